//! # kb-admin
//!
//! Admin tooling for an anatomy/physiology knowledge base: muscles, organs,
//! meridians, dysfunctions, muscle groups, receptors, receptor classes,
//! tools, entries and media.
//!
//! Records live in a hosted relational database reached through its
//! PostgREST-style API. This crate lists, searches, filters, sorts,
//! reorders, creates, copies, edits and deletes them, joins related rows
//! client-side, and relays file uploads to a cloud storage API.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   ┌──────────┐
//!  │   CLI    │   │   HTTP   │
//!  │(kbadmin) │   │  (axum)  │
//!  └────┬─────┘   └────┬─────┘
//!       └──────┬───────┘
//!              ▼
//!  ┌──────────────────────────┐      ┌───────────────┐
//!  │ crud · listing · reorder │      │    storage    │
//!  │          joins           │      │ upload relay  │
//!  └────────────┬─────────────┘      └───────┬───────┘
//!               ▼                            ▼
//!  ┌──────────────────────────┐      ┌───────────────┐
//!  │  Backend (REST / memory) │      │ cloud storage │
//!  └──────────────────────────┘      └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbadmin tables                               # probe every table
//! kbadmin list muscles --search psoas
//! kbadmin create organs --set name=Liver
//! kbadmin reorder muscles 4 0                  # drag row 4 to the top
//! kbadmin link muscle_organs muscles 12 3 7    # muscle 12 ↔ organs 3, 7
//! kbadmin serve                                # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entities, records, relations |
//! | [`backend`] | Database client trait and implementations |
//! | [`listing`] | Search, filter and sort for list views |
//! | [`crud`] | Per-table CRUD handlers |
//! | [`reorder`] | Drag-order persistence with rollback |
//! | [`joins`] | Client-side joins and link counts |
//! | [`storage`] | Cloud storage client and upload relay |
//! | [`server`] | HTTP admin API |
//! | [`tables`] | Table reachability report |

pub mod backend;
pub mod config;
pub mod crud;
pub mod joins;
pub mod listing;
pub mod models;
pub mod reorder;
pub mod server;
pub mod storage;
pub mod tables;
