//! Reachability report for the entity tables and the known relations.

use anyhow::Result;
use serde::Serialize;

use crate::backend::{self, Backend, Query};
use crate::config::Config;
use crate::models::{Entity, RELATIONS};

#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub label: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Probe every entity table with a one-row select.
pub async fn table_statuses(backend: &dyn Backend) -> Vec<TableStatus> {
    let mut out = Vec::new();
    for entity in Entity::ALL {
        let probe = backend.select(entity.table(), &Query::new().limit(1)).await;
        out.push(TableStatus {
            table: entity.table().to_string(),
            label: entity.label().to_string(),
            reachable: probe.is_ok(),
            error: probe.err().map(|e| e.to_string()),
        });
    }
    out
}

pub async fn list_tables(config: &Config) -> Result<()> {
    let backend = backend::connect(config)?;
    println!("backend: {}", backend.kind());
    println!();

    println!("{:<18} {:<16} REACHABLE", "TABLE", "LABEL");
    for status in table_statuses(backend.as_ref()).await {
        println!("{:<18} {:<16} {}", status.table, status.label, status.reachable);
        if let Some(err) = status.error {
            tracing::warn!(table = %status.table, error = %err, "table probe failed");
        }
    }

    println!();
    println!("{:<22} {:<16} RIGHT", "RELATION", "LEFT");
    for r in RELATIONS {
        println!("{:<22} {:<16} {}", r.join_table, r.left.table(), r.right.table());
    }
    Ok(())
}
