//! In-memory [`Backend`] implementation for tests and offline use.
//!
//! Tables are `Vec<Record>` behind a `std::sync::RwLock`. When built with
//! [`InMemoryBackend::with_data_file`], the tables are loaded from a JSON
//! file (`{ "<table>": [rows...] }`) and written back after every mutation,
//! so consecutive CLI runs see each other's changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{Backend, Filter, Query};
use crate::models::Record;

type Tables = HashMap<String, Vec<Record>>;

pub struct InMemoryBackend {
    tables: RwLock<Tables>,
    data_file: Option<PathBuf>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            data_file: None,
        }
    }

    /// Load tables from `path` (missing file means empty tables) and persist
    /// every mutation back to it.
    pub fn with_data_file(path: &Path) -> Result<Self> {
        let tables = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read data file: {}", path.display()))?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse data file: {}", path.display()))?
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            tables: RwLock::new(tables),
            data_file: Some(path.to_path_buf()),
        })
    }

    /// Seed a table with rows as-is (ids and timestamps are not generated).
    pub fn seed(&self, table: &str, rows: Vec<Record>) -> Result<()> {
        self.write()?
            .entry(table.to_string())
            .or_default()
            .extend(rows);
        self.persist()
    }

    /// Every row of `table` in insertion order.
    pub fn rows(&self, table: &str) -> Result<Vec<Record>> {
        Ok(self.read()?.get(table).cloned().unwrap_or_default())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory tables lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory tables lock poisoned"))
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&*self.read()?)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write data file: {}", path.display()))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>> {
        let tables = self.read()?;
        let mut rows: Vec<Record> = tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| query.compare(a, b));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut record: Record) -> Result<Record> {
        if record.get("id").is_none() {
            record.set("id", uuid::Uuid::new_v4().to_string());
        }
        if record.get("created_at").is_none() {
            record.set("created_at", Utc::now().to_rfc3339());
        }
        {
            let mut tables = self.write()?;
            let rows = tables.entry(table.to_string()).or_default();
            let id = record.id();
            if rows.iter().any(|r| r.id() == id) {
                bail!("duplicate key in {}: id {}", table, id.unwrap_or_default());
            }
            rows.push(record.clone());
        }
        self.persist()?;
        Ok(record)
    }

    async fn update(&self, table: &str, id: &str, patch: Record) -> Result<Record> {
        let updated = {
            let mut tables = self.write()?;
            let row = tables
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|r| r.id().as_deref() == Some(id)))
                .ok_or_else(|| anyhow!("row not found in {}: {}", table, id))?;
            for (k, v) in patch.0 {
                if k != "id" {
                    row.0.insert(k, v);
                }
            }
            row.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.delete_where(table, &[Filter::Eq("id".to_string(), Value::from(id))])
            .await?;
        Ok(())
    }

    async fn delete_where(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        let removed = {
            let mut tables = self.write()?;
            match tables.get_mut(table) {
                Some(rows) => {
                    let before = rows.len();
                    rows.retain(|r| !filters.iter().all(|f| f.matches(r)));
                    before - rows.len()
                }
                None => 0,
            }
        };
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }
}
