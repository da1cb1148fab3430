//! Table-driven CRUD handlers.
//!
//! [`CrudService`] wires fetch/create/update/copy/delete/reorder for one
//! [`Entity`] against any [`Backend`]. Every list/detail/edit view (CLI and
//! HTTP) goes through it, so the rules below hold everywhere:
//!
//! - `id`, `created_at` and `updated_at` are never taken from input.
//! - New and copied rows land at the end of the manual order (`max + 1`,
//!   scoped per entry for media).
//! - Copies carry their join-table links; deletes remove them first.

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use crate::backend::{Backend, Filter, Query};
use crate::config::Config;
use crate::listing::{self, ListOptions};
use crate::models::{Entity, Record, Relation};
use crate::reorder::{self, OrderChange};

const SERVER_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

#[derive(Clone)]
pub struct CrudService {
    backend: Arc<dyn Backend>,
    entity: Entity,
}

impl CrudService {
    pub fn new(backend: Arc<dyn Backend>, entity: Entity) -> Self {
        Self { backend, entity }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    fn table(&self) -> &'static str {
        self.entity.table()
    }

    fn ordered_query(&self) -> Query {
        Query::new()
            .order_by("display_order", true)
            .order_by("name", true)
    }

    /// Every row in manual order.
    pub async fn fetch_all(&self) -> Result<Vec<Record>> {
        self.backend.select(self.table(), &self.ordered_query()).await
    }

    /// Rows sharing one order scope (e.g. the media of one entry).
    pub async fn fetch_scoped(&self, scope: Option<&str>) -> Result<Vec<Record>> {
        let mut query = self.ordered_query();
        if let (Some(column), Some(value)) = (self.entity.order_scope(), scope) {
            query = query.eq(column, value);
        }
        self.backend.select(self.table(), &query).await
    }

    pub async fn fetch_one(&self, id: &str) -> Result<Record> {
        match self.backend.get(self.table(), id).await? {
            Some(r) => Ok(r),
            None => bail!("{} not found: {}", self.entity.label(), id),
        }
    }

    pub async fn list(&self, opts: &ListOptions) -> Result<Vec<Record>> {
        let rows = self.fetch_all().await?;
        Ok(listing::apply(rows, self.entity, opts))
    }

    async fn next_order(&self, scope: Option<&str>) -> Result<i64> {
        let mut query = Query::new().order_by("display_order", false).limit(1);
        if let Some(column) = self.entity.order_scope() {
            query = match scope {
                Some(value) => query.eq(column, value),
                None => query.eq(column, Value::Null),
            };
        }
        let top = self.backend.select(self.table(), &query).await?;
        Ok(top
            .first()
            .and_then(Record::display_order)
            .map(|max| max + 1)
            .unwrap_or(1))
    }

    fn scope_of(&self, record: &Record) -> Option<String> {
        self.entity
            .order_scope()
            .and_then(|column| record.get_str(column))
    }

    pub async fn create(&self, mut fields: Record) -> Result<Record> {
        for column in SERVER_COLUMNS {
            fields.remove(column);
        }
        require_name(&fields, true)?;

        if fields.display_order().is_none() {
            let scope = self.scope_of(&fields);
            fields.set_display_order(self.next_order(scope.as_deref()).await?);
        }
        let now = Utc::now().to_rfc3339();
        fields.set("created_at", now.clone());
        fields.set("updated_at", now);

        let stored = self.backend.insert(self.table(), fields).await?;
        tracing::info!(table = self.table(), id = ?stored.id(), "created");
        Ok(stored)
    }

    pub async fn update(&self, id: &str, mut fields: Record) -> Result<Record> {
        if let Some(new_id) = fields.get_str("id") {
            if new_id != id {
                bail!("invalid update: id cannot be changed ({} -> {})", id, new_id);
            }
        }
        for column in SERVER_COLUMNS {
            fields.remove(column);
        }
        require_name(&fields, false)?;
        // Raw lookup: an explicit `null` must not slip through as "absent".
        if let Some(order) = fields.0.get("display_order") {
            if !order.is_i64() {
                bail!("invalid update: display_order must be an integer");
            }
        }

        self.fetch_one(id).await?;
        fields.set("updated_at", Utc::now().to_rfc3339());
        let stored = self.backend.update(self.table(), id, fields).await?;
        tracing::info!(table = self.table(), id, "updated");
        Ok(stored)
    }

    /// Duplicate a row (and its join-table links) at the end of the order.
    pub async fn copy(&self, id: &str) -> Result<Record> {
        let mut copy = self.fetch_one(id).await?;
        for column in SERVER_COLUMNS {
            copy.remove(column);
        }
        let name = copy.name().unwrap_or_default().to_string();
        copy.set("name", format!("{} (copy)", name));
        let scope = self.scope_of(&copy);
        copy.set_display_order(self.next_order(scope.as_deref()).await?);
        let now = Utc::now().to_rfc3339();
        copy.set("created_at", now.clone());
        copy.set("updated_at", now);

        let stored = self.backend.insert(self.table(), copy).await?;
        let new_id = stored
            .get("id")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("copy of {} returned no id", id))?;

        let mut links = 0;
        for (relation, side) in Relation::involving(self.entity) {
            let column = relation.column(side);
            let rows = self
                .backend
                .select(relation.join_table, &Query::new().eq(column, id))
                .await?;
            for mut row in rows {
                for c in SERVER_COLUMNS {
                    row.remove(c);
                }
                row.set(column, new_id.clone());
                self.backend.insert(relation.join_table, row).await?;
                links += 1;
            }
        }

        tracing::info!(table = self.table(), from = id, id = ?stored.id(), links, "copied");
        Ok(stored)
    }

    /// Delete a row after removing every join-table link that references it.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.fetch_one(id).await?;
        for (relation, side) in Relation::involving(self.entity) {
            let filter = Filter::Eq(relation.column(side).to_string(), Value::from(id));
            let removed = self
                .backend
                .delete_where(relation.join_table, &[filter])
                .await?;
            if removed > 0 {
                tracing::debug!(join_table = relation.join_table, removed, "unlinked");
            }
        }
        self.backend.delete(self.table(), id).await?;
        tracing::info!(table = self.table(), id, "deleted");
        Ok(())
    }

    /// Move the row at position `from` to `to` within the manual order and
    /// return the reordered list.
    pub async fn reorder(
        &self,
        from: usize,
        to: usize,
        scope: Option<&str>,
    ) -> Result<(Vec<Record>, Vec<OrderChange>)> {
        if self.entity.order_scope().is_some() && scope.is_none() {
            bail!(
                "invalid reorder: {} order is scoped by {}",
                self.table(),
                self.entity.order_scope().unwrap_or_default()
            );
        }
        let mut list = self.fetch_scoped(scope).await?;
        let changes = reorder::persist(self.backend.as_ref(), self.table(), &mut list, from, to).await?;
        Ok((list, changes))
    }
}

fn require_name(fields: &Record, required: bool) -> Result<()> {
    match fields.0.get("name") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(()),
        Some(_) => bail!("invalid record: name must be a non-empty string"),
        None if required => bail!("invalid record: name must not be empty"),
        None => Ok(()),
    }
}

/// Build a record from `key=value` pairs. Values that parse as JSON keep
/// their type (`3`, `true`, `null`); anything else is a string.
pub fn fields_from_pairs(pairs: &[(String, String)]) -> Record {
    let mut record = Record::new();
    for (key, raw) in pairs {
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw.as_str()));
        record.set(key, value);
    }
    record
}

// ============ CLI entry points ============

fn service(config: &Config, table: &str) -> Result<CrudService> {
    let entity = Entity::from_table(table)?;
    let backend = crate::backend::connect(config)?;
    Ok(CrudService::new(backend, entity))
}

fn print_record(record: &Record) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

pub async fn run_list(config: &Config, table: &str, opts: &ListOptions) -> Result<()> {
    let svc = service(config, table)?;
    let rows = svc.list(opts).await?;
    listing::render_table(svc.entity(), &rows);
    Ok(())
}

pub async fn run_get(config: &Config, table: &str, id: &str) -> Result<()> {
    print_record(&service(config, table)?.fetch_one(id).await?)
}

pub async fn run_create(config: &Config, table: &str, pairs: &[(String, String)]) -> Result<()> {
    let created = service(config, table)?
        .create(fields_from_pairs(pairs))
        .await?;
    print_record(&created)
}

pub async fn run_update(
    config: &Config,
    table: &str,
    id: &str,
    pairs: &[(String, String)],
) -> Result<()> {
    if pairs.is_empty() {
        bail!("nothing to update: pass at least one --set key=value");
    }
    let updated = service(config, table)?
        .update(id, fields_from_pairs(pairs))
        .await?;
    print_record(&updated)
}

pub async fn run_copy(config: &Config, table: &str, id: &str) -> Result<()> {
    print_record(&service(config, table)?.copy(id).await?)
}

pub async fn run_delete(config: &Config, table: &str, id: &str) -> Result<()> {
    service(config, table)?.delete(id).await?;
    println!("Deleted {} {}.", table, id);
    Ok(())
}

pub async fn run_reorder(
    config: &Config,
    table: &str,
    from: usize,
    to: usize,
    scope: Option<&str>,
) -> Result<()> {
    let svc = service(config, table)?;
    let (rows, changes) = svc.reorder(from, to, scope).await?;
    listing::render_table(svc.entity(), &rows);
    println!("updated rows: {}", changes.len());
    Ok(())
}
