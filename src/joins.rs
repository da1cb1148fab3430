//! Client-side relational joins and aggregations.
//!
//! The hosted database is only asked for flat, filtered selects; linking
//! rows through join tables, attaching foreign-key parents and counting
//! links all happen here.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::backend::{self, Backend, Filter, Query};
use crate::config::Config;
use crate::listing;
use crate::models::{id_value, Entity, Record, Relation, Side};

/// Result of [`set_links`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// A record with every related list, keyed by the related table name.
#[derive(Debug, Clone, Serialize)]
pub struct Detail {
    pub record: Record,
    #[serde(flatten)]
    pub related: BTreeMap<String, Vec<Record>>,
}

fn ordered() -> Query {
    Query::new()
        .order_by("display_order", true)
        .order_by("name", true)
}

/// Opposite-side ids linked to `id`, in join-row order and without repeats.
async fn linked_ids(
    backend: &dyn Backend,
    relation: Relation,
    side: Side,
    id: &str,
) -> Result<Vec<String>> {
    let rows = backend
        .select(relation.join_table, &Query::new().eq(relation.column(side), id))
        .await?;
    let other = relation.column(side.opposite());
    let mut seen = HashSet::new();
    Ok(rows
        .iter()
        .filter_map(|r| r.get_str(other))
        .filter(|v| seen.insert(v.clone()))
        .collect())
}

/// Rows on the opposite side of `relation` linked to `id`, in manual order.
pub async fn linked(
    backend: &dyn Backend,
    relation: Relation,
    side: Side,
    id: &str,
) -> Result<Vec<Record>> {
    let ids = linked_ids(backend, relation, side, id).await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let target = relation.entity(side.opposite());
    let values = ids.iter().map(|s| id_value(s)).collect();
    backend
        .select(target.table(), &ordered().is_in("id", values))
        .await
}

/// Make the links of `id` exactly `ids`: insert the missing join rows and
/// delete the surplus ones.
pub async fn set_links(
    backend: &dyn Backend,
    relation: Relation,
    side: Side,
    id: &str,
    ids: &[String],
) -> Result<LinkDiff> {
    let owner = relation.entity(side);
    if backend.get(owner.table(), id).await?.is_none() {
        bail!("{} not found: {}", owner.label(), id);
    }

    let mut seen = HashSet::new();
    let desired: Vec<String> = ids
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect();

    let target = relation.entity(side.opposite());
    if !desired.is_empty() {
        let values = desired.iter().map(|s| id_value(s)).collect();
        let found: HashSet<String> = backend
            .select(target.table(), &Query::new().is_in("id", values))
            .await?
            .iter()
            .filter_map(Record::id)
            .collect();
        if let Some(missing) = desired.iter().find(|d| !found.contains(*d)) {
            bail!("{} not found: {}", target.label(), missing);
        }
    }

    let current = linked_ids(backend, relation, side, id).await?;
    let current_set: HashSet<&String> = current.iter().collect();
    let desired_set: HashSet<&String> = desired.iter().collect();

    let own_col = relation.column(side);
    let other_col = relation.column(side.opposite());
    let mut diff = LinkDiff::default();

    for other in desired.iter().filter(|d| !current_set.contains(d)) {
        let mut row = Record::new();
        row.set(own_col, id_value(id));
        row.set(other_col, id_value(other));
        backend.insert(relation.join_table, row).await?;
        diff.added.push(other.clone());
    }

    for other in current.iter().filter(|c| !desired_set.contains(c)) {
        backend
            .delete_where(
                relation.join_table,
                &[
                    Filter::Eq(own_col.to_string(), Value::from(id)),
                    Filter::Eq(other_col.to_string(), Value::from(other.as_str())),
                ],
            )
            .await?;
        diff.removed.push(other.clone());
    }

    tracing::info!(
        join_table = relation.join_table,
        id,
        added = diff.added.len(),
        removed = diff.removed.len(),
        "links updated"
    );
    Ok(diff)
}

/// Number of links per row of the entity on `side`, zero included.
pub async fn link_counts(
    backend: &dyn Backend,
    relation: Relation,
    side: Side,
) -> Result<BTreeMap<String, usize>> {
    let entity = relation.entity(side);
    let mut counts: BTreeMap<String, usize> = backend
        .select(entity.table(), &Query::new())
        .await?
        .iter()
        .filter_map(Record::id)
        .map(|id| (id, 0))
        .collect();

    let column = relation.column(side);
    for row in backend.select(relation.join_table, &Query::new()).await? {
        if let Some(id) = row.get_str(column) {
            if let Some(n) = counts.get_mut(&id) {
                *n += 1;
            }
        }
    }
    Ok(counts)
}

/// Fill each record's parent field (e.g. `receptor_class` on receptors)
/// from its foreign key. Unknown or missing parents become `null`.
pub async fn attach_parent(
    backend: &dyn Backend,
    entity: Entity,
    records: &mut [Record],
) -> Result<()> {
    let Some((fk, parent, field)) = entity.parent() else {
        return Ok(());
    };

    let mut seen = HashSet::new();
    let keys: Vec<Value> = records
        .iter()
        .filter_map(|r| r.get_str(fk))
        .filter(|k| seen.insert(k.clone()))
        .map(|k| id_value(&k))
        .collect();

    let parents: HashMap<String, Record> = if keys.is_empty() {
        HashMap::new()
    } else {
        backend
            .select(parent.table(), &Query::new().is_in("id", keys))
            .await?
            .into_iter()
            .filter_map(|p| p.id().map(|id| (id, p)))
            .collect()
    };

    for record in records.iter_mut() {
        let value = record
            .get_str(fk)
            .and_then(|k| parents.get(&k))
            .map(|p| p.clone().into_value())
            .unwrap_or(Value::Null);
        record.set(field, value);
    }
    Ok(())
}

/// A record with its linked rows, its parent, and its children.
pub async fn detail(backend: &dyn Backend, entity: Entity, id: &str) -> Result<Detail> {
    let Some(record) = backend.get(entity.table(), id).await? else {
        bail!("{} not found: {}", entity.label(), id);
    };

    let mut records = vec![record];
    attach_parent(backend, entity, &mut records).await?;
    let record = records.remove(0);

    let mut related = BTreeMap::new();
    for (relation, side) in Relation::involving(entity) {
        let rows = linked(backend, relation, side, id).await?;
        related.insert(relation.entity(side.opposite()).table().to_string(), rows);
    }

    for child in Entity::ALL {
        if let Some((fk, parent, _)) = child.parent() {
            if parent == entity {
                let rows = backend
                    .select(child.table(), &ordered().eq(fk, id))
                    .await?;
                related.insert(child.table().to_string(), rows);
            }
        }
    }

    Ok(Detail { record, related })
}

// ============ CLI entry points ============

pub async fn run_detail(config: &Config, table: &str, id: &str) -> Result<()> {
    let entity = Entity::from_table(table)?;
    let backend = backend::connect(config)?;
    let detail = detail(backend.as_ref(), entity, id).await?;
    println!("{}", serde_json::to_string_pretty(&detail)?);
    Ok(())
}

pub async fn run_links(config: &Config, relation: &str, side: &str, id: &str) -> Result<()> {
    let relation = Relation::find(relation)?;
    let side = relation.side_of(side)?;
    let backend = backend::connect(config)?;
    let rows = linked(backend.as_ref(), relation, side, id).await?;
    listing::render_table(relation.entity(side.opposite()), &rows);
    Ok(())
}

pub async fn run_link(
    config: &Config,
    relation: &str,
    side: &str,
    id: &str,
    ids: &[String],
) -> Result<()> {
    let relation = Relation::find(relation)?;
    let side = relation.side_of(side)?;
    let backend = backend::connect(config)?;
    let diff = set_links(backend.as_ref(), relation, side, id, ids).await?;
    println!("added:   {}", diff.added.len());
    println!("removed: {}", diff.removed.len());
    Ok(())
}

pub async fn run_counts(config: &Config, relation: &str, side: &str) -> Result<()> {
    let relation = Relation::find(relation)?;
    let side = relation.side_of(side)?;
    let backend = backend::connect(config)?;
    let counts = link_counts(backend.as_ref(), relation, side).await?;
    let other = relation.entity(side.opposite()).table().to_uppercase();
    println!("{:<38} {}", "ID", other);
    for (id, n) in &counts {
        println!("{:<38} {}", id, n);
    }
    Ok(())
}
