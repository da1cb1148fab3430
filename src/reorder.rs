//! Drag-order persistence.
//!
//! A reorder moves one row to a new position in the locally displayed list,
//! renumbers `display_order` as `index + 1`, and writes only the rows whose
//! value changed. Writes are sequential. If one fails, the local list is
//! restored to its snapshot and the rows already written are put back to
//! their previous order before the error is returned.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;

use crate::backend::Backend;
use crate::models::Record;

/// A single `display_order` write produced by [`renumber`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderChange {
    pub id: String,
    pub previous: Option<i64>,
    pub display_order: i64,
}

/// Move the element at `from` to index `to`.
pub fn move_item<T>(list: &mut Vec<T>, from: usize, to: usize) -> Result<()> {
    let len = list.len();
    if from >= len || to >= len {
        bail!(
            "invalid reorder: positions {} -> {} out of range for {} rows",
            from,
            to,
            len
        );
    }
    if from != to {
        let item = list.remove(from);
        list.insert(to, item);
    }
    Ok(())
}

/// Assign `display_order = index + 1` and report the rows that changed.
pub fn renumber(list: &mut [Record]) -> Result<Vec<OrderChange>> {
    let mut changes = Vec::new();
    for (idx, record) in list.iter_mut().enumerate() {
        let wanted = idx as i64 + 1;
        let previous = record.display_order();
        if previous == Some(wanted) {
            continue;
        }
        let id = match record.id() {
            Some(id) => id,
            None => bail!("invalid reorder: row at position {} has no id", idx),
        };
        record.set_display_order(wanted);
        changes.push(OrderChange {
            id,
            previous,
            display_order: wanted,
        });
    }
    Ok(changes)
}

/// Move `from` → `to` in `list` and persist the new order to `table`.
///
/// On failure `list` is left exactly as it was before the call.
pub async fn persist(
    backend: &dyn Backend,
    table: &str,
    list: &mut Vec<Record>,
    from: usize,
    to: usize,
) -> Result<Vec<OrderChange>> {
    let snapshot = list.clone();
    move_item(list, from, to)?;

    let changes = match renumber(list) {
        Ok(c) => c,
        Err(e) => {
            *list = snapshot;
            return Err(e);
        }
    };

    let mut applied: Vec<&OrderChange> = Vec::new();
    for change in &changes {
        let mut patch = Record::new();
        patch.set_display_order(change.display_order);
        match backend.update(table, &change.id, patch).await {
            Ok(_) => applied.push(change),
            Err(e) => {
                tracing::warn!(
                    table,
                    id = %change.id,
                    error = %e,
                    "reorder failed; rolling back"
                );
                *list = snapshot;
                revert(backend, table, &applied).await;
                return Err(e.context(format!("Failed to reorder {}", table)));
            }
        }
    }

    tracing::info!(table, from, to, written = changes.len(), "reordered");
    Ok(changes)
}

async fn revert(backend: &dyn Backend, table: &str, applied: &[&OrderChange]) {
    for change in applied.iter().rev() {
        let mut patch = Record::new();
        patch.set(
            "display_order",
            change.previous.map(Value::from).unwrap_or(Value::Null),
        );
        if let Err(e) = backend.update(table, &change.id, patch).await {
            tracing::warn!(
                table,
                id = %change.id,
                error = %e,
                "could not restore previous display_order"
            );
        }
    }
}
