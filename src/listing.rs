//! Generic list filtering, sorting and rendering shared by every entity view.
//!
//! The same pipeline serves `kbadmin list` and `GET /api/{table}`:
//!
//! 1. free-text search across the entity's search fields,
//! 2. `field=value` equality filters,
//! 3. a single sort key with a deterministic tie-break (`name`, then `id`).

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::backend::compare_nulls_last;
use crate::models::{Entity, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Asc,
        }
    }

    /// Parse `field`, `field:asc` or `field:desc`.
    pub fn parse(s: &str) -> Result<Self> {
        let (field, dir) = match s.split_once(':') {
            Some((f, d)) => (f.trim(), d.trim()),
            None => (s.trim(), "asc"),
        };
        if field.is_empty() {
            bail!("invalid sort: field must not be empty");
        }
        let direction = match dir.to_ascii_lowercase().as_str() {
            "asc" => Direction::Asc,
            "desc" => Direction::Desc,
            other => bail!("invalid sort direction: '{}'. Use asc or desc.", other),
        };
        Ok(Self {
            field: field.to_string(),
            direction,
        })
    }
}

/// Parse a `field=value` (or `field:value`) filter.
pub fn parse_filter(s: &str) -> Result<(String, String)> {
    let pos = s
        .find(['=', ':'])
        .ok_or_else(|| anyhow::anyhow!("invalid filter: no '=' found in '{}'", s))?;
    let field = s[..pos].trim();
    if field.is_empty() {
        bail!("invalid filter: field must not be empty in '{}'", s);
    }
    Ok((field.to_string(), s[pos + 1..].trim().to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub search: Option<String>,
    pub filters: Vec<(String, String)>,
    pub sort: Option<SortKey>,
}

/// Default ordering: manual order first, which every table carries.
pub fn default_sort() -> SortKey {
    SortKey::asc("display_order")
}

/// Filter and sort `records` for display.
pub fn apply(records: Vec<Record>, entity: Entity, opts: &ListOptions) -> Vec<Record> {
    let needle = opts
        .search
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    let mut out: Vec<Record> = records
        .into_iter()
        .filter(|r| match &needle {
            Some(n) => matches_search(r, entity, n),
            None => true,
        })
        .filter(|r| {
            opts.filters
                .iter()
                .all(|(field, value)| r.get_str(field).as_deref() == Some(value.as_str()))
        })
        .collect();

    let sort = opts.sort.clone().unwrap_or_else(default_sort);
    out.sort_by(|a, b| compare_for_sort(a, b, &sort));
    out
}

fn matches_search(record: &Record, entity: Entity, needle: &str) -> bool {
    entity.search_fields().iter().any(|f| {
        record
            .get_str(f)
            .map(|v| v.to_lowercase().contains(needle))
            .unwrap_or(false)
    })
}

fn compare_for_sort(a: &Record, b: &Record, sort: &SortKey) -> Ordering {
    let asc = sort.direction == Direction::Asc;
    compare_nulls_last(a.get(&sort.field), b.get(&sort.field), asc)
        .then_with(|| compare_nulls_last(a.get("name"), b.get("name"), true))
        .then_with(|| compare_nulls_last(a.get("id"), b.get("id"), true))
}

/// Print `records` as an aligned `ORDER  ID  NAME` table.
pub fn render_table(entity: Entity, records: &[Record]) {
    if records.is_empty() {
        println!("No {} found.", entity.table());
        return;
    }

    let id_width = records
        .iter()
        .filter_map(|r| r.id().map(|s| s.len()))
        .max()
        .unwrap_or(2)
        .max(2);

    println!("{:<6} {:<width$} NAME", "ORDER", "ID", width = id_width);
    for r in records {
        let order = r
            .display_order()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<width$} {}",
            order,
            r.id().unwrap_or_default(),
            r.name().unwrap_or("(unnamed)"),
            width = id_width
        );
    }
    println!();
    println!("{} {}", records.len(), entity.table());
}
