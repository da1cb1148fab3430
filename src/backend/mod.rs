//! Remote database abstraction.
//!
//! The [`Backend`] trait covers the table operations the admin tool needs
//! from the managed database: filtered and ordered selects, inserts,
//! patches and deletes. Two implementations ship with the crate:
//!
//! | Backend | Purpose |
//! |---------|---------|
//! | [`rest::RestBackend`] | PostgREST-dialect HTTP client for the hosted database |
//! | [`memory::InMemoryBackend`] | Local tables for tests and offline use |
//!
//! Implementations must be `Send + Sync` so a single instance can be shared
//! across axum handlers behind an `Arc`.

pub mod memory;
pub mod rest;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{scalar_string, Record};

/// A row predicate understood by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
    /// Case-insensitive substring match.
    ILike(String, String),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::In(c, _) | Filter::ILike(c, _) => c,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get_str(self.column());
        match self {
            Filter::Eq(_, expected) => match (actual, scalar_string(expected)) {
                (Some(a), Some(e)) => a == e,
                (None, None) => expected.is_null(),
                _ => false,
            },
            Filter::In(_, values) => match actual {
                Some(a) => values
                    .iter()
                    .filter_map(scalar_string)
                    .any(|v| v == a),
                None => false,
            },
            Filter::ILike(_, needle) => match actual {
                Some(a) => a.to_lowercase().contains(&needle.to_lowercase()),
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Select parameters: filters are ANDed, ordering keys apply in sequence,
/// and nulls always sort last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn is_in(mut self, column: &str, values: Vec<Value>) -> Self {
        self.filters.push(Filter::In(column.to_string(), values));
        self
    }

    pub fn ilike(mut self, column: &str, needle: &str) -> Self {
        self.filters
            .push(Filter::ILike(column.to_string(), needle.to_string()));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }

    /// Compare two records by this query's ordering keys.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for key in &self.order {
            let ord = compare_nulls_last(a.get(&key.column), b.get(&key.column), key.ascending);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Order two optional values, placing missing/null values after present
/// ones whatever the direction.
pub fn compare_nulls_last(a: Option<&Value>, b: Option<&Value>, ascending: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => {
            let ord = compare_values(x, y);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        }
    }
}

/// Total order over scalar JSON values. Numbers compare numerically and
/// strings case-insensitively, falling back to their exact form.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x
            .to_lowercase()
            .cmp(&y.to_lowercase())
            .then_with(|| x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => {
            let x = scalar_string(a).unwrap_or_default();
            let y = scalar_string(b).unwrap_or_default();
            x.cmp(&y)
        }
    }
}

/// Table operations against the knowledge-base database.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier shown in `kbadmin tables` (`"rest"`, `"memory"`).
    fn kind(&self) -> &str;

    /// Return the rows of `table` matching `query`, in query order.
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>>;

    /// Fetch a single row by id.
    async fn get(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let query = Query::new().eq("id", id).limit(1);
        Ok(self.select(table, &query).await?.into_iter().next())
    }

    /// Insert a row and return it as stored (with generated columns).
    async fn insert(&self, table: &str, record: Record) -> Result<Record>;

    /// Apply `patch` to the row with `id` and return the updated row.
    async fn update(&self, table: &str, id: &str, patch: Record) -> Result<Record>;

    /// Delete the row with `id`.
    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Delete every row matching all `filters`, returning how many went.
    async fn delete_where(&self, table: &str, filters: &[Filter]) -> Result<usize>;
}

/// Build the backend named in `[backend].kind`.
pub fn connect(config: &Config) -> Result<Arc<dyn Backend>> {
    if config.backend.is_memory() {
        let backend = match &config.backend.data_file {
            Some(path) => memory::InMemoryBackend::with_data_file(path)?,
            None => memory::InMemoryBackend::new(),
        };
        Ok(Arc::new(backend))
    } else {
        Ok(Arc::new(rest::RestBackend::from_config(&config.backend)?))
    }
}
