//! PostgREST-dialect client for the hosted knowledge-base database.
//!
//! Every table is exposed at `{url}/rest/v1/{table}`. Filters, ordering and
//! limits are encoded in the query string:
//!
//! | Query | Encoding |
//! |-------|----------|
//! | `Filter::Eq` | `col=eq.value` |
//! | `Filter::In` | `col=in.(a,b,"c,d")` |
//! | `Filter::ILike` | `col=ilike.*needle*` |
//! | ordering | `order=col.asc.nullslast,other.desc.nullslast` |
//! | limit | `limit=n` |
//!
//! # Authentication
//!
//! The API key is read from the environment variable named by
//! `[backend].key_env` (default `KB_SERVICE_KEY`) and sent both as the
//! `apikey` header and as a bearer token.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use super::{Backend, Filter, Query};
use crate::config::BackendConfig;
use crate::models::{scalar_string, Record};

pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestBackend {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: format!("{}/rest/v1", url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let api_key = std::env::var(&config.key_env)
            .with_context(|| format!("{} environment variable not set", config.key_env))?;
        Self::new(
            &config.url,
            &api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send_rows(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Vec<Record>> {
        let resp = req
            .send()
            .await
            .map_err(|e| anyhow!("Failed to {}: {}", what, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "backend request failed: {} (HTTP {}): {}",
                what,
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<Record> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to decode response for {}", what))?;
        Ok(rows)
    }
}

#[async_trait]
impl Backend for RestBackend {
    fn kind(&self) -> &str {
        "rest"
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>> {
        tracing::debug!(table, ?query, "select");
        let req = self
            .request(reqwest::Method::GET, table)
            .query(&query_params(query));
        self.send_rows(req, &format!("select from {}", table)).await
    }

    async fn insert(&self, table: &str, record: Record) -> Result<Record> {
        tracing::debug!(table, "insert");
        let req = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&record);
        self.send_rows(req, &format!("insert into {}", table))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("insert into {} returned no row", table))
    }

    async fn update(&self, table: &str, id: &str, patch: Record) -> Result<Record> {
        tracing::debug!(table, id, "update");
        let req = self
            .request(reqwest::Method::PATCH, table)
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(&patch);
        self.send_rows(req, &format!("update {}", table))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("row not found in {}: {}", table, id))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        tracing::debug!(table, id, "delete");
        let req = self
            .request(reqwest::Method::DELETE, table)
            .query(&[("id", format!("eq.{}", id))]);
        self.send_rows(req, &format!("delete from {}", table))
            .await?;
        Ok(())
    }

    async fn delete_where(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        if filters.is_empty() {
            bail!("refusing to delete from {} without filters", table);
        }
        let params: Vec<(String, String)> = filters.iter().map(filter_param).collect();
        let req = self
            .request(reqwest::Method::DELETE, table)
            .query(&params)
            .header("Prefer", "return=representation");
        let rows = self
            .send_rows(req, &format!("delete from {}", table))
            .await?;
        Ok(rows.len())
    }
}

/// Encode a [`Query`] as PostgREST query-string pairs.
pub fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(query.filters.iter().map(filter_param));

    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| {
                format!(
                    "{}.{}.nullslast",
                    o.column,
                    if o.ascending { "asc" } else { "desc" }
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }

    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

fn filter_param(filter: &Filter) -> (String, String) {
    let value = match filter {
        Filter::Eq(_, v) if v.is_null() => "is.null".to_string(),
        Filter::Eq(_, v) => format!("eq.{}", scalar_string(v).unwrap_or_default()),
        Filter::In(_, values) => {
            let items: Vec<String> = values
                .iter()
                .filter_map(scalar_string)
                .map(|s| quote_list_item(&s))
                .collect();
            format!("in.({})", items.join(","))
        }
        Filter::ILike(_, needle) => format!("ilike.*{}*", needle),
    };
    (filter.column().to_string(), value)
}

/// Quote an `in.(...)` item when it contains reserved characters.
fn quote_list_item(s: &str) -> String {
    if s.contains([',', '(', ')', '"', ' ']) {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn find<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_query_params_full() {
        let q = Query::new()
            .eq("receptor_class_id", 4)
            .is_in("id", vec![json!("a"), json!("b c")])
            .ilike("name", "psoas")
            .order_by("display_order", true)
            .order_by("name", false)
            .limit(10);
        let params = query_params(&q);
        assert_eq!(find(&params, "select"), Some("*"));
        assert_eq!(find(&params, "receptor_class_id"), Some("eq.4"));
        assert_eq!(find(&params, "id"), Some("in.(a,\"b c\")"));
        assert_eq!(find(&params, "name"), Some("ilike.*psoas*"));
        assert_eq!(
            find(&params, "order"),
            Some("display_order.asc.nullslast,name.desc.nullslast")
        );
        assert_eq!(find(&params, "limit"), Some("10"));
    }

    #[test]
    fn test_null_eq_uses_is() {
        let (_, v) = filter_param(&Filter::Eq("entry_id".into(), Value::Null));
        assert_eq!(v, "is.null");
    }

    #[test]
    fn test_plain_query_only_selects() {
        let params = query_params(&Query::new());
        assert_eq!(params, vec![("select".to_string(), "*".to_string())]);
    }

    // ─── Against a mock PostgREST server ───────────────────────────

    use axum::{
        body::Bytes,
        extract::{Path, RawQuery, State},
        http::{HeaderMap, Method, StatusCode},
        response::{IntoResponse, Response},
        routing::any,
        Json, Router,
    };
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct SeenRequest {
        method: Method,
        table: String,
        query: String,
        apikey: Option<String>,
        authorization: Option<String>,
        prefer: Option<String>,
    }

    type Seen = Arc<Mutex<Vec<SeenRequest>>>;

    async fn mock_table(
        State(seen): State<Seen>,
        method: Method,
        Path(table): Path<String>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        seen.lock().unwrap().push(SeenRequest {
            method: method.clone(),
            table: table.clone(),
            query: query.unwrap_or_default(),
            apikey: header("apikey"),
            authorization: header("authorization"),
            prefer: header("prefer"),
        });

        if table == "broken" {
            return (StatusCode::INTERNAL_SERVER_ERROR, "z".repeat(2000)).into_response();
        }
        match method {
            Method::GET => Json(json!([{"id": 1, "name": "Kidney", "display_order": 1}]))
                .into_response(),
            Method::POST | Method::PATCH => {
                let mut row: Value = serde_json::from_slice(&body).unwrap();
                row["id"] = json!(7);
                (StatusCode::CREATED, Json(json!([row]))).into_response()
            }
            Method::DELETE => StatusCode::NO_CONTENT.into_response(),
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    async fn start_mock() -> (RestBackend, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/rest/v1/{table}", any(mock_table))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        let backend = RestBackend::new(&url, "service-key", Duration::from_secs(5)).unwrap();
        (backend, seen)
    }

    #[tokio::test]
    async fn test_requests_carry_auth_and_prefer_headers() {
        let (backend, seen) = start_mock().await;

        let rows = backend
            .select("organs", &Query::new().eq("id", 1).limit(1))
            .await
            .unwrap();
        assert_eq!(rows[0].name(), Some("Kidney"));

        let mut fields = Record::new();
        fields.set("name", "Liver");
        let created = backend.insert("organs", fields).await.unwrap();
        assert_eq!(created.id().as_deref(), Some("7"));
        assert_eq!(created.name(), Some("Liver"));

        let mut patch = Record::new();
        patch.set("description", "Bile");
        let updated = backend.update("organs", "7", patch).await.unwrap();
        assert_eq!(updated.get_str("description").as_deref(), Some("Bile"));

        // 204 with an empty body is a successful delete.
        backend.delete("organs", "7").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for req in seen.iter() {
            assert_eq!(req.table, "organs");
            assert_eq!(req.apikey.as_deref(), Some("service-key"));
            assert_eq!(req.authorization.as_deref(), Some("Bearer service-key"));
        }

        assert_eq!(seen[0].method, Method::GET);
        assert!(seen[0].query.contains("id=eq.1"));
        assert!(seen[0].query.contains("limit=1"));
        assert_eq!(seen[0].prefer, None);

        assert_eq!(seen[1].method, Method::POST);
        assert_eq!(seen[1].prefer.as_deref(), Some("return=representation"));

        assert_eq!(seen[2].method, Method::PATCH);
        assert_eq!(seen[2].query, "id=eq.7");
        assert_eq!(seen[2].prefer.as_deref(), Some("return=representation"));

        assert_eq!(seen[3].method, Method::DELETE);
        assert_eq!(seen[3].query, "id=eq.7");
    }

    #[tokio::test]
    async fn test_error_status_reports_truncated_body() {
        let (backend, _seen) = start_mock().await;

        let err = backend.select("broken", &Query::new()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("backend request failed: select from broken (HTTP 500"));
        assert_eq!(message.matches('z').count(), 500);
    }
}
