//! End-to-end tests for the HTTP admin API and the upload relay.
//!
//! Each test starts the real axum server on a free port with an in-memory
//! backend. Upload tests also start a small mock of the cloud storage API.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use kb_admin::backend::memory::InMemoryBackend;
use kb_admin::backend::Backend;
use kb_admin::config::Config;
use kb_admin::models::Record;
use kb_admin::server::run_server_with_backend;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ─── Helpers ────────────────────────────────────────────────────────

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16, storage_api: Option<&str>) -> Config {
    let storage = match storage_api {
        Some(api) => format!(
            r#"
[storage]
api_url = "{}"
token_env = "KB_TEST_STORAGE_TOKEN"
root_folder = "kb-media"
public_base_url = "https://files.example.com"
timeout_secs = 5
"#,
            api
        ),
        None => String::new(),
    };
    let content = format!(
        r#"[backend]
kind = "memory"

[server]
bind = "127.0.0.1:{}"
max_upload_bytes = 1048576
{}"#,
        port, storage
    );
    toml::from_str(&content).unwrap()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

fn rec(v: Value) -> Record {
    Record::from_value(v).unwrap()
}

fn seeded_backend() -> Arc<InMemoryBackend> {
    let backend = Arc::new(InMemoryBackend::new());
    backend
        .seed(
            "muscles",
            vec![
                rec(json!({"id": "m1", "name": "Psoas", "display_order": 1})),
                rec(json!({"id": "m2", "name": "Iliacus", "display_order": 2})),
                rec(json!({"id": "m3", "name": "Quadratus lumborum", "display_order": 3})),
            ],
        )
        .unwrap();
    backend
        .seed(
            "organs",
            vec![
                rec(json!({"id": "o1", "name": "Kidney", "display_order": 1})),
                rec(json!({"id": "o2", "name": "Colon", "display_order": 2})),
            ],
        )
        .unwrap();
    backend
        .seed(
            "receptor_classes",
            vec![rec(json!({"id": "c1", "name": "Mechanoreceptor", "display_order": 1}))],
        )
        .unwrap();
    backend
        .seed(
            "receptors",
            vec![rec(json!({
                "id": "r1", "name": "Pacinian corpuscle",
                "receptor_class_id": "c1", "display_order": 1
            }))],
        )
        .unwrap();
    backend
}

/// Start the API and return its base URL and the server task.
async fn start_api(
    backend: Arc<InMemoryBackend>,
    storage_api: Option<&str>,
) -> (String, tokio::task::JoinHandle<()>) {
    let port = find_free_port();
    let cfg = test_config(port, storage_api);
    let backend: Arc<dyn Backend> = backend;
    let handle = tokio::spawn(async move {
        run_server_with_backend(&cfg, backend).await.ok();
    });
    wait_for_server(port).await;
    (format!("http://127.0.0.1:{}", port), handle)
}

fn names(body: &Value) -> Vec<String> {
    body.as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect()
}

// ─── Mock cloud storage ─────────────────────────────────────────────

#[derive(Default)]
struct MockStorage {
    folders: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    auth_headers: Vec<String>,
    conflicts: usize,
}

#[derive(Clone)]
struct MockState {
    inner: Arc<Mutex<MockStorage>>,
    base: String,
    fail_upload_url: bool,
}

async fn mock_create_folder(
    State(state): State<MockState>,
    headers: axum::http::HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> StatusCode {
    let mut inner = state.inner.lock().unwrap();
    if let Some(auth) = headers.get("authorization") {
        inner.auth_headers.push(auth.to_str().unwrap().to_string());
    }
    let path = q["path"].clone();
    if inner.folders.contains(&path) {
        inner.conflicts += 1;
        StatusCode::CONFLICT
    } else {
        inner.folders.push(path);
        StatusCode::CREATED
    }
}

async fn mock_upload_url(
    State(state): State<MockState>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    if state.fail_upload_url {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(q.get("overwrite").map(String::as_str), Some("true"));
    let href = format!("{}/upload-target?path={}", state.base, q["path"]);
    Ok(Json(json!({ "href": href, "method": "PUT", "templated": false })))
}

async fn mock_receive(
    State(state): State<MockState>,
    Query(q): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> StatusCode {
    state
        .inner
        .lock()
        .unwrap()
        .files
        .insert(q["path"].clone(), body.to_vec());
    StatusCode::CREATED
}

async fn start_mock_storage(fail_upload_url: bool) -> (String, Arc<Mutex<MockStorage>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let inner = Arc::new(Mutex::new(MockStorage::default()));
    let state = MockState {
        inner: inner.clone(),
        base: base.clone(),
        fail_upload_url,
    };
    let app = Router::new()
        .route("/v1/disk/resources", put(mock_create_folder))
        .route("/v1/disk/resources/upload", get(mock_upload_url))
        .route("/upload-target", put(mock_receive))
        .with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("{}/v1/disk", base), inner)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_and_tables() {
    let (base, handle) = start_api(seeded_backend(), None).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");

    let body: Value = client
        .get(format!("{}/api/tables", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tables = body.as_array().unwrap();
    assert_eq!(tables.len(), 10);
    assert!(tables.iter().all(|t| t["reachable"] == json!(true)));

    handle.abort();
}

#[tokio::test]
async fn test_list_search_sort_and_filter() {
    let (base, handle) = start_api(seeded_backend(), None).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/api/muscles", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names(&body), vec!["Psoas", "Iliacus", "Quadratus lumborum"]);

    let body: Value = client
        .get(format!("{}/api/muscles?search=LUMB", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names(&body), vec!["Quadratus lumborum"]);

    let body: Value = client
        .get(format!("{}/api/muscles?sort=name:asc&filter=display_order:2", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names(&body), vec!["Iliacus"]);

    // Receptors come back with their class attached.
    let body: Value = client
        .get(format!("{}/api/receptors", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body[0]["receptor_class"]["name"], "Mechanoreceptor");

    let resp = client
        .get(format!("{}/api/bones", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    handle.abort();
}

#[tokio::test]
async fn test_create_update_copy_delete() {
    let backend = seeded_backend();
    let (base, handle) = start_api(backend.clone(), None).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/organs", base))
        .json(&json!({"name": "Liver", "description": "Detox"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["display_order"], 3);
    let id = created["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{}/api/organs", base))
        .json(&json!({"description": "no name"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let updated: Value = client
        .patch(format!("{}/api/organs/{}", base, id))
        .json(&json!({"description": "Bile"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["description"], "Bile");
    assert_eq!(updated["name"], "Liver");

    let resp = client
        .post(format!("{}/api/organs/{}/copy", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let copy: Value = resp.json().await.unwrap();
    assert_eq!(copy["name"], "Liver (copy)");
    assert_eq!(copy["display_order"], 4);

    let resp = client
        .delete(format!("{}/api/organs/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/api/organs/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    assert_eq!(backend.rows("organs").unwrap().len(), 3);
    handle.abort();
}

#[tokio::test]
async fn test_reorder_persists_order() {
    let (base, handle) = start_api(seeded_backend(), None).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{}/api/muscles/reorder", base))
        .json(&json!({"from": 2, "to": 0}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        names(&body["rows"]),
        vec!["Quadratus lumborum", "Psoas", "Iliacus"]
    );
    assert_eq!(body["changes"].as_array().unwrap().len(), 3);

    let body: Value = client
        .get(format!("{}/api/muscles", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        names(&body),
        vec!["Quadratus lumborum", "Psoas", "Iliacus"]
    );

    let resp = client
        .post(format!("{}/api/muscles/reorder", base))
        .json(&json!({"from": 0, "to": 9}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    handle.abort();
}

#[tokio::test]
async fn test_links_detail_and_counts() {
    let backend = seeded_backend();
    let (base, handle) = start_api(backend.clone(), None).await;
    let client = reqwest::Client::new();

    let diff: Value = client
        .put(format!("{}/api/relations/muscle_organs/muscles/m1", base))
        .json(&json!({"ids": ["o2", "o1"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(diff["added"].as_array().unwrap().len(), 2);

    let detail: Value = client
        .get(format!("{}/api/muscles/m1/detail", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["record"]["name"], "Psoas");
    assert_eq!(names(&detail["organs"]), vec!["Kidney", "Colon"]);

    let counts: Value = client
        .get(format!("{}/api/relations/muscle_organs/counts?side=organs", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(counts["o1"], 1);
    assert_eq!(counts["o2"], 1);

    // Deleting the muscle removes its join rows too.
    client
        .delete(format!("{}/api/muscles/m1", base))
        .send()
        .await
        .unwrap();
    assert!(backend.rows("muscle_organs").unwrap().is_empty());

    let resp = client
        .put(format!("{}/api/relations/muscle_organs/muscles/m2", base))
        .json(&json!({"ids": ["o9"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    handle.abort();
}

#[tokio::test]
async fn test_set_links_rejects_non_scalar_ids() {
    let backend = seeded_backend();
    let (base, handle) = start_api(backend.clone(), None).await;
    let client = reqwest::Client::new();

    client
        .put(format!("{}/api/relations/muscle_organs/left/m2", base))
        .json(&json!({"ids": ["o1", "o2"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(backend.rows("muscle_organs").unwrap().len(), 2);

    for body in [json!({"ids": [null]}), json!({"ids": ["o1", {"id": "o2"}]})] {
        let resp = client
            .put(format!("{}/api/relations/muscle_organs/left/m2", base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let err: Value = resp.json().await.unwrap();
        assert_eq!(err["error"]["code"], "bad_request");
    }

    // Rejected bodies leave the existing links alone.
    assert_eq!(backend.rows("muscle_organs").unwrap().len(), 2);

    handle.abort();
}

#[tokio::test]
async fn test_upload_relay_success() {
    std::env::set_var("KB_TEST_STORAGE_TOKEN", "secret-token");
    let (storage_api, mock) = start_mock_storage(false).await;
    let (base, handle) = start_api(seeded_backend(), Some(&storage_api)).await;

    let form = reqwest::multipart::Form::new()
        .text("id", "42")
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"fake-jpeg".to_vec()).file_name("psoas front.jpg"),
        );
    let resp = reqwest::Client::new()
        .post(format!("{}/api/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(
        body["url"],
        "https://files.example.com/kb-media/42/psoas%20front.jpg"
    );

    // Same id again: both folders already exist (409) and the upload still succeeds.
    let form = reqwest::multipart::Form::new()
        .text("id", "42")
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"second".to_vec()).file_name("psoas back.jpg"),
        );
    let resp = reqwest::Client::new()
        .post(format!("{}/api/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(
        body["url"],
        "https://files.example.com/kb-media/42/psoas%20back.jpg"
    );

    let mock = mock.lock().unwrap();
    assert_eq!(mock.folders, vec!["kb-media", "kb-media/42"]);
    assert_eq!(mock.conflicts, 2);
    assert_eq!(mock.auth_headers.len(), 4);
    assert_eq!(
        mock.files.get("kb-media/42/psoas front.jpg").map(Vec::as_slice),
        Some(&b"fake-jpeg"[..])
    );
    assert_eq!(
        mock.files.get("kb-media/42/psoas back.jpg").map(Vec::as_slice),
        Some(&b"second"[..])
    );
    assert!(mock.auth_headers.iter().all(|h| h == "OAuth secret-token"));

    handle.abort();
}

#[tokio::test]
async fn test_upload_relay_errors() {
    std::env::set_var("KB_TEST_STORAGE_TOKEN", "secret-token");
    let (storage_api, _mock) = start_mock_storage(true).await;
    let (base, handle) = start_api(seeded_backend(), Some(&storage_api)).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(vec![1, 2, 3]).file_name("a.png"),
    );
    let resp = client
        .post(format!("{}/api/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "missing id");

    let form = reqwest::multipart::Form::new()
        .text("id", "7")
        .part(
            "file",
            reqwest::multipart::Part::bytes(vec![1, 2, 3]).file_name("a.png"),
        );
    let resp = client
        .post(format!("{}/api/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("upload URL"));

    handle.abort();
}

#[tokio::test]
async fn test_upload_without_storage_is_unavailable() {
    let (base, handle) = start_api(seeded_backend(), None).await;
    let form = reqwest::multipart::Form::new()
        .text("id", "7")
        .part("file", reqwest::multipart::Part::bytes(vec![0]).file_name("x.bin"));
    let resp = reqwest::Client::new()
        .post(format!("{}/api/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    handle.abort();
}
