use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use flapi::config::loader::ConfigState;
use flapi::engine::Engine;
use flapi::server::pipeline::{self, DynamicRequest};
use flapi::server::AppState;
use tempfile::TempDir;

const TEN_ROWS: &str = "SELECT t.id FROM (VALUES (1),(2),(3),(4),(5),(6),(7),(8),(9),(10)) AS t(id)\n";

fn write_file(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn project(temp: &TempDir) {
    write_file(
        temp.path(),
        "flapi.yaml",
        r#"
project_name: gateway-tests
http_port: 8080
connections:
  main:
    properties:
      source: inline
template:
  path: endpoints
"#,
    );
    write_file(temp.path(), "endpoints/users.sql", TEN_ROWS);
    write_file(
        temp.path(),
        "endpoints/users.yaml",
        "url-path: /users\ntemplate-source: users.sql\nconnection: [main]\n",
    );
}

async fn app_state(temp: &TempDir) -> Arc<AppState> {
    let config = Arc::new(ConfigState::load(temp.path().join("flapi.yaml")).unwrap());
    let engine = Arc::new(Engine::open(&config.app()).await.unwrap());
    AppState::new(config, engine)
}

fn get(path: &str, query: &[(&str, &str)]) -> DynamicRequest {
    DynamicRequest {
        method: Method::GET,
        path: path.to_string(),
        query: query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        headers: HeaderMap::new(),
        client_ip: "10.1.2.3".to_string(),
        body: None,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_read_with_pagination_envelope() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    let state = app_state(&temp).await;

    let response = pipeline::handle(&state, get("/users", &[("limit", "3"), ("offset", "0")])).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-Total-Count").unwrap(),
        &HeaderValue::from_static("10")
    );
    assert_eq!(
        response.headers().get("X-Next").unwrap(),
        &HeaderValue::from_static("/users?limit=3&offset=3")
    );

    let body = body_json(response).await;
    assert_eq!(body["total_count"], serde_json::json!(10));
    assert_eq!(body["next"], serde_json::json!("/users?limit=3&offset=3"));
    assert_eq!(
        body["data"],
        serde_json::json!([{"id": 1}, {"id": 2}, {"id": 3}])
    );
}

#[tokio::test]
async fn test_last_page_has_no_next_link() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    let state = app_state(&temp).await;

    let response = pipeline::handle(&state, get("/users", &[("limit", "4"), ("offset", "8")])).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["next"], serde_json::json!(""));
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_route_is_404_and_wrong_method_is_405() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    let state = app_state(&temp).await;

    let response = pipeline::handle(&state, get("/missing", &[])).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let mut request = get("/users", &[]);
    request.method = Method::POST;
    let response = pipeline::handle(&state, request).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_path_captures_feed_the_template() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    write_file(
        temp.path(),
        "endpoints/user_by_id.sql",
        "SELECT {{ params.id }} AS id\n",
    );
    write_file(
        temp.path(),
        "endpoints/user_by_id.yaml",
        r#"
url-path: /users/:id
template-source: user_by_id.sql
connection: [main]
request:
  - field-name: id
    field-in: path
    required: true
    validators:
      - type: int
        min: 1
"#,
    );
    let state = app_state(&temp).await;

    let response = pipeline::handle(&state, get("/users/42", &[("limit", "10")])).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"], serde_json::json!([{"id": 42}]));
}

#[tokio::test]
async fn test_validation_rejection_lists_field_errors() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    write_file(
        temp.path(),
        "endpoints/validated.yaml",
        r#"
url-path: /validated
template-source: users.sql
connection: [main]
request:
  - field-name: age
    field-in: query
    required: true
    validators:
      - type: int
        min: 1
        max: 120
"#,
    );
    let state = app_state(&temp).await;

    let response = pipeline::handle(&state, get("/validated", &[("age", "0")])).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(
        body["errors"],
        serde_json::json!([
            {"field": "age", "message": "Integer value is less than the minimum allowed"}
        ])
    );

    let response = pipeline::handle(&state, get("/validated", &[])).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rate_limit_headers_and_429() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    write_file(
        temp.path(),
        "endpoints/limited.yaml",
        r#"
url-path: /limited
template-source: users.sql
connection: [main]
rate-limit:
  enabled: true
  max: 3
  interval: 60
"#,
    );
    let state = app_state(&temp).await;

    for expected_remaining in ["2", "1", "0"] {
        let response = pipeline::handle(&state, get("/limited", &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("X-RateLimit-Remaining")
                .and_then(|v| v.to_str().ok()),
            Some(expected_remaining)
        );
        assert_eq!(
            response
                .headers()
                .get("X-RateLimit-Limit")
                .and_then(|v| v.to_str().ok()),
            Some("3")
        );
        assert!(response.headers().contains_key("X-RateLimit-Reset"));
    }

    let response = pipeline::handle(&state, get("/limited", &[])).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );
}

#[tokio::test]
async fn test_basic_auth_challenge_and_success() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    write_file(
        temp.path(),
        "endpoints/secure.yaml",
        r#"
url-path: /secure
template-source: users.sql
connection: [main]
auth:
  enabled: true
  type: basic
  users:
    - username: admin
      password: secret
      roles: [admin]
"#,
    );
    let state = app_state(&temp).await;

    let response = pipeline::handle(&state, get("/secure", &[])).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok()),
        Some("Basic realm=\"flAPI\"")
    );

    let mut request = get("/secure", &[]);
    request.headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_static("Basic YWRtaW46c2VjcmV0"), // admin:secret
    );
    let response = pipeline::handle(&state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_csv_negotiation() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    let state = app_state(&temp).await;

    let mut request = get("/users", &[("limit", "2")]);
    request
        .headers
        .insert(header::ACCEPT, HeaderValue::from_static("text/csv"));
    let response = pipeline::handle(&state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/csv")
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let csv = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(csv.lines().next(), Some("id"));
    assert_eq!(csv.lines().count(), 3);
}

#[tokio::test]
async fn test_arrow_stream_response() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    write_file(
        temp.path(),
        "endpoints/arrow.yaml",
        r#"
url-path: /arrow
template-source: users.sql
connection: [main]
response-format:
  formats: [json, arrow]
  default: json
  arrow-enabled: true
"#,
    );
    let state = app_state(&temp).await;

    let mut request = get("/arrow", &[]);
    request.headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("application/vnd.apache.arrow.stream"),
    );
    let response = pipeline::handle(&state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/vnd.apache.arrow.stream")
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let reader = datafusion::arrow::ipc::reader::StreamReader::try_new(
        std::io::Cursor::new(bytes.to_vec()),
        None,
    )
    .unwrap();
    let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
    assert_eq!(rows, 10);
}

#[tokio::test]
async fn test_write_endpoint_returns_data() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    write_file(
        temp.path(),
        "endpoints/items.sql",
        "CREATE TABLE IF NOT EXISTS items (name VARCHAR, email VARCHAR);\n\
         INSERT INTO items VALUES ('{{ params.name }}', '{{ params.email }}');\n\
         SELECT name, email FROM items\n",
    );
    write_file(
        temp.path(),
        "endpoints/items.yaml",
        r#"
url-path: /items
method: POST
template-source: items.sql
connection: [main]
operation:
  type: write
  returns-data: true
request:
  - field-name: name
    field-in: body
    required: true
  - field-name: email
    field-in: body
    default: default@example.com
"#,
    );
    let state = app_state(&temp).await;

    let mut request = get("/items", &[("email", "query@example.com")]);
    request.method = Method::POST;
    request.body = Some(serde_json::json!({"name": "A"}));
    let response = pipeline::handle(&state, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    // Field default wins over the query parameter on write paths.
    assert_eq!(
        body,
        serde_json::json!([{"name": "A", "email": "default@example.com"}])
    );
}

#[tokio::test]
async fn test_cache_warmup_writes_audit_row() {
    let temp = TempDir::new().unwrap();
    let lake_dir = temp.path().join("lake");
    write_file(
        temp.path(),
        "flapi.yaml",
        &format!(
            r#"
project_name: cache-tests
connections:
  main:
    properties: {{}}
ducklake:
  enabled: true
  alias: flake
  metadata_path: {meta}
  data_path: {data}
template:
  path: endpoints
"#,
            meta = lake_dir.join("metadata.jsonl").display(),
            data = lake_dir.join("data").display(),
        ),
    );
    write_file(temp.path(), "endpoints/users.sql", TEN_ROWS);
    write_file(
        temp.path(),
        "endpoints/users_cache.sql",
        "CREATE OR REPLACE TABLE {{ cache.catalog }}.{{ cache.schema }}.{{ cache.table }} AS \
         SELECT 1 AS id, '{{ cache.mode }}' AS mode\n",
    );
    write_file(
        temp.path(),
        "endpoints/users.yaml",
        r#"
url-path: /users
template-source: users.sql
connection: [main]
cache:
  enabled: true
  table: users_cache
  template-file: users_cache.sql
  cursor:
    column: id
    type: BIGINT
  primary-keys: [id]
"#,
    );

    let state = app_state(&temp).await;
    let app = state.config.app();
    state.cache.warm_up(&app, &state.config.endpoints()).await;

    // Exactly one audit row, terminal status, derived sync type.
    let batches = state
        .engine
        .query("SELECT endpoint_path, sync_type, status FROM flake.audit.sync_events")
        .await
        .unwrap();
    let rows = flapi::engine::convert::batches_to_json_rows(&batches).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["endpoint_path"], serde_json::json!("/users"));
    assert_eq!(rows[0]["sync_type"], serde_json::json!("merge"));
    assert_eq!(rows[0]["status"], serde_json::json!("success"));

    // The cache table itself materialized with the merge mode visible to
    // the template.
    let batches = state
        .engine
        .query("SELECT id, mode FROM flake.main.users_cache")
        .await
        .unwrap();
    let rows = flapi::engine::convert::batches_to_json_rows(&batches).unwrap();
    assert_eq!(
        serde_json::to_value(&rows).unwrap(),
        serde_json::json!([{"id": 1, "mode": "merge"}])
    );

    // One snapshot was committed for the cache table.
    let lake = state.engine.lake().unwrap();
    let snapshots = lake.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].table, "users_cache");
}

#[tokio::test]
async fn test_delete_invalidates_cache_or_405() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    let state = app_state(&temp).await;

    // No cache on /users: DELETE is not allowed.
    let mut request = get("/users", &[]);
    request.method = Method::DELETE;
    let response = pipeline::handle(&state, request).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_format_query_param_overrides_accept() {
    let temp = TempDir::new().unwrap();
    project(&temp);
    let state = app_state(&temp).await;

    let mut request = get("/users", &[("format", "csv"), ("limit", "1")]);
    request
        .headers
        .insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    let response = pipeline::handle(&state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/csv")
    );
}
