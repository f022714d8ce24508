//! The per-request execution pipeline for dynamic endpoints.
//!
//! Flow: route match, rate limit, auth, parameter assembly, validation,
//! template rendering, engine execution, content negotiation, response
//! serialization. A single request runs the whole sequence on one worker;
//! a failure in any stage maps to the failure table (404/405/429/401/400/
//! 500) without ever crashing the process.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::arrow_ipc::{serialize_stream, ArrowSerializerConfig};
use crate::auth;
use crate::config::templating::{build_scopes, render_endpoint_template};
use crate::config::{EndpointConfig, OperationType};
use crate::errors::{FlapiError, SerializerErrorKind};
use crate::rate_limit::RateLimitDecision;
use crate::server::negotiation::{negotiate, ResponseFormat};
use crate::server::response::{json_envelope, next_url, rows_to_csv};
use crate::server::AppState;
use crate::validation::validate_request_fields;

/// A request to the dynamic plane, decoupled from the transport so the
/// heartbeat worker can drive the same pipeline without a network hop.
#[derive(Debug, Clone)]
pub struct DynamicRequest {
    pub method: Method,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: HeaderMap,
    pub client_ip: String,
    pub body: Option<Value>,
}

impl DynamicRequest {
    /// Synthetic GET used by heartbeat warm-pings.
    pub fn synthetic(path: &str, params: &BTreeMap<String, String>) -> Self {
        Self {
            method: Method::GET,
            path: path.to_string(),
            query: params.clone(),
            headers: HeaderMap::new(),
            client_ip: "127.0.0.1".to_string(),
            body: None,
        }
    }
}

/// Run the full pipeline for one dynamic request.
pub async fn handle(state: &AppState, request: DynamicRequest) -> Response {
    let Some((endpoint, path_params)) = state.config.endpoint_for_path(&request.path) else {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    };

    // Rate limiting precedes auth so abusive clients cannot burn
    // credential lookups.
    let decision = if endpoint.rate_limit.enabled {
        let decision = state.limiter.check(
            &request.client_ip,
            &endpoint.identifier(),
            &endpoint.rate_limit,
        );
        if !decision.allowed {
            let mut response = plain(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Try again later.",
            );
            apply_rate_limit_headers(&mut response, &decision);
            return response;
        }
        Some(decision)
    } else {
        None
    };

    let authorization = request
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.auth.authenticate(&endpoint, authorization).await {
        debug!("Authentication rejected for {}: {e}", endpoint.identifier());
        let mut response = plain(StatusCode::UNAUTHORIZED, "Unauthorized");
        if let Ok(value) = HeaderValue::from_str(&auth::challenge(&endpoint.auth)) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        if let Some(decision) = &decision {
            apply_rate_limit_headers(&mut response, decision);
        }
        return response;
    }

    let mut response = dispatch(state, &endpoint, &request, path_params).await;
    if let Some(decision) = &decision {
        apply_rate_limit_headers(&mut response, decision);
    }
    response
}

async fn dispatch(
    state: &AppState,
    endpoint: &EndpointConfig,
    request: &DynamicRequest,
    path_params: std::collections::HashMap<String, String>,
) -> Response {
    if !endpoint.is_rest() {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    }

    if request.method == Method::DELETE {
        return handle_invalidation(state, endpoint).await;
    }

    if !request.method.as_str().eq_ignore_ascii_case(&endpoint.rest.method) {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    match endpoint.operation.kind {
        OperationType::Read => handle_read(state, endpoint, request, path_params).await,
        OperationType::Write => handle_write(state, endpoint, request, path_params).await,
    }
}

/// `DELETE <url-path>`: cache invalidation, available only when caching is
/// enabled for the endpoint.
async fn handle_invalidation(state: &AppState, endpoint: &EndpointConfig) -> Response {
    if !endpoint.cache.is_active() {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let config = state.config.app();
    let mut params = BTreeMap::new();
    match state.cache.refresh(&config, endpoint, &mut params).await {
        Ok(()) => plain(StatusCode::OK, "Cache invalidated"),
        Err(e) => {
            error!("Failed to invalidate cache: {e}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn handle_read(
    state: &AppState,
    endpoint: &EndpointConfig,
    request: &DynamicRequest,
    path_params: std::collections::HashMap<String, String>,
) -> Response {
    let rest = &endpoint.rest;
    let config = state.config.app();

    // Parameter assembly: internal defaults, then path captures, then the
    // query string.
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    params.insert("offset".to_string(), "0".to_string());
    params.insert("limit".to_string(), "100".to_string());
    for (key, value) in path_params {
        params.insert(key, value);
    }
    for (key, value) in &request.query {
        params.insert(key.clone(), value.clone());
    }
    state
        .cache
        .add_query_cache_params(&config, endpoint, &mut params);

    let (offset, limit) = match parse_pagination(&params) {
        Ok(pair) => pair,
        Err(_) => return plain(StatusCode::BAD_REQUEST, "Invalid pagination parameters"),
    };

    if rest.request_fields_validation {
        let errors = validate_request_fields(&endpoint.request_fields, &params);
        if !errors.is_empty() {
            return validation_response(&errors);
        }
    }

    // Negotiate the response form before touching the engine.
    let accept = request
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let negotiated = negotiate(
        accept,
        request.query.get("format").map(String::as_str),
        &endpoint.response_format,
    );
    if negotiated.format == ResponseFormat::Unsupported {
        return plain(StatusCode::NOT_ACCEPTABLE, &negotiated.error_message);
    }

    let scopes = build_scopes(&config, endpoint, &mut params);
    let query = match render_endpoint_template(endpoint, &scopes) {
        Ok(q) => q,
        Err(e) => {
            error!("Template rendering failed for {}: {e}", endpoint.identifier());
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };
    log_query(&config, endpoint, &query, &scopes.params);

    match negotiated.format {
        ResponseFormat::ArrowStream => {
            serve_arrow(state, endpoint, &query, rest.with_pagination, limit, offset, &negotiated.codec)
                .await
        }
        ResponseFormat::Json | ResponseFormat::Csv => {
            serve_rows(
                state,
                request,
                &query,
                rest.with_pagination,
                limit,
                offset,
                negotiated.format,
            )
            .await
        }
        ResponseFormat::Unsupported => unreachable!("filtered above"),
    }
}

async fn serve_rows(
    state: &AppState,
    request: &DynamicRequest,
    query: &str,
    with_pagination: bool,
    limit: i64,
    offset: i64,
    format: ResponseFormat,
) -> Response {
    let output = match state
        .engine
        .execute_read(query, with_pagination, limit, offset)
        .await
    {
        Ok(output) => output,
        Err(e) => {
            error!("Query execution failed: {e}");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    let rows = match crate::engine::convert::batches_to_json_rows(&output.batches) {
        Ok(rows) => rows,
        Err(e) => {
            error!("Result conversion failed: {e}");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    let next = if with_pagination {
        next_url(
            &request.path,
            &request.query,
            offset,
            limit,
            output.total_count,
        )
    } else {
        String::new()
    };

    let mut response = match format {
        ResponseFormat::Csv => {
            let csv = rows_to_csv(&rows);
            let mut response = Response::new(Body::from(csv));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"));
            response
        }
        _ => {
            let body = if with_pagination {
                json_envelope(rows, &next, output.total_count)
            } else {
                Value::Array(rows.into_iter().map(Value::Object).collect())
            };
            json_response(StatusCode::OK, &body)
        }
    };

    if with_pagination {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&output.total_count.to_string()) {
            headers.insert("X-Total-Count", value);
        }
        if let Ok(value) = HeaderValue::from_str(&next) {
            headers.insert("X-Next", value);
        }
    }
    response
}

async fn serve_arrow(
    state: &AppState,
    endpoint: &EndpointConfig,
    query: &str,
    with_pagination: bool,
    limit: i64,
    offset: i64,
    codec: &str,
) -> Response {
    let wrapped = if with_pagination {
        format!("SELECT * FROM ({query}) AS subquery LIMIT {limit} OFFSET {offset}")
    } else {
        query.to_string()
    };

    let stream = match state.engine.query_stream(&wrapped).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Query execution failed for {}: {e}", endpoint.identifier());
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    let serializer_config = ArrowSerializerConfig::default().with_codec(codec);
    match serialize_stream(stream, &serializer_config).await {
        Ok(serialized) => {
            let mut response = Response::new(Body::from(serialized.data));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(crate::server::negotiation::ARROW_MIME),
            );
            response
        }
        Err(FlapiError::Serializer { kind, message }) => {
            error!("Arrow serialization failed ({kind}): {message}");
            let body = json!({"error": kind.as_str(), "message": "Serialization failed"});
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &body)
        }
        Err(e) => {
            error!("Arrow serialization failed: {e}");
            let body = json!({
                "error": SerializerErrorKind::Compression.as_str(),
                "message": "Serialization failed",
            });
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &body)
        }
    }
}

async fn handle_write(
    state: &AppState,
    endpoint: &EndpointConfig,
    request: &DynamicRequest,
    path_params: std::collections::HashMap<String, String>,
) -> Response {
    let rest = &endpoint.rest;
    let config = state.config.app();

    let mut params = combine_write_parameters(
        endpoint,
        &path_params,
        &request.query,
        request.body.as_ref(),
    );

    if endpoint.operation.validate_before_write || rest.request_fields_validation {
        let errors = validate_request_fields(&endpoint.request_fields, &params);
        if !errors.is_empty() {
            return validation_response(&errors);
        }
    }

    state
        .cache
        .add_query_cache_params(&config, endpoint, &mut params);

    let scopes = build_scopes(&config, endpoint, &mut params);
    let sql = match render_endpoint_template(endpoint, &scopes) {
        Ok(sql) => sql,
        Err(e) => {
            error!("Template rendering failed for {}: {e}", endpoint.identifier());
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };
    log_query(&config, endpoint, &sql, &scopes.params);

    let output = match state
        .engine
        .execute_write(
            &sql,
            endpoint.operation.returns_data,
            endpoint.operation.transaction,
        )
        .await
    {
        Ok(output) => output,
        Err(e) => {
            error!("Write execution failed for {}: {e}", endpoint.identifier());
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    // A write can invalidate the endpoint's own cache.
    if endpoint.cache.invalidate_on_write && endpoint.cache.is_active() {
        let mut refresh_params = BTreeMap::new();
        if let Err(e) = state
            .cache
            .refresh(&config, endpoint, &mut refresh_params)
            .await
        {
            warn!(
                "Post-write cache refresh failed for {}: {e}",
                endpoint.identifier()
            );
        }
    }

    match output.returned {
        Some(batches) => match crate::engine::convert::batches_to_json_rows(&batches) {
            Ok(rows) => {
                let body = Value::Array(rows.into_iter().map(Value::Object).collect());
                json_response(StatusCode::OK, &body)
            }
            Err(e) => {
                error!("Result conversion failed: {e}");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
        None => json_response(
            StatusCode::OK,
            &json!({"rows_affected": output.rows_affected}),
        ),
    }
}

/// Write-path parameter precedence: path captures, then query, then the
/// handler defaults and declared field defaults (neither overridable from
/// the query string), then the JSON body over everything. `null` body
/// values map to an empty string with the key present; nested structures
/// serialize to compact JSON.
pub fn combine_write_parameters(
    endpoint: &EndpointConfig,
    path_params: &std::collections::HashMap<String, String>,
    query: &BTreeMap<String, String>,
    body: Option<&Value>,
) -> BTreeMap<String, String> {
    let mut params: BTreeMap<String, String> = BTreeMap::new();

    for (key, value) in path_params {
        params.insert(key.clone(), value.clone());
    }
    for (key, value) in query {
        params.insert(key.clone(), value.clone());
    }

    params.insert("offset".to_string(), "0".to_string());
    params.insert("limit".to_string(), "100".to_string());

    for field in &endpoint.request_fields {
        if let Some(default) = &field.default_value {
            params.insert(field.field_name.clone(), default.clone());
        }
    }

    if let Some(Value::Object(map)) = body {
        for (key, value) in map {
            params.insert(key.clone(), body_value_to_string(value));
        }
    }

    params
}

fn body_value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn parse_pagination(params: &BTreeMap<String, String>) -> Result<(i64, i64), ()> {
    let offset: i64 = params
        .get("offset")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| ())?
        .unwrap_or(0);
    let limit: i64 = params
        .get("limit")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| ())?
        .unwrap_or(100);
    if offset < 0 || limit < 0 {
        return Err(());
    }
    Ok((offset, limit))
}

fn log_query(
    config: &crate::config::AppConfig,
    endpoint: &EndpointConfig,
    query: &str,
    params: &BTreeMap<String, String>,
) {
    let Some(connection) = endpoint
        .connection
        .first()
        .and_then(|name| config.connections.get(name))
    else {
        return;
    };
    if connection.log_queries {
        info!("[{}] query:\n{query}", endpoint.identifier());
    }
    if connection.log_parameters {
        info!("[{}] parameters: {params:?}", endpoint.identifier());
    }
}

fn apply_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_unix.to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
}

fn validation_response(errors: &[crate::errors::FieldError]) -> Response {
    json_response(StatusCode::BAD_REQUEST, &json!({ "errors": errors }))
}

pub(crate) fn plain(status: StatusCode, body: &str) -> Response {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

pub(crate) fn json_response(status: StatusCode, body: &Value) -> Response {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_endpoint_yaml;

    fn write_endpoint() -> EndpointConfig {
        parse_endpoint_yaml(
            r#"
url-path: /items
method: POST
template-source: items.sql
operation:
  type: write
request:
  - field-name: name
    field-in: body
    required: true
  - field-name: email
    field-in: body
    default: default@example.com
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_write_parameter_precedence() {
        let endpoint = write_endpoint();
        let path_params: std::collections::HashMap<String, String> =
            [("name".to_string(), "PathName".to_string()),
             ("ignored".to_string(), "value".to_string())]
            .into_iter()
            .collect();
        let query: BTreeMap<String, String> = [
            ("email".to_string(), "query@example.com".to_string()),
            ("limit".to_string(), "50".to_string()),
        ]
        .into_iter()
        .collect();
        let body = serde_json::json!({"name": "Body Name", "email": "body@example.com"});

        let params = combine_write_parameters(&endpoint, &path_params, &query, Some(&body));

        assert_eq!(params.get("name").map(String::as_str), Some("Body Name"));
        assert_eq!(
            params.get("email").map(String::as_str),
            Some("body@example.com")
        );
        assert_eq!(params.get("offset").map(String::as_str), Some("0"));
        // Handler defaults are not query-overridable on write paths.
        assert_eq!(params.get("limit").map(String::as_str), Some("100"));
        assert_eq!(params.get("ignored").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_write_defaults_beat_query_when_body_is_missing() {
        let endpoint = write_endpoint();
        let query: BTreeMap<String, String> =
            [("email".to_string(), "query@example.com".to_string())]
                .into_iter()
                .collect();
        let body = serde_json::json!({"name": "A"});

        let params = combine_write_parameters(
            &endpoint,
            &std::collections::HashMap::new(),
            &query,
            Some(&body),
        );

        assert_eq!(params.get("name").map(String::as_str), Some("A"));
        assert_eq!(
            params.get("email").map(String::as_str),
            Some("default@example.com")
        );
    }

    #[test]
    fn test_write_body_null_and_nested_values() {
        let endpoint = write_endpoint();
        let body = serde_json::json!({
            "name": "Jane",
            "nickname": null,
            "metadata": {"age": 30, "active": true},
            "tags": ["alpha", "beta"],
            "empty": "",
        });

        let params = combine_write_parameters(
            &endpoint,
            &std::collections::HashMap::new(),
            &BTreeMap::new(),
            Some(&body),
        );

        assert_eq!(params.get("nickname").map(String::as_str), Some(""));
        assert_eq!(params.get("empty").map(String::as_str), Some(""));
        let metadata: Value =
            serde_json::from_str(params.get("metadata").unwrap()).unwrap();
        assert_eq!(metadata["age"], serde_json::json!(30));
        assert_eq!(
            params.get("tags").map(String::as_str),
            Some(r#"["alpha","beta"]"#)
        );
    }

    #[test]
    fn test_parse_pagination() {
        let mut params = BTreeMap::new();
        params.insert("offset".to_string(), "10".to_string());
        params.insert("limit".to_string(), "25".to_string());
        assert_eq!(parse_pagination(&params), Ok((10, 25)));

        params.insert("limit".to_string(), "abc".to_string());
        assert!(parse_pagination(&params).is_err());

        params.insert("limit".to_string(), "-1".to_string());
        assert!(parse_pagination(&params).is_err());
    }
}
