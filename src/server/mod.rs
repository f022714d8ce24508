//! HTTP surface: static admin/doc routes plus the dynamic endpoint plane.
//!
//! Static routes are registered on the router; everything else falls
//! through to the dynamic pipeline, which matches configured endpoint
//! patterns in registration order.

pub mod negotiation;
pub mod pipeline;
pub mod response;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::auth::AuthService;
use crate::cache::CacheService;
use crate::config::loader::ConfigState;
use crate::engine::Engine;
use crate::errors::Result;
use crate::rate_limit::RateLimiter;
use crate::utils::paths::slug_to_path;
use pipeline::{json_response, plain, DynamicRequest};

const BANNER: &str = r#"
     ___
 ___( o)>   Welcome to
 \ <_. )    flAPI
  `---'

Fast and Flexible API Framework
    powered by an embedded SQL engine
"#;

/// Shared application state handed to every handler.
pub struct AppState {
    pub config: Arc<ConfigState>,
    pub engine: Arc<Engine>,
    pub cache: Arc<CacheService>,
    pub auth: Arc<AuthService>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<ConfigState>, engine: Arc<Engine>) -> Arc<Self> {
        let cache = Arc::new(CacheService::new(engine.clone()));
        let auth = Arc::new(AuthService::new(engine.clone()));
        Arc::new(Self {
            config,
            engine,
            cache,
            auth,
            limiter: Arc::new(RateLimiter::new()),
        })
    }
}

/// Build the router: static routes first, the dynamic plane as fallback.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE]);

    Router::new()
        .route("/", get(banner))
        .route("/config", get(get_config).delete(reload_config))
        .route(
            "/config/endpoints/{slug}",
            get(get_endpoint).delete(reload_endpoint),
        )
        .route(
            "/config/endpoints/{slug}/cache/refresh",
            post(refresh_endpoint_cache),
        )
        .route("/doc", get(doc_page))
        .route("/doc.yaml", get(doc_yaml))
        .fallback(dynamic)
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn run(state: Arc<AppState>, port: u16) -> Result<()> {
    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server starting on port {port}...");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;
    Ok(())
}

async fn banner() -> Response {
    plain(StatusCode::OK, BANNER)
}

async fn get_config(State(state): State<Arc<AppState>>) -> Response {
    let app = state.config.app();
    let endpoints = state.config.endpoints();
    let endpoint_values: Vec<serde_json::Value> = endpoints
        .iter()
        .map(|e| serde_json::to_value(e.as_ref()).unwrap_or_default())
        .collect();

    match serde_json::to_value(app.as_ref()) {
        Ok(flapi) => json_response(
            StatusCode::OK,
            &serde_json::json!({"flapi": flapi, "endpoints": endpoint_values}),
        ),
        Err(e) => {
            error!("Error serializing config: {e}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn reload_config(State(state): State<Arc<AppState>>) -> Response {
    info!("Config refresh requested");
    match state.config.reload() {
        Ok(()) => plain(StatusCode::OK, "Configuration refreshed successfully"),
        Err(e) => {
            error!("Failed to refresh configuration: {e}");
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to refresh configuration",
            )
        }
    }
}

async fn get_endpoint(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    let path = slug_to_path(&slug);
    match state.config.endpoint_by_identifier(&path) {
        Some(endpoint) => match serde_json::to_value(endpoint.as_ref()) {
            Ok(value) => json_response(StatusCode::OK, &value),
            Err(e) => {
                error!("Error serializing endpoint config: {e}");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
        None => plain(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn reload_endpoint(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    let path = slug_to_path(&slug);
    match state.config.reload_endpoint(&path) {
        Ok(_) => plain(StatusCode::OK, "Endpoint configuration reloaded"),
        Err(crate::errors::FlapiError::RouteNotFound(_)) => {
            plain(StatusCode::NOT_FOUND, "Not Found")
        }
        Err(e) => {
            error!("Failed to reload endpoint {path}: {e}");
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to reload endpoint",
            )
        }
    }
}

async fn refresh_endpoint_cache(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    let path = slug_to_path(&slug);
    let Some(endpoint) = state.config.endpoint_by_identifier(&path) else {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    };
    if !endpoint.cache.is_active() {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "Caching is not enabled");
    }

    let config = state.config.app();
    let mut params = BTreeMap::new();
    match state.cache.refresh(&config, &endpoint, &mut params).await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"status": "success"})),
        Err(e) => {
            error!("Manual cache refresh failed for {path}: {e}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Cache refresh failed")
        }
    }
}

async fn doc_page(State(state): State<Arc<AppState>>) -> Response {
    let app = state.config.app();
    let html = crate::docs::doc_page_html(&app);
    let mut response = Response::new(Body::from(html));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

async fn doc_yaml(State(state): State<Arc<AppState>>) -> Response {
    let app = state.config.app();
    let endpoints = state.config.endpoints();
    match crate::docs::generate_openapi_yaml(&app, &endpoints, Some(&state.engine)).await {
        Ok(yaml) => {
            let mut response = Response::new(Body::from(yaml));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/yaml"),
            );
            response
        }
        Err(e) => {
            error!("OpenAPI generation failed: {e}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// Fallback: every unrouted request enters the dynamic pipeline.
async fn dynamic(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parse_query(parts.uri.query().unwrap_or(""));

    let body_bytes = match axum::body::to_bytes(body, 16 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read request body: {e}");
            return plain(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };
    let body_json = if body_bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body_bytes) {
            Ok(value) => Some(value),
            Err(_) => return plain(StatusCode::BAD_REQUEST, "Request body is not valid JSON"),
        }
    };

    pipeline::handle(
        &state,
        DynamicRequest {
            method: parts.method,
            path,
            query,
            headers: parts.headers,
            client_ip: addr.ip().to_string(),
            body: body_json,
        },
    )
    .await
}

/// Decode a raw query string into a map; later duplicates win.
pub fn parse_query(raw: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let parsed = parse_query("limit=3&offset=0&name=a%20b");
        assert_eq!(parsed.get("limit").map(String::as_str), Some("3"));
        assert_eq!(parsed.get("name").map(String::as_str), Some("a b"));
        assert!(parse_query("").is_empty());
    }
}
