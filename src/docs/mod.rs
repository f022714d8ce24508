//! OpenAPI 3.0 document generation for the live endpoint set.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::templating::{build_scopes, render_endpoint_template};
use crate::config::{AppConfig, EndpointConfig, FieldIn, OperationType};
use crate::engine::Engine;
use crate::errors::Result;

/// Generate the `/doc.yaml` OpenAPI 3.0 document. When an engine is
/// available, read endpoints get a response schema derived from their
/// query's result shape.
pub async fn generate_openapi_yaml(
    config: &AppConfig,
    endpoints: &[Arc<EndpointConfig>],
    engine: Option<&Engine>,
) -> Result<String> {
    let mut paths = Map::new();

    for endpoint in endpoints {
        let Some(url_path) = endpoint.url_path() else {
            continue;
        };

        let mut operation = json!({
            "summary": format!("Endpoint {url_path}"),
            "parameters": parameters_for(endpoint),
            "responses": {
                "200": {"description": "Successful response"},
                "400": {"description": "Validation error"},
                "500": {"description": "Engine error"},
            },
        });

        if let Some(engine) = engine {
            if endpoint.operation.kind == OperationType::Read {
                if let Some(properties) = describe_endpoint(config, endpoint, engine).await {
                    operation["responses"]["200"]["content"] = json!({
                        "application/json": {
                            "schema": {
                                "type": "object",
                                "properties": {
                                    "data": {
                                        "type": "array",
                                        "items": {"type": "object", "properties": properties},
                                    },
                                    "next": {"type": "string"},
                                    "total_count": {"type": "integer"},
                                },
                            }
                        }
                    });
                }
            }
        }
        if endpoint.auth.enabled {
            let scheme = if endpoint.auth.r#type.eq_ignore_ascii_case("bearer") {
                "bearerAuth"
            } else {
                "basicAuth"
            };
            let mut requirement = Map::new();
            requirement.insert(scheme.to_string(), json!([]));
            operation["security"] = Value::Array(vec![Value::Object(requirement)]);
            operation["responses"]["401"] = json!({"description": "Unauthorized"});
        }
        if endpoint.rate_limit.enabled {
            operation["responses"]["429"] = json!({"description": "Rate limit exceeded"});
        }

        let method = endpoint.rest.method.to_ascii_lowercase();

        let mut item = Map::new();
        item.insert(method, operation);
        if endpoint.cache.is_active() {
            item.insert(
                "delete".to_string(),
                json!({
                    "summary": "Invalidate the endpoint cache",
                    "responses": {"200": {"description": "Cache invalidated"}},
                }),
            );
        }

        paths.insert(openapi_path(url_path), Value::Object(item));
    }

    let document = json!({
        "openapi": "3.0.0",
        "info": {
            "title": config.project_name,
            "description": config.project_description,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "servers": [
            {"url": format!("http://{}:{}", config.server_name, config.http_port)}
        ],
        "paths": paths,
        "components": {
            "securitySchemes": {
                "basicAuth": {"type": "http", "scheme": "basic"},
                "bearerAuth": {"type": "http", "scheme": "bearer", "bearerFormat": "JWT"},
            }
        },
    });

    Ok(serde_yaml::to_string(&document)?)
}

/// Minimal HTML page for `/doc`, pointing at the YAML document.
pub fn doc_page_html(config: &AppConfig) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title} API</title></head>\n<body>\n\
         <h1>{title}</h1>\n<p>{description}</p>\n\
         <p>The OpenAPI document is served at <a href=\"/doc.yaml\">/doc.yaml</a>.</p>\n\
         </body>\n</html>\n",
        title = config.project_name,
        description = config.project_description,
    )
}

/// Render the endpoint's template with empty request parameters and ask
/// the engine for the result shape. Queries that need real parameters to
/// plan simply yield no schema.
async fn describe_endpoint(
    config: &AppConfig,
    endpoint: &EndpointConfig,
    engine: &Engine,
) -> Option<Value> {
    let mut params = std::collections::BTreeMap::new();
    let scopes = build_scopes(config, endpoint, &mut params);
    let query = render_endpoint_template(endpoint, &scopes).ok()?;
    let columns = engine
        .describe_query(&format!("SELECT * FROM ({query}) AS subquery"))
        .await
        .ok()?;

    let mut properties = Map::new();
    for (name, engine_type) in columns {
        properties.insert(name, json!({"type": openapi_type(&engine_type)}));
    }
    Some(Value::Object(properties))
}

fn openapi_type(engine_type: &str) -> &'static str {
    let upper = engine_type.to_ascii_uppercase();
    if upper.contains("INT") {
        "integer"
    } else if upper.contains("FLOAT") || upper.contains("DOUBLE") || upper.contains("DECIMAL") {
        "number"
    } else if upper.contains("BOOL") {
        "boolean"
    } else {
        "string"
    }
}

/// Convert `:name` placeholders into OpenAPI `{name}` segments.
fn openapi_path(url_path: &str) -> String {
    url_path
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn parameters_for(endpoint: &EndpointConfig) -> Value {
    let parameters: Vec<Value> = endpoint
        .request_fields
        .iter()
        .filter(|field| field.field_in != FieldIn::Body)
        .map(|field| {
            json!({
                "name": field.field_name,
                "in": match field.field_in {
                    FieldIn::Query => "query",
                    FieldIn::Path => "path",
                    FieldIn::Header => "header",
                    FieldIn::Body => unreachable!("filtered above"),
                },
                "required": field.required,
                "description": field.description,
                "schema": {"type": "string"},
            })
        })
        .collect();
    Value::Array(parameters)
}
