//! SQL template rendering.
//!
//! Templates are logic-less documents rendered with four flat scopes:
//!
//! - `params.<name>` — the merged request parameter map
//! - `conn.<prop>` — properties of the endpoint's first connection, with
//!   relative file paths rebased onto the config directory
//! - `env.<VAR>` — process environment variables matching the whitelist
//! - `cache.<key>` — populated during cache refreshes only
//!
//! Unknown keys render as empty strings, so a read template can reference
//! `{{ cache.table }}` and degrade gracefully outside a refresh.

use std::collections::BTreeMap;
use std::path::Path;

use minijinja::{context, Environment, UndefinedBehavior};
use tracing::debug;

use crate::config::{AppConfig, EndpointConfig};
use crate::errors::{FlapiError, Result};

/// Parameter-map keys that carry the cache scope. They are lifted out of
/// `params` and exposed under `cache.<scope key>` instead.
const CACHE_SCOPE_KEYS: &[(&str, &str)] = &[
    ("cacheCatalog", "catalog"),
    ("cacheSchema", "schema"),
    ("cacheTable", "table"),
    ("cacheMode", "mode"),
    ("cacheSnapshotId", "snapshotId"),
    ("cacheSnapshotTimestamp", "snapshotTimestamp"),
    ("previousSnapshotId", "previousSnapshotId"),
    ("previousSnapshotTimestamp", "previousSnapshotTimestamp"),
    ("cacheSchedule", "schedule"),
    ("cursorColumn", "cursorColumn"),
    ("cursorType", "cursorType"),
    ("primaryKeys", "primaryKeys"),
    ("previousCacheTable", "previousTable"),
    ("previousWatermark", "previousWatermark"),
    ("currentWatermark", "currentWatermark"),
];

/// The four scopes handed to a template render.
#[derive(Debug, Default, Clone)]
pub struct TemplateScopes {
    pub params: BTreeMap<String, String>,
    pub conn: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub cache: BTreeMap<String, String>,
}

/// Assemble the render scopes for an endpoint from the merged parameter
/// map. Cache-scope keys are moved out of `params` into `cache`.
pub fn build_scopes(
    config: &AppConfig,
    endpoint: &EndpointConfig,
    params: &mut BTreeMap<String, String>,
) -> TemplateScopes {
    let mut scopes = TemplateScopes::default();

    if let Some(connection_name) = endpoint.connection.first() {
        scopes.conn = connection_properties(config, connection_name);
    }

    for (name, value) in std::env::vars() {
        if config.template.is_environment_variable_allowed(&name) {
            scopes.env.insert(name, value);
        }
    }

    for (param_key, cache_key) in CACHE_SCOPE_KEYS {
        if let Some(value) = params.remove(*param_key) {
            scopes.cache.insert((*cache_key).to_string(), value);
        }
    }

    scopes.params = params.clone();
    scopes
}

/// Properties of a named connection as exposed to templates, with
/// `./`-style relative paths rebased onto the config base directory.
pub fn connection_properties(
    config: &AppConfig,
    connection_name: &str,
) -> BTreeMap<String, String> {
    let Some(connection) = config.connections.get(connection_name) else {
        return BTreeMap::new();
    };

    connection
        .properties
        .iter()
        .map(|(key, value)| {
            let rebased = if value.starts_with("./") || value.starts_with("../") {
                crate::config::loader::resolve_path(&config.base_path, value)
                    .to_string_lossy()
                    .into_owned()
            } else {
                value.clone()
            };
            (key.clone(), rebased)
        })
        .collect()
}

fn template_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env
}

/// Render raw template text with the given scopes.
pub fn render_str(template: &str, scopes: &TemplateScopes) -> Result<String> {
    let env = template_environment();
    let rendered = env.render_str(
        template,
        context! {
            params => scopes.params,
            conn => scopes.conn,
            env => scopes.env,
            cache => scopes.cache,
        },
    )?;
    Ok(rendered)
}

/// Load the endpoint's SQL template from disk and render it.
pub fn render_endpoint_template(endpoint: &EndpointConfig, scopes: &TemplateScopes) -> Result<String> {
    render_file(&endpoint.template_source, scopes)
}

/// Load and render the endpoint's cache template.
pub fn render_cache_template(endpoint: &EndpointConfig, scopes: &TemplateScopes) -> Result<String> {
    let template_file = endpoint
        .cache
        .template_file
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            FlapiError::Config(format!(
                "Endpoint {} has caching enabled but no cache template-file",
                endpoint.identifier()
            ))
        })?;
    render_file(template_file, scopes)
}

fn render_file(path: &str, scopes: &TemplateScopes) -> Result<String> {
    if !Path::new(path).exists() {
        return Err(FlapiError::Config(format!("Template file not found: {path}")));
    }
    let content = std::fs::read_to_string(path)?;
    let rendered = render_str(&content, scopes)?;
    debug!("Processed query:\n{rendered}");
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_endpoint_yaml;

    fn scopes_with_params(pairs: &[(&str, &str)]) -> TemplateScopes {
        TemplateScopes {
            params: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_params_scope() {
        let scopes = scopes_with_params(&[("name", "alice"), ("limit", "10")]);
        let sql = render_str(
            "SELECT * FROM users WHERE name = '{{ params.name }}' LIMIT {{ params.limit }}",
            &scopes,
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM users WHERE name = 'alice' LIMIT 10");
    }

    #[test]
    fn test_unknown_keys_render_empty() {
        let scopes = TemplateScopes::default();
        let sql = render_str("SELECT '{{ params.missing }}{{ cache.table }}'", &scopes).unwrap();
        assert_eq!(sql, "SELECT ''");
    }

    #[test]
    fn test_build_scopes_moves_cache_keys_out_of_params() {
        let config = AppConfig::default();
        let endpoint =
            parse_endpoint_yaml("url-path: /x\ntemplate-source: x.sql\n").unwrap();

        let mut params: BTreeMap<String, String> = [
            ("id".to_string(), "7".to_string()),
            ("cacheTable".to_string(), "users_cache".to_string()),
            ("cacheMode".to_string(), "merge".to_string()),
        ]
        .into_iter()
        .collect();

        let scopes = build_scopes(&config, &endpoint, &mut params);
        assert_eq!(scopes.params.get("id").map(String::as_str), Some("7"));
        assert!(!scopes.params.contains_key("cacheTable"));
        assert_eq!(
            scopes.cache.get("table").map(String::as_str),
            Some("users_cache")
        );
        assert_eq!(scopes.cache.get("mode").map(String::as_str), Some("merge"));
    }

    #[test]
    fn test_env_scope_respects_whitelist() {
        unsafe {
            std::env::set_var("FLAPI_TEST_TOKEN", "sekrit");
            std::env::set_var("FLAPI_TEST_OTHER", "nope");
        }

        let mut config = AppConfig::default();
        config.template.environment_whitelist = vec!["^FLAPI_TEST_TOKEN$".to_string()];
        let endpoint =
            parse_endpoint_yaml("url-path: /x\ntemplate-source: x.sql\n").unwrap();

        let mut params = BTreeMap::new();
        let scopes = build_scopes(&config, &endpoint, &mut params);
        assert_eq!(
            scopes.env.get("FLAPI_TEST_TOKEN").map(String::as_str),
            Some("sekrit")
        );
        assert!(!scopes.env.contains_key("FLAPI_TEST_OTHER"));

        // Non-whitelisted variables render as empty strings.
        let sql = render_str("'{{ env.FLAPI_TEST_OTHER }}'", &scopes).unwrap();
        assert_eq!(sql, "''");
    }
}
