use std::fs;
use std::path::Path;

use flapi::config::loader::{load_app_config, ConfigState};
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn base_config(temp: &TempDir) {
    write_file(
        temp.path(),
        "flapi.yaml",
        r#"
project_name: test-project
project_description: Test project
http_port: 8080
connections:
  main:
    properties:
      path: ./data
template:
  path: endpoints
"#,
    );
    write_file(temp.path(), "endpoints/users.sql", "SELECT 1 AS id\n");
}

#[test]
fn test_load_app_config_resolves_template_path() {
    let temp = TempDir::new().unwrap();
    base_config(&temp);

    let config = load_app_config(temp.path().join("flapi.yaml")).unwrap();
    assert_eq!(config.project_name, "test-project");
    assert!(Path::new(&config.template.path).is_absolute());
    assert!(config.template.path.ends_with("endpoints"));
}

#[test]
fn test_https_requires_cert_and_key() {
    let temp = TempDir::new().unwrap();
    write_file(
        temp.path(),
        "flapi.yaml",
        r#"
enforce-https:
  enabled: true
template:
  path: endpoints
"#,
    );

    let err = load_app_config(temp.path().join("flapi.yaml")).unwrap_err();
    assert!(err.to_string().contains("SSL certificate and key"));
}

#[test]
fn test_endpoint_paths_are_absolute_after_load() {
    let temp = TempDir::new().unwrap();
    base_config(&temp);
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
"#,
    );
    write_file(temp.path(), "endpoints/users_cache.sql", "SELECT 1\n");

    let state = ConfigState::load(temp.path().join("flapi.yaml")).unwrap();
    let endpoints = state.endpoints();
    assert_eq!(endpoints.len(), 1);

    let endpoint = &endpoints[0];
    assert!(Path::new(&endpoint.template_source).is_absolute());
    assert!(endpoint.template_source.ends_with("users.sql"));
    let cache_template = endpoint.cache.template_file.as_deref().unwrap();
    assert!(Path::new(cache_template).is_absolute());
}

#[test]
fn test_paths_stable_across_noop_reload() {
    let temp = TempDir::new().unwrap();
    base_config(&temp);
    write_file(
        temp.path(),
        "endpoints/users.yaml",
        "url-path: /users\ntemplate-source: users.sql\nconnection: [main]\n",
    );

    let state = ConfigState::load(temp.path().join("flapi.yaml")).unwrap();
    let before = state.endpoints()[0].template_source.clone();

    state.reload().unwrap();
    let after_full = state.endpoints()[0].template_source.clone();
    assert_eq!(before, after_full);

    let reloaded = state.reload_endpoint("/users").unwrap();
    assert_eq!(before, reloaded.template_source);
}

#[test]
fn test_malformed_endpoint_file_is_skipped() {
    let temp = TempDir::new().unwrap();
    base_config(&temp);
    write_file(
        temp.path(),
        "endpoints/good.yaml",
        "url-path: /good\ntemplate-source: users.sql\nconnection: [main]\n",
    );
    write_file(temp.path(), "endpoints/bad.yaml", "url-path: [not: {valid\n");
    write_file(
        temp.path(),
        "endpoints/unknown_conn.yaml",
        "url-path: /other\ntemplate-source: users.sql\nconnection: [missing]\n",
    );

    let state = ConfigState::load(temp.path().join("flapi.yaml")).unwrap();
    let endpoints = state.endpoints();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].identifier(), "/good");
}

#[test]
fn test_endpoint_discovery_is_recursive() {
    let temp = TempDir::new().unwrap();
    base_config(&temp);
    write_file(
        temp.path(),
        "endpoints/nested/deep/orders.yaml",
        "url-path: /orders\ntemplate-source: orders.sql\nconnection: [main]\n",
    );
    write_file(temp.path(), "endpoints/nested/deep/orders.sql", "SELECT 2\n");

    let state = ConfigState::load(temp.path().join("flapi.yaml")).unwrap();
    assert!(state.endpoint_by_identifier("/orders").is_some());
}

#[test]
fn test_mcp_endpoint_kinds_are_loaded() {
    let temp = TempDir::new().unwrap();
    base_config(&temp);
    write_file(
        temp.path(),
        "endpoints/tool.yaml",
        r#"
mcp-tool:
  name: list-users
  description: List users
template-source: users.sql
connection: [main]
"#,
    );
    write_file(
        temp.path(),
        "endpoints/prompt.yaml",
        r#"
mcp-prompt:
  name: summarize
  description: Summarize
  template: "Summarize {{ params.table }}"
connection: [main]
"#,
    );

    let state = ConfigState::load(temp.path().join("flapi.yaml")).unwrap();
    assert!(state.endpoint_by_identifier("list-users").is_some());
    assert!(state.endpoint_by_identifier("summarize").is_some());
}

#[test]
fn test_single_endpoint_reload_picks_up_changes() {
    let temp = TempDir::new().unwrap();
    base_config(&temp);
    write_file(
        temp.path(),
        "endpoints/users.yaml",
        "url-path: /users\ntemplate-source: users.sql\nconnection: [main]\n",
    );

    let state = ConfigState::load(temp.path().join("flapi.yaml")).unwrap();
    assert!(state.endpoints()[0].rest.with_pagination);

    write_file(
        temp.path(),
        "endpoints/users.yaml",
        "url-path: /users\ntemplate-source: users.sql\nconnection: [main]\nwith-pagination: false\n",
    );
    let reloaded = state.reload_endpoint("/users").unwrap();
    assert!(!reloaded.rest.with_pagination);
    assert_eq!(state.endpoints().len(), 1);
}

#[test]
fn test_failed_reload_keeps_previous_endpoint() {
    let temp = TempDir::new().unwrap();
    base_config(&temp);
    write_file(
        temp.path(),
        "endpoints/users.yaml",
        "url-path: /users\ntemplate-source: users.sql\nconnection: [main]\n",
    );

    let state = ConfigState::load(temp.path().join("flapi.yaml")).unwrap();

    // Break the file on disk; the reload must fail and keep the old entry.
    write_file(temp.path(), "endpoints/users.yaml", "url-path: {broken\n");
    assert!(state.reload_endpoint("/users").is_err());

    let endpoints = state.endpoints();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].identifier(), "/users");
    assert!(endpoints[0].template_source.ends_with("users.sql"));
}
