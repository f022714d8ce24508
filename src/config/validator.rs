//! Structural validation of endpoint configurations.
//!
//! Errors reject the endpoint (the previously loaded entry, if any, stays
//! live); warnings are logged and the endpoint is kept.

use std::path::Path;

use crate::config::{AppConfig, EndpointConfig};

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn all_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .cloned()
            .collect()
    }
}

/// Validate one endpoint against the loaded root configuration.
pub fn validate_endpoint(config: &AppConfig, endpoint: &EndpointConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    report.errors.extend(endpoint.validate_self());

    // Every connection the endpoint names must exist globally.
    if endpoint.connection.is_empty() {
        report
            .warnings
            .push("No database connection specified".to_string());
    } else {
        for name in &endpoint.connection {
            if !config.connections.contains_key(name) {
                report
                    .errors
                    .push(format!("Connection '{name}' not found in configuration"));
            }
        }
    }

    // Missing template files are warnings: the file may appear before the
    // first request renders it.
    if !endpoint.template_source.is_empty() && !Path::new(&endpoint.template_source).exists() {
        report.warnings.push(format!(
            "Template file does not exist: {}",
            endpoint.template_source
        ));
    }
    if endpoint.cache.enabled {
        if let Some(template_file) = &endpoint.cache.template_file {
            if !template_file.is_empty() && !Path::new(template_file).exists() {
                report.warnings.push(format!(
                    "Cache template file does not exist: {template_file}"
                ));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_endpoint_yaml, ConnectionConfig};

    fn app_with_connection(name: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config
            .connections
            .insert(name.to_string(), ConnectionConfig::default());
        config
    }

    #[test]
    fn test_unknown_connection_is_an_error() {
        let config = app_with_connection("main");
        let endpoint = parse_endpoint_yaml(
            "url-path: /x\ntemplate-source: x.sql\nconnection: [missing]\n",
        )
        .unwrap();

        let report = validate_endpoint(&config, &endpoint);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("'missing' not found"));
    }

    #[test]
    fn test_empty_connection_list_is_a_warning() {
        let config = app_with_connection("main");
        let endpoint =
            parse_endpoint_yaml("url-path: /x\ntemplate-source: x.sql\n").unwrap();

        let report = validate_endpoint(&config, &endpoint);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2); // no connection + missing template file
    }

    #[test]
    fn test_url_path_must_start_with_slash() {
        let config = app_with_connection("main");
        let endpoint = parse_endpoint_yaml(
            "url-path: users\ntemplate-source: x.sql\nconnection: [main]\n",
        )
        .unwrap();

        let report = validate_endpoint(&config, &endpoint);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("must start with '/'"));
    }

    #[test]
    fn test_prompt_without_template_is_an_error() {
        let config = app_with_connection("main");
        let endpoint = parse_endpoint_yaml(
            "mcp-prompt:\n  name: p\n  description: d\nconnection: [main]\n",
        )
        .unwrap();

        let report = validate_endpoint(&config, &endpoint);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("non-empty template"));
    }
}
