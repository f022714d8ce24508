//! Configuration model for the gateway.
//!
//! The types in this module are the contract between YAML on disk and the
//! running routing/execution plane. The root file (`flapi.yaml`) carries
//! project metadata, the server port, connections, the lake catalog and
//! engine tuning; one endpoint YAML per file under the template directory
//! describes each REST route or MCP capability.

pub mod loader;
pub mod templating;
pub mod validator;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{FlapiError, Result};
use crate::utils::interval::parse_interval;

fn default_true() -> bool {
    true
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_rate_limit_max() -> i64 {
    100
}

fn default_rate_limit_interval() -> u64 {
    60
}

fn default_formats() -> Vec<String> {
    vec!["json".to_string(), "csv".to_string()]
}

fn default_format() -> String {
    "json".to_string()
}

fn default_worker_interval() -> u64 {
    10
}

fn default_mime_json() -> String {
    "application/json".to_string()
}

/// Root configuration parsed from `flapi.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub project_description: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default, rename = "enforce-https")]
    pub enforce_https: HttpsConfig,

    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,

    /// Endpoint-level defaults applied when an endpoint file has no
    /// `rate-limit` section of its own.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Endpoint-level defaults applied when an endpoint file has no
    /// `auth` section of its own.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub ducklake: DuckLakeConfig,

    /// Engine tuning keys. `db_path` selects the database location; every
    /// other key is handed to the engine verbatim.
    #[serde(default)]
    pub engine: BTreeMap<String, String>,

    #[serde(default)]
    pub template: TemplateConfig,

    #[serde(default)]
    pub heartbeat: GlobalHeartbeatConfig,

    #[serde(default)]
    pub cache_schema: Option<String>,

    /// Directory of the root YAML file; relative paths resolve against it.
    #[serde(skip)]
    pub base_path: PathBuf,
}

impl AppConfig {
    pub fn engine_db_path(&self) -> String {
        self.engine
            .get("db_path")
            .cloned()
            .unwrap_or_else(|| ":memory:".to_string())
    }

    /// Engine settings without the `db_path` location key.
    pub fn engine_settings(&self) -> BTreeMap<String, String> {
        self.engine
            .iter()
            .filter(|(k, _)| k.as_str() != "db_path")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Default schema for cache tables whose endpoint leaves it unset.
    pub fn cache_schema(&self) -> &str {
        self.cache_schema.as_deref().unwrap_or("main")
    }
}

/// HTTPS enforcement settings. Certificate and key are both required when
/// enabled; the loader rejects the configuration otherwise.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HttpsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "ssl-cert-file")]
    pub ssl_cert_file: String,
    #[serde(default, rename = "ssl-key-file")]
    pub ssl_key_file: String,
}

/// A named engine connection: init SQL plus free-form properties exposed
/// to templates under the `conn.` scope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub init: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default, rename = "log-queries")]
    pub log_queries: bool,
    #[serde(default, rename = "log-parameters")]
    pub log_parameters: bool,
}

/// Lake catalog attach parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DuckLakeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "DuckLakeConfig::default_alias")]
    pub alias: String,
    #[serde(default)]
    pub metadata_path: String,
    #[serde(default)]
    pub data_path: String,
    #[serde(default)]
    pub data_inlining_row_limit: Option<u64>,
    #[serde(default)]
    pub override_data_path: bool,
}

impl DuckLakeConfig {
    fn default_alias() -> String {
        "flake".to_string()
    }
}

impl Default for DuckLakeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            alias: Self::default_alias(),
            metadata_path: String::new(),
            data_path: String::new(),
            data_inlining_row_limit: None,
            override_data_path: false,
        }
    }
}

/// Template directory settings. The whitelist patterns gate which process
/// environment variables templates may read through the `env.` scope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TemplateConfig {
    pub path: String,
    #[serde(default, rename = "environment-whitelist")]
    pub environment_whitelist: Vec<String>,
}

impl TemplateConfig {
    /// Whether `name` matches at least one whitelist pattern. An empty
    /// whitelist exposes nothing.
    pub fn is_environment_variable_allowed(&self, name: &str) -> bool {
        self.environment_whitelist.iter().any(|pattern| {
            regex::Regex::new(pattern)
                .map(|re| re.is_match(name))
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalHeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_worker_interval", rename = "worker-interval")]
    pub worker_interval: u64,
}

impl Default for GlobalHeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_interval: default_worker_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint configuration
// ---------------------------------------------------------------------------

/// REST settings of an endpoint. The capability is present exactly when
/// `url-path` is set; the remaining fields keep their defaults for MCP-only
/// documents.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestInfo {
    #[serde(
        default,
        rename = "url-path",
        skip_serializing_if = "Option::is_none"
    )]
    pub url_path: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_true", rename = "with-pagination")]
    pub with_pagination: bool,
    #[serde(default = "default_true", rename = "request-fields-validation")]
    pub request_fields_validation: bool,
}

impl Default for RestInfo {
    fn default() -> Self {
        Self {
            url_path: None,
            method: default_method(),
            with_pagination: true,
            request_fields_validation: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_mime_json")]
    pub result_mime_type: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpResourceInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_mime_json")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpPromptInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Prompt template literal, embedded in the config rather than read
    /// from a template file.
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Where a request field is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldIn {
    Query,
    Path,
    Body,
    Header,
}

/// One field-level validation rule. The `type` key selects the variant;
/// `preventSqlInjection` applies irrespective of type.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidatorConfig {
    #[serde(flatten)]
    pub rule: ValidatorRule,
    #[serde(default = "default_true", rename = "preventSqlInjection")]
    pub prevent_sql_injection: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValidatorRule {
    Int {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    String {
        #[serde(default)]
        regex: String,
        #[serde(default, rename = "minLength")]
        min_length: usize,
    },
    Enum {
        #[serde(rename = "allowedValues")]
        allowed_values: Vec<String>,
    },
    Date {
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
    Time {
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
}

/// Declared request field with its validation rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestFieldConfig {
    #[serde(rename = "field-name")]
    pub field_name: String,
    #[serde(rename = "field-in")]
    pub field_in: FieldIn,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "default")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_max")]
    pub max: i64,
    /// Window length in seconds.
    #[serde(default = "default_rate_limit_interval")]
    pub interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max: default_rate_limit_max(),
            interval: default_rate_limit_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Secret-table backing for Basic auth: the init statement creates a
/// credential handle in the engine, the payload query returns the secret
/// JSON document, and lookups run against `secret_table`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecretManagerConfig {
    pub secret_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub secret_id: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub secret_table: Option<String>,
    #[serde(default)]
    pub init: Option<String>,
}

impl SecretManagerConfig {
    /// Sanitized table name backing this secret, `auth_<sanitized>`.
    pub fn table_name(&self) -> String {
        match &self.secret_table {
            Some(t) if !t.is_empty() => t.clone(),
            _ => format!("auth_{}", sanitize_identifier(&self.secret_name)),
        }
    }

    /// Init SQL creating the credential handle, defaulted from the secret
    /// name and key material when not configured explicitly.
    pub fn init_sql(&self) -> String {
        if let Some(init) = &self.init {
            return init.clone();
        }
        let mut stmt = format!(
            "CREATE OR REPLACE SECRET {} (TYPE S3",
            sanitize_identifier(&self.secret_name)
        );
        if !self.secret_id.is_empty() && !self.secret_key.is_empty() {
            stmt.push_str(&format!(
                ", KEY_ID '{}', SECRET '{}'",
                self.secret_id, self.secret_key
            ));
        } else {
            stmt.push_str(", PROVIDER CREDENTIAL_CHAIN");
        }
        if !self.region.is_empty() {
            stmt.push_str(&format!(", REGION '{}'", self.region));
        }
        stmt.push_str(");");
        stmt
    }
}

/// Replace every non-alphanumeric character with `_` so the value can be
/// used as a SQL identifier.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `basic` or `bearer`.
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub users: Vec<AuthUser>,
    #[serde(default, rename = "from-aws-secretmanager")]
    pub from_aws_secretmanager: Option<SecretManagerConfig>,
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default)]
    pub jwt_issuer: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheCursor {
    pub column: String,
    pub r#type: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheRetention {
    #[serde(default, rename = "keep-last-snapshots")]
    pub keep_last_snapshots: Option<u64>,
    /// Interval string like `7d`; snapshots older than this expire.
    #[serde(default, rename = "max-snapshot-age")]
    pub max_snapshot_age: Option<String>,
}

impl CacheRetention {
    pub fn is_configured(&self) -> bool {
        self.keep_last_snapshots.is_some() || self.max_snapshot_age.is_some()
    }
}

/// Materialization mode, derived from the cache config alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Full,
    Append,
    Merge,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Append => "append",
            Self::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Catalog override; falls back to the lake alias.
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: String,
    #[serde(default, rename = "template-file")]
    pub template_file: Option<String>,
    /// Refresh interval, `<n>[smhd]`.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub cursor: Option<CacheCursor>,
    #[serde(default, rename = "primary-keys")]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub retention: CacheRetention,
    #[serde(default, rename = "invalidate-on-write")]
    pub invalidate_on_write: bool,
    #[serde(default, rename = "refresh-endpoint")]
    pub refresh_endpoint: bool,
}

impl CacheConfig {
    /// `cursor absent -> full`; `cursor, no primary keys -> append`;
    /// `cursor with primary keys -> merge`.
    pub fn mode(&self) -> CacheMode {
        match (&self.cursor, self.primary_keys.is_empty()) {
            (None, _) => CacheMode::Full,
            (Some(_), true) => CacheMode::Append,
            (Some(_), false) => CacheMode::Merge,
        }
    }

    /// Caching is live only when enabled and a target table is set.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.table.is_empty()
    }

    pub fn schedule_duration(&self) -> Option<std::time::Duration> {
        self.schedule.as_deref().and_then(parse_interval)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseFormatConfig {
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    #[serde(default = "default_format", rename = "default")]
    pub default_format: String,
    #[serde(default, rename = "arrow-enabled")]
    pub arrow_enabled: bool,
}

impl Default for ResponseFormatConfig {
    fn default() -> Self {
        Self {
            formats: default_formats(),
            default_format: default_format(),
            arrow_enabled: false,
        }
    }
}

impl ResponseFormatConfig {
    pub fn supports(&self, format: &str) -> bool {
        self.formats.iter().any(|f| f.eq_ignore_ascii_case(format))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    #[default]
    Read,
    Write,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OperationConfig {
    #[serde(default, rename = "type")]
    pub kind: OperationType,
    #[serde(default)]
    pub transaction: bool,
    #[serde(default, rename = "returns-data")]
    pub returns_data: bool,
    #[serde(default, rename = "validate-before-write")]
    pub validate_before_write: bool,
}

/// One configured endpoint: a shared envelope (template, connections,
/// auth, rate limit, cache, heartbeat, request fields) attached to at
/// least one capability out of REST / MCP tool / MCP resource / MCP
/// prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    #[serde(flatten)]
    pub rest: RestInfo,
    #[serde(default, rename = "mcp-tool")]
    pub mcp_tool: Option<McpToolInfo>,
    #[serde(default, rename = "mcp-resource")]
    pub mcp_resource: Option<McpResourceInfo>,
    #[serde(default, rename = "mcp-prompt")]
    pub mcp_prompt: Option<McpPromptInfo>,

    /// Absolute after loading; see the loader's path resolution.
    #[serde(default, rename = "template-source")]
    pub template_source: String,
    #[serde(default)]
    pub connection: Vec<String>,
    #[serde(default, rename = "request")]
    pub request_fields: Vec<RequestFieldConfig>,
    #[serde(default, rename = "rate-limit")]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default, rename = "response-format")]
    pub response_format: ResponseFormatConfig,
    #[serde(default)]
    pub operation: OperationConfig,

    /// Path of the YAML file this endpoint was loaded from.
    #[serde(skip)]
    pub source_file: PathBuf,
}

/// Capability kind used for endpoint identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Rest,
    McpTool,
    McpResource,
    McpPrompt,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::McpTool => "mcp-tool",
            Self::McpResource => "mcp-resource",
            Self::McpPrompt => "mcp-prompt",
        }
    }
}

impl EndpointConfig {
    pub fn is_rest(&self) -> bool {
        self.rest.url_path.is_some()
    }

    pub fn url_path(&self) -> Option<&str> {
        self.rest.url_path.as_deref()
    }

    /// Primary capability kind, REST first.
    pub fn kind(&self) -> Option<EndpointKind> {
        if self.is_rest() {
            Some(EndpointKind::Rest)
        } else if self.mcp_tool.is_some() {
            Some(EndpointKind::McpTool)
        } else if self.mcp_resource.is_some() {
            Some(EndpointKind::McpResource)
        } else if self.mcp_prompt.is_some() {
            Some(EndpointKind::McpPrompt)
        } else {
            None
        }
    }

    /// Identity used for matching and reload: the URL path for REST
    /// endpoints, the capability name otherwise.
    pub fn identifier(&self) -> String {
        if let Some(url_path) = &self.rest.url_path {
            return url_path.clone();
        }
        if let Some(tool) = &self.mcp_tool {
            return tool.name.clone();
        }
        if let Some(resource) = &self.mcp_resource {
            return resource.name.clone();
        }
        if let Some(prompt) = &self.mcp_prompt {
            return prompt.name.clone();
        }
        String::new()
    }

    /// Structural self-checks shared by the validator.
    pub fn validate_self(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.kind().is_none() {
            errors.push(
                "Configuration must have either 'url-path' (for REST endpoints) or \
                 'mcp-tool'/'mcp-resource'/'mcp-prompt' (for MCP entities)"
                    .to_string(),
            );
        }
        if let Some(url_path) = &self.rest.url_path {
            if !url_path.starts_with('/') {
                errors.push(format!("url-path must start with '/': {url_path}"));
            }
        }
        if let Some(prompt) = &self.mcp_prompt {
            if prompt.template.is_empty() {
                errors.push(format!(
                    "MCP prompt '{}' must carry a non-empty template",
                    prompt.name
                ));
            }
        } else if self.template_source.is_empty() {
            errors.push("template-source cannot be empty".to_string());
        }
        errors
    }
}

/// Parse an endpoint YAML document. The caller resolves paths afterwards.
pub fn parse_endpoint_yaml(content: &str) -> Result<EndpointConfig> {
    let endpoint: EndpointConfig = serde_yaml::from_str(content)?;
    if endpoint.kind().is_none() {
        return Err(FlapiError::Config(
            "Configuration must have either 'url-path' (for REST endpoints) or \
             'mcp-tool'/'mcp-resource'/'mcp-prompt' (for MCP entities)"
                .to_string(),
        ));
    }
    Ok(endpoint)
}
