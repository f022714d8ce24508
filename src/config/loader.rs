//! Loads the root configuration and the endpoint tree, and owns the live,
//! reloadable endpoint set.
//!
//! Path semantics: `template-source` and `cache.template-file` are stored
//! as absolute paths once an endpoint is loaded, resolved against the
//! directory of the endpoint's own YAML file. A reload of a config whose
//! on-disk value is relative therefore resolves identically to the initial
//! load, regardless of the process working directory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::validator::validate_endpoint;
use crate::config::{parse_endpoint_yaml, AppConfig, EndpointConfig};
use crate::errors::{FlapiError, Result};

/// Read and parse `flapi.yaml`, resolving the template directory against
/// the config file's own directory.
pub fn load_app_config(config_file: impl AsRef<Path>) -> Result<AppConfig> {
    let config_file = config_file.as_ref();
    info!("Loading configuration file: {}", config_file.display());

    let content = std::fs::read_to_string(config_file).map_err(|e| {
        FlapiError::Config(format!(
            "Cannot read configuration file {}: {e}",
            config_file.display()
        ))
    })?;

    let mut config: AppConfig = serde_yaml::from_str(&content).map_err(|e| {
        FlapiError::Config(format!(
            "Error loading configuration file {}: {e}",
            config_file.display()
        ))
    })?;

    config.base_path = config_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if config.enforce_https.enabled
        && (config.enforce_https.ssl_cert_file.is_empty()
            || config.enforce_https.ssl_key_file.is_empty())
    {
        return Err(FlapiError::Config(
            "SSL certificate and key files must be specified when HTTPS is enabled".to_string(),
        ));
    }

    if config.template.path.is_empty() {
        return Err(FlapiError::Config(
            "Template configuration is missing in flapi.yaml".to_string(),
        ));
    }
    config.template.path = resolve_path(&config.base_path, &config.template.path)
        .to_string_lossy()
        .into_owned();

    debug!(
        project = %config.project_name,
        port = config.http_port,
        template_path = %config.template.path,
        "Parsed main configuration"
    );

    Ok(config)
}

/// Resolve `value` against `base` and normalize to an absolute path.
/// Canonicalizes when the target exists; otherwise falls back to a lexical
/// absolute join so missing files still get stable identities.
pub fn resolve_path(base: &Path, value: &str) -> PathBuf {
    let candidate = PathBuf::from(value);
    let joined = if candidate.is_absolute() {
        candidate
    } else {
        base.join(candidate)
    };

    match joined.canonicalize() {
        Ok(canonical) => canonical,
        Err(_) => {
            if joined.is_absolute() {
                joined
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(&joined))
                    .unwrap_or(joined)
            }
        }
    }
}

/// Load a single endpoint file: parse, resolve template paths, apply the
/// global rate-limit/auth defaults, and validate.
pub fn load_endpoint_file(config: &AppConfig, file: &Path) -> Result<EndpointConfig> {
    let content = std::fs::read_to_string(file)?;
    let mut endpoint = parse_endpoint_yaml(&content).map_err(|e| {
        FlapiError::Config(format!(
            "Error loading endpoint config from file: {}, Error: {e}",
            file.display()
        ))
    })?;

    let endpoint_dir = file.parent().unwrap_or(Path::new("."));

    if !endpoint.template_source.is_empty() {
        endpoint.template_source = resolve_path(endpoint_dir, &endpoint.template_source)
            .to_string_lossy()
            .into_owned();
    }
    if let Some(template_file) = endpoint.cache.template_file.clone() {
        if !template_file.is_empty() {
            endpoint.cache.template_file = Some(
                resolve_path(endpoint_dir, &template_file)
                    .to_string_lossy()
                    .into_owned(),
            );
        }
    }

    // Endpoint files without their own sections inherit the global
    // defaults from flapi.yaml.
    if !endpoint.rate_limit.enabled {
        if let Some(global) = &config.rate_limit {
            if global.enabled {
                endpoint.rate_limit = global.clone();
            }
        }
    }
    if !endpoint.auth.enabled {
        if let Some(global) = &config.auth {
            if global.enabled {
                endpoint.auth = global.clone();
            }
        }
    }

    endpoint.source_file = file.to_path_buf();

    let report = validate_endpoint(config, &endpoint);
    for warning in &report.warnings {
        warn!("{}: {warning}", file.display());
    }
    if !report.is_valid() {
        return Err(FlapiError::Config(format!(
            "Invalid endpoint config {}: {}",
            file.display(),
            report.errors.join("; ")
        )));
    }

    Ok(endpoint)
}

/// Walk the template directory recursively and load every `.yaml`/`.yml`
/// endpoint file. A malformed file is skipped with a diagnostic and does
/// not abort the load.
pub fn load_endpoints(config: &AppConfig) -> Result<Vec<EndpointConfig>> {
    let template_path = Path::new(&config.template.path);
    if !template_path.is_dir() {
        return Err(FlapiError::Config(format!(
            "Template path does not exist or is not a directory: {}",
            template_path.display()
        )));
    }

    info!(
        "Loading endpoint configs recursively from: {}",
        template_path.display()
    );

    let mut endpoints = Vec::new();
    for entry in WalkDir::new(template_path) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable directory entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_yaml = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }

        match load_endpoint_file(config, entry.path()) {
            Ok(endpoint) => {
                debug!(
                    "Loaded endpoint {} from {}",
                    endpoint.identifier(),
                    entry.path().display()
                );
                endpoints.push(endpoint);
            }
            Err(e) => warn!("Skipping endpoint file {}: {e}", entry.path().display()),
        }
    }

    info!("Loaded {} endpoint configurations", endpoints.len());
    Ok(endpoints)
}

/// Live configuration: read-mostly snapshots swapped atomically on reload.
/// Readers clone the `Arc` and keep a consistent view for the duration of
/// a request.
pub struct ConfigState {
    config_file: PathBuf,
    app: RwLock<Arc<AppConfig>>,
    endpoints: RwLock<Arc<Vec<Arc<EndpointConfig>>>>,
}

impl ConfigState {
    /// Load everything from disk and build the initial snapshots.
    pub fn load(config_file: impl AsRef<Path>) -> Result<Self> {
        let config_file = config_file.as_ref().to_path_buf();
        let app = load_app_config(&config_file)?;
        let endpoints = load_endpoints(&app)?
            .into_iter()
            .map(Arc::new)
            .collect::<Vec<_>>();

        Ok(Self {
            config_file,
            app: RwLock::new(Arc::new(app)),
            endpoints: RwLock::new(Arc::new(endpoints)),
        })
    }

    pub fn app(&self) -> Arc<AppConfig> {
        self.app.read().expect("config lock poisoned").clone()
    }

    /// Current endpoint snapshot, in registration order.
    pub fn endpoints(&self) -> Arc<Vec<Arc<EndpointConfig>>> {
        self.endpoints.read().expect("config lock poisoned").clone()
    }

    /// First endpoint whose REST pattern matches `path`, with captures.
    pub fn endpoint_for_path(
        &self,
        path: &str,
    ) -> Option<(Arc<EndpointConfig>, std::collections::HashMap<String, String>)> {
        let endpoints = self.endpoints();
        for endpoint in endpoints.iter() {
            let Some(pattern) = endpoint.url_path() else {
                continue;
            };
            match crate::utils::paths::match_route(pattern, path) {
                Ok(Some(params)) => return Some((endpoint.clone(), params)),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Bad route pattern '{pattern}': {e}");
                    continue;
                }
            }
        }
        None
    }

    /// Endpoint by its identifier (URL path for REST, capability name for
    /// MCP kinds).
    pub fn endpoint_by_identifier(&self, identifier: &str) -> Option<Arc<EndpointConfig>> {
        self.endpoints()
            .iter()
            .find(|e| e.identifier() == identifier)
            .cloned()
    }

    /// Full reload: re-read the root file and the whole endpoint tree,
    /// then swap both snapshots.
    pub fn reload(&self) -> Result<()> {
        let app = load_app_config(&self.config_file)?;
        let endpoints = load_endpoints(&app)?
            .into_iter()
            .map(Arc::new)
            .collect::<Vec<_>>();

        *self.app.write().expect("config lock poisoned") = Arc::new(app);
        *self.endpoints.write().expect("config lock poisoned") = Arc::new(endpoints);
        info!("Configuration reloaded");
        Ok(())
    }

    /// Re-parse one endpoint's file and atomically replace the live entry
    /// whose identifier is `identifier`. A failed parse or validation
    /// keeps the previous entry unchanged.
    pub fn reload_endpoint(&self, identifier: &str) -> Result<Arc<EndpointConfig>> {
        let current = self
            .endpoint_by_identifier(identifier)
            .ok_or_else(|| FlapiError::RouteNotFound(identifier.to_string()))?;

        let app = self.app();
        let reloaded = Arc::new(load_endpoint_file(&app, &current.source_file)?);

        let mut guard = self.endpoints.write().expect("config lock poisoned");
        let mut next: Vec<Arc<EndpointConfig>> = guard.as_ref().clone();
        if let Some(slot) = next.iter_mut().find(|e| e.identifier() == identifier) {
            *slot = reloaded.clone();
        }
        *guard = Arc::new(next);

        info!("Reloaded endpoint {identifier}");
        Ok(reloaded)
    }
}
