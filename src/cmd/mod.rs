//! Command-line interface and server startup orchestration.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::config::loader::ConfigState;
use crate::engine::Engine;
use crate::errors::Result;
use crate::heartbeat::HeartbeatWorker;
use crate::server::{self, AppState};

/// Command-line interface for the flapi gateway.
#[derive(Parser, Debug)]
#[command(
    name = "flapi",
    version,
    about = "Declarative SQL-backed HTTP API gateway.",
    long_about = "Declarative SQL-backed HTTP API gateway.\n\
Endpoints are described in YAML with SQL templates and compiled into live\n\
HTTP routes; results stream back as JSON, CSV or an Arrow IPC stream."
)]
pub struct Cli {
    /// Path to the flapi.yaml configuration file.
    #[arg(long = "config", short = 'c', value_name = "FILE", default_value = "flapi.yaml")]
    pub config: String,

    /// Port number for the web server (overrides the configured port).
    #[arg(long = "port", short = 'p', value_name = "PORT")]
    pub port: Option<u16>,

    /// Set log level (overrides env vars like RUST_LOG).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Emit logs in JSON format.
    #[arg(long = "log-json")]
    pub log_json: bool,
}

/// Load configuration, open the engine, warm caches, start the heartbeat
/// worker and serve until shutdown.
pub async fn run_server(cli: &Cli) -> Result<()> {
    info!("Starting flapi gateway");

    let config_state = Arc::new(ConfigState::load(&cli.config)?);
    let app = config_state.app();

    if app.enforce_https.enabled {
        // TLS termination is delegated to the fronting proxy; the paths
        // are validated at load time.
        info!(
            "HTTPS enforced with cert {} and key {}",
            app.enforce_https.ssl_cert_file, app.enforce_https.ssl_key_file
        );
    }

    let engine = Arc::new(Engine::open(&app).await?);
    let state = AppState::new(config_state.clone(), engine.clone());

    state
        .cache
        .warm_up(&app, &config_state.endpoints())
        .await;

    let heartbeat = HeartbeatWorker::start(state.clone());

    let port = cli.port.unwrap_or(app.http_port);
    let serve_result = server::run(state, port).await;

    heartbeat.stop().await;
    engine.shutdown().await;

    if let Err(e) = serve_result {
        warn!("Server terminated with error: {e}");
        return Err(e);
    }
    info!("Clean shutdown complete");
    Ok(())
}
