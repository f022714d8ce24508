//! # flapi
//!
//! Declarative SQL-backed HTTP API gateway.
//!
//! ## Overview
//!
//! Operators describe endpoints in YAML with an accompanying SQL template;
//! flapi compiles these into live HTTP routes, validates incoming requests
//! against field-level rules, renders the SQL template with the request
//! context, executes it against an embedded analytical engine, and streams
//! results back as JSON, CSV, or an Arrow IPC stream.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use flapi::cmd::{run_server, Cli};
//!
//! #[tokio::main]
//! async fn main() -> flapi::Result<()> {
//!     let cli = Cli::parse();
//!     run_server(&cli).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **YAML endpoints**: one file per route, reloadable at runtime
//! - **SQL templating**: `params` / `conn` / `env` / `cache` scopes
//! - **Materialized caches**: snapshot-based full / append / merge modes
//!   in a lake catalog, with audit trail and retention
//! - **Columnar responses**: Arrow IPC streaming with ZSTD/LZ4 compression
//! - **Security**: Basic / Bearer auth, per-client rate limiting
//!
//! ## Architecture
//!
//! ```text
//! HTTP request → CORS → rate limit → auth → route match → validation
//!     → SQL template → engine → (JSON | CSV | Arrow IPC) → response
//! ```

// Public API exports
pub use errors::{FlapiError, Result};

// Public modules
pub mod arrow_ipc;
pub mod auth;
pub mod cache;
pub mod cmd;
pub mod config;
pub mod docs;
pub mod engine;
pub mod errors;
pub mod heartbeat;
pub mod log;
pub mod rate_limit;
pub mod server;
pub mod utils;
pub mod validation;
