//! Tracing bootstrap for the gateway process.
//!
//! The level and format come from the command line (`--log-level`,
//! `--log-json`); `RUST_LOG` is honored when no explicit level is given.
//! Installed once at startup, before the configuration is loaded, so the
//! loader's own diagnostics are captured.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Install the global tracing subscriber.
///
/// `level` is a filter directive string such as `info` or
/// `debug,flapi::cache=trace`; when `None`, `RUST_LOG` applies, defaulting
/// to `info`. With `use_json` the structured JSON formatter is used
/// (production); otherwise the human-readable formatter carries file and
/// line locations.
pub fn init_tracing(level: Option<&str>, use_json: bool) {
    let filter = match level {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let base = Registry::default().with(filter).with(ErrorLayer::default());

    let install = if use_json {
        tracing::subscriber::set_global_default(
            base.with(fmt::layer().json().with_target(false)),
        )
    } else {
        tracing::subscriber::set_global_default(
            base.with(
                fmt::layer()
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true),
            ),
        )
    };

    install.expect("failed to set global tracing subscriber");
}
