//! Heartbeat worker: one cooperative loop on a dedicated task.
//!
//! Every tick it warm-pings endpoints that opted in, triggers cache
//! refreshes whose schedule is due, and periodically runs the snapshot
//! garbage collection pass. The worker observes a cancellation token
//! between steps; `stop` joins the task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::server::pipeline::{self, DynamicRequest};
use crate::server::AppState;

/// Interval between garbage-collection passes.
const GC_INTERVAL: Duration = Duration::from_secs(86400);

pub struct HeartbeatWorker {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatWorker {
    /// Spawn the worker loop.
    pub fn start(state: Arc<AppState>) -> Self {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let handle = tokio::spawn(async move {
            run_loop(state, worker_token).await;
        });
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Heartbeat worker did not stop cleanly: {e}");
            }
        }
    }
}

async fn run_loop(state: Arc<AppState>, token: CancellationToken) {
    let mut last_refresh: HashMap<String, Instant> = HashMap::new();
    let mut last_gc = Instant::now();

    loop {
        let interval = {
            let app = state.config.app();
            Duration::from_secs(app.heartbeat.worker_interval.max(1))
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let app = state.config.app();
        if !app.heartbeat.enabled {
            continue;
        }

        let endpoints = state.config.endpoints();
        for endpoint in endpoints.iter() {
            if token.is_cancelled() {
                return;
            }

            // Warm-ping through the in-process pipeline.
            if endpoint.heartbeat.enabled {
                if let Some(url_path) = endpoint.url_path() {
                    debug!("Performing heartbeat for endpoint {url_path}");
                    let request = DynamicRequest::synthetic(url_path, &endpoint.heartbeat.params);
                    let response = pipeline::handle(&state, request).await;
                    if response.status().is_server_error() {
                        warn!(
                            "Heartbeat for {url_path} returned {}",
                            response.status()
                        );
                    }
                }
            }

            // Scheduled cache refresh.
            if endpoint.cache.is_active() {
                if let Some(schedule) = endpoint.cache.schedule_duration() {
                    let identifier = endpoint.identifier();
                    let due = match last_refresh.get(&identifier) {
                        Some(last) => last.elapsed() >= schedule,
                        None => {
                            // First sighting: warmup just ran, start the
                            // clock now.
                            last_refresh.insert(identifier.clone(), Instant::now());
                            false
                        }
                    };
                    if due {
                        let mut params = std::collections::BTreeMap::new();
                        match state.cache.refresh(&app, endpoint, &mut params).await {
                            Ok(()) => {
                                debug!("Scheduled cache refresh completed for {identifier}");
                            }
                            Err(e) => {
                                warn!("Scheduled cache refresh failed for {identifier}: {e}");
                            }
                        }
                        last_refresh.insert(identifier, Instant::now());
                    }
                }
            }
        }

        // Periodic lake compaction.
        if last_gc.elapsed() >= GC_INTERVAL {
            for endpoint in endpoints.iter() {
                if token.is_cancelled() {
                    return;
                }
                if endpoint.cache.is_active() {
                    state.cache.garbage_collect(&app, endpoint).await;
                }
            }
            last_gc = Instant::now();
        }
    }
}
