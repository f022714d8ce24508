//! Materialization of endpoint result sets as lake-catalog tables.
//!
//! Refreshes happen at startup (warmup), on the heartbeat worker's tick,
//! on explicit administrative request, and on `DELETE <url-path>`
//! invalidation. Ordinary GET handling never triggers a refresh. Every
//! refresh attempt writes exactly one audit row with a terminal status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::catalog::SchemaProvider;
use datafusion::datasource::MemTable;
use tracing::{debug, info, warn};

use crate::config::templating::{build_scopes, render_cache_template};
use crate::config::{AppConfig, CacheConfig, EndpointConfig};
use crate::engine::convert::batches_to_json_rows;
use crate::engine::lake::{ExpirePolicy, SnapshotRecord};
use crate::engine::Engine;
use crate::errors::{FlapiError, Result};
use crate::utils::interval::parse_interval;

const AUDIT_SCHEMA: &str = "audit";
const AUDIT_TABLE: &str = "sync_events";

/// Snapshot context handed to cache templates, derived at refresh time.
#[derive(Debug, Default, Clone)]
pub struct SnapshotInfo {
    pub current_snapshot_id: Option<String>,
    pub current_committed_at: Option<String>,
    pub previous_snapshot_id: Option<String>,
    pub previous_committed_at: Option<String>,
}

pub struct CacheService {
    engine: Arc<Engine>,
}

impl CacheService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Whether this endpoint participates in caching at all.
    pub fn is_cache_enabled(endpoint: &EndpointConfig) -> bool {
        endpoint.cache.is_active()
    }

    /// Startup pass: bootstrap the audit tables, then refresh every
    /// endpoint with an active cache. Warmup failures are logged and do
    /// not abort startup.
    pub async fn warm_up(&self, config: &AppConfig, endpoints: &[Arc<EndpointConfig>]) {
        info!("Warming up endpoint caches, this might take some time...");

        if let Err(e) = self.initialize_audit_tables(config).await {
            warn!("Failed to initialize audit tables: {e}");
        }

        for endpoint in endpoints {
            if !Self::is_cache_enabled(endpoint) {
                continue;
            }
            let mut params = BTreeMap::new();
            if let Err(e) = self.refresh(config, endpoint, &mut params).await {
                warn!(
                    "Cache warmup failed for {}: {e}",
                    endpoint.identifier()
                );
            }
        }
        info!("Finished warming up endpoint caches");
    }

    /// Run one refresh of the endpoint's cache table.
    ///
    /// Protocol: ensure the target schema, derive snapshot info, populate
    /// the cache scope, render the cache template, execute it, commit a
    /// snapshot, write the audit row, then apply retention.
    pub async fn refresh(
        &self,
        config: &AppConfig,
        endpoint: &EndpointConfig,
        params: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let cache = &endpoint.cache;
        let catalog = self.catalog_name(config, cache);
        let schema = self.schema_name(config, cache);
        let table = cache.table.clone();
        let mode = cache.mode();
        let started = Instant::now();
        let started_at = Utc::now();

        self.ensure_cache_schema(&catalog, &schema);

        let snapshot = self.fetch_snapshot_info(&catalog);

        params.clear();
        params.insert("cacheCatalog".to_string(), catalog.clone());
        params.insert("cacheSchema".to_string(), schema.clone());
        params.insert("cacheTable".to_string(), table.clone());
        params.insert("cacheMode".to_string(), mode.as_str().to_string());
        if let Some(id) = &snapshot.current_snapshot_id {
            params.insert("cacheSnapshotId".to_string(), id.clone());
        }
        if let Some(at) = &snapshot.current_committed_at {
            params.insert("cacheSnapshotTimestamp".to_string(), at.clone());
        }
        if let Some(id) = &snapshot.previous_snapshot_id {
            params.insert("previousSnapshotId".to_string(), id.clone());
            params.insert("previousCacheTable".to_string(), table.clone());
        }
        if let Some(at) = &snapshot.previous_committed_at {
            params.insert("previousSnapshotTimestamp".to_string(), at.clone());
        }
        if let Some(schedule) = &cache.schedule {
            params.insert("cacheSchedule".to_string(), schedule.clone());
        }
        if let Some(cursor) = &cache.cursor {
            params.insert("cursorColumn".to_string(), cursor.column.clone());
            params.insert("cursorType".to_string(), cursor.r#type.clone());

            if let Some(watermark) = self
                .fetch_watermark(&catalog, &schema, &table, &cursor.column)
                .await
            {
                params.insert("previousWatermark".to_string(), watermark);
            }
            params.insert(
                "currentWatermark".to_string(),
                Utc::now().to_rfc3339(),
            );
        }
        if !cache.primary_keys.is_empty() {
            params.insert("primaryKeys".to_string(), cache.primary_keys.join(","));
        }

        let scopes = build_scopes(config, endpoint, params);
        let rendered = render_cache_template(endpoint, &scopes)?;

        let refresh_result = self.engine.execute_statements(&rendered).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match refresh_result {
            Ok(()) => {
                let committed = match self.commit_snapshot(&schema, &table).await {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!("Could not commit snapshot for {schema}.{table}: {e}");
                        None
                    }
                };
                self.record_sync_event(SyncEvent {
                    config,
                    endpoint,
                    sync_type: mode.as_str(),
                    status: "success",
                    message: "Cache refreshed successfully",
                    snapshot_id: committed.map(|r| r.snapshot_id.to_string()),
                    rows_affected: None,
                    started_at: started_at.to_rfc3339(),
                    duration_ms,
                })
                .await;
            }
            Err(e) => {
                self.record_sync_event(SyncEvent {
                    config,
                    endpoint,
                    sync_type: mode.as_str(),
                    status: "error",
                    message: &e.to_string(),
                    snapshot_id: None,
                    rows_affected: None,
                    started_at: started_at.to_rfc3339(),
                    duration_ms,
                })
                .await;
                return Err(FlapiError::Cache(e.to_string()));
            }
        }

        // Retention expiry runs after a successful refresh; failures are
        // logged and do not fail the refresh.
        if cache.retention.is_configured() {
            let policy = if let Some(age) = &cache.retention.max_snapshot_age {
                parse_interval(age).map(ExpirePolicy::OlderThan)
            } else {
                cache.retention.keep_last_snapshots.map(ExpirePolicy::KeepLast)
            };
            if let Some(policy) = policy {
                if let Some(lake) = self.engine.lake() {
                    if let Err(e) = lake.expire_snapshots(&policy) {
                        warn!("Failed to expire snapshots for {schema}.{table}: {e}");
                    }
                }
            }
        }

        Ok(())
    }

    /// Add the cache parameters ordinary GET rendering needs, without
    /// triggering a refresh.
    pub fn add_query_cache_params(
        &self,
        config: &AppConfig,
        endpoint: &EndpointConfig,
        params: &mut BTreeMap<String, String>,
    ) {
        let cache = &endpoint.cache;
        if !cache.is_active() {
            return;
        }
        params
            .entry("cacheCatalog".to_string())
            .or_insert_with(|| self.catalog_name(config, cache));
        params
            .entry("cacheSchema".to_string())
            .or_insert_with(|| self.schema_name(config, cache));
        params
            .entry("cacheTable".to_string())
            .or_insert_with(|| cache.table.clone());
    }

    /// Snapshot expiry pass independent of refresh, with its own audit
    /// row.
    pub async fn garbage_collect(&self, config: &AppConfig, endpoint: &EndpointConfig) {
        let cache = &endpoint.cache;
        if !cache.retention.is_configured() {
            return;
        }
        let started_at = Utc::now();
        let started = Instant::now();

        let outcome = match self.engine.lake() {
            Some(lake) => lake
                .expire_snapshots(&ExpirePolicy::OlderThan(std::time::Duration::from_secs(
                    86400,
                )))
                .map(|_| ()),
            None => Ok(()),
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        match outcome {
            Ok(()) => {
                self.record_sync_event(SyncEvent {
                    config,
                    endpoint,
                    sync_type: "garbage_collection",
                    status: "success",
                    message: "Expired old snapshots",
                    snapshot_id: None,
                    rows_affected: None,
                    started_at: started_at.to_rfc3339(),
                    duration_ms,
                })
                .await;
            }
            Err(e) => {
                warn!("Failed to expire snapshots for {}: {e}", endpoint.identifier());
                self.record_sync_event(SyncEvent {
                    config,
                    endpoint,
                    sync_type: "garbage_collection",
                    status: "error",
                    message: &e.to_string(),
                    snapshot_id: None,
                    rows_affected: None,
                    started_at: started_at.to_rfc3339(),
                    duration_ms,
                })
                .await;
            }
        }
    }

    fn catalog_name(&self, config: &AppConfig, cache: &CacheConfig) -> String {
        cache
            .catalog
            .clone()
            .unwrap_or_else(|| config.ducklake.alias.clone())
    }

    fn schema_name(&self, config: &AppConfig, cache: &CacheConfig) -> String {
        cache
            .schema
            .clone()
            .unwrap_or_else(|| config.cache_schema().to_string())
    }

    fn ensure_cache_schema(&self, catalog: &str, schema: &str) {
        // The default schema always exists.
        if schema == "main" {
            return;
        }
        if let Some(lake) = self.engine.lake() {
            if lake.alias() == catalog {
                if let Err(e) = lake.ensure_schema(&self.engine.ctx(), schema) {
                    warn!("Failed to create cache schema {catalog}.{schema}: {e}");
                }
            }
        }
    }

    /// Current and previous snapshot, newest first. When the lake is not
    /// attached, synthesize a current snapshot from the wall clock.
    fn fetch_snapshot_info(&self, catalog: &str) -> SnapshotInfo {
        let mut info = SnapshotInfo::default();

        let records: Vec<SnapshotRecord> = match self.engine.lake() {
            Some(lake) if lake.alias() == catalog => lake.snapshots(),
            _ => Vec::new(),
        };

        if let Some(current) = records.first() {
            info.current_snapshot_id = Some(current.snapshot_id.to_string());
            info.current_committed_at = Some(current.snapshot_time.clone());
            if let Some(previous) = records.get(1) {
                info.previous_snapshot_id = Some(previous.snapshot_id.to_string());
                info.previous_committed_at = Some(previous.snapshot_time.clone());
            }
        } else {
            debug!("Lake snapshots unavailable, using fallback snapshot id");
            info.current_snapshot_id = Some(format!("snapshot_{}", Utc::now().timestamp()));
            info.current_committed_at = Some("now".to_string());
        }

        info
    }

    /// Watermark carried between refreshes: the max cursor value of the
    /// current cache table, if it exists.
    async fn fetch_watermark(
        &self,
        catalog: &str,
        schema: &str,
        table: &str,
        cursor_column: &str,
    ) -> Option<String> {
        let query =
            format!("SELECT MAX({cursor_column}) AS watermark FROM {catalog}.{schema}.{table}");
        let batches = self.engine.query(&query).await.ok()?;
        let rows = batches_to_json_rows(&batches).ok()?;
        let value = rows.first()?.get("watermark")?.clone();
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    async fn commit_snapshot(&self, schema: &str, table: &str) -> Result<SnapshotRecord> {
        let lake = self
            .engine
            .lake()
            .ok_or_else(|| FlapiError::Cache("lake catalog is not attached".to_string()))?;
        lake.commit_snapshot(&self.engine.ctx(), schema, table).await
    }

    /// Create `<catalog>.audit.sync_events` when missing.
    pub async fn initialize_audit_tables(&self, config: &AppConfig) -> Result<()> {
        if !config.ducklake.enabled {
            return Ok(());
        }
        let Some(lake) = self.engine.lake() else {
            return Ok(());
        };
        let ctx = self.engine.ctx();
        lake.ensure_schema(&ctx, AUDIT_SCHEMA)?;

        let catalog = ctx.catalog(lake.alias()).ok_or_else(|| {
            FlapiError::Engine(format!("lake catalog '{}' is not attached", lake.alias()))
        })?;
        let audit_schema = catalog.schema(AUDIT_SCHEMA).ok_or_else(|| {
            FlapiError::Engine("audit schema missing after creation".to_string())
        })?;

        if !audit_schema.table_exist(AUDIT_TABLE) {
            let table = MemTable::try_new(audit_table_schema(), vec![vec![]])?;
            audit_schema.register_table(AUDIT_TABLE.to_string(), Arc::new(table))?;
            info!(
                "Initialized lake audit tables in {}.{AUDIT_SCHEMA}",
                lake.alias()
            );
        }
        Ok(())
    }

    /// Append one audit row. Failures are logged, never propagated.
    async fn record_sync_event(&self, event: SyncEvent<'_>) {
        if !event.config.ducklake.enabled {
            return;
        }
        let catalog = event.config.ducklake.alias.clone();
        let cache = &event.endpoint.cache;
        let schema = self.schema_name(event.config, cache);

        // Single quotes in free-form messages are replaced, as audit rows
        // are inserted as literals.
        let message = event.message.replace('\'', "\"");
        let event_id = format!("evt_{}", uuid::Uuid::new_v4());
        let completed_at = Utc::now().to_rfc3339();
        let snapshot_id = event
            .snapshot_id
            .map(|s| format!("'{s}'"))
            .unwrap_or_else(|| "NULL".to_string());
        let rows_affected = event
            .rows_affected
            .map(|n| n.to_string())
            .unwrap_or_else(|| "NULL".to_string());

        let insert = format!(
            "INSERT INTO {catalog}.{AUDIT_SCHEMA}.{AUDIT_TABLE} VALUES \
             ('{event_id}', '{endpoint}', '{table}', '{schema}', '{sync_type}', '{status}', \
              '{message}', {snapshot_id}, {rows_affected}, '{started_at}', '{completed_at}', \
              {duration_ms})",
            endpoint = event.endpoint.identifier(),
            table = cache.table,
            sync_type = event.sync_type,
            status = event.status,
            started_at = event.started_at,
            duration_ms = event.duration_ms,
        );

        if let Err(e) = self.engine.execute_statements(&insert).await {
            warn!("Failed to record sync event: {e}");
        }
    }
}

struct SyncEvent<'a> {
    config: &'a AppConfig,
    endpoint: &'a EndpointConfig,
    sync_type: &'a str,
    status: &'a str,
    message: &'a str,
    snapshot_id: Option<String>,
    rows_affected: Option<i64>,
    started_at: String,
    duration_ms: i64,
}

fn audit_table_schema() -> std::sync::Arc<Schema> {
    std::sync::Arc::new(Schema::new(vec![
        Field::new("event_id", DataType::Utf8, true),
        Field::new("endpoint_path", DataType::Utf8, false),
        Field::new("cache_table", DataType::Utf8, false),
        Field::new("cache_schema", DataType::Utf8, false),
        Field::new("sync_type", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("message", DataType::Utf8, true),
        Field::new("snapshot_id", DataType::Utf8, true),
        Field::new("rows_affected", DataType::Int64, true),
        Field::new("sync_started_at", DataType::Utf8, true),
        Field::new("sync_completed_at", DataType::Utf8, true),
        Field::new("duration_ms", DataType::Int64, true),
    ]))
}
