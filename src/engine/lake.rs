//! Transactional lake catalog for materialized caches.
//!
//! The catalog is attached to the engine under a configurable alias and is
//! either fully attached (every `alias.schema.table` reference resolves)
//! or fully detached; request handlers never observe a partial state.
//!
//! Persistence model: a JSONL snapshot log at `metadata_path` records one
//! row per committed table snapshot; row data lives in parquet files under
//! `data_path/<schema>/<table>/`. Small snapshots can be inlined into the
//! log itself when `data_inlining_row_limit` is set. On attach, the latest
//! snapshot of every table is restored into the engine.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use datafusion::catalog::memory::{MemoryCatalogProvider, MemorySchemaProvider};
use datafusion::catalog::{CatalogProvider, SchemaProvider};
use datafusion::datasource::MemTable;
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::DuckLakeConfig;
use crate::engine::convert::{batches_to_json_rows, count_rows, record_batch_from_json};
use crate::errors::{FlapiError, Result};

/// One committed snapshot of a lake table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: i64,
    /// RFC 3339 commit timestamp.
    pub snapshot_time: String,
    pub schema: String,
    pub table: String,
    pub rows: u64,
    /// Parquet file relative to `data_path`; absent for inlined snapshots.
    pub data_file: Option<String>,
    /// Row data inlined into the log for small snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_rows: Option<Vec<Map<String, Value>>>,
}

/// Snapshot expiry selector, mirroring the engine's
/// `ducklake_expire_snapshots(catalog, older_than => ... | versions => ...)`.
#[derive(Debug, Clone)]
pub enum ExpirePolicy {
    /// Expire snapshots committed before `now - age`.
    OlderThan(std::time::Duration),
    /// Keep only the newest `n` snapshots per table.
    KeepLast(u64),
}

pub struct LakeCatalog {
    alias: String,
    metadata_path: PathBuf,
    data_path: PathBuf,
    data_inlining_row_limit: Option<u64>,
    override_data_path: bool,
    log: Mutex<Vec<SnapshotRecord>>,
}

impl LakeCatalog {
    /// Attach the lake catalog: read the snapshot log, register the
    /// catalog under its alias, and restore the newest snapshot of every
    /// table into the engine.
    pub async fn attach(ctx: &SessionContext, config: &DuckLakeConfig) -> Result<Self> {
        if config.metadata_path.is_empty() || config.data_path.is_empty() {
            return Err(FlapiError::Config(
                "ducklake requires both metadata_path and data_path".to_string(),
            ));
        }

        let metadata_path = PathBuf::from(&config.metadata_path);
        let data_path = PathBuf::from(&config.data_path);
        if let Some(parent) = metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&data_path)?;

        let log = read_snapshot_log(&metadata_path)?;

        let catalog = Arc::new(MemoryCatalogProvider::new());
        catalog
            .register_schema("main", Arc::new(MemorySchemaProvider::new()))
            .map_err(FlapiError::from)?;
        ctx.register_catalog(config.alias.as_str(), catalog);

        let lake = Self {
            alias: config.alias.clone(),
            metadata_path,
            data_path,
            data_inlining_row_limit: config.data_inlining_row_limit,
            override_data_path: config.override_data_path,
            log: Mutex::new(log),
        };

        lake.restore_latest_snapshots(ctx).await?;

        info!(
            "Attached lake catalog '{}' ({} snapshot(s) on record)",
            lake.alias,
            lake.log.lock().expect("snapshot log lock poisoned").len()
        );
        Ok(lake)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Snapshots newest-first, the shape of `ducklake_snapshots(catalog)`.
    pub fn snapshots(&self) -> Vec<SnapshotRecord> {
        let mut records = self
            .log
            .lock()
            .expect("snapshot log lock poisoned")
            .clone();
        records.sort_by(|a, b| b.snapshot_id.cmp(&a.snapshot_id));
        records
    }

    /// Ensure `schema` exists in the attached catalog. The `main` schema
    /// always exists.
    pub fn ensure_schema(&self, ctx: &SessionContext, schema: &str) -> Result<()> {
        let catalog = self.catalog_provider(ctx)?;
        if catalog.schema(schema).is_none() {
            catalog
                .register_schema(schema, Arc::new(MemorySchemaProvider::new()))
                .map_err(FlapiError::from)?;
            debug!("Created lake schema {}.{schema}", self.alias);
        }
        Ok(())
    }

    /// Commit the current contents of `schema.table` as a new snapshot:
    /// write a parquet file (or inline the rows), then append to the log.
    pub async fn commit_snapshot(
        &self,
        ctx: &SessionContext,
        schema: &str,
        table: &str,
    ) -> Result<SnapshotRecord> {
        let df = ctx
            .sql(&format!("SELECT * FROM {}.{schema}.{table}", self.alias))
            .await?;
        let batches = df.collect().await?;
        let rows = count_rows(&batches) as u64;

        let snapshot_id = {
            let log = self.log.lock().expect("snapshot log lock poisoned");
            log.iter().map(|r| r.snapshot_id).max().unwrap_or(0) + 1
        };

        let inline = self
            .data_inlining_row_limit
            .map(|limit| rows <= limit)
            .unwrap_or(false);

        let (data_file, inline_rows) = if inline {
            (None, Some(batches_to_json_rows(&batches)?))
        } else {
            let relative = format!("{schema}/{table}/{snapshot_id}.parquet");
            let full = self.data_path.join(&relative);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_parquet(&full, &batches)?;
            (Some(relative), None)
        };

        let record = SnapshotRecord {
            snapshot_id,
            snapshot_time: Utc::now().to_rfc3339(),
            schema: schema.to_string(),
            table: table.to_string(),
            rows,
            data_file,
            inline_rows,
        };

        {
            let mut log = self.log.lock().expect("snapshot log lock poisoned");
            log.push(record.clone());
            write_snapshot_log(&self.metadata_path, &log)?;
        }

        debug!(
            "Committed snapshot {} of {}.{schema}.{table} ({rows} rows)",
            record.snapshot_id, self.alias
        );
        Ok(record)
    }

    /// Expire snapshots per `policy`. The newest snapshot of every table
    /// is always retained so the table stays restorable.
    pub fn expire_snapshots(&self, policy: &ExpirePolicy) -> Result<usize> {
        let mut log = self.log.lock().expect("snapshot log lock poisoned");

        let cutoff = match policy {
            ExpirePolicy::OlderThan(age) => {
                let age = chrono::Duration::from_std(*age)
                    .unwrap_or_else(|_| chrono::Duration::days(1));
                Some(Utc::now() - age)
            }
            ExpirePolicy::KeepLast(_) => None,
        };

        let mut expired: Vec<SnapshotRecord> = Vec::new();
        let mut retained: Vec<SnapshotRecord> = Vec::new();

        // Group per table, newest first.
        let mut by_table: std::collections::BTreeMap<(String, String), Vec<SnapshotRecord>> =
            std::collections::BTreeMap::new();
        for record in log.drain(..) {
            by_table
                .entry((record.schema.clone(), record.table.clone()))
                .or_default()
                .push(record);
        }

        for (_, mut records) in by_table {
            records.sort_by(|a, b| b.snapshot_id.cmp(&a.snapshot_id));
            for (idx, record) in records.into_iter().enumerate() {
                let expire = if idx == 0 {
                    false
                } else {
                    match policy {
                        ExpirePolicy::OlderThan(_) => {
                            let committed =
                                chrono::DateTime::parse_from_rfc3339(&record.snapshot_time)
                                    .map(|t| t.with_timezone(&Utc))
                                    .unwrap_or_else(|_| Utc::now());
                            cutoff.map(|c| committed < c).unwrap_or(false)
                        }
                        ExpirePolicy::KeepLast(n) => idx as u64 >= (*n).max(1),
                    }
                };
                if expire {
                    expired.push(record);
                } else {
                    retained.push(record);
                }
            }
        }

        retained.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        let expired_count = expired.len();

        for record in &expired {
            if let Some(file) = &record.data_file {
                let full = self.data_path.join(file);
                if let Err(e) = std::fs::remove_file(&full) {
                    warn!("Could not remove expired snapshot file {}: {e}", full.display());
                }
            }
        }

        *log = retained;
        write_snapshot_log(&self.metadata_path, &log)?;

        if expired_count > 0 {
            info!("Expired {expired_count} snapshot(s) from lake '{}'", self.alias);
        }
        Ok(expired_count)
    }

    /// Flush the snapshot log to disk.
    pub fn checkpoint(&self) -> Result<()> {
        let log = self.log.lock().expect("snapshot log lock poisoned");
        write_snapshot_log(&self.metadata_path, &log)
    }

    /// Detach: replace the alias with an empty catalog so no table under
    /// it resolves anymore.
    pub fn detach(&self, ctx: &SessionContext) {
        ctx.register_catalog(self.alias.as_str(), Arc::new(MemoryCatalogProvider::new()));
        info!("Detached lake catalog: {}", self.alias);
    }

    fn catalog_provider(&self, ctx: &SessionContext) -> Result<Arc<dyn CatalogProvider>> {
        ctx.catalog(&self.alias).ok_or_else(|| {
            FlapiError::Engine(format!("lake catalog '{}' is not attached", self.alias))
        })
    }

    async fn restore_latest_snapshots(&self, ctx: &SessionContext) -> Result<()> {
        let latest: Vec<SnapshotRecord> = {
            let log = self.log.lock().expect("snapshot log lock poisoned");
            let mut newest: std::collections::BTreeMap<(String, String), SnapshotRecord> =
                std::collections::BTreeMap::new();
            for record in log.iter() {
                let key = (record.schema.clone(), record.table.clone());
                match newest.get(&key) {
                    Some(existing) if existing.snapshot_id >= record.snapshot_id => {}
                    _ => {
                        newest.insert(key, record.clone());
                    }
                }
            }
            newest.into_values().collect()
        };

        for record in latest {
            if let Err(e) = self.restore_snapshot(ctx, &record).await {
                warn!(
                    "Could not restore snapshot {} of {}.{}: {e}",
                    record.snapshot_id, record.schema, record.table
                );
            }
        }
        Ok(())
    }

    async fn restore_snapshot(&self, ctx: &SessionContext, record: &SnapshotRecord) -> Result<()> {
        let batches = if let Some(rows) = &record.inline_rows {
            if rows.is_empty() {
                return Ok(());
            }
            let values: Vec<Value> = rows.iter().cloned().map(Value::Object).collect();
            vec![record_batch_from_json(&values)?]
        } else if let Some(file) = &record.data_file {
            let full = if self.override_data_path {
                // Rebase onto the configured data path, ignoring where the
                // file lived when the snapshot was committed.
                let name = Path::new(file)
                    .file_name()
                    .map(|n| format!("{}/{}/{}", record.schema, record.table, n.to_string_lossy()))
                    .unwrap_or_else(|| file.clone());
                self.data_path.join(name)
            } else {
                self.data_path.join(file)
            };
            let df = ctx
                .read_parquet(
                    full.to_string_lossy().as_ref(),
                    ParquetReadOptions::default(),
                )
                .await?;
            df.collect().await?
        } else {
            return Ok(());
        };

        let Some(schema_ref) = batches.first().map(|b| b.schema()) else {
            return Ok(());
        };

        self.ensure_schema(ctx, &record.schema)?;
        let provider = self.schema_provider(ctx, &record.schema)?;
        let table = MemTable::try_new(schema_ref, vec![batches])?;
        if provider.table_exist(&record.table) {
            provider.deregister_table(&record.table)?;
        }
        provider.register_table(record.table.clone(), Arc::new(table))?;

        debug!(
            "Restored {}.{}.{} from snapshot {}",
            self.alias, record.schema, record.table, record.snapshot_id
        );
        Ok(())
    }

    fn schema_provider(
        &self,
        ctx: &SessionContext,
        schema: &str,
    ) -> Result<Arc<dyn SchemaProvider>> {
        self.catalog_provider(ctx)?.schema(schema).ok_or_else(|| {
            FlapiError::Engine(format!("lake schema '{}.{schema}' does not exist", self.alias))
        })
    }
}

fn read_snapshot_log(path: &Path) -> Result<Vec<SnapshotRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SnapshotRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                "Skipping malformed snapshot log line {} in {}: {e}",
                line_no + 1,
                path.display()
            ),
        }
    }
    Ok(records)
}

fn write_snapshot_log(path: &Path, records: &[SnapshotRecord]) -> Result<()> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(&out)?;
    file.sync_all()?;
    Ok(())
}

fn write_parquet(path: &Path, batches: &[datafusion::arrow::array::RecordBatch]) -> Result<()> {
    let Some(schema) = batches.first().map(|b| b.schema()) else {
        // An empty table still gets a log entry, just no data file content.
        std::fs::File::create(path)?;
        return Ok(());
    };
    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)
        .map_err(|e| FlapiError::Engine(format!("parquet writer: {e}")))?;
    for batch in batches {
        writer
            .write(batch)
            .map_err(|e| FlapiError::Engine(format!("parquet write: {e}")))?;
    }
    writer
        .close()
        .map_err(|e| FlapiError::Engine(format!("parquet close: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, table: &str, time: &str) -> SnapshotRecord {
        SnapshotRecord {
            snapshot_id: id,
            snapshot_time: time.to_string(),
            schema: "main".to_string(),
            table: table.to_string(),
            rows: 1,
            data_file: None,
            inline_rows: Some(Vec::new()),
        }
    }

    #[test]
    fn test_snapshot_log_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lake.jsonl");
        let records = vec![
            record(1, "users", "2026-01-01T00:00:00Z"),
            record(2, "users", "2026-01-02T00:00:00Z"),
        ];
        write_snapshot_log(&path, &records).unwrap();
        let read = read_snapshot_log(&path).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].snapshot_id, 2);
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read_snapshot_log(&dir.path().join("nope.jsonl"))
            .unwrap()
            .is_empty());
    }

    fn lake_config(dir: &Path) -> DuckLakeConfig {
        DuckLakeConfig {
            enabled: true,
            alias: "flake".to_string(),
            metadata_path: dir.join("metadata.jsonl").to_string_lossy().into_owned(),
            data_path: dir.join("data").to_string_lossy().into_owned(),
            data_inlining_row_limit: None,
            override_data_path: false,
        }
    }

    #[tokio::test]
    async fn test_commit_and_expire_snapshots() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = lake_config(dir.path());

        let ctx = SessionContext::new();
        let lake = LakeCatalog::attach(&ctx, &config).await.unwrap();

        ctx.sql("CREATE TABLE flake.main.t AS SELECT 1 AS id")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let first = lake.commit_snapshot(&ctx, "main", "t").await.unwrap();
        assert_eq!(first.snapshot_id, 1);
        assert_eq!(first.rows, 1);

        ctx.sql("INSERT INTO flake.main.t VALUES (2)")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let second = lake.commit_snapshot(&ctx, "main", "t").await.unwrap();
        assert_eq!(second.snapshot_id, 2);

        let snapshots = lake.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].snapshot_id, 2); // newest first

        let expired = lake
            .expire_snapshots(&ExpirePolicy::KeepLast(1))
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(lake.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_restores_latest_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = lake_config(dir.path());

        {
            let ctx = SessionContext::new();
            let lake = LakeCatalog::attach(&ctx, &config).await.unwrap();
            ctx.sql("CREATE TABLE flake.main.users AS SELECT 1 AS id UNION ALL SELECT 2")
                .await
                .unwrap()
                .collect()
                .await
                .unwrap();
            lake.commit_snapshot(&ctx, "main", "users").await.unwrap();
            lake.checkpoint().unwrap();
        }

        // A fresh engine restores the table from the committed snapshot.
        let ctx = SessionContext::new();
        let _lake = LakeCatalog::attach(&ctx, &config).await.unwrap();
        let batches = ctx
            .sql("SELECT COUNT(*) AS n FROM flake.main.users")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let rows = batches_to_json_rows(&batches).unwrap();
        assert_eq!(rows[0]["n"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_expire_never_drops_the_newest_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = lake_config(dir.path());

        let ctx = SessionContext::new();
        let lake = LakeCatalog::attach(&ctx, &config).await.unwrap();
        ctx.sql("CREATE TABLE flake.main.t AS SELECT 1 AS id")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        lake.commit_snapshot(&ctx, "main", "t").await.unwrap();

        // Everything is "older than zero seconds", yet the newest snapshot
        // per table survives.
        let expired = lake
            .expire_snapshots(&ExpirePolicy::OlderThan(std::time::Duration::ZERO))
            .unwrap();
        assert_eq!(expired, 0);
        assert_eq!(lake.snapshots().len(), 1);
    }
}
