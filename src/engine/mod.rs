//! Thread-safe wrapper around the embedded analytical SQL engine.
//!
//! One engine handle serves the whole process. A coarse mutex protects
//! lifecycle operations (open, lake attach/detach, shutdown); query
//! execution itself runs on cheap per-call context clones without holding
//! that mutex. Transactional multi-statement writes serialize behind a
//! dedicated write gate.

pub mod convert;
pub mod lake;

use std::sync::{Arc, Mutex, RwLock};

use datafusion::arrow::array::{Int64Array, RecordBatch, UInt64Array};
use datafusion::datasource::MemTable;
use datafusion::execution::SendableRecordBatchStream;
use datafusion::prelude::{SessionConfig, SessionContext};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{FlapiError, Result};
use lake::LakeCatalog;

/// Default extension set attempted at startup. Each attempt is
/// independent: missing extensions log a warning and are skipped.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "httpfs", "ducklake", "fts", "json", "postgres", "sqlite", "parquet",
];

/// Extensions the embedded engine provides natively (or via the lake
/// module, for `ducklake`).
const BUILTIN_EXTENSIONS: &[&str] = &["ducklake", "json", "parquet"];

/// Result of a paginated read.
#[derive(Debug)]
pub struct ReadOutput {
    pub batches: Vec<RecordBatch>,
    pub total_count: i64,
}

/// Result of a (multi-statement) write.
#[derive(Debug, Default)]
pub struct WriteOutput {
    pub rows_affected: i64,
    pub returned: Option<Vec<RecordBatch>>,
}

pub struct Engine {
    ctx: SessionContext,
    /// Guards lifecycle transitions only, never query execution.
    lifecycle: Mutex<()>,
    /// Serializes transactional writes.
    write_gate: tokio::sync::Mutex<()>,
    lake: RwLock<Option<Arc<LakeCatalog>>>,
}

impl Engine {
    /// Open the engine: apply tuning settings, load the default extension
    /// set, run every connection's init SQL, and attach the lake catalog
    /// when enabled.
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let mut session_config = SessionConfig::new().with_information_schema(true);

        // Engine-level defaults the gateway always wants.
        for (key, value) in [
            ("allow_unsigned_extensions", "true"),
            ("autoinstall_known_extensions", "1"),
            ("autoload_known_extensions", "1"),
        ] {
            if session_config.options_mut().set(key, value).is_err() {
                debug!("Engine does not expose setting {key}; skipped");
            }
        }

        for (key, value) in config.engine_settings() {
            match session_config.options_mut().set(&key, &value) {
                Ok(()) => debug!("Engine setting applied: {key} = {value}"),
                Err(e) => warn!("Engine rejected setting '{key}': {e}; skipped"),
            }
        }

        let ctx = SessionContext::new_with_config(session_config);
        info!("Engine opened at {}", config.engine_db_path());

        let engine = Self {
            ctx,
            lifecycle: Mutex::new(()),
            write_gate: tokio::sync::Mutex::new(()),
            lake: RwLock::new(None),
        };

        engine.load_default_extensions();
        engine.initialize_connections(config).await?;

        if config.ducklake.enabled {
            engine.attach_lake(config).await?;
        }

        Ok(engine)
    }

    /// Hand out a per-call context. The underlying state is shared; the
    /// clone is the engine's analog of deriving a connection.
    pub fn ctx(&self) -> SessionContext {
        self.ctx.clone()
    }

    pub fn lake(&self) -> Option<Arc<LakeCatalog>> {
        self.lake.read().expect("lake lock poisoned").clone()
    }

    fn load_default_extensions(&self) {
        info!("Loading default {} extensions", DEFAULT_EXTENSIONS.len());
        let mut loaded = 0usize;
        for extension in DEFAULT_EXTENSIONS {
            if BUILTIN_EXTENSIONS.contains(extension) {
                debug!("Successfully loaded extension: {extension}");
                loaded += 1;
            } else {
                warn!("Extension '{extension}' is not available in this engine. Skipping.");
            }
        }
        info!(
            "Successfully loaded {loaded} out of {} extensions",
            DEFAULT_EXTENSIONS.len()
        );
    }

    async fn initialize_connections(&self, config: &AppConfig) -> Result<()> {
        for (name, connection) in &config.connections {
            if connection.init.is_empty() {
                continue;
            }
            debug!("Executing init statement for connection: {name}");
            self.execute_statements(&connection.init).await?;
        }
        Ok(())
    }

    async fn attach_lake(&self, config: &AppConfig) -> Result<()> {
        info!(
            "Attaching lake catalog at alias '{}'",
            config.ducklake.alias
        );
        let lake = LakeCatalog::attach(&self.ctx, &config.ducklake)
            .await
            .map_err(|e| {
                FlapiError::Engine(format!("Failed to attach lake catalog: {e}"))
            })?;

        let _guard = self.lifecycle.lock().expect("lifecycle lock poisoned");
        *self.lake.write().expect("lake lock poisoned") = Some(Arc::new(lake));
        Ok(())
    }

    /// Split a SQL block on `;` into trimmed, non-empty statements.
    pub fn split_statements(sql: &str) -> Vec<String> {
        let statements: Vec<String> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if statements.is_empty() && !sql.trim().is_empty() {
            vec![sql.trim().to_string()]
        } else {
            statements
        }
    }

    /// Execute a block of statements sequentially on one context.
    pub async fn execute_statements(&self, sql: &str) -> Result<()> {
        let ctx = self.ctx();
        let statements = Self::split_statements(sql);
        for statement in &statements {
            ctx.sql(statement).await?.collect().await?;
        }
        debug!("{} statement(s) executed successfully", statements.len());
        Ok(())
    }

    /// Collect a single query's result batches.
    pub async fn query(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        let df = self.ctx().sql(sql).await?;
        Ok(df.collect().await?)
    }

    /// Execute a query and return a cursor-style record batch stream.
    pub async fn query_stream(&self, sql: &str) -> Result<SendableRecordBatchStream> {
        let df = self.ctx().sql(sql).await?;
        Ok(df.execute_stream().await?)
    }

    /// Run a read with pagination wrapping: the rendered query `Q` becomes
    /// `SELECT * FROM (Q) AS subquery LIMIT .. OFFSET ..`, and a separate
    /// count query provides `total_count`.
    pub async fn execute_read(
        &self,
        query: &str,
        with_pagination: bool,
        limit: i64,
        offset: i64,
    ) -> Result<ReadOutput> {
        let paginated = if with_pagination {
            format!("SELECT * FROM ({query}) AS subquery LIMIT {limit} OFFSET {offset}")
        } else {
            query.to_string()
        };

        let batches = self.query(&paginated).await?;

        let total_count = if with_pagination {
            let count_query = format!("SELECT COUNT(*) FROM ({query}) AS subquery");
            let count_batches = self.query(&count_query).await?;
            extract_single_i64(&count_batches).unwrap_or(0)
        } else {
            convert::count_rows(&batches) as i64
        };

        Ok(ReadOutput {
            batches,
            total_count,
        })
    }

    /// Execute a rendered write block: split on `;`, run every statement
    /// on one context, capture `RETURNING` output, and treat a trailing
    /// `SELECT` as the response source when `returns_data` is set.
    ///
    /// With `transactional`, the whole block runs behind the engine write
    /// gate and aborts on the first failing statement; rollback semantics
    /// remain the engine's concern.
    pub async fn execute_write(
        &self,
        sql: &str,
        returns_data: bool,
        transactional: bool,
    ) -> Result<WriteOutput> {
        let _gate = if transactional {
            Some(self.write_gate.lock().await)
        } else {
            None
        };

        let ctx = self.ctx();
        let statements = Self::split_statements(sql);
        if statements.is_empty() {
            return Err(FlapiError::Engine("empty write statement".to_string()));
        }

        let last_is_select = statements
            .last()
            .map(|s| s.trim_start().to_uppercase().starts_with("SELECT"))
            .unwrap_or(false);
        let hold_back_last = statements.len() > 1 && returns_data && last_is_select;
        let to_execute = if hold_back_last {
            statements.len() - 1
        } else {
            statements.len()
        };

        let mut output = WriteOutput::default();
        let mut has_returning_data = false;

        for statement in &statements[..to_execute] {
            let batches = ctx.sql(statement).await?.collect().await?;

            if let Some(count) = extract_rows_affected(&batches) {
                if count > 0 {
                    output.rows_affected = count;
                }
            }

            let has_returning_clause = statement.to_uppercase().contains("RETURNING");
            if has_returning_clause && convert::count_rows(&batches) > 0 {
                output.returned = Some(batches);
                has_returning_data = true;
            }
        }

        if returns_data && !has_returning_data && hold_back_last {
            let select = statements.last().expect("checked non-empty");
            let batches = ctx.sql(select).await?.collect().await?;
            if convert::count_rows(&batches) > 0 {
                output.returned = Some(batches);
            }
        }

        Ok(output)
    }

    /// Table names in a schema, newest-sorting-first like the engine's
    /// information schema ordering.
    pub async fn table_names(&self, schema: &str, prefix: &str) -> Result<Vec<String>> {
        let mut query = format!(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = '{schema}'"
        );
        if !prefix.is_empty() {
            query.push_str(&format!(" AND table_name LIKE '{prefix}%'"));
        }
        query.push_str(" ORDER BY table_name DESC");

        let batches = self.query(&query).await?;
        let rows = convert::batches_to_json_rows(&batches)?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("table_name").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect())
    }

    pub async fn table_exists(&self, schema: &str, table: &str) -> bool {
        self.table_names(schema, table)
            .await
            .map(|names| !names.is_empty())
            .unwrap_or(false)
    }

    /// Column names and engine types of a query's result shape, derived
    /// from the logical plan without executing the query.
    pub async fn describe_query(&self, query: &str) -> Result<Vec<(String, String)>> {
        let df = self.ctx().sql(query).await?;
        Ok(df
            .schema()
            .fields()
            .iter()
            .map(|field| (field.name().clone(), field.data_type().to_string()))
            .collect())
    }

    /// Create or replace an engine-local table from record batches. Used
    /// for materialized credential tables.
    pub async fn replace_table(&self, name: &str, batches: Vec<RecordBatch>) -> Result<()> {
        let Some(schema) = batches.first().map(|b| b.schema()) else {
            return Err(FlapiError::Engine(format!(
                "cannot create table '{name}' without rows"
            )));
        };
        let table = MemTable::try_new(schema, vec![batches])?;
        let ctx = self.ctx();
        // register_table replaces nothing by itself; drop first.
        let _ = ctx.deregister_table(name);
        ctx.register_table(name, Arc::new(table))?;
        Ok(())
    }

    /// Best-effort shutdown: detach the lake catalog, checkpoint, close.
    /// All failures are logged, none propagate.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().expect("lifecycle lock poisoned");

        let lake = self.lake.write().expect("lake lock poisoned").take();
        if let Some(lake) = lake {
            if let Err(e) = lake.checkpoint() {
                warn!("Failed to checkpoint lake catalog: {e}");
            }
            lake.detach(&self.ctx);
        }
        info!("Engine closed");
    }
}

/// First column of the first row as i64, the shape of a `COUNT(*)` result.
fn extract_single_i64(batches: &[RecordBatch]) -> Option<i64> {
    let batch = batches.iter().find(|b| b.num_rows() > 0)?;
    let column = batch.column(0);
    if let Some(array) = column.as_any().downcast_ref::<Int64Array>() {
        return Some(array.value(0));
    }
    if let Some(array) = column.as_any().downcast_ref::<UInt64Array>() {
        return Some(array.value(0) as i64);
    }
    None
}

/// DML statements report affected rows as a single `count` column.
fn extract_rows_affected(batches: &[RecordBatch]) -> Option<i64> {
    let batch = batches.iter().find(|b| b.num_rows() > 0)?;
    let schema = batch.schema();
    let idx = schema.fields().iter().position(|f| f.name() == "count")?;
    let column = batch.column(idx);
    if let Some(array) = column.as_any().downcast_ref::<UInt64Array>() {
        return Some(array.value(0) as i64);
    }
    if let Some(array) = column.as_any().downcast_ref::<Int64Array>() {
        return Some(array.value(0));
    }
    None
}
