// Model and run store
// SQLite-based persistence with JSON backup
//
// Keeps fitted predictor bundles keyed by feature schema, plus a history of
// pipeline runs with the last completed snapshot for cross-process reads.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::features::FeatureSchema;
use crate::predictor::{FittedModel, RidgeRegressor};
use crate::{PerformanceReport, SignalCounts};

// =============================================================================
// Data Models
// =============================================================================

/// Persisted predictor: fitted model and scaler, the ordered feature columns
/// they expect and the last report produced with them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle<P = RidgeRegressor> {
    pub model: FittedModel<P>,
    pub feature_columns: Vec<String>,
    pub schema_fingerprint: String,
    pub report: Option<PerformanceReport>,
    pub fitted_at: DateTime<Utc>,
}

impl<P> ModelBundle<P> {
    pub fn new(model: FittedModel<P>, report: Option<PerformanceReport>) -> Self {
        let feature_columns = model.schema.names().iter().map(|s| s.to_string()).collect();
        let schema_fingerprint = model.schema.fingerprint();
        ModelBundle {
            model,
            feature_columns,
            schema_fingerprint,
            report,
            fitted_at: Utc::now(),
        }
    }

    /// Check the stored columns against a live feature schema
    pub fn check_schema(&self, schema: &FeatureSchema) -> PipelineResult<()> {
        let live: Vec<&str> = schema.names();
        if self.feature_columns.iter().map(String::as_str).ne(live.iter().copied())
            || &self.model.schema != schema
        {
            return Err(PipelineError::CacheSchemaMismatch {
                expected: self.feature_columns.join(","),
                found: live.join(","),
            });
        }
        Ok(())
    }
}

/// One finished pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Terminal state name, `DONE` or `FAILED`
    pub state: String,
    pub error: Option<String>,
    pub report: Option<PerformanceReport>,
    pub counts: SignalCounts,
    pub final_threshold: Option<f64>,
    pub threshold_attempts: Option<usize>,
}

// =============================================================================
// Store Implementation
// =============================================================================

/// Completed-run snapshots kept by default; older runs keep their record only
pub const DEFAULT_KEEP_SNAPSHOTS: usize = 5;

pub struct ModelStore {
    conn: Mutex<Connection>,
    json_backup_path: PathBuf,
    auto_backup: bool,
    keep_snapshots: usize,
}

impl ModelStore {
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: P, auto_backup: bool) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Mutex::new(conn),
            json_backup_path: json_backup_path.as_ref().to_path_buf(),
            auto_backup,
            keep_snapshots: DEFAULT_KEEP_SNAPSHOTS,
        };

        store.create_tables()?;
        info!("Model store initialized at {}", db_path.display());

        Ok(store)
    }

    /// Open the store under the configured state directory
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("Failed to create state dir: {}", config.state_dir))?;
        Ok(Self::new(config.db_path(), config.json_path(), config.json_backup)?
            .with_snapshot_retention(config.keep_snapshots))
    }

    /// Keep snapshots only for the newest `keep` runs (at least one)
    pub fn with_snapshot_retention(mut self, keep: usize) -> Self {
        self.keep_snapshots = keep.max(1);
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store connection lock poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS model_bundles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schema_fingerprint TEXT NOT NULL,
                feature_columns TEXT NOT NULL,
                window_size INTEGER NOT NULL,
                bundle TEXT NOT NULL,
                fitted_at TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                report TEXT,
                buy_count INTEGER DEFAULT 0,
                sell_count INTEGER DEFAULT 0,
                hold_count INTEGER DEFAULT 0,
                final_threshold REAL,
                threshold_attempts INTEGER,
                snapshot TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bundles_fingerprint ON model_bundles(schema_fingerprint)",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state)", [])?;

        debug!("Database schema created/verified");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Model bundles
    // -------------------------------------------------------------------------

    pub fn save_bundle<P: Serialize>(&self, bundle: &ModelBundle<P>) -> Result<i64> {
        let conn = self.conn()?;
        let bundle_json = serde_json::to_string(bundle)?;
        let columns_json = serde_json::to_string(&bundle.feature_columns)?;

        conn.execute(
            "INSERT INTO model_bundles
             (schema_fingerprint, feature_columns, window_size, bundle, fitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bundle.schema_fingerprint,
                columns_json,
                bundle.model.window_size as i64,
                bundle_json,
                bundle.fitted_at.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        debug!(
            "Model bundle saved: id={} columns={} fingerprint={}",
            id,
            bundle.feature_columns.len(),
            &bundle.schema_fingerprint[..12.min(bundle.schema_fingerprint.len())]
        );

        if self.auto_backup {
            drop(conn);
            self.export_json()?;
        }

        Ok(id)
    }

    /// Replace the report on the newest bundle with `fingerprint`
    ///
    /// Returns false when no bundle with that fingerprint exists.
    pub fn update_bundle_report(
        &self,
        fingerprint: &str,
        report: Option<&PerformanceReport>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, bundle FROM model_bundles
                 WHERE schema_fingerprint = ?1 ORDER BY id DESC LIMIT 1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((id, raw)) = row else {
            return Ok(false);
        };

        let mut bundle: serde_json::Value =
            serde_json::from_str(&raw).context("Failed to decode model bundle")?;
        bundle["report"] = serde_json::to_value(report)?;
        conn.execute(
            "UPDATE model_bundles SET bundle = ?1 WHERE id = ?2",
            params![bundle.to_string(), id],
        )?;
        debug!("Model bundle report updated: id={}", id);

        if self.auto_backup {
            drop(conn);
            self.export_json()?;
        }

        Ok(true)
    }

    pub fn bundle_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM model_bundles", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Most recently saved bundle regardless of schema
    pub fn latest_bundle<P: DeserializeOwned>(&self) -> Result<Option<ModelBundle<P>>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT bundle FROM model_bundles ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|json| serde_json::from_str(&json).context("Failed to decode model bundle"))
            .transpose()
    }

    /// Latest bundle usable with `schema`; a schema mismatch is a cache miss
    pub fn load_bundle<P: DeserializeOwned>(
        &self,
        schema: &FeatureSchema,
    ) -> Result<Option<ModelBundle<P>>> {
        let Some(bundle) = self.latest_bundle::<P>()? else {
            debug!("No cached model bundle");
            return Ok(None);
        };

        match bundle.check_schema(schema) {
            Ok(()) => {
                info!(
                    "Cached model hit: {} columns, fitted at {}",
                    bundle.feature_columns.len(),
                    bundle.fitted_at
                );
                Ok(Some(bundle))
            }
            Err(e) => {
                warn!("Cached model ignored: {}", e);
                Ok(None)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    /// Record a finished run, optionally with the snapshot it published
    pub fn record_run<S: Serialize>(&self, run: &RunRecord, snapshot: Option<&S>) -> Result<i64> {
        let conn = self.conn()?;
        let report_json = run.report.as_ref().map(serde_json::to_string).transpose()?;
        let snapshot_json = snapshot.map(serde_json::to_string).transpose()?;

        conn.execute(
            "INSERT INTO runs
             (started_at, finished_at, state, error, report, buy_count, sell_count,
              hold_count, final_threshold, threshold_attempts, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
                run.state,
                run.error,
                report_json,
                run.counts.buy as i64,
                run.counts.sell as i64,
                run.counts.hold as i64,
                run.final_threshold,
                run.threshold_attempts.map(|a| a as i64),
                snapshot_json,
            ],
        )?;
        let id = conn.last_insert_rowid();

        if snapshot_json.is_some() {
            let pruned = conn.execute(
                "UPDATE runs SET snapshot = NULL
                 WHERE snapshot IS NOT NULL AND id NOT IN (
                     SELECT id FROM runs WHERE snapshot IS NOT NULL ORDER BY id DESC LIMIT ?1
                 )",
                params![self.keep_snapshots as i64],
            )?;
            if pruned > 0 {
                debug!("Dropped {} old run snapshots", pruned);
            }
        }

        info!("Run recorded: id={} state={}", id, run.state);

        if self.auto_backup {
            drop(conn);
            self.export_json()?;
        }

        Ok(id)
    }

    /// Most recent runs, newest first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, state, error, report, buy_count,
                    sell_count, hold_count, final_threshold, threshold_attempts
             FROM runs ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<f64>>(9)?,
                    row.get::<_, Option<i64>>(10)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut runs = Vec::with_capacity(rows.len());
        for (id, started, finished, state, error, report, buy, sell, hold, threshold, attempts) in rows
        {
            let report = report
                .map(|r| serde_json::from_str(&r))
                .transpose()
                .context("Failed to decode run report")?;

            runs.push(RunRecord {
                id: Some(id),
                started_at: parse_time(&started)?,
                finished_at: parse_time(&finished)?,
                state,
                error,
                report,
                counts: SignalCounts {
                    buy: buy as usize,
                    sell: sell as usize,
                    hold: hold as usize,
                },
                final_threshold: threshold,
                threshold_attempts: attempts.map(|a| a as usize),
            });
        }

        debug!("Loaded {} runs", runs.len());
        Ok(runs)
    }

    /// Number of runs that still carry a snapshot
    pub fn snapshot_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE snapshot IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Snapshot of the latest successful run
    pub fn last_snapshot<S: DeserializeOwned>(&self) -> Result<Option<S>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM runs
                 WHERE state = 'DONE' AND snapshot IS NOT NULL
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|json| serde_json::from_str(&json).context("Failed to decode run snapshot"))
            .transpose()
    }

    pub fn export_json(&self) -> Result<()> {
        let runs = self.recent_runs(20)?;
        let bundle: Option<ModelBundle<serde_json::Value>> = self.latest_bundle()?;

        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "model_bundle": bundle,
            "runs": runs,
        });

        std::fs::write(&self.json_backup_path, serde_json::to_string_pretty(&state)?)?;
        debug!("State exported to: {}", self.json_backup_path.display());
        Ok(())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp: {}", raw))
}

// =============================================================================
// Tests
// =============================================================================
