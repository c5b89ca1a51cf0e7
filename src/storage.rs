// src/storage.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::analytics::clustering::{ClusterAssignment, ClusterTransitionRecord};
use crate::config::{SnapshotBackend, StorageConfig};
use crate::db::{self, PgPool};
use crate::models::{CourseId, RunWindow};
use crate::reinforcement::QTableSnapshot;
use crate::results::RunReport;
use crate::utils;

const ASSIGNMENT_FILE: &str = "assignment.json";
const TRANSITIONS_FILE: &str = "transitions.json";
const POLICY_FILE: &str = "policy.json";
const REPORT_FILE: &str = "report.json";

/// Everything one successful course run emits. Written all-or-nothing.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub assignment: ClusterAssignment,
    /// Full transition ledger of the course after this run
    pub transitions: Vec<ClusterTransitionRecord>,
    /// Absent when training was skipped for lack of data
    pub policy: Option<QTableSnapshot>,
    pub report: RunReport,
}

impl RunArtifacts {
    pub fn course_id(&self) -> &CourseId {
        &self.report.course_id
    }
}

/// Durable home of run snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists every artifact of a run, or nothing on failure.
    async fn save_run(&self, artifacts: &RunArtifacts) -> Result<()>;

    async fn load_latest_policy(&self, course_id: &CourseId) -> Result<Option<QTableSnapshot>>;

    async fn load_latest_assignment(&self, course_id: &CourseId)
    -> Result<Option<ClusterAssignment>>;

    async fn load_transition_records(
        &self,
        course_id: &CourseId,
    ) -> Result<Vec<ClusterTransitionRecord>>;

    /// True when a run over exactly `window` was already persisted.
    async fn has_completed(&self, course_id: &CourseId, window: &RunWindow) -> Result<bool>;
}

//------------------------------------------------------------------------------
// FILE STORE
//------------------------------------------------------------------------------

/// One directory per course, one sub-directory per run named after its
/// timestamp. A run is staged in a hidden directory and renamed into place.
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Readable form of the id plus a hash of the raw id, so ids that
    /// sanitize to the same text keep separate directories.
    fn course_dir(&self, course_id: &CourseId) -> PathBuf {
        let safe: String = course_id
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let hash = utils::fnv1a(course_id.0.bytes()) as u32;
        self.root.join(format!("{}-{:08x}", safe, hash))
    }

    /// Committed run directories of a course, newest first.
    async fn run_dirs(&self, course_id: &CourseId) -> Result<Vec<PathBuf>> {
        let dir = self.course_dir(course_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", dir.display()));
            }
        };
        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                runs.push(entry.path());
            }
        }
        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let raw = serde_json::to_vec_pretty(value)
            .with_context(|| format!("Failed to serialize {}", path.display()))?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn stage(&self, staging: &Path, artifacts: &RunArtifacts) -> Result<()> {
        tokio::fs::create_dir_all(staging)
            .await
            .with_context(|| format!("Failed to create {}", staging.display()))?;
        Self::write_json(&staging.join(ASSIGNMENT_FILE), &artifacts.assignment).await?;
        Self::write_json(&staging.join(TRANSITIONS_FILE), &artifacts.transitions).await?;
        if let Some(policy) = &artifacts.policy {
            Self::write_json(&staging.join(POLICY_FILE), policy).await?;
        }
        Self::write_json(&staging.join(REPORT_FILE), &artifacts.report).await?;
        Ok(())
    }
}

pub fn run_dir_name(report: &RunReport) -> String {
    format!(
        "{}-{}",
        report.run_timestamp.format("%Y%m%dT%H%M%S%.3fZ"),
        report.run_id.simple()
    )
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save_run(&self, artifacts: &RunArtifacts) -> Result<()> {
        let course_dir = self.course_dir(artifacts.course_id());
        let name = run_dir_name(&artifacts.report);
        let staging = course_dir.join(format!(".staging-{}", name));
        let target = course_dir.join(&name);

        if let Err(e) = self.stage(&staging, artifacts).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                warn!(
                    "Failed to remove staging directory {}: {}",
                    staging.display(),
                    cleanup
                );
            }
            return Err(e);
        }
        tokio::fs::rename(&staging, &target)
            .await
            .with_context(|| format!("Failed to commit run directory {}", target.display()))?;
        info!(
            "Saved run {} of course {} to {}",
            artifacts.report.run_id,
            artifacts.course_id(),
            target.display()
        );
        Ok(())
    }

    async fn load_latest_policy(&self, course_id: &CourseId) -> Result<Option<QTableSnapshot>> {
        for dir in self.run_dirs(course_id).await? {
            let path = dir.join(POLICY_FILE);
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => {
                    let snapshot = QTableSnapshot::from_json(&raw)
                        .with_context(|| format!("Failed to load {}", path.display()))?;
                    debug!("Loaded policy v{} from {}", snapshot.version, path.display());
                    return Ok(Some(snapshot));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", path.display()));
                }
            }
        }
        Ok(None)
    }

    async fn load_latest_assignment(
        &self,
        course_id: &CourseId,
    ) -> Result<Option<ClusterAssignment>> {
        match self.run_dirs(course_id).await?.first() {
            Some(dir) => Self::read_json(&dir.join(ASSIGNMENT_FILE)).await,
            None => Ok(None),
        }
    }

    async fn load_transition_records(
        &self,
        course_id: &CourseId,
    ) -> Result<Vec<ClusterTransitionRecord>> {
        match self.run_dirs(course_id).await?.first() {
            Some(dir) => Ok(Self::read_json(&dir.join(TRANSITIONS_FILE))
                .await?
                .unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    async fn has_completed(&self, course_id: &CourseId, window: &RunWindow) -> Result<bool> {
        for dir in self.run_dirs(course_id).await? {
            match Self::read_json::<RunReport>(&dir.join(REPORT_FILE)).await {
                Ok(Some(report)) if report.window == *window => return Ok(true),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable run report in {}: {}", dir.display(), e),
            }
        }
        Ok(false)
    }
}

//------------------------------------------------------------------------------
// POSTGRES STORE
//------------------------------------------------------------------------------

pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the analytics schema and its tables when missing.
    pub async fn ensure_tables_exist(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for schema setup")?;
        conn.batch_execute(
            "
            CREATE SCHEMA IF NOT EXISTS analytics;

            CREATE TABLE IF NOT EXISTS analytics.cluster_assignments (
                run_id UUID PRIMARY KEY,
                course_id TEXT NOT NULL,
                run_timestamp TIMESTAMPTZ NOT NULL,
                optimal_k INTEGER NOT NULL,
                payload JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS analytics.cluster_transitions (
                course_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                last_run_id UUID NOT NULL,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (course_id, student_id)
            );

            CREATE TABLE IF NOT EXISTS analytics.q_table_snapshots (
                run_id UUID PRIMARY KEY,
                course_id TEXT NOT NULL,
                run_timestamp TIMESTAMPTZ NOT NULL,
                version BIGINT NOT NULL,
                catalog_version TEXT NOT NULL,
                payload JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS analytics.run_reports (
                run_id UUID PRIMARY KEY,
                course_id TEXT NOT NULL,
                run_timestamp TIMESTAMPTZ NOT NULL,
                window_key TEXT NOT NULL,
                payload JSONB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_q_table_snapshots_course
                ON analytics.q_table_snapshots (course_id, version DESC);
            CREATE INDEX IF NOT EXISTS idx_cluster_assignments_course
                ON analytics.cluster_assignments (course_id, run_timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_run_reports_window
                ON analytics.run_reports (course_id, window_key);
            ",
        )
        .await
        .context("Failed to create analytics tables")?;
        info!("Analytics tables are in place");
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn save_run(&self, artifacts: &RunArtifacts) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for run snapshot")?;
        let report = &artifacts.report;
        let transaction = conn.transaction().await.context(format!(
            "Run {}: failed to start transaction",
            report.run_id
        ))?;

        let assignment_json = serde_json::to_value(&artifacts.assignment)?;
        transaction
            .execute(
                "INSERT INTO analytics.cluster_assignments
                 (run_id, course_id, run_timestamp, optimal_k, payload)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &artifacts.assignment.run_id,
                    &artifacts.assignment.course_id,
                    &artifacts.assignment.run_timestamp,
                    &(artifacts.assignment.optimal_k as i32),
                    &assignment_json,
                ],
            )
            .await
            .context("Failed to insert cluster assignment")?;

        for record in &artifacts.transitions {
            let Some(last) = record.latest() else {
                continue;
            };
            let payload = serde_json::to_value(record)?;
            transaction
                .execute(
                    "INSERT INTO analytics.cluster_transitions
                     (course_id, student_id, last_run_id, payload, updated_at)
                     VALUES ($1, $2, $3, $4, NOW())
                     ON CONFLICT (course_id, student_id) DO UPDATE
                     SET last_run_id = $3, payload = $4, updated_at = NOW()",
                    &[&record.course_id, &record.student_id, &last.run_id, &payload],
                )
                .await
                .context("Failed to upsert cluster transition record")?;
        }

        if let Some(policy) = &artifacts.policy {
            let payload = serde_json::to_value(policy)?;
            transaction
                .execute(
                    "INSERT INTO analytics.q_table_snapshots
                     (run_id, course_id, run_timestamp, version, catalog_version, payload)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                    &[
                        &policy.run_id,
                        &policy.course_id,
                        &policy.run_timestamp,
                        &(policy.version as i64),
                        &policy.catalog_version,
                        &payload,
                    ],
                )
                .await
                .context("Failed to insert Q-table snapshot")?;
        }

        let report_json = serde_json::to_value(report)?;
        transaction
            .execute(
                "INSERT INTO analytics.run_reports
                 (run_id, course_id, run_timestamp, window_key, payload)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &report.run_id,
                    &report.course_id,
                    &report.run_timestamp,
                    &report.window.key(),
                    &report_json,
                ],
            )
            .await
            .context("Failed to insert run report")?;

        transaction
            .commit()
            .await
            .context(format!("Run {}: failed to commit snapshot", report.run_id))?;
        info!(
            "Saved run {} of course {} to PostgreSQL",
            report.run_id, report.course_id
        );
        Ok(())
    }

    async fn load_latest_policy(&self, course_id: &CourseId) -> Result<Option<QTableSnapshot>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT payload FROM analytics.q_table_snapshots
                 WHERE course_id = $1
                 ORDER BY version DESC
                 LIMIT 1",
                &[course_id],
            )
            .await
            .context("Failed to query latest Q-table snapshot")?;
        match row {
            Some(row) => {
                let payload: Value = row.get(0);
                let mut snapshot: QTableSnapshot = serde_json::from_value(payload)
                    .context("Failed to decode Q-table snapshot")?;
                snapshot.rebuild_index();
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn load_latest_assignment(
        &self,
        course_id: &CourseId,
    ) -> Result<Option<ClusterAssignment>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT payload FROM analytics.cluster_assignments
                 WHERE course_id = $1
                 ORDER BY run_timestamp DESC
                 LIMIT 1",
                &[course_id],
            )
            .await
            .context("Failed to query latest cluster assignment")?;
        row.map(|row| {
            let payload: Value = row.get(0);
            serde_json::from_value(payload).context("Failed to decode cluster assignment")
        })
        .transpose()
    }

    async fn load_transition_records(
        &self,
        course_id: &CourseId,
    ) -> Result<Vec<ClusterTransitionRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT payload FROM analytics.cluster_transitions
                 WHERE course_id = $1
                 ORDER BY student_id",
                &[course_id],
            )
            .await
            .context("Failed to query cluster transition records")?;
        rows.into_iter()
            .map(|row| {
                let payload: Value = row.get(0);
                serde_json::from_value(payload).context("Failed to decode transition record")
            })
            .collect()
    }

    async fn has_completed(&self, course_id: &CourseId, window: &RunWindow) -> Result<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT 1 FROM analytics.run_reports
                 WHERE course_id = $1 AND window_key = $2
                 LIMIT 1",
                &[course_id, &window.key()],
            )
            .await
            .context("Failed to query run reports")?;
        Ok(row.is_some())
    }
}

/// Store selected by `config.backend`. The Postgres backend creates its
/// tables when `ensure_schema` is set.
pub async fn open_store(
    config: &StorageConfig,
    ensure_schema: bool,
) -> Result<Arc<dyn SnapshotStore>> {
    match config.backend {
        SnapshotBackend::File => {
            info!("Using snapshot directory {}", config.snapshot_dir.display());
            Ok(Arc::new(FileSnapshotStore::new(config.snapshot_dir.clone())))
        }
        SnapshotBackend::Postgres => {
            let pool = db::connect()
                .await
                .context("Failed to connect to database")?;
            let store = PgSnapshotStore::new(pool);
            if ensure_schema {
                store.ensure_tables_exist().await?;
            }
            Ok(Arc::new(store))
        }
    }
}
