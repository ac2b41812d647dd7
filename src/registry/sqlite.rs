use super::types::{HistoryEntry, LaunchRecord, TransitionOutcome};
use crate::error::{Error, Result};
use crate::workspace::{StateTransition, Workspace, WorkspaceSettings, WorkspaceState};
use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use rusqlite::OptionalExtension;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

const DB_FILE_NAME: &str = "registry.db";
const LOCK_FILE_NAME: &str = ".lock";
const SCHEMA_VERSION: i32 = 1;

const WORKSPACE_COLUMNS: &str = "id, state, message, version, container_ref, assigned_port, \
     launched_at, last_heartbeat_at, state_updated_at, resource_limits, home_dir_path, \
     settings, logs_flushed_at, disk_usage_bytes";

/// Outcome of a guarded write, computed inside the database thread.
enum Guarded<T> {
    Done(T),
    Stale(i64),
    Invalid(Error),
    Missing,
}

/// SQLite-backed workspace registry.
///
/// The registry is the source of truth for workspace state and survives
/// host restarts. Every state change runs in a transaction that re-reads the
/// row, checks the caller's `version`, validates the transition and appends
/// a `workspace_history` row.
///
/// Uses advisory file locking (`{state_dir}/.lock`) to detect a second host
/// process pointed at the same state directory. The lock is held for the
/// lifetime of the registry and released when dropped.
pub struct SqliteRegistry {
    db_path: PathBuf,
    conn: Connection,
    /// Advisory lock file handle - held to detect concurrent hosts.
    #[allow(dead_code)]
    lock_file: Option<std::fs::File>,
}

impl SqliteRegistry {
    /// Open (creating if needed) the registry in `state_dir` and bring the
    /// schema up to date.
    pub async fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;

        let lock_file = Self::try_acquire_lock(&state_dir.join(LOCK_FILE_NAME))?;
        let db_path = state_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path).await?;

        // Configure WAL mode for crash recovery
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        let registry = Self {
            db_path,
            conn,
            lock_file,
        };
        registry.initialize().await?;
        Ok(registry)
    }

    /// Create an in-memory registry with no file lock. Used by tests and
    /// `--dry-run` style tooling.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open(":memory:").await?;

        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        })
        .await?;

        let registry = Self {
            db_path: PathBuf::from(":memory:"),
            conn,
            lock_file: None,
        };
        registry.initialize().await?;
        Ok(registry)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Try to acquire an advisory file lock.
    ///
    /// Returns the lock file handle if successful, or None if another process
    /// holds the lock (with a warning logged). Two hosts sharing a registry
    /// would prune each other's containers, so the warning names the owner.
    fn try_acquire_lock(lock_path: &Path) -> Result<Option<std::fs::File>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| Error::Filesystem(format!("Failed to open lock file: {}", e)))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired advisory lock on {:?}", lock_path);
                Ok(Some(file))
            }
            Err(e) => {
                let owner = std::fs::read_to_string(lock_path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                warn!(
                    "Another workspace-host process (PID {}) holds {:?}: {}. \
                     Proceeding, but both hosts will reconcile the same containers.",
                    if owner.is_empty() { "unknown" } else { owner.as_str() },
                    lock_path,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Execute a function within a transaction and commit it.
    #[tracing::instrument(skip(self, f), fields(operation = "db_transaction"))]
    async fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                let result = f(&tx)?;
                tx.commit()?;
                Ok(result)
            })
            .await
            .map_err(Error::from)
    }

    /// Create the schema on a fresh database, or check the version of an
    /// existing one.
    async fn initialize(&self) -> Result<()> {
        let schema_exists: bool = self
            .conn
            .call(
                |conn: &mut rusqlite::Connection| -> tokio_rusqlite::Result<bool> {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
                        [],
                        |row| row.get(0),
                    )?)
                },
            )
            .await?;

        if !schema_exists {
            debug!("Creating registry schema");
            return self.create_schema().await;
        }

        let current_version: i32 = self
            .conn
            .call(
                |conn: &mut rusqlite::Connection| -> tokio_rusqlite::Result<i32> {
                    Ok(conn
                        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                            row.get::<_, Option<i32>>(0)
                        })?
                        .unwrap_or(0))
                },
            )
            .await?;

        if current_version > SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "Registry at {} uses schema version {}, newer than this host supports ({})",
                self.db_path.display(),
                current_version,
                SCHEMA_VERSION
            )));
        }
        debug!("Registry schema is up to date (version {})", current_version);
        Ok(())
    }

    async fn create_schema(&self) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute_batch(
                r#"
                CREATE TABLE schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );

                CREATE TABLE workspaces (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL CHECK (state IN
                        ('uninitialized', 'launching', 'running', 'stopping', 'stopped', 'errored')),
                    message TEXT NOT NULL DEFAULT '',
                    version INTEGER NOT NULL DEFAULT 0,
                    container_ref TEXT,
                    assigned_port INTEGER,
                    launched_at TEXT,
                    last_heartbeat_at TEXT,
                    state_updated_at TEXT NOT NULL,
                    resource_limits TEXT,
                    home_dir_path TEXT,
                    settings TEXT,
                    created_at TEXT NOT NULL,
                    logs_flushed_at TEXT,
                    disk_usage_bytes INTEGER
                );

                -- A host port belongs to at most one workspace at a time
                CREATE UNIQUE INDEX idx_workspaces_assigned_port
                    ON workspaces(assigned_port) WHERE assigned_port IS NOT NULL;
                CREATE INDEX idx_workspaces_state ON workspaces(state);

                CREATE TABLE workspace_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                    version INTEGER NOT NULL,
                    state TEXT NOT NULL,
                    message TEXT NOT NULL,
                    at TEXT NOT NULL
                );
                CREATE INDEX idx_history_workspace ON workspace_history(workspace_id, id);
                "#,
            )?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![SCHEMA_VERSION, ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let id = id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| Ok(load(conn, &id)?))
            .await
            .map_err(Error::from)
    }

    /// Like [`get`](Self::get), but a missing row is an error.
    pub async fn require(&self, id: &str) -> Result<Workspace> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Workspace>> {
        self.query_workspaces("SELECT {cols} FROM workspaces ORDER BY id", Vec::new())
            .await
    }

    pub async fn list_in_states(&self, states: &[WorkspaceState]) -> Result<Vec<Workspace>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=states.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {{cols}} FROM workspaces WHERE state IN ({}) ORDER BY id",
            placeholders
        );
        let params = states.iter().map(|s| s.as_str().to_string()).collect();
        self.query_workspaces(&sql, params).await
    }

    /// Workspaces that may own a container: launching, running or stopping.
    pub async fn list_active(&self) -> Result<Vec<Workspace>> {
        self.list_in_states(&[
            WorkspaceState::Launching,
            WorkspaceState::Running,
            WorkspaceState::Stopping,
        ])
        .await
    }

    /// Running workspaces whose last heartbeat is older than `cutoff`.
    /// Workspaces that never sent a heartbeat are not included.
    pub async fn stale_heartbeats(&self, cutoff: DateTime<Utc>) -> Result<Vec<Workspace>> {
        self.query_workspaces(
            "SELECT {cols} FROM workspaces WHERE state = 'running' \
             AND last_heartbeat_at IS NOT NULL AND last_heartbeat_at < ?1 ORDER BY id",
            vec![ts(cutoff)],
        )
        .await
    }

    /// Workspaces that entered `launching` before `cutoff` and are still there.
    pub async fn stuck_launches(&self, cutoff: DateTime<Utc>) -> Result<Vec<Workspace>> {
        self.query_workspaces(
            "SELECT {cols} FROM workspaces WHERE state = 'launching' \
             AND state_updated_at < ?1 ORDER BY id",
            vec![ts(cutoff)],
        )
        .await
    }

    async fn query_workspaces(&self, sql: &str, params: Vec<String>) -> Result<Vec<Workspace>> {
        let sql = sql.replace("{cols}", WORKSPACE_COLUMNS);
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), workspace_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)
    }

    /// Ports currently assigned, with their owners.
    pub async fn assigned_ports(&self) -> Result<Vec<(String, u16)>> {
        self.conn
            .call(|conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT id, assigned_port FROM workspaces WHERE assigned_port IS NOT NULL ORDER BY assigned_port",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)
    }

    /// Every state a workspace has been in, oldest first.
    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        let id = id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT version, state, message, at FROM workspace_history \
                     WHERE workspace_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([&id], |row| {
                        let state: String = row.get(1)?;
                        let at: String = row.get(3)?;
                        Ok(HistoryEntry {
                            version: row.get(0)?,
                            state: parse_state(1, &state)?,
                            message: row.get(2)?,
                            at: parse_ts(Some(at)).unwrap_or_else(Utc::now),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert the workspace as `uninitialized` if it doesn't exist yet, and
    /// return its current row.
    pub async fn ensure(&self, id: &str) -> Result<Workspace> {
        let id = id.to_string();
        self.with_transaction(move |tx| {
            let now = ts(Utc::now());
            tx.execute(
                "INSERT OR IGNORE INTO workspaces (id, state, message, version, state_updated_at, created_at) \
                 VALUES (?1, 'uninitialized', '', 0, ?2, ?2)",
                rusqlite::params![id, now],
            )?;
            load(tx, &id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
        })
        .await
    }

    /// Store container settings for a workspace, registering it if needed.
    /// Takes effect on the next launch.
    pub async fn configure(&self, id: &str, settings: &WorkspaceSettings) -> Result<Workspace> {
        let id = id.to_string();
        let settings_json = serde_json::to_string(settings)?;
        self.with_transaction(move |tx| {
            let now = ts(Utc::now());
            tx.execute(
                "INSERT OR IGNORE INTO workspaces (id, state, message, version, state_updated_at, created_at) \
                 VALUES (?1, 'uninitialized', '', 0, ?2, ?2)",
                rusqlite::params![id, now],
            )?;
            tx.execute(
                "UPDATE workspaces SET settings = ?2 WHERE id = ?1",
                rusqlite::params![id, settings_json],
            )?;
            load(tx, &id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
        })
        .await
    }

    /// Start a new launch: bump `version`, enter `launching`, reset the
    /// per-container fields and snapshot the launch parameters.
    ///
    /// `expected_version` is the version the caller read; if it no longer
    /// matches, nothing is written.
    #[must_use = "a stale outcome means the launch must be abandoned"]
    pub async fn begin_launch(
        &self,
        id: &str,
        expected_version: i64,
        launch: LaunchRecord,
    ) -> Result<TransitionOutcome> {
        let id = id.to_string();
        let limits_json = serde_json::to_string(&launch.resource_limits)?;
        let home = launch.home_dir_path.to_string_lossy().to_string();
        let message = launch.message;

        let id_for_tx = id.clone();
        let outcome = self
            .with_transaction(move |tx| {
                let Some(current) = load(tx, &id_for_tx)? else {
                    return Ok(Guarded::Missing);
                };
                if current.version != expected_version {
                    return Ok(Guarded::Stale(current.version));
                }
                if !current.state.can_launch() {
                    return Ok(Guarded::Invalid(Error::InvalidTransition {
                        id: id_for_tx.clone(),
                        from: current.state,
                        to: WorkspaceState::Launching,
                    }));
                }

                let now = ts(Utc::now());
                let version = current.version + 1;
                tx.execute(
                    "UPDATE workspaces SET state = 'launching', message = ?2, version = ?3, \
                     launched_at = ?4, state_updated_at = ?4, last_heartbeat_at = NULL, \
                     container_ref = NULL, assigned_port = NULL, logs_flushed_at = NULL, \
                     resource_limits = ?5, home_dir_path = ?6 \
                     WHERE id = ?1",
                    rusqlite::params![id_for_tx, message, version, now, limits_json, home],
                )?;
                append_history(tx, &id_for_tx, version, WorkspaceState::Launching, &message, &now)?;

                let updated = load(tx, &id_for_tx)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                Ok(Guarded::Done(updated))
            })
            .await?;

        resolve(&id, outcome)
    }

    /// Apply a validated state transition.
    ///
    /// With `expected_version = Some(v)` the write only happens if the
    /// workspace is still at version `v`; otherwise
    /// [`TransitionOutcome::Stale`] is returned and nothing changes. `None`
    /// skips the version check (used by recovery, which runs with every other
    /// operation excluded).
    #[must_use = "ignoring this result may hide a stale or rejected transition"]
    pub async fn apply_transition(
        &self,
        id: &str,
        expected_version: Option<i64>,
        transition: StateTransition,
    ) -> Result<TransitionOutcome> {
        let id = id.to_string();
        let id_for_tx = id.clone();

        let outcome = self
            .with_transaction(move |tx| {
                let Some(current) = load(tx, &id_for_tx)? else {
                    return Ok(Guarded::Missing);
                };
                if let Some(expected) = expected_version {
                    if current.version != expected {
                        return Ok(Guarded::Stale(current.version));
                    }
                }
                if let Err(e) = transition.validate(&id_for_tx, current.state) {
                    return Ok(Guarded::Invalid(e));
                }

                let now = ts(Utc::now());
                let state_changed = current.state != transition.state;

                // Build UPDATE statement dynamically based on what needs to be updated
                let mut updates = vec!["state = ?1".to_string(), "message = ?2".to_string()];
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![
                    Box::new(transition.state.as_str()),
                    Box::new(transition.message.clone()),
                ];

                if state_changed {
                    params.push(Box::new(now.clone()));
                    updates.push(format!("state_updated_at = ?{}", params.len()));
                }
                if let Some(container_ref) = transition.container_ref.clone() {
                    params.push(Box::new(container_ref));
                    updates.push(format!("container_ref = ?{}", params.len()));
                }
                if let Some(port) = transition.assigned_port {
                    params.push(Box::new(port));
                    updates.push(format!("assigned_port = ?{}", params.len()));
                }
                if transition.clear_container {
                    updates.push("container_ref = NULL".to_string());
                    updates.push("assigned_port = NULL".to_string());
                    updates.push("last_heartbeat_at = NULL".to_string());
                    updates.push("logs_flushed_at = NULL".to_string());
                }

                params.push(Box::new(id_for_tx.clone()));
                let query = format!(
                    "UPDATE workspaces SET {} WHERE id = ?{}",
                    updates.join(", "),
                    params.len()
                );
                let param_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                tx.execute(&query, param_refs.as_slice())?;

                if state_changed {
                    append_history(
                        tx,
                        &id_for_tx,
                        current.version,
                        transition.state,
                        &transition.message,
                        &now,
                    )?;
                }

                let updated = load(tx, &id_for_tx)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                Ok(Guarded::Done(updated))
            })
            .await?;

        resolve(&id, outcome)
    }

    /// Move a running workspace to `stopping` if, and only if, its last
    /// heartbeat is still older than `cutoff`.
    ///
    /// The staleness check and the state change are one statement, so a
    /// heartbeat either lands before it (and the workspace keeps running)
    /// or is rejected after it.
    #[must_use = "a stale outcome means a heartbeat arrived in time"]
    pub async fn begin_idle_stop(
        &self,
        id: &str,
        expected_version: i64,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<TransitionOutcome> {
        let id = id.to_string();
        let id_for_tx = id.clone();
        let message = message.to_string();

        let outcome = self
            .with_transaction(move |tx| {
                let now = ts(Utc::now());
                let rows = tx.execute(
                    "UPDATE workspaces SET state = 'stopping', message = ?3, state_updated_at = ?4 \
                     WHERE id = ?1 AND version = ?2 AND state = 'running' \
                     AND last_heartbeat_at IS NOT NULL AND last_heartbeat_at < ?5",
                    rusqlite::params![id_for_tx, expected_version, message, now, ts(cutoff)],
                )?;
                let Some(current) = load(tx, &id_for_tx)? else {
                    return Ok(Guarded::Missing);
                };
                if rows == 0 {
                    return Ok(Guarded::Stale(current.version));
                }
                append_history(
                    tx,
                    &id_for_tx,
                    expected_version,
                    WorkspaceState::Stopping,
                    &message,
                    &now,
                )?;
                Ok(Guarded::Done(current))
            })
            .await?;

        resolve(&id, outcome)
    }

    /// Update the status message without changing state. Returns false if
    /// the workspace has moved on to another version.
    pub async fn set_message(&self, id: &str, version: i64, message: &str) -> Result<bool> {
        let id = id.to_string();
        let message = message.to_string();
        let rows = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.execute(
                    "UPDATE workspaces SET message = ?3 WHERE id = ?1 AND version = ?2",
                    rusqlite::params![id, version, message],
                )?)
            })
            .await?;
        Ok(rows == 1)
    }

    /// Record a client heartbeat. Accepted only while the workspace is
    /// `running`; returns whether it was accepted.
    pub async fn record_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let id = id.to_string();
        let rows = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.execute(
                    "UPDATE workspaces SET last_heartbeat_at = ?2 WHERE id = ?1 AND state = 'running'",
                    rusqlite::params![id, ts(at)],
                )?)
            })
            .await?;
        Ok(rows == 1)
    }

    /// Move the log watermark of `container_ref` forward to `until`.
    ///
    /// No-op if the workspace no longer owns that container or the watermark
    /// is already past `until`.
    pub async fn advance_log_watermark(
        &self,
        id: &str,
        container_ref: &str,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let id = id.to_string();
        let container_ref = container_ref.to_string();
        let rows = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let until = ts(until);
                Ok(conn.execute(
                    "UPDATE workspaces SET logs_flushed_at = ?3 \
                     WHERE id = ?1 AND container_ref = ?2 \
                     AND (logs_flushed_at IS NULL OR logs_flushed_at < ?3)",
                    rusqlite::params![id, container_ref, until],
                )?)
            })
            .await?;
        Ok(rows == 1)
    }

    /// Store the measured size of a workspace's home directory.
    pub async fn record_disk_usage(&self, id: &str, bytes: u64) -> Result<()> {
        let id = id.to_string();
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "UPDATE workspaces SET disk_usage_bytes = ?2 WHERE id = ?1",
                    rusqlite::params![id, bytes],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }
}

fn resolve(id: &str, outcome: Guarded<Workspace>) -> Result<TransitionOutcome> {
    match outcome {
        Guarded::Done(ws) => Ok(TransitionOutcome::Applied(ws)),
        Guarded::Stale(current_version) => {
            debug!(workspace_id = id, current_version, "Discarding stale transition");
            Ok(TransitionOutcome::Stale { current_version })
        }
        Guarded::Invalid(e) => Err(e),
        Guarded::Missing => Err(Error::WorkspaceNotFound(id.to_string())),
    }
}

fn append_history(
    conn: &rusqlite::Connection,
    id: &str,
    version: i64,
    state: WorkspaceState,
    message: &str,
    at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO workspace_history (workspace_id, version, state, message, at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![id, version, state.as_str(), message, at],
    )?;
    Ok(())
}

fn load(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<Workspace>> {
    conn.query_row(
        &format!("SELECT {} FROM workspaces WHERE id = ?1", WORKSPACE_COLUMNS),
        [id],
        workspace_from_row,
    )
    .optional()
}

fn workspace_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
    let state: String = row.get(1)?;
    let resource_limits: Option<String> = row.get(9)?;
    let home_dir_path: Option<String> = row.get(10)?;
    let settings: Option<String> = row.get(11)?;

    Ok(Workspace {
        id: row.get(0)?,
        state: parse_state(1, &state)?,
        message: row.get(2)?,
        version: row.get(3)?,
        container_ref: row.get(4)?,
        assigned_port: row.get(5)?,
        launched_at: parse_ts(row.get(6)?),
        last_heartbeat_at: parse_ts(row.get(7)?),
        state_updated_at: parse_ts(row.get(8)?).unwrap_or_else(Utc::now),
        resource_limits: resource_limits.and_then(|json| serde_json::from_str(&json).ok()),
        home_dir_path: home_dir_path.map(PathBuf::from),
        settings: settings
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default(),
        logs_flushed_at: parse_ts(row.get(12)?),
        disk_usage_bytes: row
            .get::<_, Option<i64>>(13)?
            .and_then(|bytes| u64::try_from(bytes).ok()),
    })
}

fn parse_state(column: usize, raw: &str) -> rusqlite::Result<WorkspaceState> {
    raw.parse::<WorkspaceState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            )),
        )
    })
}

/// Timestamps are stored as fixed-width RFC 3339 strings so that SQL string
/// comparison orders them chronologically.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use tempfile::TempDir;

    async fn create_ephemeral_registry() -> SqliteRegistry {
        SqliteRegistry::open_in_memory().await.unwrap()
    }

    fn launch_record(message: &str) -> LaunchRecord {
        LaunchRecord {
            resource_limits: ResourceLimits::default(),
            home_dir_path: PathBuf::from("/srv/workspaces/ws"),
            message: message.to_string(),
        }
    }

    /// Bring a workspace to `running` at version 1 with the given port.
    async fn launch_to_running(registry: &SqliteRegistry, id: &str, port: u16) -> Workspace {
        let ws = registry.ensure(id).await.unwrap();
        let ws = registry
            .begin_launch(id, ws.version, launch_record("Launching"))
            .await
            .unwrap()
            .applied()
            .unwrap();
        registry
            .apply_transition(
                id,
                Some(ws.version),
                StateTransition::running("Running")
                    .with_container(format!("container-{}", id))
                    .with_port(port),
            )
            .await
            .unwrap()
            .applied()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_creates_uninitialized_row_once() {
        let registry = create_ephemeral_registry().await;
        let first = registry.ensure("ws1").await.unwrap();
        assert_eq!(first.state, WorkspaceState::Uninitialized);
        assert_eq!(first.version, 0);

        let second = registry.ensure("ws1").await.unwrap();
        assert_eq!(second.state_updated_at, first.state_updated_at);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_begin_launch_bumps_version_and_resets_container_fields() {
        let registry = create_ephemeral_registry().await;
        let running = launch_to_running(&registry, "ws1", 20001).await;
        registry
            .record_heartbeat("ws1", Utc::now())
            .await
            .unwrap();

        // Stop it so it can launch again
        let stopping = registry
            .apply_transition("ws1", Some(running.version), StateTransition::stopping("Stopping"))
            .await
            .unwrap()
            .applied()
            .unwrap();
        registry
            .apply_transition("ws1", Some(stopping.version), StateTransition::stopped("Stopped"))
            .await
            .unwrap()
            .applied()
            .unwrap();

        let relaunched = registry
            .begin_launch("ws1", running.version, launch_record("Launching again"))
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(relaunched.version, running.version + 1);
        assert_eq!(relaunched.state, WorkspaceState::Launching);
        assert!(relaunched.container_ref.is_none());
        assert!(relaunched.assigned_port.is_none());
        assert!(relaunched.last_heartbeat_at.is_none());
        assert!(relaunched.launched_at.is_some());
        assert_eq!(relaunched.resource_limits, Some(ResourceLimits::default()));
    }

    #[tokio::test]
    async fn test_begin_launch_with_old_version_is_stale() {
        let registry = create_ephemeral_registry().await;
        registry.ensure("ws1").await.unwrap();
        let first = registry
            .begin_launch("ws1", 0, launch_record("Launching"))
            .await
            .unwrap();
        assert!(first.is_applied());

        // Errored so the state would allow a launch; only the version is wrong
        registry
            .apply_transition("ws1", Some(1), StateTransition::errored("boom"))
            .await
            .unwrap();
        let second = registry
            .begin_launch("ws1", 0, launch_record("Launching"))
            .await
            .unwrap();
        assert!(matches!(second, TransitionOutcome::Stale { current_version: 1 }));
    }

    #[tokio::test]
    async fn test_begin_launch_from_running_is_rejected() {
        let registry = create_ephemeral_registry().await;
        let running = launch_to_running(&registry, "ws1", 20001).await;
        let err = registry
            .begin_launch("ws1", running.version, launch_record("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_stale_transition_writes_nothing() {
        let registry = create_ephemeral_registry().await;
        let running = launch_to_running(&registry, "ws1", 20001).await;

        let outcome = registry
            .apply_transition("ws1", Some(running.version - 1), StateTransition::stopping("old"))
            .await
            .unwrap();
        assert!(!outcome.is_applied());

        let current = registry.require("ws1").await.unwrap();
        assert_eq!(current.state, WorkspaceState::Running);
        assert_eq!(current.message, "Running");
    }

    #[tokio::test]
    async fn test_invalid_transition_is_an_error() {
        let registry = create_ephemeral_registry().await;
        registry.ensure("ws1").await.unwrap();
        let err = registry
            .apply_transition("ws1", Some(0), StateTransition::running("nope"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: WorkspaceState::Uninitialized,
                to: WorkspaceState::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transition_on_missing_workspace() {
        let registry = create_ephemeral_registry().await;
        let err = registry
            .apply_transition("ghost", None, StateTransition::stopping("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkspaceNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_stopped_clears_container_port_and_heartbeat() {
        let registry = create_ephemeral_registry().await;
        let running = launch_to_running(&registry, "ws1", 20001).await;
        assert!(registry.record_heartbeat("ws1", Utc::now()).await.unwrap());

        registry
            .apply_transition("ws1", Some(running.version), StateTransition::stopping("Stopping"))
            .await
            .unwrap();
        let stopped = registry
            .apply_transition("ws1", Some(running.version), StateTransition::stopped("Stopped"))
            .await
            .unwrap()
            .applied()
            .unwrap();

        assert_eq!(stopped.state, WorkspaceState::Stopped);
        assert!(stopped.container_ref.is_none());
        assert!(stopped.assigned_port.is_none());
        assert!(stopped.last_heartbeat_at.is_none());
        assert!(registry.assigned_ports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_port_is_rejected_by_database() {
        let registry = create_ephemeral_registry().await;
        launch_to_running(&registry, "ws1", 20001).await;

        let ws2 = registry.ensure("ws2").await.unwrap();
        let ws2 = registry
            .begin_launch("ws2", ws2.version, launch_record("Launching"))
            .await
            .unwrap()
            .applied()
            .unwrap();
        let result = registry
            .apply_transition(
                "ws2",
                Some(ws2.version),
                StateTransition::message_only(WorkspaceState::Launching, "port").with_port(20001),
            )
            .await;
        assert!(matches!(result, Err(Error::Database(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_only_accepted_while_running() {
        let registry = create_ephemeral_registry().await;
        registry.ensure("ws1").await.unwrap();
        assert!(!registry.record_heartbeat("ws1", Utc::now()).await.unwrap());
        assert!(!registry.record_heartbeat("ghost", Utc::now()).await.unwrap());

        launch_to_running(&registry, "ws2", 20002).await;
        let at = Utc::now();
        assert!(registry.record_heartbeat("ws2", at).await.unwrap());
        let ws = registry.require("ws2").await.unwrap();
        let stored = ws.last_heartbeat_at.unwrap();
        assert!((stored - at).num_milliseconds().abs() < 1);
    }

    #[tokio::test]
    async fn test_stale_heartbeats_excludes_never_heartbeated() {
        let registry = create_ephemeral_registry().await;
        launch_to_running(&registry, "silent", 20001).await;
        launch_to_running(&registry, "idle", 20002).await;
        launch_to_running(&registry, "active", 20003).await;

        let now = Utc::now();
        registry
            .record_heartbeat("idle", now - chrono::Duration::minutes(20))
            .await
            .unwrap();
        registry.record_heartbeat("active", now).await.unwrap();

        let stale = registry
            .stale_heartbeats(now - chrono::Duration::minutes(10))
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["idle"]);
    }

    #[tokio::test]
    async fn test_idle_stop_loses_to_fresh_heartbeat() {
        let registry = create_ephemeral_registry().await;
        let running = launch_to_running(&registry, "ws1", 20001).await;
        let now = Utc::now();
        registry
            .record_heartbeat("ws1", now - chrono::Duration::minutes(20))
            .await
            .unwrap();
        let cutoff = now - chrono::Duration::minutes(10);

        // A heartbeat lands between the scan and the stop
        registry.record_heartbeat("ws1", now).await.unwrap();
        let outcome = registry
            .begin_idle_stop("ws1", running.version, cutoff, "idle")
            .await
            .unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(
            registry.require("ws1").await.unwrap().state,
            WorkspaceState::Running
        );
    }

    #[tokio::test]
    async fn test_idle_stop_blocks_later_heartbeats() {
        let registry = create_ephemeral_registry().await;
        let running = launch_to_running(&registry, "ws1", 20001).await;
        let now = Utc::now();
        registry
            .record_heartbeat("ws1", now - chrono::Duration::minutes(20))
            .await
            .unwrap();

        let outcome = registry
            .begin_idle_stop("ws1", running.version, now - chrono::Duration::minutes(10), "idle")
            .await
            .unwrap();
        assert!(outcome.is_applied());
        assert!(!registry.record_heartbeat("ws1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_stuck_launches() {
        let registry = create_ephemeral_registry().await;
        registry.ensure("ws1").await.unwrap();
        registry
            .begin_launch("ws1", 0, launch_record("Launching"))
            .await
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(5);
        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(registry.stuck_launches(future).await.unwrap().len(), 1);
        assert!(registry.stuck_launches(past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_watermark_only_moves_forward_for_current_container() {
        let registry = create_ephemeral_registry().await;
        launch_to_running(&registry, "ws1", 20001).await;
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(30);

        assert!(registry
            .advance_log_watermark("ws1", "container-ws1", t1)
            .await
            .unwrap());
        assert!(!registry
            .advance_log_watermark("ws1", "container-ws1", t0)
            .await
            .unwrap());
        assert!(!registry
            .advance_log_watermark("ws1", "some-other-container", t1 + chrono::Duration::seconds(1))
            .await
            .unwrap());

        let ws = registry.require("ws1").await.unwrap();
        let stored = ws.logs_flushed_at.unwrap();
        assert!((stored - t1).num_milliseconds().abs() < 1);
    }

    #[tokio::test]
    async fn test_history_records_each_state_change() {
        let registry = create_ephemeral_registry().await;
        let running = launch_to_running(&registry, "ws1", 20001).await;
        // Message-only update does not add history
        registry
            .apply_transition(
                "ws1",
                Some(running.version),
                StateTransition::message_only(WorkspaceState::Running, "still running"),
            )
            .await
            .unwrap();

        let history = registry.history("ws1").await.unwrap();
        let states: Vec<_> = history.iter().map(|h| h.state).collect();
        assert_eq!(states, vec![WorkspaceState::Launching, WorkspaceState::Running]);
        assert!(history.iter().all(|h| h.version == 1));
    }

    #[tokio::test]
    async fn test_configure_persists_settings() {
        let registry = create_ephemeral_registry().await;
        let settings = WorkspaceSettings {
            image: Some("workspace/jupyter:3".to_string()),
            port: Some(8888),
            ..WorkspaceSettings::default()
        };
        let ws = registry.configure("ws1", &settings).await.unwrap();
        assert_eq!(ws.state, WorkspaceState::Uninitialized);
        assert_eq!(registry.require("ws1").await.unwrap().settings, settings);
    }

    #[tokio::test]
    async fn test_list_in_states() {
        let registry = create_ephemeral_registry().await;
        registry.ensure("idle").await.unwrap();
        launch_to_running(&registry, "busy", 20001).await;

        let active = registry.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "busy");
        assert!(registry.list_in_states(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let registry = SqliteRegistry::open(temp_dir.path()).await.unwrap();
            launch_to_running(&registry, "ws1", 20001).await;
        }

        let reopened = SqliteRegistry::open(temp_dir.path()).await.unwrap();
        let ws = reopened.require("ws1").await.unwrap();
        assert_eq!(ws.state, WorkspaceState::Running);
        assert_eq!(ws.assigned_port, Some(20001));
        assert_eq!(ws.container_ref.as_deref(), Some("container-ws1"));
    }

    #[tokio::test]
    async fn test_newer_schema_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        {
            SqliteRegistry::open(temp_dir.path()).await.unwrap();
        }
        {
            let conn = rusqlite::Connection::open(temp_dir.path().join(DB_FILE_NAME)).unwrap();
            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![SCHEMA_VERSION + 1, ts(Utc::now())],
            )
            .unwrap();
        }

        let err = SqliteRegistry::open(temp_dir.path()).await.err().unwrap();
        assert!(matches!(err, Error::Config(msg) if msg.contains("newer")));
    }

    #[tokio::test]
    async fn test_disk_usage_is_recorded() {
        let registry = create_ephemeral_registry().await;
        registry.ensure("ws1").await.unwrap();
        assert_eq!(registry.require("ws1").await.unwrap().disk_usage_bytes, None);

        registry.record_disk_usage("ws1", 12_345).await.unwrap();
        assert_eq!(
            registry.require("ws1").await.unwrap().disk_usage_bytes,
            Some(12_345)
        );
    }
}
