use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub mod runs;
pub mod sessions;
pub mod steps;
pub mod stories;

pub use runs::{RunRecord, RunStatus, Scheduler};
pub use sessions::{ActiveSessionRecord, SpawnSource};
pub use steps::{StepRecord, StepStatus};
pub use stories::{StoryRecord, StoryStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("invalid {column} value `{value}` in database")]
    InvalidColumn { column: String, value: String },
    #[error("failed to encode {column}: {source}")]
    Encode {
        column: String,
        #[source]
        source: serde_json::Error,
    },
}

/// SQLite-backed store for runs, steps, stories and active sessions.
///
/// Connections are opened per operation with WAL journaling so daemon and
/// CLI processes can share the file; all mutations go through
/// [`Store::with_tx`].
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        let mut connection = store.connect()?;
        apply_migrations(&mut connection)?;
        Ok(store)
    }

    /// Runs `f` against a transaction handle; commits on `Ok`, rolls back on
    /// any error (the transaction is also rolled back if `f` panics, via
    /// drop).
    pub fn with_tx<T, E>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut connection = self.connect()?;
        let tx = connection.transaction().map_err(StoreError::from)?;
        let handle = StoreTx { tx };
        let value = f(&handle)?;
        handle.tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let connection =
            Connection::open(&self.db_path).map_err(|source| StoreError::Open {
                path: self.db_path.display().to_string(),
                source,
            })?;
        connection.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;
        Ok(connection)
    }
}

/// Transaction handle exposing the typed row accessors. Implementations
/// live next to their record types in the sibling modules.
pub struct StoreTx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl StoreTx<'_> {
    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }
}

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        run_number INTEGER NOT NULL UNIQUE,
        workflow_id TEXT NOT NULL,
        task TEXT NOT NULL,
        status TEXT NOT NULL,
        context TEXT NOT NULL DEFAULT '{}',
        notify_url TEXT,
        scheduler TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        step_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        step_index INTEGER NOT NULL,
        input_template TEXT NOT NULL,
        expects TEXT,
        step_type TEXT NOT NULL DEFAULT 'single',
        loop_config TEXT,
        max_retries INTEGER NOT NULL DEFAULT 2,
        retry_count INTEGER NOT NULL DEFAULT 0,
        abandoned_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        current_story_id TEXT,
        output TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(run_id, step_index),
        UNIQUE(run_id, step_id)
    );

    CREATE TABLE IF NOT EXISTS stories (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        story_index INTEGER NOT NULL,
        story_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        acceptance_criteria TEXT NOT NULL,
        status TEXT NOT NULL,
        output TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 2,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(run_id, story_id)
    );

    CREATE TABLE IF NOT EXISTS active_sessions (
        agent_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        story_id TEXT NOT NULL DEFAULT '',
        run_id TEXT NOT NULL,
        spawned_at TEXT NOT NULL,
        spawned_by TEXT NOT NULL,
        session_id TEXT NOT NULL,
        PRIMARY KEY (agent_id, step_id, story_id)
    );

    CREATE INDEX IF NOT EXISTS idx_steps_status ON steps(status);
    CREATE INDEX IF NOT EXISTS idx_steps_agent ON steps(agent_id);
    CREATE INDEX IF NOT EXISTS idx_stories_status ON stories(status);
    CREATE INDEX IF NOT EXISTS idx_stories_run ON stories(run_id);
    CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
    CREATE INDEX IF NOT EXISTS idx_runs_scheduler ON runs(scheduler);
    CREATE INDEX IF NOT EXISTS idx_sessions_run ON active_sessions(run_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_story ON active_sessions(story_id);
    ",
)];

fn apply_migrations(connection: &mut Connection) -> Result<(), StoreError> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY);",
    )?;
    let current: i64 = connection.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = connection.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )?;
        tx.commit()?;
    }
    Ok(())
}

pub(crate) fn invalid_column(column: &str, value: &str) -> StoreError {
    StoreError::InvalidColumn {
        column: column.to_string(),
        value: value.to_string(),
    }
}
