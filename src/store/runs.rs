use super::{invalid_column, StoreError, StoreTx};
use crate::shared::time::now_iso;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduler {
    Cron,
    Daemon,
}

impl Scheduler {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Daemon => "daemon",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "cron" => Ok(Self::Cron),
            "daemon" => Ok(Self::Daemon),
            other => Err(format!("scheduler must be `cron` or `daemon`, got `{other}`")),
        }
    }

    /// Database NULL is read as `cron`.
    fn from_db(raw: Option<&str>) -> Result<Self, String> {
        match raw {
            None => Ok(Self::Cron),
            Some(value) => Self::parse(value),
        }
    }
}

impl std::fmt::Display for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Context = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: String,
    pub run_number: i64,
    pub workflow_id: String,
    pub task: String,
    pub status: RunStatus,
    pub context: Context,
    pub notify_url: Option<String>,
    pub scheduler: Scheduler,
    pub created_at: String,
    pub updated_at: String,
}

const RUN_COLUMNS: &str =
    "id, run_number, workflow_id, task, status, context, notify_url, scheduler, created_at, updated_at";

fn map_run(row: &Row<'_>) -> rusqlite::Result<(RunRecord, String, String, Option<String>)> {
    let status_raw: String = row.get(4)?;
    let context_raw: String = row.get(5)?;
    let scheduler_raw: Option<String> = row.get(7)?;
    let record = RunRecord {
        id: row.get(0)?,
        run_number: row.get(1)?,
        workflow_id: row.get(2)?,
        task: row.get(3)?,
        status: RunStatus::Running,
        context: Context::new(),
        notify_url: row.get(6)?,
        scheduler: Scheduler::Cron,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    };
    Ok((record, status_raw, context_raw, scheduler_raw))
}

fn finish_run(
    parts: (RunRecord, String, String, Option<String>),
) -> Result<RunRecord, StoreError> {
    let (mut record, status_raw, context_raw, scheduler_raw) = parts;
    record.status =
        RunStatus::parse(&status_raw).map_err(|_| invalid_column("runs.status", &status_raw))?;
    record.scheduler = Scheduler::from_db(scheduler_raw.as_deref())
        .map_err(|_| invalid_column("runs.scheduler", scheduler_raw.as_deref().unwrap_or("")))?;
    record.context = serde_json::from_str(&context_raw)
        .map_err(|_| invalid_column("runs.context", &context_raw))?;
    Ok(record)
}

pub(crate) fn run_by_id(conn: &Connection, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
    let parts = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![run_id],
            map_run,
        )
        .optional()?;
    parts.map(finish_run).transpose()
}

impl StoreTx<'_> {
    pub fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let context = serde_json::to_string(&run.context).map_err(|source| StoreError::Encode {
            column: "runs.context".to_string(),
            source,
        })?;
        self.conn().execute(
            &format!(
                "INSERT INTO runs ({RUN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                run.id,
                run.run_number,
                run.workflow_id,
                run.task,
                run.status.as_str(),
                context,
                run.notify_url,
                run.scheduler.as_str(),
                run.created_at,
                run.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        run_by_id(self.conn(), run_id)
    }

    /// Prefix lookup used by the CLI; exact match wins over a prefix match.
    pub fn run_by_prefix(&self, prefix: &str) -> Result<Option<RunRecord>, StoreError> {
        if let Some(run) = self.run(prefix)? {
            return Ok(Some(run));
        }
        let parts = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE id LIKE ?1 || '%'
                     ORDER BY run_number DESC LIMIT 1"
                ),
                params![prefix],
                map_run,
            )
            .optional()?;
        parts.map(finish_run).transpose()
    }

    pub fn next_run_number(&self) -> Result<i64, StoreError> {
        let max: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(run_number), 0) FROM runs",
            [],
            |row| row.get(0),
        )?;
        Ok(max + 1)
    }

    pub fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE runs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, status.as_str(), now_iso()],
        )?;
        Ok(())
    }

    pub fn update_run_context(&self, run_id: &str, context: &Context) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(context).map_err(|source| StoreError::Encode {
            column: "runs.context".to_string(),
            source,
        })?;
        self.conn().execute(
            "UPDATE runs SET context = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, encoded, now_iso()],
        )?;
        Ok(())
    }

    /// Distinct workflow ids with running, daemon-scheduled runs — the
    /// daemon tick's work list.
    pub fn daemon_workflow_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut statement = self.conn().prepare(
            "SELECT DISTINCT workflow_id FROM runs
             WHERE status = 'running' AND scheduler = 'daemon'
             ORDER BY workflow_id",
        )?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn runs_with_status(&self, status: RunStatus) -> Result<Vec<RunRecord>, StoreError> {
        let mut statement = self.conn().prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = ?1 ORDER BY run_number"
        ))?;
        let rows = statement.query_map(params![status.as_str()], map_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_run(row?)?);
        }
        Ok(out)
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let mut statement = self.conn().prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY run_number DESC LIMIT ?1"
        ))?;
        let rows = statement.query_map(params![limit as i64], map_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_run(row?)?);
        }
        Ok(out)
    }
}
