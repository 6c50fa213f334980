use super::runs::Scheduler;
use super::{invalid_column, StoreError, StoreTx};
use crate::shared::time::now_iso;
use crate::workflow::{LoopConfig, StepType};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Pending,
    Claiming,
    Running,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "waiting" => Ok(Self::Waiting),
            "pending" => Ok(Self::Pending),
            "claiming" => Ok(Self::Claiming),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown step status `{other}`")),
        }
    }

    /// A step that still blocks pipeline advancement past its index.
    pub fn is_incomplete(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Claiming | Self::Running | Self::Failed
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub step_index: i64,
    pub input_template: String,
    pub expects: Option<String>,
    pub step_type: StepType,
    pub loop_config: Option<LoopConfig>,
    pub max_retries: i64,
    pub retry_count: i64,
    pub abandoned_count: i64,
    pub status: StepStatus,
    pub current_story_id: Option<String>,
    pub output: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const STEP_COLUMNS: &str = "id, run_id, step_id, agent_id, step_index, input_template, expects, \
     step_type, loop_config, max_retries, retry_count, abandoned_count, status, \
     current_story_id, output, created_at, updated_at";

type RawStep = (StepRecord, String, String, Option<String>);

fn map_step(row: &Row<'_>) -> rusqlite::Result<RawStep> {
    let step_type_raw: String = row.get(7)?;
    let loop_config_raw: Option<String> = row.get(8)?;
    let status_raw: String = row.get(12)?;
    let record = StepRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        agent_id: row.get(3)?,
        step_index: row.get(4)?,
        input_template: row.get(5)?,
        expects: row.get(6)?,
        step_type: StepType::Single,
        loop_config: None,
        max_retries: row.get(9)?,
        retry_count: row.get(10)?,
        abandoned_count: row.get(11)?,
        status: StepStatus::Waiting,
        current_story_id: row.get(13)?,
        output: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    };
    Ok((record, step_type_raw, status_raw, loop_config_raw))
}

fn finish_step(parts: RawStep) -> Result<StepRecord, StoreError> {
    let (mut record, step_type_raw, status_raw, loop_config_raw) = parts;
    record.step_type = StepType::parse(&step_type_raw)
        .map_err(|_| invalid_column("steps.step_type", &step_type_raw))?;
    record.status =
        StepStatus::parse(&status_raw).map_err(|_| invalid_column("steps.status", &status_raw))?;
    record.loop_config = match loop_config_raw {
        None => None,
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|_| invalid_column("steps.loop_config", &raw))?,
        ),
    };
    Ok(record)
}

pub(crate) fn step_by_id(conn: &Connection, id: &str) -> Result<Option<StepRecord>, StoreError> {
    let parts = conn
        .query_row(
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
            params![id],
            map_step,
        )
        .optional()?;
    parts.map(finish_step).transpose()
}

fn collect_steps<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    bind: P,
) -> Result<Vec<StepRecord>, StoreError> {
    let mut statement = conn.prepare(sql)?;
    let rows = statement.query_map(bind, map_step)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(finish_step(row?)?);
    }
    Ok(out)
}

impl StoreTx<'_> {
    pub fn insert_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        let loop_config = step
            .loop_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|source| StoreError::Encode {
                column: "steps.loop_config".to_string(),
                source,
            })?;
        self.conn().execute(
            &format!(
                "INSERT INTO steps ({STEP_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                step.id,
                step.run_id,
                step.step_id,
                step.agent_id,
                step.step_index,
                step.input_template,
                step.expects,
                step.step_type.as_str(),
                loop_config,
                step.max_retries,
                step.retry_count,
                step.abandoned_count,
                step.status.as_str(),
                step.current_story_id,
                step.output,
                step.created_at,
                step.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn step(&self, id: &str) -> Result<Option<StepRecord>, StoreError> {
        step_by_id(self.conn(), id)
    }

    pub fn step_by_name(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        let parts = self
            .conn()
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND step_id = ?2"),
                params![run_id, step_id],
                map_step,
            )
            .optional()?;
        parts.map(finish_step).transpose()
    }

    pub fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        collect_steps(
            self.conn(),
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_index"),
            params![run_id],
        )
    }

    /// Deterministic claim candidate: the agent's first pending single step
    /// whose run has not failed or been cancelled. Runs are filtered by
    /// scheduler so a daemon claim never touches cron-scheduled runs of the
    /// same workflow, and vice versa.
    pub fn claimable_step(
        &self,
        agent_id: &str,
        scheduler: Scheduler,
    ) -> Result<Option<StepRecord>, StoreError> {
        let parts = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {prefixed} FROM steps s JOIN runs r ON r.id = s.run_id
                     WHERE s.agent_id = ?1 AND s.status = 'pending' AND s.step_type = 'single'
                       AND r.status NOT IN ('failed', 'cancelled')
                       AND {scheduler_clause}
                     ORDER BY s.run_id, s.step_index LIMIT 1",
                    prefixed = prefixed_step_columns(),
                    scheduler_clause = scheduler_clause(scheduler),
                ),
                params![agent_id],
                map_step,
            )
            .optional()?;
        parts.map(finish_step).transpose()
    }

    /// The agent's active loop step, if any: `running`, or `pending` and
    /// awaiting promotion by its first story claim.
    pub fn loop_step_for_agent(
        &self,
        agent_id: &str,
        scheduler: Scheduler,
    ) -> Result<Option<StepRecord>, StoreError> {
        let parts = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {prefixed} FROM steps s JOIN runs r ON r.id = s.run_id
                     WHERE s.agent_id = ?1 AND s.step_type = 'loop'
                       AND s.status IN ('running', 'pending')
                       AND r.status = 'running'
                       AND {scheduler_clause}
                     ORDER BY s.run_id, s.step_index LIMIT 1",
                    prefixed = prefixed_step_columns(),
                    scheduler_clause = scheduler_clause(scheduler),
                ),
                params![agent_id],
                map_step,
            )
            .optional()?;
        parts.map(finish_step).transpose()
    }

    pub fn steps_in_status(&self, status: StepStatus) -> Result<Vec<StepRecord>, StoreError> {
        collect_steps(
            self.conn(),
            &format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE status = ?1 ORDER BY run_id, step_index"
            ),
            params![status.as_str()],
        )
    }

    pub fn update_step_status(&self, id: &str, status: StepStatus) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE steps SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_iso()],
        )?;
        Ok(())
    }

    pub fn set_step_output(&self, id: &str, output: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE steps SET output = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, output, now_iso()],
        )?;
        Ok(())
    }

    pub fn set_current_story(
        &self,
        id: &str,
        story_row_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE steps SET current_story_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, story_row_id, now_iso()],
        )?;
        Ok(())
    }

    pub fn bump_step_retry(&self, id: &str) -> Result<i64, StoreError> {
        self.conn().execute(
            "UPDATE steps SET retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_iso()],
        )?;
        let count: i64 = self.conn().query_row(
            "SELECT retry_count FROM steps WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn bump_step_abandoned(&self, id: &str) -> Result<i64, StoreError> {
        self.conn().execute(
            "UPDATE steps SET abandoned_count = abandoned_count + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_iso()],
        )?;
        let count: i64 = self.conn().query_row(
            "SELECT abandoned_count FROM steps WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn scheduler_clause(scheduler: Scheduler) -> &'static str {
    match scheduler {
        Scheduler::Daemon => "r.scheduler = 'daemon'",
        Scheduler::Cron => "(r.scheduler IS NULL OR r.scheduler = 'cron')",
    }
}

fn prefixed_step_columns() -> String {
    STEP_COLUMNS
        .split(", ")
        .map(|column| format!("s.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
