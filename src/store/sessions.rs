use super::{invalid_column, StoreError, StoreTx};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnSource {
    Daemon,
    Cron,
}

impl SpawnSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daemon => "daemon",
            Self::Cron => "cron",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "daemon" => Ok(Self::Daemon),
            "cron" => Ok(Self::Cron),
            other => Err(format!("unknown spawn source `{other}`")),
        }
    }
}

/// A worker believed to be running. `story_id` is the empty string when the
/// session runs a whole step; the composite primary key relies on that
/// normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSessionRecord {
    pub agent_id: String,
    pub step_id: String,
    pub story_id: String,
    pub run_id: String,
    pub spawned_at: String,
    pub spawned_by: SpawnSource,
    pub session_id: String,
}

const SESSION_COLUMNS: &str =
    "agent_id, step_id, story_id, run_id, spawned_at, spawned_by, session_id";

fn map_session(row: &Row<'_>) -> rusqlite::Result<(ActiveSessionRecord, String)> {
    let spawned_by_raw: String = row.get(5)?;
    let record = ActiveSessionRecord {
        agent_id: row.get(0)?,
        step_id: row.get(1)?,
        story_id: row.get(2)?,
        run_id: row.get(3)?,
        spawned_at: row.get(4)?,
        spawned_by: SpawnSource::Daemon,
        session_id: row.get(6)?,
    };
    Ok((record, spawned_by_raw))
}

fn finish_session(parts: (ActiveSessionRecord, String)) -> Result<ActiveSessionRecord, StoreError> {
    let (mut record, spawned_by_raw) = parts;
    record.spawned_by = SpawnSource::parse(&spawned_by_raw)
        .map_err(|_| invalid_column("active_sessions.spawned_by", &spawned_by_raw))?;
    Ok(record)
}

impl StoreTx<'_> {
    pub fn upsert_session(&self, session: &ActiveSessionRecord) -> Result<(), StoreError> {
        self.conn().execute(
            &format!(
                "INSERT INTO active_sessions ({SESSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(agent_id, step_id, story_id) DO UPDATE SET
                     run_id=excluded.run_id,
                     spawned_at=excluded.spawned_at,
                     spawned_by=excluded.spawned_by,
                     session_id=excluded.session_id"
            ),
            params![
                session.agent_id,
                session.step_id,
                session.story_id,
                session.run_id,
                session.spawned_at,
                session.spawned_by.as_str(),
                session.session_id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_session(
        &self,
        agent_id: &str,
        step_id: &str,
        story_id: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM active_sessions
             WHERE agent_id = ?1 AND step_id = ?2 AND story_id = ?3",
            params![agent_id, step_id, story_id],
        )?;
        Ok(())
    }

    pub fn sessions(&self) -> Result<Vec<ActiveSessionRecord>, StoreError> {
        let mut statement = self.conn().prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM active_sessions ORDER BY spawned_at"
        ))?;
        let rows = statement.query_map([], map_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_session(row?)?);
        }
        Ok(out)
    }

    pub fn sessions_for_run(&self, run_id: &str) -> Result<Vec<ActiveSessionRecord>, StoreError> {
        let mut statement = self.conn().prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM active_sessions WHERE run_id = ?1 ORDER BY spawned_at"
        ))?;
        let rows = statement.query_map(params![run_id], map_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_session(row?)?);
        }
        Ok(out)
    }
}
