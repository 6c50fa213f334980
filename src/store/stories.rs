use super::{invalid_column, StoreError, StoreTx};
use crate::shared::time::now_iso;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STORY_MAX_RETRIES: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Claiming,
    Running,
    Done,
    Failed,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pending" => Ok(Self::Pending),
            "claiming" => Ok(Self::Claiming),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown story status `{other}`")),
        }
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryRecord {
    pub id: String,
    pub run_id: String,
    pub story_index: i64,
    pub story_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: StoryStatus,
    pub output: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: String,
    pub updated_at: String,
}

const STORY_COLUMNS: &str = "id, run_id, story_index, story_id, title, description, \
     acceptance_criteria, status, output, retry_count, max_retries, created_at, updated_at";

type RawStory = (StoryRecord, String, String);

fn map_story(row: &Row<'_>) -> rusqlite::Result<RawStory> {
    let criteria_raw: String = row.get(6)?;
    let status_raw: String = row.get(7)?;
    let record = StoryRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        story_index: row.get(2)?,
        story_id: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        acceptance_criteria: Vec::new(),
        status: StoryStatus::Pending,
        output: row.get(8)?,
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    };
    Ok((record, criteria_raw, status_raw))
}

fn finish_story(parts: RawStory) -> Result<StoryRecord, StoreError> {
    let (mut record, criteria_raw, status_raw) = parts;
    record.acceptance_criteria = serde_json::from_str(&criteria_raw)
        .map_err(|_| invalid_column("stories.acceptance_criteria", &criteria_raw))?;
    record.status = StoryStatus::parse(&status_raw)
        .map_err(|_| invalid_column("stories.status", &status_raw))?;
    Ok(record)
}

pub(crate) fn story_by_id(conn: &Connection, id: &str) -> Result<Option<StoryRecord>, StoreError> {
    let parts = conn
        .query_row(
            &format!("SELECT {STORY_COLUMNS} FROM stories WHERE id = ?1"),
            params![id],
            map_story,
        )
        .optional()?;
    parts.map(finish_story).transpose()
}

impl StoreTx<'_> {
    pub fn insert_story(&self, story: &StoryRecord) -> Result<(), StoreError> {
        let criteria = serde_json::to_string(&story.acceptance_criteria).map_err(|source| {
            StoreError::Encode {
                column: "stories.acceptance_criteria".to_string(),
                source,
            }
        })?;
        self.conn().execute(
            &format!(
                "INSERT INTO stories ({STORY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                story.id,
                story.run_id,
                story.story_index,
                story.story_id,
                story.title,
                story.description,
                criteria,
                story.status.as_str(),
                story.output,
                story.retry_count,
                story.max_retries,
                story.created_at,
                story.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn story(&self, id: &str) -> Result<Option<StoryRecord>, StoreError> {
        story_by_id(self.conn(), id)
    }

    pub fn stories_for_run(&self, run_id: &str) -> Result<Vec<StoryRecord>, StoreError> {
        let mut statement = self.conn().prepare(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE run_id = ?1 ORDER BY story_index"
        ))?;
        let rows = statement.query_map(params![run_id], map_story)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_story(row?)?);
        }
        Ok(out)
    }

    pub fn run_has_stories(&self, run_id: &str) -> Result<bool, StoreError> {
        let exists = self
            .conn()
            .query_row(
                "SELECT 1 FROM stories WHERE run_id = ?1 LIMIT 1",
                params![run_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    pub fn next_pending_story(&self, run_id: &str) -> Result<Option<StoryRecord>, StoreError> {
        let parts = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {STORY_COLUMNS} FROM stories
                     WHERE run_id = ?1 AND status = 'pending'
                     ORDER BY story_index LIMIT 1"
                ),
                params![run_id],
                map_story,
            )
            .optional()?;
        parts.map(finish_story).transpose()
    }

    /// Target of the verify-each retry branch.
    pub fn most_recent_done_story(&self, run_id: &str) -> Result<Option<StoryRecord>, StoreError> {
        let parts = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {STORY_COLUMNS} FROM stories
                     WHERE run_id = ?1 AND status = 'done'
                     ORDER BY updated_at DESC, story_index DESC LIMIT 1"
                ),
                params![run_id],
                map_story,
            )
            .optional()?;
        parts.map(finish_story).transpose()
    }

    pub fn stories_in_status(&self, status: StoryStatus) -> Result<Vec<StoryRecord>, StoreError> {
        let mut statement = self.conn().prepare(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE status = ?1 ORDER BY run_id, story_index"
        ))?;
        let rows = statement.query_map(params![status.as_str()], map_story)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_story(row?)?);
        }
        Ok(out)
    }

    pub fn update_story_status(&self, id: &str, status: StoryStatus) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE stories SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_iso()],
        )?;
        Ok(())
    }

    pub fn set_story_output(&self, id: &str, output: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE stories SET output = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, output, now_iso()],
        )?;
        Ok(())
    }

    pub fn bump_story_retry(&self, id: &str) -> Result<i64, StoreError> {
        self.conn().execute(
            "UPDATE stories SET retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_iso()],
        )?;
        let count: i64 = self.conn().query_row(
            "SELECT retry_count FROM stories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
