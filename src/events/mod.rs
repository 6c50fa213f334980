use crate::config::StatePaths;
use crate::shared::fs_atomic::append_line;
use crate::shared::logging::append_runtime_log;
use crate::shared::time::now_iso;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub mod webhook;

pub const JOURNAL_MAX_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "step.pending")]
    StepPending,
    #[serde(rename = "step.claimed")]
    StepClaimed,
    #[serde(rename = "step.running")]
    StepRunning,
    #[serde(rename = "step.done")]
    StepDone,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.timeout")]
    StepTimeout,
    #[serde(rename = "step.rollback")]
    StepRollback,
    #[serde(rename = "story.claimed")]
    StoryClaimed,
    #[serde(rename = "story.started")]
    StoryStarted,
    #[serde(rename = "story.done")]
    StoryDone,
    #[serde(rename = "story.verified")]
    StoryVerified,
    #[serde(rename = "story.retry")]
    StoryRetry,
    #[serde(rename = "story.failed")]
    StoryFailed,
    #[serde(rename = "story.rollback")]
    StoryRollback,
    #[serde(rename = "pipeline.advanced")]
    PipelineAdvanced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: String,
    pub event: EventKind,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EventRecord {
    pub fn new(event: EventKind, run_id: impl Into<String>) -> Self {
        Self {
            ts: now_iso(),
            event,
            run_id: run_id.into(),
            workflow_id: None,
            step_id: None,
            agent_id: None,
            story_id: None,
            story_title: None,
            session_id: None,
            detail: None,
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_story(mut self, story_id: impl Into<String>, title: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self.story_title = Some(title.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only structured event journal with webhook fan-out. `emit` is
/// best-effort by contract: it never returns an error to callers.
pub struct EventJournal {
    paths: StatePaths,
    journal_path: PathBuf,
}

impl EventJournal {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            paths: paths.clone(),
            journal_path: paths.journal_path(),
        }
    }

    pub fn emit(&self, record: &EventRecord, notify_url: Option<&str>) {
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };

        self.rotate_if_needed();
        if let Err(err) = append_line(&self.journal_path, &line) {
            append_runtime_log(
                &self.paths,
                "warn",
                "events.append_failed",
                &format!("{}: {err}", self.journal_path.display()),
            );
        }

        if let Some(url) = notify_url {
            if let Err(err) = webhook::post_event(url, record) {
                append_runtime_log(
                    &self.paths,
                    "warn",
                    "events.webhook_failed",
                    &err.to_string(),
                );
            }
        }
    }

    fn rotate_if_needed(&self) {
        let Ok(metadata) = fs::metadata(&self.journal_path) else {
            return;
        };
        if metadata.len() <= JOURNAL_MAX_BYTES {
            return;
        }
        let backup = self.journal_path.with_extension("jsonl.1");
        let _ = fs::rename(&self.journal_path, backup);
    }

    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let mut records = self.read_all();
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        records
    }

    /// Events for a run; `run_id` may be a prefix.
    pub fn by_run(&self, run_id: &str, limit: usize) -> Vec<EventRecord> {
        let mut records: Vec<EventRecord> = self
            .read_all()
            .into_iter()
            .filter(|record| record.run_id.starts_with(run_id))
            .collect();
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        records
    }

    fn read_all(&self) -> Vec<EventRecord> {
        let mut records = Vec::new();
        let backup = self.journal_path.with_extension("jsonl.1");
        for path in [&backup, &self.journal_path] {
            let Ok(raw) = fs::read_to_string(path) else {
                continue;
            };
            for line in raw.lines() {
                if let Ok(record) = serde_json::from_str::<EventRecord>(line) {
                    records.push(record);
                }
            }
        }
        records
    }
}
