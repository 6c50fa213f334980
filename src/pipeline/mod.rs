use crate::config::StatePaths;
use crate::events::{EventJournal, EventKind, EventRecord};
use crate::shared::ids::new_row_id;
use crate::shared::time::now_iso;
use crate::store::{RunRecord, RunStatus, Scheduler, StepRecord, StepStatus, Store, StoreError};
use crate::workflow::{WorkflowSpec, DEFAULT_STEP_MAX_RETRIES};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

pub mod advance;
pub mod claim;
pub mod complete;
pub mod context;
pub mod fail;
pub mod stories;

pub use claim::{ClaimKind, ClaimResult};
pub use complete::CompleteOutcome;
pub use fail::FailOutcome;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown step `{step_db_id}`")]
    UnknownStep { step_db_id: String },
    #[error("unknown run `{run_id}`")]
    UnknownRun { run_id: String },
    #[error("invalid stories payload: {reason}")]
    InvalidStories { reason: String },
    #[error("invalid scheduler `{value}`: must be `cron` or `daemon`")]
    InvalidScheduler { value: String },
}

/// Advancement outcome shared by `complete_step` and `advance_pipeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdvanceOutcome {
    pub advanced: bool,
    pub run_completed: bool,
}

/// The sole writer of run, step and story status. Every operation runs in a
/// single store transaction; events are journaled only after the
/// transaction commits.
pub struct PipelineEngine {
    store: Arc<Store>,
    journal: Arc<EventJournal>,
    paths: StatePaths,
}

impl PipelineEngine {
    pub fn new(store: Arc<Store>, journal: Arc<EventJournal>, paths: StatePaths) -> Self {
        Self {
            store,
            journal,
            paths,
        }
    }

    /// `Store::with_tx` pinned to the pipeline error type; every engine
    /// operation funnels through here.
    pub(crate) fn in_tx<T>(
        &self,
        f: impl FnOnce(&crate::store::StoreTx<'_>) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        self.store.with_tx(f)
    }

    pub(crate) fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub(crate) fn emit_all(&self, events: Vec<EventRecord>, notify_url: Option<&str>) {
        for event in events {
            self.journal.emit(&event, notify_url);
        }
    }

    /// Creates a run and its step rows from the workflow spec: step 0 starts
    /// `pending`, every other step `waiting`.
    pub fn start_run(
        &self,
        spec: &WorkflowSpec,
        task: &str,
        notify_url: Option<String>,
        scheduler: Scheduler,
    ) -> Result<RunRecord, PipelineError> {
        let now = now_iso();
        let mut context = BTreeMap::new();
        context.insert("task".to_string(), task.to_string());

        let run_template = RunRecord {
            id: new_row_id("run"),
            run_number: 0,
            workflow_id: spec.id.clone(),
            task: task.to_string(),
            status: RunStatus::Running,
            context,
            notify_url,
            scheduler,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        let mut events = Vec::new();
        let run = self.in_tx(|tx| {
            let mut run = run_template.clone();
            run.run_number = tx.next_run_number()?;
            tx.insert_run(&run)?;

            for (index, step_def) in spec.steps.iter().enumerate() {
                let status = if index == 0 {
                    StepStatus::Pending
                } else {
                    StepStatus::Waiting
                };
                tx.insert_step(&StepRecord {
                    id: new_row_id("step"),
                    run_id: run.id.clone(),
                    step_id: step_def.id.clone(),
                    agent_id: spec.scoped_agent_id(&step_def.agent),
                    step_index: index as i64,
                    input_template: step_def.input.clone(),
                    expects: step_def.expects.clone(),
                    step_type: step_def.step_type,
                    loop_config: step_def.loop_config.clone(),
                    max_retries: step_def.max_retries.unwrap_or(DEFAULT_STEP_MAX_RETRIES),
                    retry_count: 0,
                    abandoned_count: 0,
                    status,
                    current_story_id: None,
                    output: None,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                })?;
            }
            Ok(run)
        })?;

        events.push(
            EventRecord::new(EventKind::RunStarted, &run.id)
                .with_workflow(&run.workflow_id)
                .with_detail(&run.task),
        );
        if let Some(first) = spec.steps.first() {
            events.push(
                EventRecord::new(EventKind::StepPending, &run.id)
                    .with_workflow(&run.workflow_id)
                    .with_step(&first.id)
                    .with_agent(spec.scoped_agent_id(&first.agent)),
            );
        }
        self.emit_all(events, run.notify_url.as_deref());
        Ok(run)
    }

    /// External stop-run: the run becomes `cancelled` and every non-terminal
    /// step fails with "Cancelled by user". In-flight workers are not
    /// killed; their late reports die on the terminal-run guard.
    pub fn cancel_run(&self, run_id: &str) -> Result<bool, PipelineError> {
        self.in_tx(|tx| {
            let Some(run) = tx.run(run_id)? else {
                return Err(PipelineError::UnknownRun {
                    run_id: run_id.to_string(),
                });
            };
            if run.status.is_terminal() {
                return Ok(false);
            }
            tx.update_run_status(&run.id, RunStatus::Cancelled)?;
            for step in tx.steps_for_run(&run.id)? {
                if !matches!(step.status, StepStatus::Done | StepStatus::Failed) {
                    tx.update_step_status(&step.id, StepStatus::Failed)?;
                    tx.set_step_output(&step.id, "Cancelled by user")?;
                }
            }
            Ok(true)
        })
    }

    /// Moves the progress file aside when a run completes, so long-lived
    /// loop agents start the next run clean.
    pub(crate) fn archive_progress(&self, workflow_id: &str, run_number: i64) {
        let source = self.paths.progress_path(workflow_id);
        if !source.exists() {
            return;
        }
        let target = self.paths.progress_archive_path(workflow_id, run_number);
        if let Some(parent) = target.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::rename(&source, &target);
    }
}
