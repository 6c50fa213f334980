use crate::config::StatePaths;
use crate::events::{EventJournal, EventKind, EventRecord};
use crate::pipeline::{PipelineEngine, PipelineError};
use crate::shared::logging::append_runtime_log;
use crate::shared::time::age_secs;
use crate::store::{
    RunRecord, RunStatus, StepRecord, StepStatus, Store, StoryStatus,
};
use crate::workflow::{SpecCache, StepType, DEFAULT_AGENT_TIMEOUT_SECS};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const SWEEP_THROTTLE: Duration = Duration::from_secs(300);
pub const ABANDON_GRACE_SECS: i64 = 300;
pub const CLAIM_STALE_SECS: i64 = 300;
pub const MAX_ABANDONMENTS: i64 = 5;
pub const SESSION_STALE_SECS: i64 = 900;
pub const SESSION_MAX_AGE_SECS: i64 = 3600;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub abandoned_steps: usize,
    pub reset_stories: usize,
    pub advanced_runs: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClaimSweepReport {
    pub steps_reverted: usize,
    pub stories_reverted: usize,
}

/// Periodic repair of work the pipeline lost track of: abandoned running
/// rows, stale claims, stuck pipelines, and dead session records.
pub struct Sweeper {
    journal: Arc<EventJournal>,
    cache: Arc<SpecCache>,
    paths: StatePaths,
    engine: PipelineEngine,
    last_sweep: Mutex<Option<Instant>>,
}

impl Sweeper {
    pub fn new(
        store: Arc<Store>,
        journal: Arc<EventJournal>,
        cache: Arc<SpecCache>,
        paths: StatePaths,
    ) -> Self {
        let engine = PipelineEngine::new(store, journal.clone(), paths.clone());
        Self {
            journal,
            cache,
            paths,
            engine,
            last_sweep: Mutex::new(None),
        }
    }

    /// Throttled entry point: at most one full sweep per five minutes
    /// across all callers sharing this sweeper.
    pub fn sweep(&self) -> Result<Option<SweepReport>, PipelineError> {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|err| err.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < SWEEP_THROTTLE {
                    return Ok(None);
                }
            }
            *last = Some(Instant::now());
        }
        self.sweep_forced().map(Some)
    }

    pub fn sweep_forced(&self) -> Result<SweepReport, PipelineError> {
        let report = SweepReport {
            abandoned_steps: self.reap_abandoned_steps()?,
            reset_stories: self.reset_orphaned_stories()?,
            advanced_runs: self.recover_stuck_pipelines()?,
        };
        append_runtime_log(
            &self.paths,
            "info",
            "sweeper.sweep",
            &format!(
                "abandoned_steps={} reset_stories={} advanced_runs={}",
                report.abandoned_steps, report.reset_stories, report.advanced_runs
            ),
        );
        Ok(report)
    }

    /// Pass 1: `running` steps whose agent never reported back within its
    /// timeout plus grace.
    fn reap_abandoned_steps(&self) -> Result<usize, PipelineError> {
        let candidates: Vec<(StepRecord, RunRecord)> = self.engine.in_tx(|tx| {
            let mut out = Vec::new();
            for step in tx.steps_in_status(StepStatus::Running)? {
                let Some(run) = tx.run(&step.run_id)? else {
                    continue;
                };
                if run.status == RunStatus::Running {
                    out.push((step, run));
                }
            }
            Ok(out)
        })?;

        let mut reaped = 0;
        for (step, run) in candidates {
            let timeout = self.agent_timeout(&run.workflow_id, &step.agent_id);
            let expired = age_secs(&step.updated_at)
                .map(|age| age > timeout + ABANDON_GRACE_SECS)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            if self.reap_one_step(&step.id)? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    fn reap_one_step(&self, step_row_id: &str) -> Result<bool, PipelineError> {
        let mut events = Vec::new();
        let mut notify_url = None;

        let reaped = self.engine.in_tx(|tx| {
            let Some(step) = tx.step(step_row_id)? else {
                return Ok(false);
            };
            if step.status != StepStatus::Running {
                return Ok(false);
            }
            let Some(run) = tx.run(&step.run_id)? else {
                return Ok(false);
            };
            if run.status != RunStatus::Running {
                return Ok(false);
            }
            notify_url = run.notify_url.clone();

            if step.step_type == StepType::Loop && step.current_story_id.is_none() {
                // A loop between stories with a live verify window is not
                // abandoned; the verify step owns the run right now.
                if let Some(verify_name) = step
                    .loop_config
                    .as_ref()
                    .filter(|config| config.verify_each)
                    .and_then(|config| config.verify_step.as_deref())
                {
                    if let Some(verify) = tx.step_by_name(&run.id, verify_name)? {
                        if matches!(
                            verify.status,
                            StepStatus::Pending | StepStatus::Claiming | StepStatus::Running
                        ) {
                            return Ok(false);
                        }
                    }
                }
            }

            events.push(
                EventRecord::new(EventKind::StepTimeout, &run.id)
                    .with_workflow(&run.workflow_id)
                    .with_step(&step.step_id)
                    .with_agent(&step.agent_id),
            );

            if step.step_type == StepType::Loop {
                if let Some(story_row_id) = step.current_story_id.clone() {
                    if let Some(story) = tx.story(&story_row_id)? {
                        let retry_count = tx.bump_story_retry(&story.id)?;
                        if retry_count > story.max_retries {
                            tx.update_story_status(&story.id, StoryStatus::Failed)?;
                            tx.update_step_status(&step.id, StepStatus::Failed)?;
                            tx.update_run_status(&run.id, RunStatus::Failed)?;
                            events.push(
                                EventRecord::new(EventKind::StoryFailed, &run.id)
                                    .with_workflow(&run.workflow_id)
                                    .with_step(&step.step_id)
                                    .with_story(&story.story_id, &story.title)
                                    .with_detail("abandoned and out of retries"),
                            );
                            events.push(
                                EventRecord::new(EventKind::RunFailed, &run.id)
                                    .with_workflow(&run.workflow_id),
                            );
                        } else {
                            tx.update_story_status(&story.id, StoryStatus::Pending)?;
                            tx.set_current_story(&step.id, None)?;
                            tx.update_step_status(&step.id, StepStatus::Pending)?;
                            events.push(
                                EventRecord::new(EventKind::StoryRetry, &run.id)
                                    .with_workflow(&run.workflow_id)
                                    .with_step(&step.step_id)
                                    .with_story(&story.story_id, &story.title)
                                    .with_detail("worker abandoned"),
                            );
                        }
                        return Ok(true);
                    }
                }
                // Loop with no story in flight: just hand it back.
                tx.update_step_status(&step.id, StepStatus::Pending)?;
                return Ok(true);
            }

            // Abandonments are counted separately from explicit failures and
            // get a higher cap: process death is not the agent's fault.
            let abandoned = tx.bump_step_abandoned(&step.id)?;
            if abandoned >= MAX_ABANDONMENTS {
                tx.update_step_status(&step.id, StepStatus::Failed)?;
                tx.update_run_status(&run.id, RunStatus::Failed)?;
                events.push(
                    EventRecord::new(EventKind::StepFailed, &run.id)
                        .with_workflow(&run.workflow_id)
                        .with_step(&step.step_id)
                        .with_detail(format!("abandoned {abandoned} times")),
                );
                events.push(
                    EventRecord::new(EventKind::RunFailed, &run.id)
                        .with_workflow(&run.workflow_id),
                );
            } else {
                tx.update_step_status(&step.id, StepStatus::Pending)?;
            }
            Ok(true)
        })?;

        for event in events {
            self.journal.emit(&event, notify_url.as_deref());
        }
        Ok(reaped)
    }

    /// Pass 2: `running` stories no step claims to be working on.
    fn reset_orphaned_stories(&self) -> Result<usize, PipelineError> {
        let mut events = Vec::new();
        let reset = self.engine.in_tx(|tx| {
            let mut reset = 0;
            for story in tx.stories_in_status(StoryStatus::Running)? {
                let owned = tx
                    .steps_for_run(&story.run_id)?
                    .iter()
                    .any(|step| step.current_story_id.as_deref() == Some(story.id.as_str()));
                if owned {
                    continue;
                }
                tx.update_story_status(&story.id, StoryStatus::Pending)?;
                let notify_url = tx.run(&story.run_id)?.and_then(|run| run.notify_url);
                events.push((
                    EventRecord::new(EventKind::StoryRollback, &story.run_id)
                        .with_story(&story.story_id, &story.title)
                        .with_detail("no active step owner"),
                    notify_url,
                ));
                reset += 1;
            }
            Ok(reset)
        })?;

        for (event, notify_url) in events {
            self.journal.emit(&event, notify_url.as_deref());
        }
        Ok(reset)
    }

    /// Pass 3: runs whose loop step finished but whose successor was never
    /// promoted out of `waiting`.
    fn recover_stuck_pipelines(&self) -> Result<usize, PipelineError> {
        let stuck: Vec<String> = self.engine.in_tx(|tx| {
            let mut out = Vec::new();
            for run in tx.runs_with_status(RunStatus::Running)? {
                let steps = tx.steps_for_run(&run.id)?;
                let loop_done = steps
                    .iter()
                    .any(|s| s.step_type == StepType::Loop && s.status == StepStatus::Done);
                let any_active = steps.iter().any(|s| {
                    matches!(
                        s.status,
                        StepStatus::Pending | StepStatus::Claiming | StepStatus::Running
                    )
                });
                let any_waiting = steps.iter().any(|s| s.status == StepStatus::Waiting);
                if loop_done && !any_active && any_waiting {
                    out.push(run.id.clone());
                }
            }
            Ok(out)
        })?;

        let mut advanced = 0;
        for run_id in stuck {
            if self.engine.advance_pipeline(&run_id)?.advanced {
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    /// Separate cadence: claims that never resolved to a spawn within five
    /// minutes are reverted and charged a retry.
    pub fn sweep_claiming(&self) -> Result<ClaimSweepReport, PipelineError> {
        let mut events = Vec::new();
        let report = self.engine.in_tx(|tx| {
            let mut report = ClaimSweepReport::default();

            for step in tx.steps_in_status(StepStatus::Claiming)? {
                let stale = age_secs(&step.updated_at)
                    .map(|age| age > CLAIM_STALE_SECS)
                    .unwrap_or(false);
                if !stale {
                    continue;
                }
                tx.update_step_status(&step.id, StepStatus::Pending)?;
                tx.bump_step_retry(&step.id)?;
                let notify_url = tx.run(&step.run_id)?.and_then(|run| run.notify_url);
                events.push((
                    EventRecord::new(EventKind::StepRollback, &step.run_id)
                        .with_step(&step.step_id)
                        .with_agent(&step.agent_id)
                        .with_detail("claim expired"),
                    notify_url,
                ));
                report.steps_reverted += 1;
            }

            for story in tx.stories_in_status(StoryStatus::Claiming)? {
                let stale = age_secs(&story.updated_at)
                    .map(|age| age > CLAIM_STALE_SECS)
                    .unwrap_or(false);
                if !stale {
                    continue;
                }
                tx.update_story_status(&story.id, StoryStatus::Pending)?;
                tx.bump_story_retry(&story.id)?;
                for step in tx.steps_for_run(&story.run_id)? {
                    if step.current_story_id.as_deref() == Some(story.id.as_str()) {
                        tx.set_current_story(&step.id, None)?;
                    }
                }
                let notify_url = tx.run(&story.run_id)?.and_then(|run| run.notify_url);
                events.push((
                    EventRecord::new(EventKind::StoryRollback, &story.run_id)
                        .with_story(&story.story_id, &story.title)
                        .with_detail("claim expired"),
                    notify_url,
                ));
                report.stories_reverted += 1;
            }
            Ok(report)
        })?;

        for (event, notify_url) in events {
            self.journal.emit(&event, notify_url.as_deref());
        }
        Ok(report)
    }

    /// Session GC: a session row may outlive its worker, never the other
    /// way around.
    pub fn gc_sessions(&self) -> Result<usize, PipelineError> {
        let removed = self.engine.in_tx(|tx| {
            let mut removed = 0;
            for session in tx.sessions()? {
                let age = age_secs(&session.spawned_at).unwrap_or(i64::MAX);
                let step = tx.step(&session.step_id)?;

                let step_gone = match &step {
                    None => true,
                    Some(step) => !matches!(
                        step.status,
                        StepStatus::Pending | StepStatus::Running
                    ),
                };
                let referent_running = match (&step, session.story_id.as_str()) {
                    (Some(_), story_row_id) if !story_row_id.is_empty() => tx
                        .story(story_row_id)?
                        .map(|story| story.status == StoryStatus::Running)
                        .unwrap_or(false),
                    (Some(step), _) => step.status == StepStatus::Running,
                    (None, _) => false,
                };

                let expired = step_gone
                    || age > SESSION_MAX_AGE_SECS
                    || (age > SESSION_STALE_SECS && !referent_running);
                if expired {
                    tx.delete_session(&session.agent_id, &session.step_id, &session.story_id)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })?;
        Ok(removed)
    }

    fn agent_timeout(&self, workflow_id: &str, scoped_agent_id: &str) -> i64 {
        self.cache
            .get_spec(workflow_id)
            .ok()
            .and_then(|spec| {
                spec.agent_by_scoped_id(scoped_agent_id)
                    .map(|agent| spec.agent_timeout_secs(agent))
            })
            .unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS) as i64
    }
}
