use super::context::resolve_input;
use super::stories::render_story_block;
use super::{PipelineEngine, PipelineError};
use crate::events::{EventKind, EventRecord};
use crate::store::{
    RunRecord, RunStatus, Scheduler, StepRecord, StepStatus, StoryStatus, StoreTx,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Step,
    Story,
}

/// A successful claim: the step (or story) is now `claiming` and the
/// resolved input is ready for the worker prompt.
#[derive(Debug, Clone)]
pub struct ClaimResult {
    pub kind: ClaimKind,
    pub run_id: String,
    pub run_number: i64,
    pub workflow_id: String,
    pub step_row_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub story_row_id: Option<String>,
    pub story_id: Option<String>,
    pub story_title: Option<String>,
    pub input: String,
}

impl PipelineEngine {
    /// Atomically reserves the agent's next pending single step
    /// (`pending → claiming`) and resolves its input template. The
    /// scheduler keeps daemon claims off cron-scheduled runs.
    pub fn claim_step(
        &self,
        agent_id: &str,
        scheduler: Scheduler,
    ) -> Result<Option<ClaimResult>, PipelineError> {
        let mut events = Vec::new();
        let mut notify_url = None;

        let claim = self.in_tx(|tx| {
            let Some(step) = tx.claimable_step(agent_id, scheduler)? else {
                return Ok(None);
            };
            let Some(run) = tx.run(&step.run_id)? else {
                return Ok(None);
            };
            if run.status != RunStatus::Running {
                return Ok(None);
            }
            notify_url = run.notify_url.clone();

            tx.update_step_status(&step.id, StepStatus::Claiming)?;
            let has_stories = tx.run_has_stories(&run.id)?;
            let input = resolve_input(&step.input_template, &run, self.paths(), has_stories);

            events.push(
                EventRecord::new(EventKind::StepClaimed, &run.id)
                    .with_workflow(&run.workflow_id)
                    .with_step(&step.step_id)
                    .with_agent(&step.agent_id),
            );
            Ok(Some(ClaimResult {
                kind: ClaimKind::Step,
                run_id: run.id.clone(),
                run_number: run.run_number,
                workflow_id: run.workflow_id.clone(),
                step_row_id: step.id.clone(),
                step_id: step.step_id.clone(),
                agent_id: step.agent_id.clone(),
                story_row_id: None,
                story_id: None,
                story_title: None,
                input,
            }))
        })?;

        self.emit_all(events, notify_url.as_deref());
        Ok(claim)
    }

    /// Reserves the loop step's next pending story, materialises the
    /// story-scoped context onto the run, and resolves the loop step's
    /// input. A `pending` loop step is promoted to `running` here — the
    /// loop step itself never runs a worker, its stories do.
    pub fn claim_story(
        &self,
        agent_id: &str,
        loop_step_row_id: &str,
    ) -> Result<Option<ClaimResult>, PipelineError> {
        let mut events = Vec::new();
        let mut notify_url = None;
        let mut archive = None;

        let claim = self.in_tx(|tx| {
            let Some(step) = tx.step(loop_step_row_id)? else {
                return Err(PipelineError::UnknownStep {
                    step_db_id: loop_step_row_id.to_string(),
                });
            };
            if step.agent_id != agent_id
                || step.step_type != crate::workflow::StepType::Loop
                || !matches!(step.status, StepStatus::Pending | StepStatus::Running)
            {
                return Ok(None);
            }
            let Some(run) = tx.run(&step.run_id)? else {
                return Ok(None);
            };
            if run.status != RunStatus::Running {
                return Ok(None);
            }
            notify_url = run.notify_url.clone();

            if let Some(current) = &step.current_story_id {
                if let Some(story) = tx.story(current)? {
                    if matches!(story.status, StoryStatus::Claiming | StoryStatus::Running) {
                        return Ok(None);
                    }
                }
            }

            let Some(story) = tx.next_pending_story(&run.id)? else {
                finish_exhausted_loop(tx, &run, &step, &mut events, &mut archive)?;
                return Ok(None);
            };

            tx.update_story_status(&story.id, StoryStatus::Claiming)?;
            tx.set_current_story(&step.id, Some(&story.id))?;
            if step.status == StepStatus::Pending {
                tx.update_step_status(&step.id, StepStatus::Running)?;
            }

            let stories = tx.stories_for_run(&run.id)?;
            let completed = stories
                .iter()
                .filter(|candidate| candidate.status == StoryStatus::Done)
                .count();
            let remaining = stories
                .iter()
                .filter(|candidate| candidate.status == StoryStatus::Pending)
                .count();

            let mut context = run.context.clone();
            context.insert("current_story".to_string(), render_story_block(&story));
            context.insert("current_story_id".to_string(), story.story_id.clone());
            context.insert("current_story_title".to_string(), story.title.clone());
            context.insert("completed_stories".to_string(), completed.to_string());
            context.insert("stories_remaining".to_string(), remaining.to_string());
            if let Some(progress) = super::context::read_progress(self.paths(), &run.workflow_id)
            {
                context.insert("progress".to_string(), progress);
            }
            tx.update_run_context(&run.id, &context)?;

            let mut updated_run = run.clone();
            updated_run.context = context;
            let input = resolve_input(&step.input_template, &updated_run, self.paths(), true);

            events.push(
                EventRecord::new(EventKind::StoryClaimed, &run.id)
                    .with_workflow(&run.workflow_id)
                    .with_step(&step.step_id)
                    .with_agent(&step.agent_id)
                    .with_story(&story.story_id, &story.title),
            );
            Ok(Some(ClaimResult {
                kind: ClaimKind::Story,
                run_id: run.id.clone(),
                run_number: run.run_number,
                workflow_id: run.workflow_id.clone(),
                step_row_id: step.id.clone(),
                step_id: step.step_id.clone(),
                agent_id: step.agent_id.clone(),
                story_row_id: Some(story.id.clone()),
                story_id: Some(story.story_id.clone()),
                story_title: Some(story.title.clone()),
                input,
            }))
        })?;

        self.emit_all(events, notify_url.as_deref());
        if let Some((workflow_id, run_number)) = archive {
            self.archive_progress(&workflow_id, run_number);
        }
        Ok(claim)
    }
}

/// No pending story remained: hand off to the shared loop continuation
/// unless the run has no stories yet (the loop is still waiting for the
/// planner's ingestion).
fn finish_exhausted_loop(
    tx: &StoreTx<'_>,
    run: &RunRecord,
    step: &StepRecord,
    events: &mut Vec<EventRecord>,
    archive: &mut Option<(String, i64)>,
) -> Result<(), PipelineError> {
    if !tx.run_has_stories(&run.id)? {
        return Ok(());
    }
    super::complete::loop_continuation(tx, run, step, events, archive)?;
    Ok(())
}
