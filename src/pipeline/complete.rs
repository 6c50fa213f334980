use super::advance::advance_in_tx;
use super::context::merge_output_into_context;
use super::stories::{extract_stories_json, ingest_stories, parse_stories_payload};
use super::{AdvanceOutcome, PipelineEngine, PipelineError};
use crate::events::{EventKind, EventRecord};
use crate::store::{RunRecord, RunStatus, StepRecord, StepStatus, StoryStatus, StoreTx};
use crate::workflow::StepType;

pub type CompleteOutcome = AdvanceOutcome;

impl PipelineEngine {
    /// Routes a worker's completion report: context merge, story ingestion,
    /// loop-story completion with the verify-each hand-off, verify-step
    /// completion, or plain step completion plus advancement.
    ///
    /// A terminal run absorbs the report as a no-op; an invalid
    /// `STORIES_JSON` payload raises and rolls the whole transaction back,
    /// leaving the step `running`.
    pub fn complete_step(
        &self,
        step_row_id: &str,
        output: &str,
    ) -> Result<CompleteOutcome, PipelineError> {
        let mut events = Vec::new();
        let mut notify_url = None;
        let mut archive = None;

        let outcome = self.in_tx(|tx| {
            let Some(step) = tx.step(step_row_id)? else {
                return Err(PipelineError::UnknownStep {
                    step_db_id: step_row_id.to_string(),
                });
            };
            let Some(run) = tx.run(&step.run_id)? else {
                return Err(PipelineError::UnknownRun {
                    run_id: step.run_id.clone(),
                });
            };
            if run.status.is_terminal() {
                return Ok(AdvanceOutcome::default());
            }
            notify_url = run.notify_url.clone();

            let mut context = run.context.clone();
            merge_output_into_context(&mut context, output);

            if let Some(block) = extract_stories_json(output) {
                let payloads = parse_stories_payload(&block)?;
                ingest_stories(tx, &run.id, &payloads)?;
            }
            tx.update_run_context(&run.id, &context)?;
            let mut run = run;
            run.context = context;

            if step.step_type == StepType::Loop {
                if let Some(story_row_id) = step.current_story_id.clone() {
                    return complete_story(
                        tx,
                        &run,
                        &step,
                        &story_row_id,
                        output,
                        &mut events,
                        &mut archive,
                    );
                }
            }

            if let Some(loop_step) = verify_parent(tx, &run, &step)? {
                return complete_verify(
                    tx,
                    &run,
                    &step,
                    &loop_step,
                    output,
                    &mut events,
                    &mut archive,
                );
            }

            tx.update_step_status(&step.id, StepStatus::Done)?;
            tx.set_step_output(&step.id, output)?;
            events.push(
                EventRecord::new(EventKind::StepDone, &run.id)
                    .with_workflow(&run.workflow_id)
                    .with_step(&step.step_id)
                    .with_agent(&step.agent_id),
            );
            let outcome = advance_in_tx(tx, &run, &mut events)?;
            if outcome.run_completed {
                archive = Some((run.workflow_id.clone(), run.run_number));
            }
            Ok(outcome)
        })?;

        self.emit_all(events, notify_url.as_deref());
        if let Some((workflow_id, run_number)) = archive {
            self.archive_progress(&workflow_id, run_number);
        }
        Ok(outcome)
    }
}

/// The loop step whose `verify_step` names this step, if verify-each is on.
fn verify_parent(
    tx: &StoreTx<'_>,
    run: &RunRecord,
    step: &StepRecord,
) -> Result<Option<StepRecord>, PipelineError> {
    for candidate in tx.steps_for_run(&run.id)? {
        if candidate.step_type != StepType::Loop {
            continue;
        }
        let Some(config) = &candidate.loop_config else {
            continue;
        };
        if config.verify_each && config.verify_step.as_deref() == Some(step.step_id.as_str()) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn complete_story(
    tx: &StoreTx<'_>,
    run: &RunRecord,
    step: &StepRecord,
    story_row_id: &str,
    output: &str,
    events: &mut Vec<EventRecord>,
    archive: &mut Option<(String, i64)>,
) -> Result<AdvanceOutcome, PipelineError> {
    tx.update_story_status(story_row_id, StoryStatus::Done)?;
    tx.set_story_output(story_row_id, output)?;
    tx.set_current_story(&step.id, None)?;
    tx.set_step_output(&step.id, output)?;

    if let Some(story) = tx.story(story_row_id)? {
        events.push(
            EventRecord::new(EventKind::StoryDone, &run.id)
                .with_workflow(&run.workflow_id)
                .with_step(&step.step_id)
                .with_story(&story.story_id, &story.title),
        );
    }

    let verify_name = step.loop_config.as_ref().and_then(|config| {
        if config.verify_each {
            config.verify_step.as_deref()
        } else {
            None
        }
    });
    if let Some(verify_name) = verify_name {
        if let Some(verify) = tx.step_by_name(&run.id, verify_name)? {
            tx.update_step_status(&verify.id, StepStatus::Pending)?;
            events.push(
                EventRecord::new(EventKind::StepPending, &run.id)
                    .with_workflow(&run.workflow_id)
                    .with_step(&verify.step_id)
                    .with_agent(&verify.agent_id),
            );
            return Ok(AdvanceOutcome::default());
        }
    }

    loop_continuation(tx, run, step, events, archive)
}

fn complete_verify(
    tx: &StoreTx<'_>,
    run: &RunRecord,
    verify_step: &StepRecord,
    loop_step: &StepRecord,
    output: &str,
    events: &mut Vec<EventRecord>,
    archive: &mut Option<(String, i64)>,
) -> Result<AdvanceOutcome, PipelineError> {
    // The verify step is reused every iteration.
    tx.update_step_status(&verify_step.id, StepStatus::Waiting)?;

    let wants_retry = run
        .context
        .get("status")
        .map(|value| value.trim().eq_ignore_ascii_case("retry"))
        .unwrap_or(false);
    let last_done = tx.most_recent_done_story(&run.id)?;

    if wants_retry {
        if let Some(story) = last_done {
            let retry_count = tx.bump_story_retry(&story.id)?;
            if retry_count > story.max_retries {
                tx.update_story_status(&story.id, StoryStatus::Failed)?;
                tx.update_step_status(&loop_step.id, StepStatus::Failed)?;
                tx.update_run_status(&run.id, RunStatus::Failed)?;
                events.push(
                    EventRecord::new(EventKind::StoryFailed, &run.id)
                        .with_workflow(&run.workflow_id)
                        .with_step(&loop_step.step_id)
                        .with_story(&story.story_id, &story.title)
                        .with_detail("verification retries exhausted"),
                );
                events.push(
                    EventRecord::new(EventKind::RunFailed, &run.id)
                        .with_workflow(&run.workflow_id),
                );
                return Ok(AdvanceOutcome::default());
            }

            tx.update_story_status(&story.id, StoryStatus::Pending)?;
            let feedback = run
                .context
                .get("issues")
                .cloned()
                .unwrap_or_else(|| output.trim().to_string());
            let mut context = run.context.clone();
            context.insert("verify_feedback".to_string(), feedback.clone());
            tx.update_run_context(&run.id, &context)?;
            tx.update_step_status(&loop_step.id, StepStatus::Pending)?;
            events.push(
                EventRecord::new(EventKind::StoryRetry, &run.id)
                    .with_workflow(&run.workflow_id)
                    .with_step(&loop_step.step_id)
                    .with_story(&story.story_id, &story.title)
                    .with_detail(feedback),
            );
            return Ok(AdvanceOutcome::default());
        }
    }

    if let Some(story) = &last_done {
        events.push(
            EventRecord::new(EventKind::StoryVerified, &run.id)
                .with_workflow(&run.workflow_id)
                .with_step(&loop_step.step_id)
                .with_story(&story.story_id, &story.title),
        );
    }
    if run.context.contains_key("verify_feedback") {
        let mut context = run.context.clone();
        context.remove("verify_feedback");
        tx.update_run_context(&run.id, &context)?;
    }
    loop_continuation(tx, run, loop_step, events, archive)
}

/// After a story settles: hand the loop step back to the daemon while
/// stories remain, fail it when one failed, finish it when all are done.
pub(crate) fn loop_continuation(
    tx: &StoreTx<'_>,
    run: &RunRecord,
    loop_step: &StepRecord,
    events: &mut Vec<EventRecord>,
    archive: &mut Option<(String, i64)>,
) -> Result<AdvanceOutcome, PipelineError> {
    let stories = tx.stories_for_run(&run.id)?;

    if stories
        .iter()
        .any(|story| story.status == StoryStatus::Pending)
    {
        tx.update_step_status(&loop_step.id, StepStatus::Pending)?;
        events.push(
            EventRecord::new(EventKind::StepPending, &run.id)
                .with_workflow(&run.workflow_id)
                .with_step(&loop_step.step_id)
                .with_agent(&loop_step.agent_id)
                .with_detail("next story"),
        );
        return Ok(AdvanceOutcome::default());
    }

    if stories
        .iter()
        .any(|story| story.status == StoryStatus::Failed)
    {
        tx.update_step_status(&loop_step.id, StepStatus::Failed)?;
        tx.update_run_status(&run.id, RunStatus::Failed)?;
        events.push(
            EventRecord::new(EventKind::StepFailed, &run.id)
                .with_workflow(&run.workflow_id)
                .with_step(&loop_step.step_id)
                .with_detail("a story failed"),
        );
        events.push(
            EventRecord::new(EventKind::RunFailed, &run.id).with_workflow(&run.workflow_id),
        );
        return Ok(AdvanceOutcome::default());
    }

    tx.update_step_status(&loop_step.id, StepStatus::Done)?;
    if let Some(verify_name) = loop_step
        .loop_config
        .as_ref()
        .and_then(|config| config.verify_step.as_deref())
    {
        if let Some(verify) = tx.step_by_name(&run.id, verify_name)? {
            tx.update_step_status(&verify.id, StepStatus::Done)?;
        }
    }
    events.push(
        EventRecord::new(EventKind::StepDone, &run.id)
            .with_workflow(&run.workflow_id)
            .with_step(&loop_step.step_id),
    );
    let outcome = advance_in_tx(tx, run, events)?;
    if outcome.run_completed {
        *archive = Some((run.workflow_id.clone(), run.run_number));
    }
    Ok(outcome)
}
