use super::{PipelineEngine, PipelineError};
use crate::events::{EventKind, EventRecord};
use crate::store::{RunStatus, StepStatus, StoryStatus};
use crate::workflow::StepType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailOutcome {
    pub retrying: bool,
    pub run_failed: bool,
}

impl PipelineEngine {
    /// Explicit worker failure. A loop step with a story in flight charges
    /// the story's retry budget; a single step charges its own. Exhausted
    /// budgets fail the run.
    pub fn fail_step(&self, step_row_id: &str, error: &str) -> Result<FailOutcome, PipelineError> {
        let mut events = Vec::new();
        let mut notify_url = None;

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
                return Ok(FailOutcome::default());
            }
            notify_url = run.notify_url.clone();

            if step.step_type == StepType::Loop {
                if let Some(story_row_id) = step.current_story_id.clone() {
                    if let Some(story) = tx.story(&story_row_id)? {
                        let retry_count = tx.bump_story_retry(&story.id)?;
                        if retry_count > story.max_retries {
                            tx.update_story_status(&story.id, StoryStatus::Failed)?;
                            tx.set_story_output(&story.id, error)?;
                            tx.update_step_status(&step.id, StepStatus::Failed)?;
                            tx.update_run_status(&run.id, RunStatus::Failed)?;
                            events.push(
                                EventRecord::new(EventKind::StoryFailed, &run.id)
                                    .with_workflow(&run.workflow_id)
                                    .with_step(&step.step_id)
                                    .with_story(&story.story_id, &story.title)
                                    .with_detail(error),
                            );
                            events.push(
                                EventRecord::new(EventKind::StepFailed, &run.id)
                                    .with_workflow(&run.workflow_id)
                                    .with_step(&step.step_id)
                                    .with_detail(error),
                            );
                            events.push(
                                EventRecord::new(EventKind::RunFailed, &run.id)
                                    .with_workflow(&run.workflow_id),
                            );
                            return Ok(FailOutcome {
                                retrying: false,
                                run_failed: true,
                            });
                        }

                        tx.update_story_status(&story.id, StoryStatus::Pending)?;
                        tx.set_current_story(&step.id, None)?;
                        tx.update_step_status(&step.id, StepStatus::Pending)?;
                        events.push(
                            EventRecord::new(EventKind::StoryRetry, &run.id)
                                .with_workflow(&run.workflow_id)
                                .with_step(&step.step_id)
                                .with_story(&story.story_id, &story.title)
                                .with_detail(error),
                        );
                        return Ok(FailOutcome {
                            retrying: true,
                            run_failed: false,
                        });
                    }
                }
            }

            let retry_count = tx.bump_step_retry(&step.id)?;
            if retry_count > step.max_retries {
                tx.update_step_status(&step.id, StepStatus::Failed)?;
                tx.set_step_output(&step.id, error)?;
                tx.update_run_status(&run.id, RunStatus::Failed)?;
                events.push(
                    EventRecord::new(EventKind::StepFailed, &run.id)
                        .with_workflow(&run.workflow_id)
                        .with_step(&step.step_id)
                        .with_agent(&step.agent_id)
                        .with_detail(error),
                );
                events.push(
                    EventRecord::new(EventKind::RunFailed, &run.id)
                        .with_workflow(&run.workflow_id),
                );
                return Ok(FailOutcome {
                    retrying: false,
                    run_failed: true,
                });
            }

            tx.update_step_status(&step.id, StepStatus::Pending)?;
            events.push(
                EventRecord::new(EventKind::StepFailed, &run.id)
                    .with_workflow(&run.workflow_id)
                    .with_step(&step.step_id)
                    .with_agent(&step.agent_id)
                    .with_detail(format!("{error} (retry {retry_count}/{})", step.max_retries)),
            );
            Ok(FailOutcome {
                retrying: true,
                run_failed: false,
            })
        })?;

        self.emit_all(events, notify_url.as_deref());
        Ok(outcome)
    }
}
