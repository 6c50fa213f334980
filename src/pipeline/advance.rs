use super::{AdvanceOutcome, PipelineEngine, PipelineError};
use crate::events::{EventKind, EventRecord};
use crate::store::{RunRecord, RunStatus, StepStatus, StoreTx};

impl PipelineEngine {
    /// Re-entrant pipeline advancement: promotes the lowest waiting step to
    /// `pending` once nothing before it is still in flight, or completes
    /// the run when every step is done. Safe to call twice; the second call
    /// observes the already-advanced state and does nothing.
    pub fn advance_pipeline(&self, run_id: &str) -> Result<AdvanceOutcome, PipelineError> {
        let mut events = Vec::new();
        let mut notify_url = None;
        let mut archive = None;

        let outcome = self.in_tx(|tx| {
            let Some(run) = tx.run(run_id)? else {
                return Err(PipelineError::UnknownRun {
                    run_id: run_id.to_string(),
                });
            };
            notify_url = run.notify_url.clone();
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

/// The in-transaction advancement shared with completion paths.
pub(crate) fn advance_in_tx(
    tx: &StoreTx<'_>,
    run: &RunRecord,
    events: &mut Vec<EventRecord>,
) -> Result<AdvanceOutcome, PipelineError> {
    if run.status.is_terminal() {
        return Ok(AdvanceOutcome::default());
    }

    let steps = tx.steps_for_run(&run.id)?;
    let next_waiting = steps
        .iter()
        .filter(|step| step.status == StepStatus::Waiting)
        .min_by_key(|step| step.step_index);

    if let Some(waiting) = next_waiting {
        let blocked = steps
            .iter()
            .any(|step| step.step_index < waiting.step_index && step.status.is_incomplete());
        if blocked {
            return Ok(AdvanceOutcome::default());
        }
        tx.update_step_status(&waiting.id, StepStatus::Pending)?;
        events.push(
            EventRecord::new(EventKind::PipelineAdvanced, &run.id)
                .with_workflow(&run.workflow_id)
                .with_step(&waiting.step_id),
        );
        events.push(
            EventRecord::new(EventKind::StepPending, &run.id)
                .with_workflow(&run.workflow_id)
                .with_step(&waiting.step_id)
                .with_agent(&waiting.agent_id),
        );
        return Ok(AdvanceOutcome {
            advanced: true,
            run_completed: false,
        });
    }

    if steps.iter().any(|step| step.status.is_incomplete()) {
        return Ok(AdvanceOutcome::default());
    }

    tx.update_run_status(&run.id, RunStatus::Completed)?;
    events.push(
        EventRecord::new(EventKind::RunCompleted, &run.id).with_workflow(&run.workflow_id),
    );
    Ok(AdvanceOutcome {
        advanced: false,
        run_completed: true,
    })
}
