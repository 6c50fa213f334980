use crate::events::{EventJournal, EventKind, EventRecord};
use crate::pipeline::{ClaimKind, ClaimResult, PipelineEngine, PipelineError};
use crate::shared::ids::spawn_nonce;
use crate::shared::time::now_iso;
use crate::store::{
    ActiveSessionRecord, RunStatus, Scheduler, SpawnSource, StepStatus, StoryStatus,
};
use crate::workflow::{Thinking, WorkflowSpec};
use std::sync::Arc;

pub mod gateway;

pub use gateway::{Gateway, GatewayError, HttpGateway, SpawnRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned { session_id: String },
    NoWork,
    StoryAlreadyClaimed,
    RunTerminal,
    RolledBack { error: String },
}

enum LoopClaim {
    None,
    Busy,
    Claimed(ClaimResult),
}

impl SpawnOutcome {
    pub fn spawned(&self) -> bool {
        matches!(self, Self::Spawned { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Spawned { .. } => "spawned",
            Self::NoWork => "no_work",
            Self::StoryAlreadyClaimed => "story_already_claimed",
            Self::RunTerminal => "run_terminal",
            Self::RolledBack { .. } => "rollback",
        }
    }
}

/// Claims work for an agent and launches the worker through the Gateway.
/// The spawn call itself runs outside any store transaction; pure-DB
/// transactions bracket it on either side (claim, then confirm-or-rollback).
pub struct Spawner {
    journal: Arc<EventJournal>,
    engine: PipelineEngine,
    gateway: Arc<dyn Gateway>,
}

impl Spawner {
    pub fn new(
        journal: Arc<EventJournal>,
        engine: PipelineEngine,
        gateway: Arc<dyn Gateway>,
    ) -> Self {
        Self {
            journal,
            engine,
            gateway,
        }
    }

    pub fn peek_and_spawn(
        &self,
        agent_id: &str,
        spec: &WorkflowSpec,
        source: SpawnSource,
    ) -> Result<SpawnOutcome, PipelineError> {
        let scheduler = match source {
            SpawnSource::Daemon => Scheduler::Daemon,
            SpawnSource::Cron => Scheduler::Cron,
        };
        let claim = match self.engine.claim_step(agent_id, scheduler)? {
            Some(claim) => claim,
            None => match self.claim_from_loop(agent_id, scheduler)? {
                LoopClaim::Claimed(claim) => claim,
                LoopClaim::Busy => return Ok(SpawnOutcome::StoryAlreadyClaimed),
                LoopClaim::None => return Ok(SpawnOutcome::NoWork),
            },
        };

        let agent = spec.agent_by_scoped_id(agent_id);
        let timeout_secs = agent
            .map(|agent| spec.agent_timeout_secs(agent))
            .unwrap_or(crate::workflow::DEFAULT_AGENT_TIMEOUT_SECS);
        let thinking = agent
            .and_then(|agent| agent.thinking)
            .unwrap_or(Thinking::Low);

        let request = SpawnRequest {
            idempotency_key: format!(
                "antfarm:{}:{}:{}:{}",
                claim.run_id,
                claim.step_id,
                claim.story_id.as_deref().unwrap_or("root"),
                spawn_nonce()
            ),
            agent_id: agent_id.to_string(),
            session_key: format!(
                "agent:{agent_id}:workflow:{}:{}",
                claim.run_id, claim.step_id
            ),
            message: build_worker_prompt(&claim),
            timeout_secs,
            thinking,
        };

        // External I/O, deliberately outside any store transaction.
        match self.gateway.call_agent(&request) {
            Ok(accepted_run_id) => {
                let session_id = gateway::resolve_session_id(self.gateway.as_ref(), &accepted_run_id);
                self.confirm_spawn(&claim, &session_id, source)
            }
            Err(err) => {
                self.rollback_claim(&claim, &err.to_string())?;
                Ok(SpawnOutcome::RolledBack {
                    error: err.to_string(),
                })
            }
        }
    }

    /// The loop-step path: `claim_step` never touches loop steps, so a
    /// pending or running loop owned by this agent is probed here and its
    /// next story claimed.
    fn claim_from_loop(
        &self,
        agent_id: &str,
        scheduler: Scheduler,
    ) -> Result<LoopClaim, PipelineError> {
        enum Probe {
            None,
            Busy,
            Ready(String),
        }

        let probe = self.engine.in_tx(|tx| {
            let Some(step) = tx.loop_step_for_agent(agent_id, scheduler)? else {
                return Ok(Probe::None);
            };
            let Some(run) = tx.run(&step.run_id)? else {
                return Ok(Probe::None);
            };
            if run.status != RunStatus::Running {
                return Ok(Probe::None);
            }
            // Dependencies: every earlier step must be done before the loop
            // may work a story.
            let blocked = tx
                .steps_for_run(&run.id)?
                .iter()
                .any(|other| other.step_index < step.step_index && other.status != StepStatus::Done);
            if blocked {
                return Ok(Probe::None);
            }
            if let Some(current) = &step.current_story_id {
                if let Some(story) = tx.story(current)? {
                    if matches!(story.status, StoryStatus::Running | StoryStatus::Claiming) {
                        return Ok(Probe::Busy);
                    }
                }
            }
            Ok(Probe::Ready(step.id.clone()))
        })?;

        match probe {
            Probe::None => Ok(LoopClaim::None),
            Probe::Busy => Ok(LoopClaim::Busy),
            Probe::Ready(step_row_id) => Ok(self
                .engine
                .claim_story(agent_id, &step_row_id)?
                .map(LoopClaim::Claimed)
                .unwrap_or(LoopClaim::None)),
        }
    }

    /// Spawn succeeded: `claiming → running` plus the session record — but
    /// only if the claim survived the spawn window (a run cancelled
    /// mid-spawn must not reach `running`).
    fn confirm_spawn(
        &self,
        claim: &ClaimResult,
        session_id: &str,
        source: SpawnSource,
    ) -> Result<SpawnOutcome, PipelineError> {
        let mut events = Vec::new();
        let mut notify_url = None;

        let confirmed = self.engine.in_tx(|tx| {
            let Some(run) = tx.run(&claim.run_id)? else {
                return Ok(false);
            };
            if run.status.is_terminal() {
                return Ok(false);
            }
            notify_url = run.notify_url.clone();

            match claim.kind {
                ClaimKind::Step => {
                    let Some(step) = tx.step(&claim.step_row_id)? else {
                        return Ok(false);
                    };
                    if step.status != StepStatus::Claiming {
                        return Ok(false);
                    }
                    tx.update_step_status(&step.id, StepStatus::Running)?;
                    events.push(
                        EventRecord::new(EventKind::StepRunning, &run.id)
                            .with_workflow(&run.workflow_id)
                            .with_step(&step.step_id)
                            .with_agent(&step.agent_id)
                            .with_session(session_id),
                    );
                }
                ClaimKind::Story => {
                    let Some(story_row_id) = &claim.story_row_id else {
                        return Ok(false);
                    };
                    let Some(story) = tx.story(story_row_id)? else {
                        return Ok(false);
                    };
                    if story.status != StoryStatus::Claiming {
                        return Ok(false);
                    }
                    tx.update_story_status(&story.id, StoryStatus::Running)?;
                    events.push(
                        EventRecord::new(EventKind::StoryStarted, &run.id)
                            .with_workflow(&run.workflow_id)
                            .with_step(&claim.step_id)
                            .with_agent(&claim.agent_id)
                            .with_story(&story.story_id, &story.title)
                            .with_session(session_id),
                    );
                }
            }

            tx.upsert_session(&ActiveSessionRecord {
                agent_id: claim.agent_id.clone(),
                step_id: claim.step_row_id.clone(),
                story_id: claim.story_row_id.clone().unwrap_or_default(),
                run_id: claim.run_id.clone(),
                spawned_at: now_iso(),
                spawned_by: source,
                session_id: session_id.to_string(),
            })?;
            Ok(true)
        })?;

        for event in events {
            self.journal.emit(&event, notify_url.as_deref());
        }
        if confirmed {
            Ok(SpawnOutcome::Spawned {
                session_id: session_id.to_string(),
            })
        } else {
            Ok(SpawnOutcome::RunTerminal)
        }
    }

    /// Spawn failed: restore the pre-claim state without charging retries.
    fn rollback_claim(&self, claim: &ClaimResult, error: &str) -> Result<(), PipelineError> {
        let mut events = Vec::new();
        let mut notify_url = None;

        self.engine.in_tx(|tx| {
            let run = tx.run(&claim.run_id)?;
            notify_url = run.and_then(|run| run.notify_url);

            match claim.kind {
                ClaimKind::Step => {
                    if let Some(step) = tx.step(&claim.step_row_id)? {
                        if step.status == StepStatus::Claiming {
                            tx.update_step_status(&step.id, StepStatus::Pending)?;
                            events.push(
                                EventRecord::new(EventKind::StepRollback, &claim.run_id)
                                    .with_workflow(&claim.workflow_id)
                                    .with_step(&step.step_id)
                                    .with_agent(&step.agent_id)
                                    .with_detail(error),
                            );
                        }
                    }
                }
                ClaimKind::Story => {
                    if let Some(story_row_id) = &claim.story_row_id {
                        if let Some(story) = tx.story(story_row_id)? {
                            if story.status == StoryStatus::Claiming {
                                tx.update_story_status(&story.id, StoryStatus::Pending)?;
                                events.push(
                                    EventRecord::new(EventKind::StoryRollback, &claim.run_id)
                                        .with_workflow(&claim.workflow_id)
                                        .with_step(&claim.step_id)
                                        .with_story(&story.story_id, &story.title)
                                        .with_detail(error),
                                );
                            }
                        }
                        if let Some(step) = tx.step(&claim.step_row_id)? {
                            // Only clear the pointer if it still names the
                            // story we failed to spawn.
                            if step.current_story_id.as_deref()
                                == Some(story_row_id.as_str())
                            {
                                tx.set_current_story(&step.id, None)?;
                            }
                        }
                    }
                }
            }
            Ok(())
        })?;

        for event in events {
            self.journal.emit(&event, notify_url.as_deref());
        }
        Ok(())
    }
}

/// The worker prompt: resolved step input plus the mandatory completion
/// protocol so every worker knows how to report back.
fn build_worker_prompt(claim: &ClaimResult) -> String {
    format!(
        "{input}\n\n---\nWhen you are finished, report back to the orchestrator:\n\
         - on success run `antfarm step complete {step_row_id}` and write your \
         output to its standard input as `KEY: value` lines\n\
         - on failure run `antfarm step fail {step_row_id} \"<reason>\"`\n\
         Do not finish without reporting.",
        input = claim.input,
        step_row_id = claim.step_row_id,
    )
}
