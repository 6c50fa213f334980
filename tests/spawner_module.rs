use antfarm::config::{bootstrap_state_root, StatePaths};
use antfarm::events::{EventJournal, EventKind};
use antfarm::pipeline::PipelineEngine;
use antfarm::spawner::{Gateway, GatewayError, SpawnOutcome, SpawnRequest, Spawner};
use antfarm::store::{RunStatus, Scheduler, SpawnSource, StepStatus, StoryStatus, Store};
use antfarm::workflow::WorkflowSpec;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

struct Harness {
    _dir: tempfile::TempDir,
    paths: StatePaths,
    store: Arc<Store>,
    journal: Arc<EventJournal>,
    engine: PipelineEngine,
}

fn harness() -> Harness {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join(".antfarm"));
    bootstrap_state_root(&paths).expect("bootstrap");
    let store = Arc::new(Store::open(&paths.db_path()).expect("store"));
    let journal = Arc::new(EventJournal::new(&paths));
    let engine = PipelineEngine::new(store.clone(), journal.clone(), paths.clone());
    Harness {
        _dir: dir,
        paths,
        store,
        journal,
        engine,
    }
}

fn echo_spec() -> WorkflowSpec {
    serde_yaml::from_str(
        "
id: echo
agents:
  - id: echo
    timeout_seconds: 900
steps:
  - id: echo
    agent: echo
    input: \"Echo this text: {{task}}\"
",
    )
    .expect("spec")
}

type CallHook = Box<dyn FnMut() + Send>;

struct MockGateway {
    fail: bool,
    session_id: Option<String>,
    calls: Mutex<Vec<SpawnRequest>>,
    on_call: Mutex<Option<CallHook>>,
}

impl MockGateway {
    fn accepting() -> Self {
        Self {
            fail: false,
            session_id: Some("sess-1".to_string()),
            calls: Mutex::new(Vec::new()),
            on_call: Mutex::new(None),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            session_id: None,
            calls: Mutex::new(Vec::new()),
            on_call: Mutex::new(None),
        }
    }
}

impl Gateway for MockGateway {
    fn call_agent(&self, request: &SpawnRequest) -> Result<String, GatewayError> {
        self.calls.lock().expect("calls").push(request.clone());
        if let Some(hook) = self.on_call.lock().expect("hook").as_mut() {
            hook();
        }
        if self.fail {
            return Err(GatewayError::Rejected {
                status: "error".to_string(),
            });
        }
        Ok("gw-accepted-1".to_string())
    }

    fn session_for_run(&self, _gateway_run_id: &str) -> Option<String> {
        self.session_id.clone()
    }
}

fn spawner_with(h: &Harness, gateway: Arc<MockGateway>) -> Spawner {
    let engine = PipelineEngine::new(h.store.clone(), h.journal.clone(), h.paths.clone());
    Spawner::new(h.journal.clone(), engine, gateway)
}

#[test]
fn happy_path_spawns_and_completes_the_run() {
    let h = harness();
    let spec = echo_spec();
    let run = h
        .engine
        .start_run(&spec, "hello", None, Scheduler::Daemon)
        .expect("start");
    let gateway = Arc::new(MockGateway::accepting());
    let spawner = spawner_with(&h, gateway.clone());

    let outcome = spawner
        .peek_and_spawn("echo_echo", &spec, SpawnSource::Daemon)
        .expect("spawn");
    assert_eq!(
        outcome,
        SpawnOutcome::Spawned {
            session_id: "sess-1".to_string()
        }
    );

    let steps = h
        .store
        .with_tx(|tx| tx.steps_for_run(&run.id))
        .expect("steps");
    assert_eq!(steps[0].status, StepStatus::Running);

    let sessions = h.store.with_tx(|tx| tx.sessions()).expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, "sess-1");
    assert_eq!(sessions[0].agent_id, "echo_echo");
    assert_eq!(sessions[0].story_id, "");

    let calls = gateway.calls.lock().expect("calls");
    assert_eq!(calls.len(), 1);
    let request = &calls[0];
    assert!(request.message.contains("Echo this text: hello"));
    assert!(request
        .message
        .contains(&format!("antfarm step complete {}", steps[0].id)));
    assert_eq!(request.agent_id, "echo_echo");
    assert_eq!(request.timeout_secs, 900);
    assert!(request
        .idempotency_key
        .starts_with(&format!("antfarm:{}:echo:root:", run.id)));
    assert_eq!(
        request.session_key,
        format!("agent:echo_echo:workflow:{}:echo", run.id)
    );
    drop(calls);

    // Worker reports back; run finishes.
    let outcome = h
        .engine
        .complete_step(&steps[0].id, "STATUS: done\nCHANGES: -\nTESTS: -")
        .expect("complete");
    assert!(outcome.run_completed);

    let finished = h
        .store
        .with_tx(|tx| tx.run(&run.id))
        .expect("load")
        .expect("present");
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.context.get("status").map(String::as_str), Some("done"));
    assert_eq!(finished.context.get("changes").map(String::as_str), Some("-"));
    assert_eq!(finished.context.get("tests").map(String::as_str), Some("-"));

    let kinds: Vec<EventKind> = h
        .journal
        .by_run(&run.id, usize::MAX)
        .into_iter()
        .map(|record| record.event)
        .collect();
    for expected in [
        EventKind::RunStarted,
        EventKind::StepRunning,
        EventKind::StepDone,
        EventKind::RunCompleted,
    ] {
        assert!(kinds.contains(&expected), "missing {expected:?}");
    }
}

#[test]
fn spawn_failure_rolls_the_claim_back_untouched() {
    let h = harness();
    let spec = echo_spec();
    let run = h
        .engine
        .start_run(&spec, "hello", None, Scheduler::Daemon)
        .expect("start");
    let spawner = spawner_with(&h, Arc::new(MockGateway::failing()));

    let outcome = spawner
        .peek_and_spawn("echo_echo", &spec, SpawnSource::Daemon)
        .expect("spawn attempt");
    assert!(matches!(outcome, SpawnOutcome::RolledBack { .. }));

    let step = h
        .store
        .with_tx(|tx| tx.steps_for_run(&run.id))
        .expect("steps")
        .remove(0);
    assert_eq!(step.status, StepStatus::Pending, "claim rolled back");
    assert_eq!(step.retry_count, 0, "rollback never charges a retry");

    assert!(h
        .store
        .with_tx(|tx| tx.sessions())
        .expect("sessions")
        .is_empty());

    let kinds: Vec<EventKind> = h
        .journal
        .by_run(&run.id, usize::MAX)
        .into_iter()
        .map(|record| record.event)
        .collect();
    assert!(kinds.contains(&EventKind::StepRollback));

    // The next tick can claim again.
    let retried = spawner_with(&h, Arc::new(MockGateway::accepting()))
        .peek_and_spawn("echo_echo", &spec, SpawnSource::Daemon)
        .expect("respawn");
    assert!(retried.spawned());
}

#[test]
fn no_work_when_nothing_is_pending() {
    let h = harness();
    let spec = echo_spec();
    let spawner = spawner_with(&h, Arc::new(MockGateway::accepting()));
    let outcome = spawner
        .peek_and_spawn("echo_echo", &spec, SpawnSource::Daemon)
        .expect("spawn");
    assert_eq!(outcome, SpawnOutcome::NoWork);
}

#[test]
fn run_cancelled_mid_spawn_never_reaches_running() {
    let h = harness();
    let spec = echo_spec();
    let run = h
        .engine
        .start_run(&spec, "hello", None, Scheduler::Daemon)
        .expect("start");

    let gateway = Arc::new(MockGateway::accepting());
    {
        // The cancel lands while the gateway call is in flight.
        let store = h.store.clone();
        let journal = h.journal.clone();
        let paths = h.paths.clone();
        let run_id = run.id.clone();
        *gateway.on_call.lock().expect("hook") = Some(Box::new(move || {
            let engine = PipelineEngine::new(store.clone(), journal.clone(), paths.clone());
            engine.cancel_run(&run_id).expect("cancel");
        }));
    }
    let spawner = spawner_with(&h, gateway);

    let outcome = spawner
        .peek_and_spawn("echo_echo", &spec, SpawnSource::Daemon)
        .expect("spawn");
    assert_eq!(outcome, SpawnOutcome::RunTerminal);

    let step = h
        .store
        .with_tx(|tx| tx.steps_for_run(&run.id))
        .expect("steps")
        .remove(0);
    assert_ne!(step.status, StepStatus::Running);
    assert!(h
        .store
        .with_tx(|tx| tx.sessions())
        .expect("sessions")
        .is_empty());
}

#[test]
fn daemon_spawner_never_claims_cron_runs() {
    let h = harness();
    let spec = echo_spec();
    // Same workflow, two schedulers.
    let daemon_run = h
        .engine
        .start_run(&spec, "daemon task", None, Scheduler::Daemon)
        .expect("daemon run");
    let cron_run = h
        .engine
        .start_run(&spec, "cron task", None, Scheduler::Cron)
        .expect("cron run");

    let gateway = Arc::new(MockGateway::accepting());
    let spawner = spawner_with(&h, gateway.clone());

    // First spawn claims the daemon run's step.
    assert!(spawner
        .peek_and_spawn("echo_echo", &spec, SpawnSource::Daemon)
        .expect("spawn")
        .spawned());
    // Second spawn finds nothing: the cron run is not the daemon's to claim.
    assert_eq!(
        spawner
            .peek_and_spawn("echo_echo", &spec, SpawnSource::Daemon)
            .expect("spawn"),
        SpawnOutcome::NoWork
    );

    let cron_steps = h
        .store
        .with_tx(|tx| tx.steps_for_run(&cron_run.id))
        .expect("steps");
    assert_eq!(cron_steps[0].status, StepStatus::Pending);

    for session in h.store.with_tx(|tx| tx.sessions()).expect("sessions") {
        assert_eq!(session.run_id, daemon_run.id);
    }
    assert!(h.journal.by_run(&cron_run.id, usize::MAX).iter().all(
        |record| record.event == EventKind::RunStarted || record.event == EventKind::StepPending
    ));
}

#[test]
fn loop_story_spawn_and_busy_signal() {
    let h = harness();
    let spec: WorkflowSpec = serde_yaml::from_str(
        "
id: feature
agents:
  - id: planner
  - id: coder
steps:
  - id: plan
    agent: planner
    input: \"Plan {{task}}\"
  - id: implement
    agent: coder
    input: \"Implement {{current_story}}\"
    type: loop
",
    )
    .expect("spec");

    let run = h
        .engine
        .start_run(&spec, "feature work", None, Scheduler::Daemon)
        .expect("start");
    let steps = h
        .store
        .with_tx(|tx| tx.steps_for_run(&run.id))
        .expect("steps");
    h.engine
        .complete_step(
            &steps[0].id,
            "STORIES_JSON: [{\"id\":\"s1\",\"title\":\"t\",\"description\":\"d\",\"acceptanceCriteria\":[\"a\"]}]",
        )
        .expect("plan");

    let gateway = Arc::new(MockGateway::accepting());
    let spawner = spawner_with(&h, gateway);

    let outcome = spawner
        .peek_and_spawn("feature_coder", &spec, SpawnSource::Daemon)
        .expect("spawn");
    assert!(outcome.spawned());

    let stories = h
        .store
        .with_tx(|tx| tx.stories_for_run(&run.id))
        .expect("stories");
    assert_eq!(stories[0].status, StoryStatus::Running);

    let sessions = h.store.with_tx(|tx| tx.sessions()).expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].story_id, stories[0].id);

    // The story is in flight: the next tick reports it, not a double claim.
    let outcome = spawner
        .peek_and_spawn("feature_coder", &spec, SpawnSource::Daemon)
        .expect("second spawn");
    assert_eq!(outcome, SpawnOutcome::StoryAlreadyClaimed);
}
