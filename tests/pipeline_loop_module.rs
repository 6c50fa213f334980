use antfarm::config::{bootstrap_state_root, StatePaths};
use antfarm::events::{EventJournal, EventKind};
use antfarm::pipeline::PipelineEngine;
use antfarm::store::{RunStatus, Scheduler, StepStatus, StoryStatus, Store};
use antfarm::workflow::WorkflowSpec;
use std::sync::Arc;
use tempfile::tempdir;

struct Harness {
    _dir: tempfile::TempDir,
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
        store,
        journal,
        engine,
    }
}

fn loop_spec() -> WorkflowSpec {
    serde_yaml::from_str(
        "
id: feature
agents:
  - id: planner
  - id: coder
  - id: reviewer
steps:
  - id: plan
    agent: planner
    input: \"Break down: {{task}}\"
  - id: implement
    agent: coder
    input: \"Implement {{current_story}} feedback: {{verify_feedback}}\"
    type: loop
    loop_config:
      verify_each: true
      verify_step: verify
  - id: verify
    agent: reviewer
    input: \"Verify story {{current_story_id}}\"
",
    )
    .expect("spec")
}

const TWO_STORIES: &str = "STATUS: done\nSTORIES_JSON: [\
    {\"id\":\"s1\",\"title\":\"t1\",\"description\":\"d1\",\"acceptanceCriteria\":[\"a1\"]},\
    {\"id\":\"s2\",\"title\":\"t2\",\"description\":\"d2\",\"acceptanceCriteria\":[\"a2\"]}]";

struct LoopRun {
    run_id: String,
    plan_row: String,
    implement_row: String,
    verify_row: String,
}

fn start_and_plan(h: &Harness) -> LoopRun {
    let spec = loop_spec();
    let run = h
        .engine
        .start_run(&spec, "build the feature", None, Scheduler::Daemon)
        .expect("start");
    let steps = h
        .store
        .with_tx(|tx| tx.steps_for_run(&run.id))
        .expect("steps");
    let ids = LoopRun {
        run_id: run.id.clone(),
        plan_row: steps[0].id.clone(),
        implement_row: steps[1].id.clone(),
        verify_row: steps[2].id.clone(),
    };

    h.engine
        .complete_step(&ids.plan_row, TWO_STORIES)
        .expect("complete plan");
    ids
}

fn step_status(h: &Harness, row_id: &str) -> StepStatus {
    h.store
        .with_tx(|tx| tx.step(row_id))
        .expect("load")
        .expect("present")
        .status
}

fn story_by_human_id(h: &Harness, run_id: &str, story_id: &str) -> antfarm::store::StoryRecord {
    h.store
        .with_tx(|tx| tx.stories_for_run(run_id))
        .expect("stories")
        .into_iter()
        .find(|story| story.story_id == story_id)
        .expect("story present")
}

#[test]
fn planner_output_ingests_stories_once() {
    let h = harness();
    let ids = start_and_plan(&h);

    let stories = h
        .store
        .with_tx(|tx| tx.stories_for_run(&ids.run_id))
        .expect("stories");
    assert_eq!(stories.len(), 2);
    assert_eq!(stories[0].story_id, "s1");
    assert_eq!(stories[0].status, StoryStatus::Pending);
    assert_eq!(stories[1].story_index, 1);

    // Replaying an output with a stories block must not duplicate them.
    h.engine
        .complete_step(&ids.plan_row, TWO_STORIES)
        .expect("replay");
    let replayed = h
        .store
        .with_tx(|tx| tx.stories_for_run(&ids.run_id))
        .expect("stories");
    assert_eq!(replayed.len(), 2);

    // The loop step was promoted to pending by advancement.
    assert_eq!(step_status(&h, &ids.implement_row), StepStatus::Pending);
}

#[test]
fn story_claim_materialises_story_context() {
    let h = harness();
    let ids = start_and_plan(&h);

    let claim = h
        .engine
        .claim_story("feature_coder", &ids.implement_row)
        .expect("claim")
        .expect("story available");
    assert_eq!(claim.story_id.as_deref(), Some("s1"));
    assert!(claim.input.contains("s1: t1"));
    assert!(claim.input.contains("d1"));
    assert!(claim.input.contains("- a1"));

    let run = h
        .store
        .with_tx(|tx| tx.run(&ids.run_id))
        .expect("load")
        .expect("present");
    assert_eq!(
        run.context.get("current_story_id").map(String::as_str),
        Some("s1")
    );
    assert_eq!(
        run.context.get("completed_stories").map(String::as_str),
        Some("0")
    );
    assert_eq!(
        run.context.get("stories_remaining").map(String::as_str),
        Some("1")
    );

    // The loop step is running across story executions; the story itself is
    // claiming until a spawn confirms.
    assert_eq!(step_status(&h, &ids.implement_row), StepStatus::Running);
    assert_eq!(
        story_by_human_id(&h, &ids.run_id, "s1").status,
        StoryStatus::Claiming
    );

    // While s1 is in flight no second story can be claimed.
    assert!(h
        .engine
        .claim_story("feature_coder", &ids.implement_row)
        .expect("claim")
        .is_none());
}

#[test]
fn verify_retry_then_done_walks_both_stories_to_completion() {
    let h = harness();
    let ids = start_and_plan(&h);

    // First pass over s1.
    h.engine
        .claim_story("feature_coder", &ids.implement_row)
        .expect("claim")
        .expect("s1");
    h.engine
        .complete_step(&ids.implement_row, "STATUS: done\nSUMMARY: wired it up")
        .expect("complete s1");

    assert_eq!(
        story_by_human_id(&h, &ids.run_id, "s1").status,
        StoryStatus::Done
    );
    assert_eq!(step_status(&h, &ids.verify_row), StepStatus::Pending);
    assert_eq!(step_status(&h, &ids.implement_row), StepStatus::Running);

    // Verifier demands a retry.
    h.engine
        .complete_step(&ids.verify_row, "STATUS: retry\nISSUES: missing test")
        .expect("verify retry");

    let s1 = story_by_human_id(&h, &ids.run_id, "s1");
    assert_eq!(s1.status, StoryStatus::Pending);
    assert_eq!(s1.retry_count, 1);
    assert_eq!(step_status(&h, &ids.verify_row), StepStatus::Waiting);
    assert_eq!(step_status(&h, &ids.implement_row), StepStatus::Pending);

    let run = h
        .store
        .with_tx(|tx| tx.run(&ids.run_id))
        .expect("load")
        .expect("present");
    assert_eq!(
        run.context.get("verify_feedback").map(String::as_str),
        Some("missing test")
    );

    // Second pass over s1: the re-claim sees the feedback.
    let claim = h
        .engine
        .claim_story("feature_coder", &ids.implement_row)
        .expect("claim")
        .expect("s1 again");
    assert_eq!(claim.story_id.as_deref(), Some("s1"));
    assert!(claim.input.contains("feedback: missing test"));

    h.engine
        .complete_step(&ids.implement_row, "STATUS: done\nSUMMARY: added the test")
        .expect("complete s1 again");
    h.engine
        .complete_step(&ids.verify_row, "STATUS: done")
        .expect("verify s1");

    let run = h
        .store
        .with_tx(|tx| tx.run(&ids.run_id))
        .expect("load")
        .expect("present");
    assert!(
        !run.context.contains_key("verify_feedback"),
        "feedback cleared after a clean verification"
    );

    // s2 is picked up next.
    let claim = h
        .engine
        .claim_story("feature_coder", &ids.implement_row)
        .expect("claim")
        .expect("s2");
    assert_eq!(claim.story_id.as_deref(), Some("s2"));

    h.engine
        .complete_step(&ids.implement_row, "STATUS: done")
        .expect("complete s2");
    h.engine
        .complete_step(&ids.verify_row, "STATUS: done")
        .expect("verify s2");

    let run = h
        .store
        .with_tx(|tx| tx.run(&ids.run_id))
        .expect("load")
        .expect("present");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(step_status(&h, &ids.implement_row), StepStatus::Done);
    assert_eq!(step_status(&h, &ids.verify_row), StepStatus::Done);

    let kinds: Vec<EventKind> = h
        .journal
        .by_run(&ids.run_id, usize::MAX)
        .into_iter()
        .map(|record| record.event)
        .collect();
    assert!(kinds.contains(&EventKind::StoryRetry));
    assert!(kinds.contains(&EventKind::StoryVerified));
    assert!(kinds.contains(&EventKind::StoryDone));
    assert_eq!(kinds.last(), Some(&EventKind::RunCompleted));
}

#[test]
fn story_at_retry_cap_fails_the_run_on_next_retry_verdict() {
    let h = harness();
    let ids = start_and_plan(&h);

    // Exhaust s1: default max_retries is 2, so three retry verdicts fail it.
    for round in 0..3 {
        h.engine
            .claim_story("feature_coder", &ids.implement_row)
            .expect("claim")
            .expect("s1 available");
        h.engine
            .complete_step(&ids.implement_row, "STATUS: done")
            .expect("complete");
        h.engine
            .complete_step(&ids.verify_row, "STATUS: retry\nISSUES: still broken")
            .expect("verify");

        let s1 = story_by_human_id(&h, &ids.run_id, "s1");
        if round < 2 {
            assert_eq!(s1.status, StoryStatus::Pending, "round {round} retries");
            assert_eq!(s1.retry_count, round + 1);
        } else {
            assert_eq!(s1.status, StoryStatus::Failed, "retry budget exhausted");
        }
    }

    assert_eq!(step_status(&h, &ids.implement_row), StepStatus::Failed);
    let run = h
        .store
        .with_tx(|tx| tx.run(&ids.run_id))
        .expect("load")
        .expect("present");
    assert_eq!(run.status, RunStatus::Failed);

    let kinds: Vec<EventKind> = h
        .journal
        .by_run(&ids.run_id, usize::MAX)
        .into_iter()
        .map(|record| record.event)
        .collect();
    assert!(kinds.contains(&EventKind::StoryFailed));
    assert_eq!(kinds.last(), Some(&EventKind::RunFailed));
}

#[test]
fn worker_failure_with_story_in_flight_charges_the_story() {
    let h = harness();
    let ids = start_and_plan(&h);

    h.engine
        .claim_story("feature_coder", &ids.implement_row)
        .expect("claim")
        .expect("s1");

    let outcome = h
        .engine
        .fail_step(&ids.implement_row, "worker crashed")
        .expect("fail");
    assert!(outcome.retrying);

    let s1 = story_by_human_id(&h, &ids.run_id, "s1");
    assert_eq!(s1.status, StoryStatus::Pending);
    assert_eq!(s1.retry_count, 1);

    let implement = h
        .store
        .with_tx(|tx| tx.step(&ids.implement_row))
        .expect("load")
        .expect("present");
    assert_eq!(implement.status, StepStatus::Pending);
    assert_eq!(implement.current_story_id, None);
    assert_eq!(implement.retry_count, 0, "step budget untouched");
}

#[test]
fn twenty_one_stories_are_rejected() {
    let h = harness();
    let spec = loop_spec();
    let run = h
        .engine
        .start_run(&spec, "too many", None, Scheduler::Daemon)
        .expect("start");
    let steps = h
        .store
        .with_tx(|tx| tx.steps_for_run(&run.id))
        .expect("steps");

    let story = |index: usize| {
        format!("{{\"id\":\"s{index}\",\"title\":\"t\",\"description\":\"d\",\"acceptanceCriteria\":[\"a\"]}}")
    };
    let payload = |count: usize| {
        format!(
            "STORIES_JSON: [{}]",
            (0..count).map(story).collect::<Vec<_>>().join(",")
        )
    };

    let err = h
        .engine
        .complete_step(&steps[0].id, &payload(21))
        .expect_err("21 stories rejected");
    assert!(err.to_string().contains("cap is 20"));

    h.engine
        .complete_step(&steps[0].id, &payload(20))
        .expect("20 stories accepted");
    let stories = h
        .store
        .with_tx(|tx| tx.stories_for_run(&run.id))
        .expect("stories");
    assert_eq!(stories.len(), 20);
}
