use antfarm::shared::time::now_iso;
use antfarm::store::{
    ActiveSessionRecord, RunRecord, RunStatus, Scheduler, SpawnSource, StepRecord, StepStatus,
    Store, StoreError,
};
use antfarm::workflow::StepType;
use rusqlite::params;
use std::collections::BTreeMap;
use tempfile::tempdir;

fn sample_run(id: &str, run_number: i64, scheduler: Scheduler) -> RunRecord {
    let now = now_iso();
    RunRecord {
        id: id.to_string(),
        run_number,
        workflow_id: "build".to_string(),
        task: "ship the widget".to_string(),
        status: RunStatus::Running,
        context: BTreeMap::new(),
        notify_url: None,
        scheduler,
        created_at: now.clone(),
        updated_at: now,
    }
}

fn sample_step(run_id: &str, index: i64, status: StepStatus) -> StepRecord {
    let now = now_iso();
    StepRecord {
        id: format!("{run_id}-step-{index}"),
        run_id: run_id.to_string(),
        step_id: format!("step{index}"),
        agent_id: "build_worker".to_string(),
        step_index: index,
        input_template: "Do {{task}}".to_string(),
        expects: None,
        step_type: StepType::Single,
        loop_config: None,
        max_retries: 2,
        retry_count: 0,
        abandoned_count: 0,
        status,
        current_story_id: None,
        output: None,
        created_at: now.clone(),
        updated_at: now,
    }
}

#[test]
fn open_applies_migrations_idempotently() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("antfarm.db");
    let _first = Store::open(&db_path).expect("first open");
    let second = Store::open(&db_path).expect("second open");

    let result: Result<(), StoreError> = second.with_tx(|tx| {
        tx.insert_run(&sample_run("run-1", 1, Scheduler::Daemon))?;
        Ok(())
    });
    result.expect("insert after reopen");
}

#[test]
fn with_tx_rolls_back_on_error() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("antfarm.db")).expect("open");

    let result: Result<(), StoreError> = store.with_tx(|tx| {
        tx.insert_run(&sample_run("run-rollback", 1, Scheduler::Daemon))?;
        Err(StoreError::InvalidColumn {
            column: "test".to_string(),
            value: "boom".to_string(),
        })
    });
    assert!(result.is_err());

    let loaded: Result<Option<RunRecord>, StoreError> =
        store.with_tx(|tx| tx.run("run-rollback"));
    assert!(loaded.expect("query").is_none(), "insert must roll back");
}

#[test]
fn duplicate_step_index_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("antfarm.db")).expect("open");

    let result: Result<(), StoreError> = store.with_tx(|tx| {
        tx.insert_run(&sample_run("run-1", 1, Scheduler::Daemon))?;
        tx.insert_step(&sample_step("run-1", 0, StepStatus::Pending))?;
        let mut clash = sample_step("run-1", 0, StepStatus::Waiting);
        clash.id = "other-row-id".to_string();
        clash.step_id = "other-name".to_string();
        tx.insert_step(&clash)?;
        Ok(())
    });
    assert!(result.is_err(), "unique(run_id, step_index) must hold");
}

#[test]
fn null_scheduler_reads_as_cron() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("antfarm.db");
    let store = Store::open(&db_path).expect("open");

    let connection = rusqlite::Connection::open(&db_path).expect("raw open");
    connection
        .execute(
            "INSERT INTO runs (id, run_number, workflow_id, task, status, context, scheduler,
                               created_at, updated_at)
             VALUES (?1, 1, 'build', 'task', 'running', '{}', NULL, ?2, ?2)",
            params!["run-legacy", now_iso()],
        )
        .expect("raw insert");

    let run = store
        .with_tx(|tx| tx.run("run-legacy"))
        .expect("load")
        .expect("present");
    assert_eq!(run.scheduler, Scheduler::Cron);
}

#[test]
fn claimable_step_respects_scheduler_and_skips_loops() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("antfarm.db")).expect("open");

    let result: Result<(), StoreError> = store.with_tx(|tx| {
        tx.insert_run(&sample_run("run-daemon", 1, Scheduler::Daemon))?;
        tx.insert_run(&sample_run("run-cron", 2, Scheduler::Cron))?;
        tx.insert_step(&sample_step("run-daemon", 0, StepStatus::Pending))?;
        tx.insert_step(&sample_step("run-cron", 0, StepStatus::Pending))?;

        let mut loop_step = sample_step("run-daemon", 1, StepStatus::Pending);
        loop_step.id = "loop-row".to_string();
        loop_step.step_id = "loop".to_string();
        loop_step.step_type = StepType::Loop;
        tx.insert_step(&loop_step)?;
        Ok(())
    });
    result.expect("seed");

    let daemon_claim = store
        .with_tx(|tx| tx.claimable_step("build_worker", Scheduler::Daemon))
        .expect("query")
        .expect("daemon step available");
    assert_eq!(daemon_claim.run_id, "run-daemon");
    assert_eq!(daemon_claim.step_type, StepType::Single);

    let cron_claim = store
        .with_tx(|tx| tx.claimable_step("build_worker", Scheduler::Cron))
        .expect("query")
        .expect("cron step available");
    assert_eq!(cron_claim.run_id, "run-cron");
}

#[test]
fn session_composite_key_upserts_with_empty_story() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("antfarm.db")).expect("open");

    let session = |story_id: &str, session_id: &str| ActiveSessionRecord {
        agent_id: "build_worker".to_string(),
        step_id: "step-row".to_string(),
        story_id: story_id.to_string(),
        run_id: "run-1".to_string(),
        spawned_at: now_iso(),
        spawned_by: SpawnSource::Daemon,
        session_id: session_id.to_string(),
    };

    let result: Result<(), StoreError> = store.with_tx(|tx| {
        tx.upsert_session(&session("", "sess-1"))?;
        tx.upsert_session(&session("story-row", "sess-2"))?;
        tx.upsert_session(&session("", "sess-3"))?;
        Ok(())
    });
    result.expect("upserts");

    let sessions = store.with_tx(|tx| tx.sessions()).expect("list");
    assert_eq!(sessions.len(), 2, "same (agent, step, '') key must upsert");
    let replaced = sessions
        .iter()
        .find(|record| record.story_id.is_empty())
        .expect("step-scoped session");
    assert_eq!(replaced.session_id, "sess-3");
}

#[test]
fn run_by_prefix_prefers_exact_match() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("antfarm.db")).expect("open");

    let result: Result<(), StoreError> = store.with_tx(|tx| {
        tx.insert_run(&sample_run("run-abc", 1, Scheduler::Daemon))?;
        tx.insert_run(&sample_run("run-abc-xyz", 2, Scheduler::Daemon))?;
        Ok(())
    });
    result.expect("seed");

    let exact = store
        .with_tx(|tx| tx.run_by_prefix("run-abc"))
        .expect("query")
        .expect("present");
    assert_eq!(exact.id, "run-abc");

    let prefixed = store
        .with_tx(|tx| tx.run_by_prefix("run-abc-x"))
        .expect("query")
        .expect("present");
    assert_eq!(prefixed.id, "run-abc-xyz");
}

#[test]
fn daemon_workflow_ids_are_distinct_and_daemon_only() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("antfarm.db")).expect("open");

    let result: Result<(), StoreError> = store.with_tx(|tx| {
        tx.insert_run(&sample_run("run-1", 1, Scheduler::Daemon))?;
        tx.insert_run(&sample_run("run-2", 2, Scheduler::Daemon))?;
        tx.insert_run(&sample_run("run-3", 3, Scheduler::Cron))?;
        let mut completed = sample_run("run-4", 4, Scheduler::Daemon);
        completed.status = RunStatus::Completed;
        tx.insert_run(&completed)?;
        Ok(())
    });
    result.expect("seed");

    let ids = store
        .with_tx(|tx| tx.daemon_workflow_ids())
        .expect("query");
    assert_eq!(ids, vec!["build".to_string()]);
}
