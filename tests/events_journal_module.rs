use antfarm::config::{bootstrap_state_root, StatePaths};
use antfarm::events::{EventJournal, EventKind, EventRecord, JOURNAL_MAX_BYTES};
use std::fs;
use tempfile::tempdir;

fn harness() -> (tempfile::TempDir, StatePaths, EventJournal) {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join(".antfarm"));
    bootstrap_state_root(&paths).expect("bootstrap");
    let journal = EventJournal::new(&paths);
    (dir, paths, journal)
}

#[test]
fn emit_then_read_back_recent_and_by_run() {
    let (_dir, _paths, journal) = harness();

    journal.emit(&EventRecord::new(EventKind::RunStarted, "run-alpha-1"), None);
    journal.emit(
        &EventRecord::new(EventKind::StepDone, "run-alpha-1").with_step("build"),
        None,
    );
    journal.emit(&EventRecord::new(EventKind::RunStarted, "run-beta-2"), None);

    let recent = journal.recent(10);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[2].run_id, "run-beta-2");

    let alpha = journal.by_run("run-alpha", 10);
    assert_eq!(alpha.len(), 2, "prefix match on run id");
    assert_eq!(alpha[1].event, EventKind::StepDone);

    let limited = journal.recent(1);
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].run_id, "run-beta-2");
}

#[test]
fn oversized_journal_rotates_keeping_one_backup() {
    let (_dir, paths, journal) = harness();

    let filler = format!(
        "{}\n",
        serde_json::to_string(&EventRecord::new(EventKind::RunStarted, "run-old")).expect("json")
    );
    let repeat = (JOURNAL_MAX_BYTES as usize / filler.len()) + 2;
    fs::write(paths.journal_path(), filler.repeat(repeat)).expect("oversized journal");

    journal.emit(&EventRecord::new(EventKind::RunCompleted, "run-new"), None);

    let backup = paths.journal_path().with_extension("jsonl.1");
    assert!(backup.exists(), "rotation keeps a .1 backup");
    let live_len = fs::metadata(paths.journal_path()).expect("journal").len();
    assert!(live_len < 1024, "live journal starts fresh after rotation");

    // Readback still sees both generations.
    let all = journal.by_run("run-", usize::MAX);
    assert!(all.iter().any(|record| record.run_id == "run-new"));
    assert!(all.iter().any(|record| record.run_id == "run-old"));
}

#[test]
fn webhook_failure_is_swallowed() {
    let (_dir, _paths, journal) = harness();
    // Nothing listens on this port; emit must not error or panic.
    journal.emit(
        &EventRecord::new(EventKind::RunStarted, "run-hook"),
        Some("http://127.0.0.1:9/#auth=token"),
    );
    assert_eq!(journal.by_run("run-hook", 10).len(), 1);
}

#[test]
fn event_kinds_serialize_with_dotted_names() {
    let record = EventRecord::new(EventKind::PipelineAdvanced, "run-1");
    let encoded = serde_json::to_string(&record).expect("encode");
    assert!(encoded.contains("\"pipeline.advanced\""));
    let decoded: EventRecord = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(decoded.event, EventKind::PipelineAdvanced);
}
