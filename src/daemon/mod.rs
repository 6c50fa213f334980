use crate::config::{bootstrap_state_root, ConfigError, Settings, StatePaths};
use crate::events::EventJournal;
use crate::pipeline::PipelineEngine;
use crate::recovery::Sweeper;
use crate::shared::logging::append_runtime_log;
use crate::spawner::{HttpGateway, Spawner};
use crate::store::{SpawnSource, Store, StoreError};
use crate::workflow::SpecCache;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub mod pid;

pub use pid::{
    acquire, cleanup_stale, is_process_alive, ownership_state, read_pid, release,
    spawn_daemon_process, stop_daemon, OwnershipState, PidError,
};

pub const CLAIM_SWEEP_INTERVAL: Duration = Duration::from_secs(120);
pub const SESSION_GC_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pid(#[from] PidError),
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
    }
}

fn shutdown_requested(paths: &StatePaths) -> bool {
    SHUTDOWN.load(Ordering::SeqCst) || paths.stop_signal_path().exists()
}

/// Sleeps in small slices so shutdown stays responsive; returns false once
/// shutdown was requested.
fn sleep_with_shutdown(paths: &StatePaths, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown_requested(paths) {
            return false;
        }
        let slice = remaining.min(Duration::from_millis(200));
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    !shutdown_requested(paths)
}

/// The long-lived daemon loop: every poll interval, iterate daemon-scheduled
/// workflows and their declared agents, spawning one worker per claimable
/// unit of work. Sweeps interleave on their own cadences. Single-threaded,
/// so ticks can never overlap.
pub fn run_daemon(paths: &StatePaths, settings: &Settings) -> Result<(), RuntimeError> {
    bootstrap_state_root(paths)?;
    SHUTDOWN.store(false, Ordering::SeqCst);
    install_signal_handlers();
    let _ = fs::remove_file(paths.stop_signal_path());
    pid::write_pid(paths, std::process::id())?;

    let store = Arc::new(Store::open(&paths.db_path())?);
    let journal = Arc::new(EventJournal::new(paths));
    let workflows_dir = settings
        .workflows_dir
        .clone()
        .unwrap_or_else(|| paths.workflows_dir());
    let cache = Arc::new(SpecCache::new(workflows_dir));
    let engine = PipelineEngine::new(store.clone(), journal.clone(), paths.clone());
    let sweeper = Arc::new(Sweeper::new(
        store.clone(),
        journal.clone(),
        cache.clone(),
        paths.clone(),
    ));
    let gateway = Arc::new(HttpGateway::new(settings.gateway_url.clone()));
    let spawner = Spawner::new(journal.clone(), engine, gateway);

    let interval = Duration::from_millis(settings.effective_poll_interval_ms());
    append_runtime_log(
        paths,
        "info",
        "daemon.started",
        &format!(
            "pid={} interval_ms={}",
            std::process::id(),
            interval.as_millis()
        ),
    );

    let mut last_claim_sweep = Instant::now();
    let mut last_session_gc = Instant::now();

    while !shutdown_requested(paths) {
        run_tick(paths, settings, &store, &cache, &sweeper, &spawner);

        if last_claim_sweep.elapsed() >= CLAIM_SWEEP_INTERVAL {
            last_claim_sweep = Instant::now();
            match sweeper.sweep_claiming() {
                Ok(report) => append_runtime_log(
                    paths,
                    "info",
                    "daemon.claim_sweep",
                    &format!(
                        "steps_reverted={} stories_reverted={}",
                        report.steps_reverted, report.stories_reverted
                    ),
                ),
                Err(err) => {
                    append_runtime_log(paths, "warn", "daemon.claim_sweep_failed", &err.to_string())
                }
            }
        }

        if last_session_gc.elapsed() >= SESSION_GC_INTERVAL {
            last_session_gc = Instant::now();
            match sweeper.gc_sessions() {
                Ok(removed) => append_runtime_log(
                    paths,
                    "info",
                    "daemon.session_gc",
                    &format!("removed={removed}"),
                ),
                Err(err) => {
                    append_runtime_log(paths, "warn", "daemon.session_gc_failed", &err.to_string())
                }
            }
        }

        if !sleep_with_shutdown(paths, interval) {
            break;
        }
    }

    pid::release(paths);
    let _ = fs::remove_file(paths.stop_signal_path());
    append_runtime_log(paths, "info", "daemon.stopped", "daemon stopped cleanly");
    Ok(())
}

fn run_tick(
    paths: &StatePaths,
    settings: &Settings,
    store: &Arc<Store>,
    cache: &Arc<SpecCache>,
    sweeper: &Arc<Sweeper>,
    spawner: &Spawner,
) {
    if let Err(err) = sweeper.sweep() {
        append_runtime_log(paths, "warn", "daemon.sweep_failed", &err.to_string());
    }

    let workflow_ids = match store.with_tx(|tx| tx.daemon_workflow_ids()) {
        Ok(ids) => ids,
        Err(err) => {
            append_runtime_log(paths, "warn", "daemon.tick_query_failed", &err.to_string());
            return;
        }
    };

    for workflow_id in workflow_ids {
        if shutdown_requested(paths) {
            return;
        }
        if !settings.workflow_allowed(&workflow_id) {
            continue;
        }
        let spec = match cache.get_spec(&workflow_id) {
            Ok(spec) => spec,
            Err(err) => {
                append_runtime_log(
                    paths,
                    "warn",
                    "daemon.spec_load_failed",
                    &format!("workflow={workflow_id}: {err}"),
                );
                continue;
            }
        };

        for agent in &spec.agents {
            if shutdown_requested(paths) {
                return;
            }
            let scoped = spec.scoped_agent_id(&agent.id);
            match spawner.peek_and_spawn(&scoped, &spec, SpawnSource::Daemon) {
                Ok(outcome) if outcome.spawned() => append_runtime_log(
                    paths,
                    "info",
                    "daemon.spawned",
                    &format!("workflow={workflow_id} agent={scoped}"),
                ),
                Ok(outcome) => {
                    if outcome.reason() != "no_work" {
                        append_runtime_log(
                            paths,
                            "info",
                            "daemon.spawn_skipped",
                            &format!(
                                "workflow={workflow_id} agent={scoped} reason={}",
                                outcome.reason()
                            ),
                        );
                    }
                }
                Err(err) => append_runtime_log(
                    paths,
                    "warn",
                    "daemon.spawn_failed",
                    &format!("workflow={workflow_id} agent={scoped}: {err}"),
                ),
            }
        }
    }

    let stats = cache.stats();
    append_runtime_log(
        paths,
        "info",
        "daemon.cache_stats",
        &format!(
            "hits={} misses={} size={} hit_rate={:.2}",
            stats.hits, stats.misses, stats.size, stats.hit_rate
        ),
    );
}
