use crate::app::cli::take_switch;
use crate::config::{bootstrap_state_root, default_state_root_path, load_settings, StatePaths};
use crate::daemon::{self, pid, OwnershipState};
use std::path::PathBuf;
use std::time::Duration;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

fn resolve_paths(state_root: Option<PathBuf>) -> Result<StatePaths, String> {
    let root = match state_root {
        Some(root) => root,
        None => default_state_root_path().map_err(|err| err.to_string())?,
    };
    Ok(StatePaths::new(root))
}

pub fn handle(state_root: Option<PathBuf>, mut args: Vec<String>) -> Result<(), String> {
    let Some(action) = args.first().cloned() else {
        return Err("usage: antfarm daemon <start|stop|status>".to_string());
    };
    let mut rest = args.split_off(1);

    match action.as_str() {
        "start" => {
            let foreground = take_switch(&mut rest, "--foreground");
            start(state_root, foreground)
        }
        "stop" => stop(state_root),
        "status" => status(state_root),
        other => Err(format!("unknown daemon action `{other}`")),
    }
}

fn start(state_root: Option<PathBuf>, foreground: bool) -> Result<(), String> {
    let paths = resolve_paths(state_root)?;
    bootstrap_state_root(&paths).map_err(|err| err.to_string())?;

    pid::acquire(&paths).map_err(|err| err.to_string())?;

    if foreground {
        return run_foreground(Some(paths.root));
    }

    match pid::spawn_daemon_process(&paths) {
        Ok(child_pid) => {
            pid::write_pid(&paths, child_pid).map_err(|err| err.to_string())?;
            println!("daemon started with pid {child_pid}");
            Ok(())
        }
        Err(err) => {
            pid::release(&paths);
            Err(err.to_string())
        }
    }
}

/// Shared by `daemon start --foreground` and the hidden `__daemon` mode the
/// detached child runs in.
pub fn run_foreground(state_root: Option<PathBuf>) -> Result<(), String> {
    let paths = resolve_paths(state_root)?;
    bootstrap_state_root(&paths).map_err(|err| err.to_string())?;
    let settings = load_settings(&paths).map_err(|err| err.to_string())?;
    daemon::run_daemon(&paths, &settings).map_err(|err| err.to_string())
}

fn stop(state_root: Option<PathBuf>) -> Result<(), String> {
    let paths = resolve_paths(state_root)?;
    let pid = pid::stop_daemon(&paths, STOP_TIMEOUT).map_err(|err| err.to_string())?;
    println!("daemon (pid {pid}) stopped");
    Ok(())
}

fn status(state_root: Option<PathBuf>) -> Result<(), String> {
    let paths = resolve_paths(state_root)?;
    match pid::ownership_state(&paths).map_err(|err| err.to_string())? {
        OwnershipState::Running { pid } => println!("daemon is running with pid {pid}"),
        OwnershipState::Stale => println!("daemon is not running (stale pid file)"),
        OwnershipState::NotRunning => println!("daemon is not running"),
    }
    Ok(())
}
