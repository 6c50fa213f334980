use crate::config::StatePaths;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::append_runtime_log;
use std::fs;
use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum PidError {
    #[error("failed to create daemon path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("daemon is already running with pid {pid}")]
    AlreadyRunning { pid: u32 },
    #[error("no running daemon instance")]
    NotRunning,
    #[error("failed to read pid file {path}: {source}")]
    ReadPid {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write pid file {path}: {source}")]
    WritePid {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn daemon process: {0}")]
    Spawn(String),
    #[error("failed to stop daemon process {pid}; process is still alive")]
    StopFailedAlive { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    NotRunning,
    Running { pid: u32 },
    Stale,
}

/// The pid file is the daemon's singleton token: its content names the
/// owner, and the owner is believed only while that process is alive.
pub fn ownership_state(paths: &StatePaths) -> Result<OwnershipState, PidError> {
    Ok(match read_pid(paths)? {
        None => OwnershipState::NotRunning,
        Some(pid) if is_process_alive(pid) => OwnershipState::Running { pid },
        Some(_) => OwnershipState::Stale,
    })
}

/// Claims the singleton token for the calling process. A live owner wins;
/// a stale token (its process is gone) is replaced. Two concurrent
/// claimants are serialised by the create-new open: the loser surfaces as
/// `AlreadyRunning`.
pub fn acquire(paths: &StatePaths) -> Result<(), PidError> {
    match ownership_state(paths)? {
        OwnershipState::Running { pid } => Err(PidError::AlreadyRunning { pid }),
        OwnershipState::Stale => {
            cleanup_stale(paths);
            claim_fresh(paths)
        }
        OwnershipState::NotRunning => claim_fresh(paths),
    }
}

fn claim_fresh(paths: &StatePaths) -> Result<(), PidError> {
    let path = paths.pid_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PidError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let opened = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path);
    match opened {
        Ok(mut file) => file
            .write_all(std::process::id().to_string().as_bytes())
            .map_err(|source| PidError::WritePid {
                path: path.display().to_string(),
                source,
            }),
        Err(source) if source.kind() == ErrorKind::AlreadyExists => {
            // Another starter won the race between our probe and the open.
            let pid = read_pid(paths)?.unwrap_or(0);
            Err(PidError::AlreadyRunning { pid })
        }
        Err(source) => Err(PidError::WritePid {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Re-points the token at another process (the detached child after a
/// background start).
pub fn write_pid(paths: &StatePaths, pid: u32) -> Result<(), PidError> {
    let path = paths.pid_path();
    atomic_write_file(&path, pid.to_string().as_bytes()).map_err(|source| PidError::WritePid {
        path: path.display().to_string(),
        source,
    })
}

pub fn release(paths: &StatePaths) {
    let _ = fs::remove_file(paths.pid_path());
}

pub fn cleanup_stale(paths: &StatePaths) {
    release(paths);
    let _ = fs::remove_file(paths.stop_signal_path());
}

pub fn read_pid(paths: &StatePaths) -> Result<Option<u32>, PidError> {
    let path = paths.pid_path();
    match fs::read_to_string(&path) {
        Ok(raw) => Ok(raw.trim().parse::<u32>().ok()),
        Err(source) if source.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PidError::ReadPid {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Detaches a child running this binary's hidden `__daemon` mode. The
/// child's stderr is routed into the log directory so startup failures are
/// not lost with the terminal.
pub fn spawn_daemon_process(paths: &StatePaths) -> Result<u32, PidError> {
    let exe = std::env::current_exe().map_err(|err| PidError::Spawn(err.to_string()))?;
    let stderr = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.daemon_stderr_log_path())
        .map(Stdio::from)
        .unwrap_or_else(|_| Stdio::null());
    let child = Command::new(exe)
        .args(["__daemon", "--state-root"])
        .arg(&paths.root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr)
        .spawn()
        .map_err(|err| PidError::Spawn(err.to_string()))?;
    Ok(child.id())
}

pub fn signal_stop(paths: &StatePaths) -> Result<(), PidError> {
    let path = paths.stop_signal_path();
    fs::write(&path, b"stop").map_err(|source| PidError::WritePid {
        path: path.display().to_string(),
        source,
    })
}

/// Stops the running daemon through an escalation ladder: first the
/// cooperative stop file with the caller's full timeout, then TERM, then
/// KILL, each later rung with a short fixed grace window.
pub fn stop_daemon(paths: &StatePaths, timeout: Duration) -> Result<u32, PidError> {
    let pid = match ownership_state(paths)? {
        OwnershipState::Running { pid } => pid,
        OwnershipState::Stale => {
            cleanup_stale(paths);
            return Err(PidError::NotRunning);
        }
        OwnershipState::NotRunning => return Err(PidError::NotRunning),
    };

    signal_stop(paths)?;
    append_runtime_log(paths, "info", "daemon.stop.requested", &format!("pid={pid}"));

    let ladder: [(Option<&str>, Duration); 3] = [
        (None, timeout),
        (Some("TERM"), Duration::from_secs(2)),
        (Some("KILL"), Duration::from_secs(2)),
    ];
    for (signal, grace) in ladder {
        if !is_process_alive(pid) {
            break;
        }
        if let Some(signal) = signal {
            append_runtime_log(
                paths,
                "warn",
                "daemon.stop.escalate",
                &format!("pid={pid} signal={signal}"),
            );
            kill_process(pid, Some(signal));
        }
        let deadline = Instant::now() + grace;
        while is_process_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
    }

    if is_process_alive(pid) {
        append_runtime_log(
            paths,
            "error",
            "daemon.stop.failed",
            &format!("pid={pid} survived the escalation ladder"),
        );
        return Err(PidError::StopFailedAlive { pid });
    }

    cleanup_stale(paths);
    Ok(pid)
}

pub fn is_process_alive(pid: u32) -> bool {
    kill_process(pid, None)
}

/// One wrapper around kill(1) serves both delivery and the `-0` liveness
/// probe; a `None` signal only asks whether the process exists.
fn kill_process(pid: u32, signal: Option<&str>) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        let flag = match signal {
            Some(name) => format!("-{name}"),
            None => "-0".to_string(),
        };
        let pid_arg = pid.to_string();
        Command::new("kill")
            .args([flag.as_str(), pid_arg.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = signal;
        false
    }
}
