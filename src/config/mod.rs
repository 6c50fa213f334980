use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_ROOT_DIR: &str = ".antfarm";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to resolve home directory for state root")]
    HomeDirectoryUnavailable,
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to create state path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub workflows_dir: Option<PathBuf>,
    /// Workflow allow-list for the daemon; empty means every workflow with
    /// daemon-scheduled runs is eligible.
    #[serde(default)]
    pub allowed_workflows: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            poll_interval_ms: default_poll_interval_ms(),
            workflows_dir: None,
            allowed_workflows: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Poll interval with the daemon floor applied.
    pub fn effective_poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS)
    }

    pub fn workflow_allowed(&self, workflow_id: &str) -> bool {
        self.allowed_workflows.is_empty()
            || self.allowed_workflows.iter().any(|id| id == workflow_id)
    }
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.root.join("daemon"),
            self.root.join("events"),
            self.root.join("logs"),
            self.root.join("progress"),
            self.root.join("workflows"),
        ]
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("antfarm.db")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join("events/journal.jsonl")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.root.join("logs/runtime.log")
    }

    pub fn daemon_stderr_log_path(&self) -> PathBuf {
        self.root.join("logs/daemon.err")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.daemon_dir().join("antfarm.pid")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.daemon_dir().join("stop")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    pub fn progress_path(&self, workflow_id: &str) -> PathBuf {
        self.root.join("progress").join(format!("{workflow_id}.md"))
    }

    pub fn progress_archive_path(&self, workflow_id: &str, run_number: i64) -> PathBuf {
        self.root
            .join("progress/archive")
            .join(format!("{workflow_id}-run{run_number}.md"))
    }
}

pub fn default_state_root_path() -> Result<PathBuf, ConfigError> {
    if let Some(root) = std::env::var_os("ANTFARM_STATE_ROOT") {
        return Ok(PathBuf::from(root));
    }
    let home = std::env::var_os("HOME").ok_or(ConfigError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_ROOT_DIR))
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), ConfigError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| ConfigError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Settings from `<state>/config.yaml`; a missing file yields defaults.
pub fn load_settings(paths: &StatePaths) -> Result<Settings, ConfigError> {
    let path = paths.settings_file();
    if !path.exists() {
        return Ok(Settings::default());
    }
    Settings::from_path(&path)
}
