use crate::config::{
    bootstrap_state_root, default_state_root_path, load_settings, Settings, StatePaths,
};
use crate::events::EventJournal;
use crate::pipeline::PipelineEngine;
use crate::store::Store;
use crate::workflow::SpecCache;
use std::path::PathBuf;
use std::sync::Arc;

pub mod cli;
pub mod command_handlers;

/// Everything a command handler needs, wired once per invocation. The
/// explicit bundle (instead of ambient statics) is what lets the tests run
/// against a temp-dir state root.
pub struct AppContext {
    pub paths: StatePaths,
    pub settings: Settings,
    pub store: Arc<Store>,
    pub journal: Arc<EventJournal>,
    pub cache: Arc<SpecCache>,
    pub engine: PipelineEngine,
}

impl AppContext {
    pub fn bootstrap(state_root: Option<PathBuf>) -> Result<Self, String> {
        let root = match state_root {
            Some(root) => root,
            None => default_state_root_path().map_err(|err| err.to_string())?,
        };
        let paths = StatePaths::new(root);
        bootstrap_state_root(&paths).map_err(|err| err.to_string())?;
        let settings = load_settings(&paths).map_err(|err| err.to_string())?;

        let store = Arc::new(Store::open(&paths.db_path()).map_err(|err| err.to_string())?);
        let journal = Arc::new(EventJournal::new(&paths));
        let workflows_dir = settings
            .workflows_dir
            .clone()
            .unwrap_or_else(|| paths.workflows_dir());
        let cache = Arc::new(SpecCache::new(workflows_dir));
        let engine = PipelineEngine::new(store.clone(), journal.clone(), paths.clone());

        Ok(Self {
            paths,
            settings,
            store,
            journal,
            cache,
            engine,
        })
    }
}

/// CLI entry point; returns the process exit code.
pub fn run(args: Vec<String>) -> i32 {
    match cli::dispatch(args) {
        Ok(()) => 0,
        Err(message) => {
            eprintln!("{message}");
            1
        }
    }
}
