use crate::app::cli::take_flag;
use crate::app::AppContext;
use std::path::PathBuf;

const DEFAULT_TAIL_LIMIT: usize = 50;

pub fn handle(state_root: Option<PathBuf>, mut args: Vec<String>) -> Result<(), String> {
    let Some(action) = args.first().cloned() else {
        return Err("usage: antfarm events tail [--run <run_id>] [--limit <n>]".to_string());
    };
    let mut rest = args.split_off(1);

    match action.as_str() {
        "tail" => {
            let run_filter = take_flag(&mut rest, "--run");
            let limit = take_flag(&mut rest, "--limit")
                .and_then(|raw| raw.parse::<usize>().ok())
                .unwrap_or(DEFAULT_TAIL_LIMIT);
            tail(state_root, run_filter, limit)
        }
        other => Err(format!("unknown events action `{other}`")),
    }
}

fn tail(
    state_root: Option<PathBuf>,
    run_filter: Option<String>,
    limit: usize,
) -> Result<(), String> {
    let context = AppContext::bootstrap(state_root)?;
    let records = match run_filter {
        Some(run_id) => context.journal.by_run(&run_id, limit),
        None => context.journal.recent(limit),
    };

    if records.is_empty() {
        println!("no events");
        return Ok(());
    }
    for record in records {
        let line = serde_json::to_string(&record).map_err(|err| err.to_string())?;
        println!("{line}");
    }
    Ok(())
}
