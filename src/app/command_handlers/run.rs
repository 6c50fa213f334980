use crate::app::cli::take_flag;
use crate::app::AppContext;
use crate::pipeline::PipelineError;
use crate::store::Scheduler;
use std::path::PathBuf;

pub fn handle(state_root: Option<PathBuf>, mut args: Vec<String>) -> Result<(), String> {
    let Some(action) = args.first().cloned() else {
        return Err("usage: antfarm run <start|cancel|list|show> ...".to_string());
    };
    let rest = args.split_off(1);

    match action.as_str() {
        "start" => start(state_root, rest),
        "cancel" => cancel(state_root, rest),
        "list" => list(state_root),
        "show" => show(state_root, rest),
        other => Err(format!("unknown run action `{other}`")),
    }
}

fn start(state_root: Option<PathBuf>, mut args: Vec<String>) -> Result<(), String> {
    let notify_url = take_flag(&mut args, "--notify-url");
    let scheduler = match take_flag(&mut args, "--scheduler") {
        Some(raw) => Scheduler::parse(&raw)
            .map_err(|_| PipelineError::InvalidScheduler { value: raw }.to_string())?,
        None => Scheduler::Daemon,
    };

    if args.len() < 2 {
        return Err("usage: antfarm run start <workflow_id> <task...>".to_string());
    }
    let workflow_id = args.remove(0);
    let task = args.join(" ");

    let context = AppContext::bootstrap(state_root)?;
    let spec = context
        .cache
        .get_spec(&workflow_id)
        .map_err(|err| err.to_string())?;
    let run = context
        .engine
        .start_run(&spec, &task, notify_url, scheduler)
        .map_err(|err| err.to_string())?;

    println!("started run {} (#{})", run.id, run.run_number);
    println!("workflow={} scheduler={}", run.workflow_id, run.scheduler);
    Ok(())
}

fn cancel(state_root: Option<PathBuf>, args: Vec<String>) -> Result<(), String> {
    let Some(run_ref) = args.first() else {
        return Err("usage: antfarm run cancel <run_id>".to_string());
    };
    let context = AppContext::bootstrap(state_root)?;
    let run = context
        .store
        .with_tx(|tx| tx.run_by_prefix(run_ref))
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("run `{run_ref}` was not found"))?;

    let cancelled = context
        .engine
        .cancel_run(&run.id)
        .map_err(|err| err.to_string())?;
    if cancelled {
        println!("cancelled run {}", run.id);
    } else {
        println!("run {} is already terminal ({})", run.id, run.status);
    }
    Ok(())
}

fn list(state_root: Option<PathBuf>) -> Result<(), String> {
    let context = AppContext::bootstrap(state_root)?;
    let runs = context
        .store
        .with_tx(|tx| tx.list_runs(50))
        .map_err(|err| err.to_string())?;

    if runs.is_empty() {
        println!("no runs");
        return Ok(());
    }
    for run in runs {
        println!(
            "#{:<4} {:<10} {:<12} {:<8} {}",
            run.run_number, run.status, run.workflow_id, run.scheduler, run.id
        );
    }
    Ok(())
}

fn show(state_root: Option<PathBuf>, args: Vec<String>) -> Result<(), String> {
    let Some(run_ref) = args.first() else {
        return Err("usage: antfarm run show <run_id>".to_string());
    };
    let context = AppContext::bootstrap(state_root)?;

    let run = context
        .store
        .with_tx(|tx| tx.run_by_prefix(run_ref))
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("run `{run_ref}` was not found"))?;
    let steps = context
        .store
        .with_tx(|tx| tx.steps_for_run(&run.id))
        .map_err(|err| err.to_string())?;
    let stories = context
        .store
        .with_tx(|tx| tx.stories_for_run(&run.id))
        .map_err(|err| err.to_string())?;

    println!("run {} (#{})", run.id, run.run_number);
    println!(
        "workflow={} status={} scheduler={}",
        run.workflow_id, run.status, run.scheduler
    );
    println!("task: {}", run.task);
    println!("steps:");
    for step in steps {
        let story_marker = step
            .current_story_id
            .as_deref()
            .map(|story| format!(" story={story}"))
            .unwrap_or_default();
        println!(
            "  [{}] {:<10} {:<20} agent={} retries={}/{}{}",
            step.step_index,
            step.status,
            step.step_id,
            step.agent_id,
            step.retry_count,
            step.max_retries,
            story_marker
        );
    }
    if !stories.is_empty() {
        println!("stories:");
        for story in stories {
            println!(
                "  [{}] {:<10} {:<12} {}",
                story.story_index, story.status, story.story_id, story.title
            );
        }
    }
    Ok(())
}
