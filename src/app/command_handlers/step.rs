use crate::app::AppContext;
use std::io::Read;
use std::path::PathBuf;

/// The worker completion protocol: `step complete` takes the output on
/// stdin (never as argv, to avoid quoting hazards), `step fail` takes the
/// reason as an argument.
pub fn handle(state_root: Option<PathBuf>, mut args: Vec<String>) -> Result<(), String> {
    let Some(action) = args.first().cloned() else {
        return Err("usage: antfarm step <complete|fail> <step_db_id> ...".to_string());
    };
    let rest = args.split_off(1);

    match action.as_str() {
        "complete" => complete(state_root, rest),
        "fail" => fail(state_root, rest),
        other => Err(format!("unknown step action `{other}`")),
    }
}

fn complete(state_root: Option<PathBuf>, args: Vec<String>) -> Result<(), String> {
    let Some(step_row_id) = args.first() else {
        return Err("usage: antfarm step complete <step_db_id> < output".to_string());
    };

    let mut output = String::new();
    std::io::stdin()
        .read_to_string(&mut output)
        .map_err(|err| format!("failed to read step output from stdin: {err}"))?;

    let context = AppContext::bootstrap(state_root)?;
    let outcome = context
        .engine
        .complete_step(step_row_id, &output)
        .map_err(|err| err.to_string())?;

    println!(
        "step {step_row_id} completed (advanced={} run_completed={})",
        outcome.advanced, outcome.run_completed
    );
    Ok(())
}

fn fail(state_root: Option<PathBuf>, args: Vec<String>) -> Result<(), String> {
    if args.len() < 2 {
        return Err("usage: antfarm step fail <step_db_id> <error>".to_string());
    }
    let step_row_id = &args[0];
    let error = args[1..].join(" ");

    let context = AppContext::bootstrap(state_root)?;
    let outcome = context
        .engine
        .fail_step(step_row_id, &error)
        .map_err(|err| err.to_string())?;

    println!(
        "step {step_row_id} failed (retrying={} run_failed={})",
        outcome.retrying, outcome.run_failed
    );
    Ok(())
}
