use super::command_handlers::{daemon, events, run, step};
use std::path::PathBuf;

const USAGE: &str = "antfarm — multi-agent workflow orchestrator

Usage:
  antfarm run start <workflow_id> <task...> [--notify-url <url>] [--scheduler cron|daemon]
  antfarm run cancel <run_id>
  antfarm run list
  antfarm run show <run_id>
  antfarm step complete <step_db_id>     (output on stdin, KEY: value lines)
  antfarm step fail <step_db_id> <error>
  antfarm daemon start [--foreground]
  antfarm daemon stop
  antfarm daemon status
  antfarm events tail [--run <run_id>] [--limit <n>]";

/// Extracts `--flag value` from an argument list, returning the remainder.
pub(crate) fn take_flag(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let position = args.iter().position(|arg| arg == flag)?;
    if position + 1 >= args.len() {
        return None;
    }
    let value = args.remove(position + 1);
    args.remove(position);
    Some(value)
}

pub(crate) fn take_switch(args: &mut Vec<String>, switch: &str) -> bool {
    match args.iter().position(|arg| arg == switch) {
        Some(position) => {
            args.remove(position);
            true
        }
        None => false,
    }
}

pub fn dispatch(mut args: Vec<String>) -> Result<(), String> {
    let state_root = take_flag(&mut args, "--state-root").map(PathBuf::from);

    let Some(command) = args.first().cloned() else {
        return Err(USAGE.to_string());
    };
    let rest = args.split_off(1);

    match command.as_str() {
        "run" => run::handle(state_root, rest),
        "step" => step::handle(state_root, rest),
        "daemon" => daemon::handle(state_root, rest),
        "events" => events::handle(state_root, rest),
        // Hidden mode exec'd by `daemon start` for the detached child.
        "__daemon" => daemon::run_foreground(state_root),
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            Ok(())
        }
        other => Err(format!("unknown command `{other}`\n\n{USAGE}")),
    }
}
