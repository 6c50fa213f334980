use crate::config::StatePaths;
use crate::store::runs::Context;
use crate::store::RunRecord;
use std::fs;
use std::process::Command;

/// Key token that introduces a stories payload; never merged into context.
pub const STORIES_KEY: &str = "STORIES_JSON";

/// A line at column 0 matching `^[A-Z_]+:` starts a new key; everything up
/// to the next key line (or end of output) is the value.
pub(crate) fn is_key_line(line: &str) -> bool {
    match_key_line(line).is_some()
}

fn match_key_line(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    if colon == 0 {
        return None;
    }
    let key = &line[..colon];
    if !key.chars().all(|ch| ch.is_ascii_uppercase() || ch == '_') {
        return None;
    }
    Some((key, &line[colon + 1..]))
}

/// Parses worker output into `(KEY, value)` pairs. Keys keep their original
/// casing; multi-line values are newline-joined and trimmed.
pub fn parse_key_values(output: &str) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;

    for line in output.lines() {
        if let Some((key, rest)) = match_key_line(line) {
            if let Some((done_key, lines)) = current.take() {
                entries.push((done_key, lines.join("\n").trim().to_string()));
            }
            current = Some((key.to_string(), vec![rest.to_string()]));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line.to_string());
        }
    }
    if let Some((done_key, lines)) = current.take() {
        entries.push((done_key, lines.join("\n").trim().to_string()));
    }
    entries
}

/// Merges parsed output into the run context: keys lowercased, values
/// trimmed, `STORIES_JSON` excluded.
pub fn merge_output_into_context(context: &mut Context, output: &str) {
    for (key, value) in parse_key_values(output) {
        if key == STORIES_KEY {
            continue;
        }
        context.insert(key.to_ascii_lowercase(), value);
    }
}

/// Renders `{{name}}` placeholders from the value map. Unknown names render
/// as the literal `[missing: name]`; malformed placeholders pass through
/// untouched.
pub fn interpolate(template: &str, values: &Context) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 2..];
        let Some(close) = tail.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = tail[..close].trim();
        let well_formed = !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
        if !well_formed {
            out.push_str(&rest[open..open + 2 + close + 2]);
        } else {
            match values.get(name) {
                Some(value) => out.push_str(value),
                None => out.push_str(&format!("[missing: {name}]")),
            }
        }
        rest = &tail[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Run context plus the derived values every template may rely on.
pub fn augmented_context(run: &RunRecord, paths: &StatePaths, run_has_stories: bool) -> Context {
    let mut values = run.context.clone();
    values.insert("run_id".to_string(), run.id.clone());
    values
        .entry("task".to_string())
        .or_insert_with(|| run.task.clone());

    if let (Some(repo), Some(branch)) = (values.get("repo").cloned(), values.get("branch").cloned())
    {
        values.insert(
            "has_frontend_changes".to_string(),
            has_frontend_changes(&repo, &branch).to_string(),
        );
    }
    if run_has_stories {
        if let Some(progress) = read_progress(paths, &run.workflow_id) {
            values.insert("progress".to_string(), progress);
        }
    }
    values
}

pub fn resolve_input(
    template: &str,
    run: &RunRecord,
    paths: &StatePaths,
    run_has_stories: bool,
) -> String {
    interpolate(template, &augmented_context(run, paths, run_has_stories))
}

pub fn read_progress(paths: &StatePaths, workflow_id: &str) -> Option<String> {
    let raw = fs::read_to_string(paths.progress_path(workflow_id)).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

const FRONTEND_EXTENSIONS: &[&str] = &[".tsx", ".jsx", ".css", ".scss", ".html", ".vue"];
const FRONTEND_DIRS: &[&str] = &["frontend/", "ui/", "web/"];

/// Best-effort git-diff heuristic against `main`; any failure reads as no
/// frontend changes.
pub fn has_frontend_changes(repo: &str, branch: &str) -> bool {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .arg("diff")
        .arg("--name-only")
        .arg(format!("main...{branch}"))
        .output();
    let Ok(output) = output else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    String::from_utf8_lossy(&output.stdout).lines().any(|path| {
        let path = path.trim();
        FRONTEND_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
            || FRONTEND_DIRS.iter().any(|dir| path.starts_with(dir))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_values_accumulate_until_the_next_key() {
        let parsed = parse_key_values("STATUS: done\nNOTES: first line\nsecond line\nTESTS: -\n");
        assert_eq!(
            parsed,
            vec![
                ("STATUS".to_string(), "done".to_string()),
                ("NOTES".to_string(), "first line\nsecond line".to_string()),
                ("TESTS".to_string(), "-".to_string()),
            ]
        );
    }

    #[test]
    fn lowercase_and_mixed_prefixes_are_not_keys() {
        let parsed = parse_key_values("Status: nope\nSTATUS: done\nhttp://x: nope");
        assert_eq!(parsed, vec![("STATUS".to_string(), "done".to_string())]);
    }

    #[test]
    fn merge_lowercases_keys_and_skips_stories_json() {
        let mut context = Context::new();
        merge_output_into_context(
            &mut context,
            "STATUS: done\nSTORIES_JSON: [{\"id\":\"s1\"}]\nCHANGES: -",
        );
        assert_eq!(context.get("status").map(String::as_str), Some("done"));
        assert_eq!(context.get("changes").map(String::as_str), Some("-"));
        assert!(!context.contains_key("stories_json"));
    }

    #[test]
    fn parse_then_merge_is_stable_under_reemission() {
        let output = "STATUS: done\nNOTES: alpha\nbeta";
        let mut first = Context::new();
        merge_output_into_context(&mut first, output);
        let reemitted = first
            .iter()
            .map(|(key, value)| format!("{}: {value}", key.to_ascii_uppercase()))
            .collect::<Vec<_>>()
            .join("\n");
        let mut second = Context::new();
        merge_output_into_context(&mut second, &reemitted);
        assert_eq!(first, second);
    }

    #[test]
    fn interpolation_renders_missing_keys_literally() {
        let mut values = Context::new();
        values.insert("task".to_string(), "ship it".to_string());
        values.insert("repo.url".to_string(), "git@example:repo".to_string());
        assert_eq!(
            interpolate("Do {{task}} at {{repo.url}} ({{absent}})", &values),
            "Do ship it at git@example:repo ([missing: absent])"
        );
    }

    #[test]
    fn malformed_placeholders_pass_through() {
        let values = Context::new();
        assert_eq!(interpolate("a {{ not closed", &values), "a {{ not closed");
        assert_eq!(interpolate("b {{bad key}} c", &values), "b {{bad key}} c");
    }
}
