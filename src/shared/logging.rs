use crate::config::StatePaths;
use crate::shared::fs_atomic::append_line;
use crate::shared::time::now_secs;

/// Best-effort structured runtime log. Failures are swallowed so logging
/// never disturbs the caller.
pub fn append_runtime_log(paths: &StatePaths, level: &str, event: &str, message: &str) {
    let payload = serde_json::json!({
        "timestamp": now_secs(),
        "level": level,
        "event": event,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };
    let _ = append_line(&paths.runtime_log_path(), &line);
}
