use std::sync::atomic::{AtomicU64, Ordering};

static ROW_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifiers end up in file names, SQL rows and session keys, so they
/// are held to a conservative charset. The first offending character is
/// named in the error.
pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    let offender = value
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '-' && *ch != '_');
    match offender {
        None => Ok(()),
        Some(bad) => Err(format!(
            "{kind} contains `{bad}`; only ASCII letters, digits, '-' and '_' are allowed"
        )),
    }
}

/// Opaque, process-unique row identifier with a readable prefix.
pub fn new_row_id(prefix: &str) -> String {
    let counter = ROW_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{prefix}-{}-{}-{counter}",
        crate::shared::time::now_millis(),
        std::process::id()
    )
}

pub fn spawn_nonce() -> String {
    let counter = ROW_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:x}", crate::shared::time::now_millis(), counter)
}
