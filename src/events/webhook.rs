use super::EventRecord;
use std::time::Duration;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("webhook POST to {url} failed: {reason}")]
    Post { url: String, reason: String },
}

/// Splits a `#auth=<bearer>` fragment off a notify URL. Any fragment is
/// stripped before dispatch; only an `auth=` fragment yields a token.
pub(crate) fn split_auth_fragment(notify_url: &str) -> (&str, Option<&str>) {
    match notify_url.split_once('#') {
        Some((base, fragment)) => (base, fragment.strip_prefix("auth=")),
        None => (notify_url, None),
    }
}

pub(crate) fn post_event(notify_url: &str, record: &EventRecord) -> Result<(), WebhookError> {
    let (url, token) = split_auth_fragment(notify_url);
    let body = serde_json::to_value(record)?;

    let mut request = ureq::post(url)
        .timeout(WEBHOOK_TIMEOUT)
        .set("Content-Type", "application/json");
    if let Some(token) = token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    request.send_json(body).map_err(|err| WebhookError::Post {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    Ok(())
}
