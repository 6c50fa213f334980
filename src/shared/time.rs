use chrono::{DateTime, SecondsFormat, Utc};

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

/// Seconds elapsed since the given ISO-8601 timestamp; `None` when the
/// timestamp does not parse.
pub fn age_secs(raw: &str) -> Option<i64> {
    parse_iso(raw).map(|ts| (Utc::now() - ts).num_seconds())
}

pub fn iso_secs_ago(seconds: i64) -> String {
    (Utc::now() - chrono::Duration::seconds(seconds)).to_rfc3339_opts(SecondsFormat::Millis, true)
}
