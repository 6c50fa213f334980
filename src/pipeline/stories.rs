use super::PipelineError;
use crate::shared::ids::new_row_id;
use crate::shared::time::now_iso;
use crate::store::stories::DEFAULT_STORY_MAX_RETRIES;
use crate::store::{StoryRecord, StoryStatus, StoreTx};
use serde::Deserialize;
use std::collections::BTreeSet;

pub const MAX_STORIES: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct StoryPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
}

/// The JSON array text following a `STORIES_JSON:` key, up to the next key
/// line or end of output.
pub fn extract_stories_json(output: &str) -> Option<String> {
    let mut collected: Option<Vec<String>> = None;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("STORIES_JSON:") {
            collected = Some(vec![rest.to_string()]);
            continue;
        }
        if let Some(lines) = collected.as_mut() {
            if super::context::is_key_line(line) {
                break;
            }
            lines.push(line.to_string());
        }
    }
    collected.map(|lines| lines.join("\n").trim().to_string())
}

pub fn parse_stories_payload(block: &str) -> Result<Vec<StoryPayload>, PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidStories { reason };

    let payloads: Vec<StoryPayload> = serde_json::from_str(block)
        .map_err(|err| invalid(format!("stories payload is not a JSON array: {err}")))?;

    if payloads.is_empty() {
        return Err(invalid("stories payload is empty".to_string()));
    }
    if payloads.len() > MAX_STORIES {
        return Err(invalid(format!(
            "stories payload has {} entries; the cap is {MAX_STORIES}",
            payloads.len()
        )));
    }

    let mut seen = BTreeSet::new();
    for payload in &payloads {
        if payload.id.trim().is_empty() {
            return Err(invalid("story id must be non-empty".to_string()));
        }
        if payload.title.trim().is_empty() {
            return Err(invalid(format!("story `{}` has no title", payload.id)));
        }
        if payload.description.trim().is_empty() {
            return Err(invalid(format!("story `{}` has no description", payload.id)));
        }
        if payload.acceptance_criteria.is_empty() {
            return Err(invalid(format!(
                "story `{}` has no acceptance criteria",
                payload.id
            )));
        }
        if !seen.insert(payload.id.clone()) {
            return Err(invalid(format!("duplicate story id `{}`", payload.id)));
        }
    }
    Ok(payloads)
}

/// Ingests a validated payload for the run. Idempotent: a run that already
/// has stories is left untouched.
pub(crate) fn ingest_stories(
    tx: &StoreTx<'_>,
    run_id: &str,
    payloads: &[StoryPayload],
) -> Result<usize, PipelineError> {
    if tx.run_has_stories(run_id)? {
        return Ok(0);
    }
    let now = now_iso();
    for (index, payload) in payloads.iter().enumerate() {
        tx.insert_story(&StoryRecord {
            id: new_row_id("story"),
            run_id: run_id.to_string(),
            story_index: index as i64,
            story_id: payload.id.clone(),
            title: payload.title.clone(),
            description: payload.description.clone(),
            acceptance_criteria: payload.acceptance_criteria.clone(),
            status: StoryStatus::Pending,
            output: None,
            retry_count: 0,
            max_retries: DEFAULT_STORY_MAX_RETRIES,
            created_at: now.clone(),
            updated_at: now.clone(),
        })?;
    }
    Ok(payloads.len())
}

/// One story rendered for the `current_story` context value.
pub(crate) fn render_story_block(story: &StoryRecord) -> String {
    let criteria = story
        .acceptance_criteria
        .iter()
        .map(|criterion| format!("- {criterion}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{id}: {title}\n{description}\nAcceptance criteria:\n{criteria}",
        id = story.story_id,
        title = story.title,
        description = story.description,
    )
}
