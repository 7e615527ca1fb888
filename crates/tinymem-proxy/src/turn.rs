//! The post-turn pipeline: everything that happens after the upstream
//! model has answered.
//!
//! The assistant response is stored in the vault and linked to the
//! episode, its fenced code blocks are extracted and resolved, each
//! resolved block is run through the promotion gates, and the shadow audit
//! is enqueued. The whole path is reconstructible from vault and ledger
//! rows alone.

use tracing::{debug, warn};

use tinymem_audit::AuditRequest;
use tinymem_types::{ArtifactState, Confidence, ContentType, EpisodeId, Result};

use crate::extract::extract_code_blocks;
use crate::AppState;

/// Outcome of a `/v1/user/code` submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserCodeOutcome {
    /// Vault hash of the submitted content.
    pub artifact_hash: String,
    /// Resolved entity, when one was determined.
    pub entity_key: Option<String>,
    /// Resolution confidence.
    pub confidence: String,
    /// Artifact state after the attempt.
    pub state: String,
    /// Whether promotion succeeded.
    pub promoted: bool,
    /// Gate summary or resolution note.
    pub reason: String,
}

/// Store the assistant response, process its code blocks through the
/// resolver and the state machine, and enqueue the shadow audit.
pub async fn process_assistant_response(
    state: &AppState,
    episode_id: EpisodeId,
    user_prompt: &str,
    assistant_text: &str,
) -> Result<()> {
    let response_hash = state
        .vault
        .store(assistant_text.as_bytes(), ContentType::ToolResult, None)
        .await?;
    state
        .ledger
        .update_episode_assistant_response(episode_id, &response_hash)
        .await?;

    let blocks = extract_code_blocks(assistant_text, state.config.extraction_buffer_bytes);
    debug!(episode = %episode_id, blocks = blocks.len(), "extracted code blocks");

    let mut primary_entity: Option<String> = None;
    for block in &blocks {
        let hash = state
            .vault
            .store(block.content.as_bytes(), ContentType::Code, None)
            .await?;
        let resolution = state
            .resolver
            .resolve(&hash, block.content.as_bytes(), block.filepath.as_deref())
            .await?;
        if resolution.entity_key.is_none() {
            continue;
        }
        let outcome = state
            .machine
            .attempt_promotion(episode_id, &resolution, false)
            .await?;
        if primary_entity.is_none() {
            primary_entity = Some(outcome.entity_key.to_string());
        }
        debug!(
            entity = %outcome.entity_key,
            promoted = outcome.promoted,
            "assistant code block processed"
        );
    }

    state.auditor.enqueue(AuditRequest {
        episode_id,
        artifact_hash: response_hash,
        entity_key: primary_entity,
        user_prompt: user_prompt.to_string(),
        assistant_response: assistant_text.to_string(),
    });
    Ok(())
}

/// Ingest a user paste: the write-head path. Gate B is granted by the user
/// rule; Gate A and Gate C are still consulted.
pub async fn ingest_user_code(
    state: &AppState,
    content: &str,
    filepath: Option<&str>,
) -> Result<UserCodeOutcome> {
    let episode_id = state
        .ledger
        .create_episode(
            None,
            None,
            Some(serde_json::json!({"source": "user_code", "is_user_paste": true})),
        )
        .await?;

    let hash = state
        .vault
        .store(content.as_bytes(), ContentType::Code, None)
        .await?;
    let resolution = state
        .resolver
        .resolve(&hash, content.as_bytes(), filepath)
        .await?;

    if resolution.entity_key.is_none() {
        return Ok(UserCodeOutcome {
            artifact_hash: hash,
            entity_key: None,
            confidence: resolution.confidence.as_str().to_string(),
            state: ArtifactState::Proposed.as_str().to_string(),
            promoted: false,
            reason: format!("no entity resolved via {}", resolution.method.as_str()),
        });
    }

    let outcome = state
        .machine
        .attempt_promotion(episode_id, &resolution, true)
        .await?;
    if !outcome.promoted && resolution.confidence == Confidence::Confirmed {
        warn!(entity = %outcome.entity_key, reason = %outcome.reason, "user paste not promoted");
    }
    Ok(UserCodeOutcome {
        artifact_hash: hash,
        entity_key: Some(outcome.entity_key.to_string()),
        confidence: resolution.confidence.as_str().to_string(),
        state: outcome.state.as_str().to_string(),
        promoted: outcome.promoted,
        reason: outcome.reason,
    })
}

/// Reassemble the assistant text from a captured SSE stream: concatenate
/// every `choices[0].delta.content` in `data:` events, ignoring everything
/// else.
pub fn assemble_sse_text(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut assembled = String::new();
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            continue;
        };
        if data == "[DONE]" {
            break;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        if let Some(content) = event
            .pointer("/choices/0/delta/content")
            .and_then(|v| v.as_str())
        {
            assembled.push_str(content);
        }
    }
    (!assembled.is_empty()).then_some(assembled)
}
