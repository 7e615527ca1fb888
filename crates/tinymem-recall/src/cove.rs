//! The CoVe advisory filter.
//!
//! CoVe asks the configured model to flag recalled candidates it judges
//! irrelevant or hallucination-prone. Its authority is strictly negative
//! and strictly bounded: it may only remove items from the list it was
//! given, batches above the candidate cap pass through unfiltered, and any
//! failure (timeout, transport error, malformed verdict) fails open with
//! the input returned unchanged. Per-project statistics are persisted after
//! every batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use tinymem_store::Store;
use tinymem_types::{Memory, Result, TinyMemError};
use tinymem_upstream::ChatBackend;

/// Tuning for the CoVe filter.
#[derive(Debug, Clone)]
pub struct CoVeConfig {
    /// Master switch; disabled means every batch passes through.
    pub enabled: bool,
    /// Verdicts below this confidence are ignored entirely.
    pub confidence_threshold: f64,
    /// Largest batch the model is asked about; extras pass through.
    pub max_candidates: usize,
    /// Per-batch deadline.
    pub timeout: Duration,
}

impl Default for CoVeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 0.7,
            max_candidates: 20,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    confidence: f64,
}

const SYSTEM_PROMPT: &str = "You screen project-memory snippets before they are injected into a \
coding assistant's context. Given a user query and a numbered list of memory snippets, identify \
snippets that are irrelevant to the query or look like unverified hallucinated claims. Respond \
with only a JSON object: {\"exclude\": [\"<id>\", ...], \"confidence\": <0.0-1.0>}. When unsure, \
exclude nothing.";

/// The advisory filter.
#[derive(Clone)]
pub struct CoVeFilter {
    backend: Arc<dyn ChatBackend>,
    store: Store,
    config: CoVeConfig,
}

impl CoVeFilter {
    /// Build a filter over the given backend and stats store.
    pub fn new(backend: Arc<dyn ChatBackend>, store: Store, config: CoVeConfig) -> Self {
        Self {
            backend,
            store,
            config,
        }
    }

    /// Filter a candidate list. The result is always a subset of the
    /// input; on any failure the input is returned unchanged.
    pub async fn filter(
        &self,
        project_id: &str,
        candidates: Vec<Memory>,
        query: &str,
    ) -> Vec<Memory> {
        if !self.config.enabled || candidates.is_empty() {
            return candidates;
        }

        let cap = self.config.max_candidates.min(candidates.len());
        let (considered, passthrough) = candidates.split_at(cap);

        match self.ask(considered, query).await {
            Ok(verdict) if verdict.confidence >= self.config.confidence_threshold => {
                let kept: Vec<Memory> = considered
                    .iter()
                    .filter(|m| !verdict.exclude.contains(&m.id.to_string()))
                    .cloned()
                    .collect();
                let discarded = considered.len() - kept.len();
                debug!(project_id, discarded, confidence = verdict.confidence, "cove verdict applied");
                self.record_stats(project_id, considered.len(), discarded, verdict.confidence, 0)
                    .await;
                kept.into_iter().chain(passthrough.iter().cloned()).collect()
            }
            Ok(verdict) => {
                debug!(
                    project_id,
                    confidence = verdict.confidence,
                    "cove verdict below threshold, ignored"
                );
                self.record_stats(project_id, considered.len(), 0, verdict.confidence, 0)
                    .await;
                candidates
            }
            Err(e) => {
                warn!(project_id, error = %e, "cove unavailable, failing open");
                self.record_stats(project_id, considered.len(), 0, 0.0, 1).await;
                candidates
            }
        }
    }

    async fn ask(&self, considered: &[Memory], query: &str) -> Result<Verdict> {
        let listing: Vec<serde_json::Value> = considered
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id.to_string(),
                    "kind": m.kind.as_str(),
                    "summary": m.summary,
                })
            })
            .collect();
        let user = format!(
            "Query: {query}\n\nCandidates:\n{}",
            serde_json::to_string_pretty(&listing)?
        );

        let reply = tokio::time::timeout(
            self.config.timeout,
            self.backend.complete_text(SYSTEM_PROMPT, &user),
        )
        .await
        .map_err(|_| TinyMemError::CoVeUnavailable("batch timed out".to_string()))??;

        parse_verdict(&reply)
    }

    async fn record_stats(
        &self,
        project_id: &str,
        evaluated: usize,
        discarded: usize,
        confidence: f64,
        errors: i64,
    ) {
        let result = sqlx::query(
            "INSERT INTO cove_stats (project_id, evaluated, discarded, avg_confidence, errors, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(project_id) DO UPDATE SET
                 evaluated = evaluated + excluded.evaluated,
                 discarded = discarded + excluded.discarded,
                 avg_confidence = (cove_stats.avg_confidence + excluded.avg_confidence) / 2.0,
                 errors = errors + excluded.errors,
                 updated_at = excluded.updated_at",
        )
        .bind(project_id)
        .bind(evaluated as i64)
        .bind(discarded as i64)
        .bind(confidence)
        .bind(errors)
        .bind(Utc::now().to_rfc3339())
        .execute(self.store.writer())
        .await;
        if let Err(e) = result {
            warn!(project_id, error = %e, "failed to persist cove stats");
        }
    }
}

/// Pull the first JSON object out of a model reply and decode it. Models
/// wrap JSON in prose and code fences often enough that this is the
/// contract.
fn parse_verdict(reply: &str) -> Result<Verdict> {
    let start = reply
        .find('{')
        .ok_or_else(|| TinyMemError::CoVeUnavailable("no JSON in reply".to_string()))?;
    let end = reply
        .rfind('}')
        .ok_or_else(|| TinyMemError::CoVeUnavailable("no JSON in reply".to_string()))?;
    serde_json::from_str(&reply[start..=end])
        .map_err(|e| TinyMemError::CoVeUnavailable(format!("bad verdict JSON: {e}")))
}
