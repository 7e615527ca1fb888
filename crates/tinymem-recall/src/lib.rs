#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-recall** – Assemble a bounded, tiered slice of project memory.
//!
//! Recall is lexical, not semantic: always-tier memories come first up to a
//! fraction of the token budget, contextual-tier memories are scored by
//! FTS5 match / classification match / recency, and opportunistic-tier
//! memories fill whatever budget remains. Superseded rows are excluded at
//! every step, dormant incomplete tasks are withheld unless the query asks
//! to continue, and the optional CoVe filter may drop, never add, before
//! the slice is returned. The whole operation runs under a deadline and
//! fails open to an empty slice.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::Row;
use tracing::{debug, warn};

use tinymem_store::Store;
use tinymem_types::{
    estimate_tokens, parse_timestamp, Memory, RecallTier, Result, TinyMemError,
};

pub mod cove;
pub mod tasks;

pub use cove::{CoVeConfig, CoVeFilter};
pub use tasks::{TaskFile, TaskGuard};

/// Tuning for the recall engine.
#[derive(Debug, Clone)]
pub struct RecallConfig {
    /// Hard cap on returned items.
    pub max_items: usize,
    /// Hard cap on the summed token weight.
    pub max_tokens: i64,
    /// Fraction of the token budget reserved for the always tier.
    pub always_tier_fraction: f64,
    /// Deadline for the whole recall; overruns fail open to empty.
    pub timeout: Duration,
    /// Whether to write a `recall_metrics` row per call.
    pub metrics_enabled: bool,
    /// A task untouched for this many hours is dormant.
    pub dormant_after_hours: i64,
    /// Location of the project's task file, when one exists.
    pub tasks_path: Option<PathBuf>,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            max_items: 20,
            max_tokens: 2048,
            always_tier_fraction: 0.5,
            timeout: Duration::from_secs(5),
            metrics_enabled: false,
            dormant_after_hours: 168,
            tasks_path: None,
        }
    }
}

/// The assembled slice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecallOutcome {
    /// Selected memories in injection order.
    pub memories: Vec<Memory>,
    /// Summed token weight of the selection.
    pub total_tokens: i64,
}

impl RecallOutcome {
    /// Render the slice as one system-message block. Empty renders nothing.
    pub fn render_block(&self) -> Option<String> {
        if self.memories.is_empty() {
            return None;
        }
        let mut block = String::from("Project memory (evidence-weighted; facts are verified):\n");
        for memory in &self.memories {
            block.push_str(&format!(
                "- [{}|{}] {}",
                memory.kind.as_str(),
                memory.truth_state.as_str(),
                memory.summary
            ));
            if !memory.detail.is_empty() {
                block.push_str(&format!(": {}", memory.detail));
            }
            block.push('\n');
        }
        Some(block)
    }
}

/// The recall engine.
#[derive(Clone)]
pub struct RecallEngine {
    store: Store,
    config: RecallConfig,
    cove: Option<CoVeFilter>,
}

impl RecallEngine {
    /// Build over the shared store. Pass a [`CoVeFilter`] to enable the
    /// advisory pass on recall results.
    pub fn new(store: Store, config: RecallConfig, cove: Option<CoVeFilter>) -> Self {
        Self {
            store,
            config,
            cove,
        }
    }

    /// Assemble a slice for `query`. `query_type` labels the metrics row.
    pub async fn recall(
        &self,
        project_id: &str,
        query: &str,
        query_type: &str,
    ) -> Result<RecallOutcome> {
        let started = Instant::now();
        let assembled =
            match tokio::time::timeout(self.config.timeout, self.assemble(project_id, query))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    warn!(project_id, "recall deadline exceeded, failing open to empty");
                    RecallOutcome::default()
                }
            };

        let outcome = match &self.cove {
            Some(filter) if !assembled.memories.is_empty() => {
                let filtered = filter
                    .filter(project_id, assembled.memories, query)
                    .await;
                let total_tokens = filtered.iter().map(memory_tokens).sum();
                RecallOutcome {
                    memories: filtered,
                    total_tokens,
                }
            }
            _ => assembled,
        };

        if self.config.metrics_enabled {
            self.record_metric(project_id, query_type, &outcome, started.elapsed())
                .await;
        }
        Ok(outcome)
    }

    async fn assemble(&self, project_id: &str, query: &str) -> Result<RecallOutcome> {
        let guard = TaskGuard::new(
            chrono::Duration::hours(self.config.dormant_after_hours),
            match &self.config.tasks_path {
                Some(path) => TaskFile::load(path).await,
                None => TaskFile::default(),
            },
        );
        let continuation = TaskGuard::query_requests_continuation(query);
        let now = Utc::now();

        let mut outcome = RecallOutcome::default();
        let always_budget =
            (self.config.max_tokens as f64 * self.config.always_tier_fraction) as i64;

        // 1. Always tier, inside its budget fraction.
        for memory in self.tier_members(project_id, RecallTier::Always).await? {
            if outcome.memories.len() >= self.config.max_items {
                break;
            }
            if !continuation && guard.withholds(&memory, now) {
                continue;
            }
            let tokens = memory_tokens(&memory);
            if outcome.total_tokens + tokens > always_budget {
                continue;
            }
            outcome.total_tokens += tokens;
            outcome.memories.push(memory);
        }

        // 2. Contextual tier, scored against the query.
        let contextual = self
            .scored_matches(project_id, query, RecallTier::Contextual)
            .await?;
        self.fill(&mut outcome, contextual, &guard, continuation, now);

        // 3. Opportunistic tier: matches first, then the rest by recency.
        let mut opportunistic = self
            .scored_matches(project_id, query, RecallTier::Opportunistic)
            .await?;
        let matched_ids: Vec<_> = opportunistic.iter().map(|m| m.id).collect();
        for memory in self
            .tier_members(project_id, RecallTier::Opportunistic)
            .await?
        {
            if !matched_ids.contains(&memory.id) {
                opportunistic.push(memory);
            }
        }
        self.fill(&mut outcome, opportunistic, &guard, continuation, now);

        debug!(
            project_id,
            items = outcome.memories.len(),
            tokens = outcome.total_tokens,
            "recall assembled"
        );
        Ok(outcome)
    }

    fn fill(
        &self,
        outcome: &mut RecallOutcome,
        candidates: Vec<Memory>,
        guard: &TaskGuard,
        continuation: bool,
        now: chrono::DateTime<Utc>,
    ) {
        for memory in candidates {
            if outcome.memories.len() >= self.config.max_items {
                break;
            }
            if outcome.memories.iter().any(|m| m.id == memory.id) {
                continue;
            }
            if !continuation && guard.withholds(&memory, now) {
                continue;
            }
            let tokens = memory_tokens(&memory);
            if outcome.total_tokens + tokens > self.config.max_tokens {
                continue;
            }
            outcome.total_tokens += tokens;
            outcome.memories.push(memory);
        }
    }

    /// Live members of one tier, newest first.
    async fn tier_members(&self, project_id: &str, tier: RecallTier) -> Result<Vec<Memory>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE project_id = ? AND superseded_by IS NULL AND recall_tier = ?
             ORDER BY updated_at DESC, id"
        ))
        .bind(project_id)
        .bind(tier.as_str())
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_memory).collect()
    }

    /// FTS matches within one tier, ordered by classification-in-query,
    /// then FTS rank, then recency.
    async fn scored_matches(
        &self,
        project_id: &str,
        query: &str,
        tier: RecallTier,
    ) -> Result<Vec<Memory>> {
        let tokens: Vec<String> = query
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let rows = sqlx::query(&format!(
            "SELECT {prefixed}, memories_fts.rank AS fts_rank FROM memories_fts
             JOIN memories m ON m.rowid = memories_fts.rowid
             WHERE memories_fts MATCH ? AND m.project_id = ? AND m.superseded_by IS NULL
               AND m.recall_tier = ?
             ORDER BY memories_fts.rank",
            prefixed = MEMORY_COLUMNS_PREFIXED
        ))
        .bind(&match_expr)
        .bind(project_id)
        .bind(tier.as_str())
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;

        let query_lower = query.to_lowercase();
        let mut scored: Vec<(bool, f64, Memory)> = rows
            .into_iter()
            .map(|row| {
                let rank: f64 = row.get("fts_rank");
                let memory = decode_memory(row)?;
                let classified = memory
                    .classification
                    .as_deref()
                    .map(|c| query_lower.contains(&c.to_lowercase()))
                    .unwrap_or(false);
                Ok((classified, rank, memory))
            })
            .collect::<Result<_>>()?;
        scored.sort_by(|(ca, ra, ma), (cb, rb, mb)| {
            cb.cmp(ca)
                .then(ra.partial_cmp(rb).unwrap_or(std::cmp::Ordering::Equal))
                .then(mb.updated_at.cmp(&ma.updated_at))
        });
        Ok(scored.into_iter().map(|(_, _, m)| m).collect())
    }

    async fn record_metric(
        &self,
        project_id: &str,
        query_type: &str,
        outcome: &RecallOutcome,
        elapsed: Duration,
    ) {
        let ids: Vec<String> = outcome.memories.iter().map(|m| m.id.to_string()).collect();
        let result = sqlx::query(
            "INSERT INTO recall_metrics
             (created_at, project_id, query_type, memory_count, memory_ids, total_tokens, duration_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(project_id)
        .bind(query_type)
        .bind(outcome.memories.len() as i64)
        .bind(serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string()))
        .bind(outcome.total_tokens)
        .bind(elapsed.as_millis() as i64)
        .execute(self.store.writer())
        .await;
        if let Err(e) = result {
            warn!(project_id, error = %e, "failed to persist recall metric");
        }
    }
}

fn memory_tokens(memory: &Memory) -> i64 {
    estimate_tokens(memory.summary.as_bytes()) + estimate_tokens(memory.detail.as_bytes())
}

const MEMORY_COLUMNS: &str = "id, project_id, kind, summary, detail, key, source, recall_tier, \
                              truth_state, classification, created_at, updated_at, superseded_by";

const MEMORY_COLUMNS_PREFIXED: &str =
    "m.id, m.project_id, m.kind, m.summary, m.detail, m.key, m.source, m.recall_tier, \
     m.truth_state, m.classification, m.created_at, m.updated_at, m.superseded_by";

fn decode_memory(row: sqlx::sqlite::SqliteRow) -> Result<Memory> {
    let id: String = row.get("id");
    let kind: String = row.get("kind");
    let recall_tier: String = row.get("recall_tier");
    let truth_state: String = row.get("truth_state");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let superseded_by: Option<String> = row.get("superseded_by");
    Ok(Memory {
        id: id
            .parse()
            .map_err(|e| TinyMemError::Corrupt(format!("bad memory id {id}: {e}")))?,
        project_id: row.get("project_id"),
        kind: kind.parse()?,
        summary: row.get("summary"),
        detail: row.get("detail"),
        key: row.get("key"),
        source: row.get("source"),
        recall_tier: recall_tier.parse()?,
        truth_state: truth_state.parse()?,
        classification: row.get("classification"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        superseded_by: superseded_by
            .map(|s| {
                s.parse()
                    .map_err(|e| TinyMemError::Corrupt(format!("bad superseded_by {s}: {e}")))
            })
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinymem_memory::{MemoryService, NewMemory};
    use tinymem_types::MemoryKind;

    async fn fixtures() -> (Store, MemoryService) {
        let store = Store::in_memory().await.unwrap();
        (store.clone(), MemoryService::new(store))
    }

    fn engine(store: &Store, config: RecallConfig) -> RecallEngine {
        RecallEngine::new(store.clone(), config, None)
    }

    #[tokio::test]
    async fn always_tier_leads_the_slice() {
        let (store, service) = fixtures().await;
        service
            .create(NewMemory::new("proj", MemoryKind::Constraint, "never push to main"))
            .await
            .unwrap();
        service
            .create(NewMemory::new("proj", MemoryKind::Note, "main branch has CI"))
            .await
            .unwrap();

        let outcome = engine(&store, RecallConfig::default())
            .recall("proj", "main", "test")
            .await
            .unwrap();

        assert_eq!(outcome.memories[0].kind, MemoryKind::Constraint);
        assert_eq!(outcome.memories.len(), 2);
        assert!(outcome.total_tokens > 0);
    }

    #[tokio::test]
    async fn superseded_rows_never_surface() {
        let (store, service) = fixtures().await;
        service
            .create(NewMemory::new("proj", MemoryKind::Note, "old port value").with_key("port"))
            .await
            .unwrap();
        let live = service
            .create(NewMemory::new("proj", MemoryKind::Note, "new port value").with_key("port"))
            .await
            .unwrap();

        let outcome = engine(&store, RecallConfig::default())
            .recall("proj", "port value", "test")
            .await
            .unwrap();

        assert_eq!(outcome.memories.len(), 1);
        assert_eq!(outcome.memories[0].id, live.id);
    }

    #[tokio::test]
    async fn budgets_bound_the_slice() {
        let (store, service) = fixtures().await;
        for i in 0..10 {
            service
                .create(NewMemory::new(
                    "proj",
                    MemoryKind::Note,
                    format!("note number {i} about recall budgeting behavior"),
                ))
                .await
                .unwrap();
        }

        let by_items = engine(
            &store,
            RecallConfig {
                max_items: 3,
                ..RecallConfig::default()
            },
        )
        .recall("proj", "recall budgeting", "test")
        .await
        .unwrap();
        assert_eq!(by_items.memories.len(), 3);

        let by_tokens = engine(
            &store,
            RecallConfig {
                max_tokens: 25,
                ..RecallConfig::default()
            },
        )
        .recall("proj", "recall budgeting", "test")
        .await
        .unwrap();
        assert!(by_tokens.total_tokens <= 25);
    }

    #[tokio::test]
    async fn classification_match_outranks_plain_matches() {
        let (store, service) = fixtures().await;
        service
            .create(NewMemory::new("proj", MemoryKind::Decision, "we chose sqlite for storage"))
            .await
            .unwrap();
        let classified = service
            .create(
                NewMemory::new("proj", MemoryKind::Decision, "sqlite runs in WAL mode")
                    .with_classification("storage"),
            )
            .await
            .unwrap();

        let outcome = engine(&store, RecallConfig::default())
            .recall("proj", "how is storage sqlite set up", "test")
            .await
            .unwrap();

        let contextual: Vec<_> = outcome
            .memories
            .iter()
            .filter(|m| m.recall_tier == RecallTier::Contextual)
            .collect();
        assert_eq!(contextual[0].id, classified.id);
    }

    #[tokio::test]
    async fn dormant_tasks_are_withheld_without_continuation() {
        let (store, service) = fixtures().await;
        let task = service
            .create(NewMemory::new("proj", MemoryKind::Task, "migrate the billing tables"))
            .await
            .unwrap();
        // Age the task past the dormancy window.
        sqlx::query("UPDATE memories SET updated_at = '2020-01-01T00:00:00+00:00' WHERE id = ?")
            .bind(task.id.to_string())
            .execute(store.writer())
            .await
            .unwrap();

        let engine = engine(
            &store,
            RecallConfig {
                dormant_after_hours: 24,
                ..RecallConfig::default()
            },
        );

        let plain = engine.recall("proj", "billing tables", "test").await.unwrap();
        assert!(plain.memories.is_empty());

        let continued = engine
            .recall("proj", "resume the billing tables migration", "test")
            .await
            .unwrap();
        assert_eq!(continued.memories.len(), 1);
    }

    #[tokio::test]
    async fn metrics_row_is_written_when_enabled() {
        let (store, service) = fixtures().await;
        service
            .create(NewMemory::new("proj", MemoryKind::Note, "something to find"))
            .await
            .unwrap();

        engine(
            &store,
            RecallConfig {
                metrics_enabled: true,
                ..RecallConfig::default()
            },
        )
        .recall("proj", "something", "chat")
        .await
        .unwrap();

        let row = sqlx::query(
            "SELECT query_type, memory_count FROM recall_metrics WHERE project_id = 'proj'",
        )
        .fetch_one(store.reader())
        .await
        .unwrap();
        assert_eq!(row.get::<String, _>("query_type"), "chat");
        assert_eq!(row.get::<i64, _>("memory_count"), 1);
    }

    #[tokio::test]
    async fn empty_query_still_serves_the_always_tier() {
        let (store, service) = fixtures().await;
        service
            .create(NewMemory::new("proj", MemoryKind::Constraint, "stay on rust 1.75"))
            .await
            .unwrap();

        let outcome = engine(&store, RecallConfig::default())
            .recall("proj", "", "test")
            .await
            .unwrap();
        assert_eq!(outcome.memories.len(), 1);
    }
}
