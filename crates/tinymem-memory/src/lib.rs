#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-memory** – Typed project memories with evidence-gated facts.
//!
//! A memory is a typed note scoped to a project: fact, claim, plan,
//! decision, constraint, observation, note, or task. The load-bearing rule
//! lives here: a row of kind `fact` cannot come into existence without at
//! least one evidence predicate verified true, and the storage layer
//! enforces that on every path. The two legal routes to a fact are
//! [`MemoryService::create_fact_with_evidence`], which runs the verifier
//! inside the insert transaction, and [`MemoryService::promote_to_fact`],
//! which requires prior verified evidence on the row.
//!
//! Supersession, not deletion: writing a new fact/decision/constraint (or
//! reusing a key) marks the displaced row with `superseded_by`, which
//! excludes it from search and recall forever after.

use chrono::Utc;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use tinymem_store::Store;
use tinymem_types::{
    parse_timestamp, Evidence, EvidencePredicate, Memory, MemoryId, MemoryKind, RecallTier,
    Result, TinyMemError, TruthState, MAX_SUMMARY_LEN,
};

pub mod verifier;

pub use verifier::{EvidenceVerifier, VerifierConfig};

/// Kinds whose arrival supersedes an identical-summary sibling.
const SUPERSEDING_KINDS: [MemoryKind; 3] =
    [MemoryKind::Fact, MemoryKind::Decision, MemoryKind::Constraint];

/// Input payload for a new memory. Tier and truth state fall back to the
/// kind's defaults when unset.
#[derive(Debug, Clone)]
pub struct NewMemory {
    /// Project scope.
    pub project_id: String,
    /// Typed category.
    pub kind: MemoryKind,
    /// One-line summary.
    pub summary: String,
    /// Longer body.
    pub detail: String,
    /// Optional stable key, unique per project among live rows.
    pub key: Option<String>,
    /// Optional provenance note.
    pub source: Option<String>,
    /// Explicit tier, or the kind default.
    pub recall_tier: Option<RecallTier>,
    /// Explicit truth state, or the kind default.
    pub truth_state: Option<TruthState>,
    /// Optional classification label.
    pub classification: Option<String>,
}

impl NewMemory {
    /// A new memory payload with everything optional left unset.
    pub fn new(
        project_id: impl Into<String>,
        kind: MemoryKind,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            kind,
            summary: summary.into(),
            detail: String::new(),
            key: None,
            source: None,
            recall_tier: None,
            truth_state: None,
            classification: None,
        }
    }

    /// Set the detail body.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Set the stable key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the classification label.
    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    fn into_memory(self) -> Result<Memory> {
        if self.summary.trim().is_empty() {
            return Err(TinyMemError::storage("memory summary required"));
        }
        if self.summary.len() > MAX_SUMMARY_LEN {
            return Err(TinyMemError::storage(format!(
                "memory summary exceeds {MAX_SUMMARY_LEN} bytes"
            )));
        }
        let now = Utc::now();
        Ok(Memory {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            kind: self.kind,
            summary: self.summary,
            detail: self.detail,
            key: self.key,
            source: self.source,
            recall_tier: self.recall_tier.unwrap_or_else(|| self.kind.default_tier()),
            truth_state: self
                .truth_state
                .unwrap_or_else(|| self.kind.default_truth_state()),
            classification: self.classification,
            created_at: now,
            updated_at: now,
            superseded_by: None,
        })
    }
}

/// The memory service.
#[derive(Debug, Clone)]
pub struct MemoryService {
    store: Store,
}

impl MemoryService {
    /// Wrap the shared store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a non-fact memory. A `fact` payload is refused with
    /// [`TinyMemError::FactRequiresEvidence`]; use
    /// [`Self::create_fact_with_evidence`] instead.
    pub async fn create(&self, new: NewMemory) -> Result<Memory> {
        if new.kind == MemoryKind::Fact {
            return Err(TinyMemError::FactRequiresEvidence);
        }
        let memory = new.into_memory()?;

        let mut tx = self.store.tx().await?;
        insert_memory(&mut tx, &memory).await?;
        let displaced = supersede_conflicts(&mut tx, &memory).await?;
        tx.commit().await.map_err(TinyMemError::storage)?;
        if displaced > 0 {
            debug!(id = %memory.id, displaced, "memory superseded older rows");
        }
        Ok(memory)
    }

    /// Update a memory's content fields. Fact rows are immutable through
    /// this path, and no update may turn a row into a fact.
    pub async fn update(&self, memory: &Memory) -> Result<()> {
        if memory.kind == MemoryKind::Fact {
            return Err(TinyMemError::FactRequiresEvidence);
        }
        let existing = self
            .get(memory.id, &memory.project_id)
            .await?
            .ok_or_else(|| TinyMemError::storage(format!("unknown memory {}", memory.id)))?;
        if existing.kind == MemoryKind::Fact {
            return Err(TinyMemError::FactRequiresEvidence);
        }

        sqlx::query(
            "UPDATE memories SET kind = ?, summary = ?, detail = ?, key = ?, source = ?,
             recall_tier = ?, truth_state = ?, classification = ?, updated_at = ?
             WHERE id = ? AND project_id = ?",
        )
        .bind(memory.kind.as_str())
        .bind(&memory.summary)
        .bind(&memory.detail)
        .bind(&memory.key)
        .bind(&memory.source)
        .bind(memory.recall_tier.as_str())
        .bind(memory.truth_state.as_str())
        .bind(&memory.classification)
        .bind(Utc::now().to_rfc3339())
        .bind(memory.id.to_string())
        .bind(&memory.project_id)
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;
        Ok(())
    }

    /// Create a fact, transactionally verifying every evidence predicate.
    /// On any unverified predicate the transaction rolls back and no fact
    /// row (and no evidence row) exists.
    pub async fn create_fact_with_evidence(
        &self,
        new: NewMemory,
        predicates: &[EvidencePredicate],
        verifier: &EvidenceVerifier,
    ) -> Result<Memory> {
        if predicates.is_empty() {
            return Err(TinyMemError::FactRequiresEvidence);
        }
        let mut payload = new;
        payload.kind = MemoryKind::Fact;
        payload.truth_state = Some(TruthState::Verified);
        let memory = payload.into_memory()?;

        let mut tx = self.store.tx().await?;
        insert_memory(&mut tx, &memory).await?;
        for predicate in predicates {
            if !verifier.verify(predicate).await {
                // Dropping the transaction rolls everything back.
                return Err(TinyMemError::EvidenceUnverified {
                    predicate: predicate.to_string(),
                });
            }
            sqlx::query(
                "INSERT INTO evidence (memory_id, kind, content, verified, created_at)
                 VALUES (?, ?, ?, 1, ?)",
            )
            .bind(memory.id.to_string())
            .bind(predicate.kind.as_str())
            .bind(&predicate.content)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(TinyMemError::storage)?;
        }
        supersede_conflicts(&mut tx, &memory).await?;
        tx.commit().await.map_err(TinyMemError::storage)?;
        debug!(id = %memory.id, predicates = predicates.len(), "fact created with evidence");
        Ok(memory)
    }

    /// Promote an existing memory to a fact. Callable only from an
    /// already-validated context (`is_validated`), and even then the row
    /// must carry at least one verified evidence record.
    pub async fn promote_to_fact(
        &self,
        memory_id: MemoryId,
        project_id: &str,
        is_validated: bool,
    ) -> Result<()> {
        if !is_validated {
            return Err(TinyMemError::FactRequiresEvidence);
        }
        let memory = self
            .get(memory_id, project_id)
            .await?
            .ok_or_else(|| TinyMemError::storage(format!("unknown memory {memory_id}")))?;
        let evidence = self.evidence_for(memory_id).await?;
        if !evidence.iter().any(|e| e.verified) {
            return Err(TinyMemError::FactRequiresEvidence);
        }

        let mut tx = self.store.tx().await?;
        sqlx::query(
            "UPDATE memories SET kind = 'fact', truth_state = 'verified',
             recall_tier = 'always', updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(memory_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(TinyMemError::storage)?;

        let promoted = Memory {
            kind: MemoryKind::Fact,
            truth_state: TruthState::Verified,
            recall_tier: RecallTier::Always,
            ..memory
        };
        supersede_conflicts(&mut tx, &promoted).await?;
        tx.commit().await.map_err(TinyMemError::storage)
    }

    /// Point `old_id` at its replacement. The superseded row disappears
    /// from search and recall but stays on disk.
    pub async fn mark_superseded(&self, old_id: MemoryId, new_id: MemoryId) -> Result<()> {
        sqlx::query("UPDATE memories SET superseded_by = ?, updated_at = ? WHERE id = ?")
            .bind(new_id.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(old_id.to_string())
            .execute(self.store.writer())
            .await
            .map_err(TinyMemError::storage)?;
        Ok(())
    }

    /// Fetch one memory by id within a project.
    pub async fn get(&self, id: MemoryId, project_id: &str) -> Result<Option<Memory>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ? AND project_id = ?"
        ))
        .bind(id.to_string())
        .bind(project_id)
        .fetch_optional(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        row.map(decode_memory).transpose()
    }

    /// All live (non-superseded) memories for a project, newest first.
    pub async fn list(&self, project_id: &str) -> Result<Vec<Memory>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE project_id = ? AND superseded_by IS NULL
             ORDER BY updated_at DESC, id"
        ))
        .bind(project_id)
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_memory).collect()
    }

    /// Full-text search over summaries and details. Terms are OR-joined;
    /// superseded rows never match. Falls back to LIKE if the FTS query
    /// cannot run (the build guarantees FTS5, so the fallback is a safety
    /// net, not a mode).
    pub async fn search(&self, project_id: &str, terms: &str, limit: i64) -> Result<Vec<Memory>> {
        let tokens = tokenize(terms);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        let fts = sqlx::query(&format!(
            "SELECT {prefixed} FROM memories_fts
             JOIN memories m ON m.rowid = memories_fts.rowid
             WHERE memories_fts MATCH ? AND m.project_id = ? AND m.superseded_by IS NULL
             ORDER BY memories_fts.rank LIMIT ?",
            prefixed = MEMORY_COLUMNS_PREFIXED
        ))
        .bind(&match_expr)
        .bind(project_id)
        .bind(limit)
        .fetch_all(self.store.reader())
        .await;

        match fts {
            Ok(rows) => rows.into_iter().map(decode_memory).collect(),
            Err(e) => {
                warn!(error = %e, "fts search failed, falling back to LIKE");
                self.search_like(project_id, &tokens, limit).await
            }
        }
    }

    async fn search_like(
        &self,
        project_id: &str,
        tokens: &[String],
        limit: i64,
    ) -> Result<Vec<Memory>> {
        let clauses = tokens
            .iter()
            .map(|_| "(summary LIKE ? OR detail LIKE ?)")
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE project_id = ? AND superseded_by IS NULL AND ({clauses})
             ORDER BY updated_at DESC LIMIT ?"
        );
        let mut query = sqlx::query(&sql).bind(project_id);
        for token in tokens {
            let like = format!("%{token}%");
            query = query.bind(like.clone()).bind(like);
        }
        let rows = query
            .bind(limit)
            .fetch_all(self.store.reader())
            .await
            .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_memory).collect()
    }

    /// Evidence records for one memory, in append order.
    pub async fn evidence_for(&self, memory_id: MemoryId) -> Result<Vec<Evidence>> {
        let rows = sqlx::query(
            "SELECT id, memory_id, kind, content, verified, created_at
             FROM evidence WHERE memory_id = ? ORDER BY id",
        )
        .bind(memory_id.to_string())
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter()
            .map(|row| {
                let memory_id: String = row.get("memory_id");
                let kind: String = row.get("kind");
                let verified: i64 = row.get("verified");
                let created_at: String = row.get("created_at");
                Ok(Evidence {
                    id: row.get("id"),
                    memory_id: memory_id.parse().map_err(|e| {
                        TinyMemError::Corrupt(format!("bad memory id {memory_id}: {e}"))
                    })?,
                    kind: kind.parse()?,
                    content: row.get("content"),
                    verified: verified != 0,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }
}

const MEMORY_COLUMNS: &str = "id, project_id, kind, summary, detail, key, source, recall_tier, \
                              truth_state, classification, created_at, updated_at, superseded_by";

const MEMORY_COLUMNS_PREFIXED: &str =
    "m.id, m.project_id, m.kind, m.summary, m.detail, m.key, m.source, m.recall_tier, \
     m.truth_state, m.classification, m.created_at, m.updated_at, m.superseded_by";

async fn insert_memory(tx: &mut Transaction<'static, Sqlite>, memory: &Memory) -> Result<()> {
    sqlx::query(
        "INSERT INTO memories
         (id, project_id, kind, summary, detail, key, source, recall_tier, truth_state,
          classification, created_at, updated_at, superseded_by)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
    )
    .bind(memory.id.to_string())
    .bind(&memory.project_id)
    .bind(memory.kind.as_str())
    .bind(&memory.summary)
    .bind(&memory.detail)
    .bind(&memory.key)
    .bind(&memory.source)
    .bind(memory.recall_tier.as_str())
    .bind(memory.truth_state.as_str())
    .bind(&memory.classification)
    .bind(memory.created_at.to_rfc3339())
    .bind(memory.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await
    .map_err(TinyMemError::storage)?;
    Ok(())
}

/// Mark as superseded every live sibling that shares the new memory's key,
/// or, for fact/decision/constraint, its kind and exact summary. Runs
/// after the new row is inserted so the pointer resolves.
async fn supersede_conflicts(
    tx: &mut Transaction<'static, Sqlite>,
    memory: &Memory,
) -> Result<u64> {
    let mut displaced = 0;

    if let Some(key) = &memory.key {
        let result = sqlx::query(
            "UPDATE memories SET superseded_by = ?, updated_at = ?
             WHERE project_id = ? AND key = ? AND superseded_by IS NULL AND id != ?",
        )
        .bind(memory.id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&memory.project_id)
        .bind(key)
        .bind(memory.id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(TinyMemError::storage)?;
        displaced += result.rows_affected();
    }

    if SUPERSEDING_KINDS.contains(&memory.kind) {
        let result = sqlx::query(
            "UPDATE memories SET superseded_by = ?, updated_at = ?
             WHERE project_id = ? AND kind = ? AND summary = ?
               AND superseded_by IS NULL AND id != ?",
        )
        .bind(memory.id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&memory.project_id)
        .bind(memory.kind.as_str())
        .bind(&memory.summary)
        .bind(memory.id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(TinyMemError::storage)?;
        displaced += result.rows_affected();
    }

    Ok(displaced)
}

fn tokenize(terms: &str) -> Vec<String> {
    terms
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

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
    use std::time::Duration;
    use tinymem_types::EvidenceKind;

    async fn service() -> MemoryService {
        MemoryService::new(Store::in_memory().await.unwrap())
    }

    fn verifier_in(dir: &std::path::Path) -> EvidenceVerifier {
        EvidenceVerifier::new(VerifierConfig {
            working_dir: Some(dir.to_path_buf()),
            timeout: Duration::from_secs(5),
            ..VerifierConfig::default()
        })
    }

    fn file_exists(path: &str) -> EvidencePredicate {
        EvidencePredicate {
            kind: EvidenceKind::FileExists,
            content: path.to_string(),
        }
    }

    #[tokio::test]
    async fn bare_fact_creation_is_refused() {
        let service = service().await;
        let err = service
            .create(NewMemory::new("proj", MemoryKind::Fact, "X is true"))
            .await
            .unwrap_err();
        assert!(matches!(err, TinyMemError::FactRequiresEvidence));

        let all = service.list("proj").await.unwrap();
        assert!(all.iter().all(|m| m.kind != MemoryKind::Fact));
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn fact_with_verified_evidence_commits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# readme\n").unwrap();
        let service = service().await;
        let verifier = verifier_in(dir.path());

        let fact = service
            .create_fact_with_evidence(
                NewMemory::new("proj", MemoryKind::Fact, "README exists"),
                &[file_exists("README.md")],
                &verifier,
            )
            .await
            .unwrap();

        assert_eq!(fact.kind, MemoryKind::Fact);
        assert_eq!(fact.truth_state, TruthState::Verified);
        assert_eq!(fact.recall_tier, RecallTier::Always);

        let evidence = service.evidence_for(fact.id).await.unwrap();
        assert_eq!(evidence.len(), 1);
        assert!(evidence[0].verified);
    }

    #[tokio::test]
    async fn failed_predicate_rolls_the_whole_transaction_back() {
        let dir = tempfile::tempdir().unwrap();
        let service = service().await;
        let verifier = verifier_in(dir.path());

        // README.md does not exist in this tempdir.
        let err = service
            .create_fact_with_evidence(
                NewMemory::new("proj", MemoryKind::Fact, "README exists"),
                &[file_exists("README.md")],
                &verifier,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TinyMemError::EvidenceUnverified { .. }));

        assert!(service.list("proj").await.unwrap().is_empty());
        let row = sqlx::query("SELECT COUNT(*) FROM evidence")
            .fetch_one(service.store.reader())
            .await
            .unwrap();
        let count: i64 = row.get(0);
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn empty_predicate_list_is_not_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let service = service().await;
        let verifier = verifier_in(dir.path());
        let err = service
            .create_fact_with_evidence(
                NewMemory::new("proj", MemoryKind::Fact, "X"),
                &[],
                &verifier,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TinyMemError::FactRequiresEvidence));
    }

    #[tokio::test]
    async fn reusing_a_key_supersedes_the_old_row() {
        let service = service().await;
        let first = service
            .create(NewMemory::new("proj", MemoryKind::Note, "old value").with_key("db-port"))
            .await
            .unwrap();
        let second = service
            .create(NewMemory::new("proj", MemoryKind::Note, "new value").with_key("db-port"))
            .await
            .unwrap();

        let old = service.get(first.id, "proj").await.unwrap().unwrap();
        assert_eq!(old.superseded_by, Some(second.id));

        let live = service.list("proj").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id);
    }

    #[tokio::test]
    async fn same_kind_and_summary_supersedes_for_decisions() {
        let service = service().await;
        let first = service
            .create(NewMemory::new("proj", MemoryKind::Decision, "use sqlite"))
            .await
            .unwrap();
        let second = service
            .create(NewMemory::new("proj", MemoryKind::Decision, "use sqlite"))
            .await
            .unwrap();

        let old = service.get(first.id, "proj").await.unwrap().unwrap();
        assert_eq!(old.superseded_by, Some(second.id));
    }

    #[tokio::test]
    async fn notes_with_same_summary_coexist() {
        let service = service().await;
        service
            .create(NewMemory::new("proj", MemoryKind::Note, "same words"))
            .await
            .unwrap();
        service
            .create(NewMemory::new("proj", MemoryKind::Note, "same words"))
            .await
            .unwrap();
        assert_eq!(service.list("proj").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn key_scope_is_per_project() {
        let service = service().await;
        service
            .create(NewMemory::new("proj-a", MemoryKind::Note, "a").with_key("shared"))
            .await
            .unwrap();
        service
            .create(NewMemory::new("proj-b", MemoryKind::Note, "b").with_key("shared"))
            .await
            .unwrap();
        assert_eq!(service.list("proj-a").await.unwrap().len(), 1);
        assert_eq!(service.list("proj-b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_uses_fts_and_excludes_superseded() {
        let service = service().await;
        let first = service
            .create(
                NewMemory::new("proj", MemoryKind::Note, "the database uses WAL journaling")
                    .with_key("journal"),
            )
            .await
            .unwrap();
        service
            .create(
                NewMemory::new("proj", MemoryKind::Note, "journaling moved to rollback mode")
                    .with_key("journal"),
            )
            .await
            .unwrap();
        service
            .create(NewMemory::new("proj", MemoryKind::Note, "unrelated entry"))
            .await
            .unwrap();

        let hits = service.search("proj", "journaling database", 10).await.unwrap();
        assert_eq!(hits.len(), 1, "superseded row must not match");
        assert_ne!(hits[0].id, first.id);
    }

    #[tokio::test]
    async fn update_cannot_touch_or_mint_facts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), "x").unwrap();
        let service = service().await;
        let verifier = verifier_in(dir.path());

        let fact = service
            .create_fact_with_evidence(
                NewMemory::new("proj", MemoryKind::Fact, "f exists"),
                &[file_exists("f")],
                &verifier,
            )
            .await
            .unwrap();

        // Updating a fact row is refused.
        let mut as_note = fact.clone();
        as_note.kind = MemoryKind::Note;
        assert!(matches!(
            service.update(&as_note).await.unwrap_err(),
            TinyMemError::FactRequiresEvidence
        ));

        // Turning a note into a fact is refused.
        let note = service
            .create(NewMemory::new("proj", MemoryKind::Note, "a note"))
            .await
            .unwrap();
        let mut as_fact = note.clone();
        as_fact.kind = MemoryKind::Fact;
        assert!(matches!(
            service.update(&as_fact).await.unwrap_err(),
            TinyMemError::FactRequiresEvidence
        ));
    }

    #[tokio::test]
    async fn promote_to_fact_requires_validation_and_evidence() {
        let service = service().await;
        let note = service
            .create(NewMemory::new("proj", MemoryKind::Claim, "claimed truth"))
            .await
            .unwrap();

        // Not validated.
        assert!(matches!(
            service.promote_to_fact(note.id, "proj", false).await.unwrap_err(),
            TinyMemError::FactRequiresEvidence
        ));
        // Validated but no verified evidence rows.
        assert!(matches!(
            service.promote_to_fact(note.id, "proj", true).await.unwrap_err(),
            TinyMemError::FactRequiresEvidence
        ));

        // With a verified evidence row, promotion succeeds.
        sqlx::query(
            "INSERT INTO evidence (memory_id, kind, content, verified, created_at)
             VALUES (?, 'file_exists', 'README.md', 1, ?)",
        )
        .bind(note.id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(service.store.writer())
        .await
        .unwrap();
        service.promote_to_fact(note.id, "proj", true).await.unwrap();

        let promoted = service.get(note.id, "proj").await.unwrap().unwrap();
        assert_eq!(promoted.kind, MemoryKind::Fact);
        assert_eq!(promoted.truth_state, TruthState::Verified);
    }
}
