#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-types** – Shared primitive data structures for tinyMem.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, cryptography, or storage:
//! hashes are carried as lowercase hex strings and computed elsewhere.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod entity;
pub mod error;

pub use entity::EntityKey;
pub use error::{Result, TinyMemError};

//─────────────────────────────
//  Size limits
//─────────────────────────────

/// Maximum accepted artifact payload to prevent memory exhaustion (4 MiB).
pub const MAX_ARTIFACT_BYTES: usize = 4 * 1024 * 1024;

/// Maximum accepted memory summary length.
pub const MAX_SUMMARY_LEN: usize = 4096;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Identifier of one user/assistant exchange recorded in the ledger.
pub type EpisodeId = Uuid;

/// Identifier of a typed project memory row.
pub type MemoryId = Uuid;

/// SHA-256 content digest, 64 lowercase hex characters.
pub type ArtifactHash = String;

//─────────────────────────────
//  Artifact vocabulary
//─────────────────────────────

/// Closed set of content categories accepted by the vault.
///
/// The type does not participate in content addressing: the same bytes
/// stored under two different types resolve to one artifact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Source code, usually a fenced block extracted from a chat turn.
    Code,
    /// Unified diff output.
    Diff,
    /// A recorded decision.
    Decision,
    /// Raw user input.
    UserInput,
    /// A fully assembled prompt sent upstream.
    Prompt,
    /// A tool invocation payload.
    ToolCall,
    /// A tool result payload.
    ToolResult,
}

impl ContentType {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Code => "code",
            ContentType::Diff => "diff",
            ContentType::Decision => "decision",
            ContentType::UserInput => "user_input",
            ContentType::Prompt => "prompt",
            ContentType::ToolCall => "tool_call",
            ContentType::ToolResult => "tool_result",
        }
    }
}

impl FromStr for ContentType {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "code" => Ok(ContentType::Code),
            "diff" => Ok(ContentType::Diff),
            "decision" => Ok(ContentType::Decision),
            "user_input" => Ok(ContentType::UserInput),
            "prompt" => Ok(ContentType::Prompt),
            "tool_call" => Ok(ContentType::ToolCall),
            "tool_result" => Ok(ContentType::ToolResult),
            other => Err(TinyMemError::InvalidContentType(other.to_string())),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable content blob addressed by its SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// SHA-256 of `content`, lowercase hex. Primary key.
    pub hash: ArtifactHash,
    /// Raw bytes, exactly as stored.
    pub content: Vec<u8>,
    /// Content category; informational only, not part of the address.
    pub content_type: ContentType,
    /// Commit time of the first store of these bytes.
    pub created_at: DateTime<Utc>,
    /// Length of `content` in bytes.
    pub byte_size: i64,
    /// Optional model-token count supplied by the caller.
    pub token_count: Option<i64>,
}

impl Artifact {
    /// Token weight used for context budgeting: the stored count when the
    /// caller supplied one, otherwise the bytes/4 estimate.
    pub fn token_weight(&self) -> i64 {
        self.token_count
            .unwrap_or_else(|| estimate_tokens(&self.content))
    }
}

//─────────────────────────────
//  Entity state vocabulary
//─────────────────────────────

/// Lifecycle state of an entity's current artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactState {
    /// Seen and resolved, not yet proven.
    Proposed,
    /// Passed all three promotion gates; hydrated into prompts.
    Authoritative,
    /// Replaced by a later authoritative artifact for the same entity.
    Superseded,
    /// Explicitly withdrawn. Recorded, never deleted.
    Tombstoned,
}

impl ArtifactState {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactState::Proposed => "PROPOSED",
            ArtifactState::Authoritative => "AUTHORITATIVE",
            ArtifactState::Superseded => "SUPERSEDED",
            ArtifactState::Tombstoned => "TOMBSTONED",
        }
    }
}

impl FromStr for ArtifactState {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PROPOSED" => Ok(ArtifactState::Proposed),
            "AUTHORITATIVE" => Ok(ArtifactState::Authoritative),
            "SUPERSEDED" => Ok(ArtifactState::Superseded),
            "TOMBSTONED" => Ok(ArtifactState::Tombstoned),
            other => Err(TinyMemError::Corrupt(format!(
                "unknown artifact state: {other}"
            ))),
        }
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current mapping of one entity key to its governing artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Canonical `filepath::symbol` reference.
    pub entity_key: EntityKey,
    /// The artifact currently governing this entity.
    pub artifact_hash: ArtifactHash,
    /// Lifecycle state of that artifact.
    pub state: ArtifactState,
    /// On-disk path, when known.
    pub filepath: Option<String>,
    /// Set when the last external-truth check found the on-disk file
    /// diverged from the artifact. Stale entities are skipped by hydration.
    pub stale: bool,
    /// Time of the last transition applied to this row.
    pub updated_at: DateTime<Utc>,
}

/// One append-only record of a state machine decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Monotonic row id; ties in `created_at` replay in id order.
    pub id: i64,
    /// Episode during which the transition was attempted.
    pub episode_id: EpisodeId,
    /// Entity the transition applies to.
    pub entity_key: String,
    /// State before the attempt; `None` for a first sighting.
    pub from_state: Option<ArtifactState>,
    /// State after the attempt (unchanged on denial).
    pub to_state: ArtifactState,
    /// Artifact under consideration.
    pub artifact_hash: ArtifactHash,
    /// Gate results and decision, human-readable.
    pub reason: String,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Resolution vocabulary
//─────────────────────────────

/// Honesty level of an entity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    /// Structure proven by a concrete-syntax parse.
    Confirmed,
    /// Suggested by regex or correlation; never sufficient to promote.
    Inferred,
    /// No entity could be determined.
    Unresolved,
}

impl Confidence {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Confirmed => "CONFIRMED",
            Confidence::Inferred => "INFERRED",
            Confidence::Unresolved => "UNRESOLVED",
        }
    }
}

impl FromStr for Confidence {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CONFIRMED" => Ok(Confidence::Confirmed),
            "INFERRED" => Ok(Confidence::Inferred),
            "UNRESOLVED" => Ok(Confidence::Unresolved),
            other => Err(TinyMemError::Corrupt(format!(
                "unknown confidence: {other}"
            ))),
        }
    }
}

/// Pipeline stage that produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMethod {
    /// Concrete-syntax parse (tree-sitter).
    Ast,
    /// Embedded pattern catalogue.
    Regex,
    /// Symbol overlap against the live entity map.
    Correlation,
    /// No stage resolved the artifact.
    Unresolved,
}

impl ResolveMethod {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveMethod::Ast => "ast",
            ResolveMethod::Regex => "regex",
            ResolveMethod::Correlation => "correlation",
            ResolveMethod::Unresolved => "unresolved",
        }
    }
}

impl FromStr for ResolveMethod {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ast" => Ok(ResolveMethod::Ast),
            "regex" => Ok(ResolveMethod::Regex),
            "correlation" => Ok(ResolveMethod::Correlation),
            "unresolved" => Ok(ResolveMethod::Unresolved),
            other => Err(TinyMemError::Corrupt(format!("unknown method: {other}"))),
        }
    }
}

/// Outcome of running an artifact through the resolution pipeline.
///
/// Cached once per artifact hash; subsequent lookups return the cached row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Artifact this resolution describes.
    pub artifact_hash: ArtifactHash,
    /// Resolved entity, when one was determined.
    pub entity_key: Option<EntityKey>,
    /// Honesty level of the match.
    pub confidence: Confidence,
    /// Stage that produced the result.
    pub method: ResolveMethod,
    /// Filepath hint carried through from the caller.
    pub filepath: Option<String>,
    /// Top-level symbols found in the artifact, in declaration order.
    pub symbols: Vec<String>,
    /// Total AST node count, when the AST stage parsed the artifact.
    pub ast_node_count: Option<i64>,
}

impl Resolution {
    /// An unresolved result for the given artifact.
    pub fn unresolved(artifact_hash: impl Into<String>, method: ResolveMethod) -> Self {
        Self {
            artifact_hash: artifact_hash.into(),
            entity_key: None,
            confidence: Confidence::Unresolved,
            method,
            filepath: None,
            symbols: Vec::new(),
            ast_node_count: None,
        }
    }
}

//─────────────────────────────
//  Ledger vocabulary
//─────────────────────────────

/// One user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Episode identifier (UUID v4).
    pub episode_id: EpisodeId,
    /// Creation time (request arrival).
    pub created_at: DateTime<Utc>,
    /// Vault hash of the user prompt, once stored.
    pub user_prompt_hash: Option<ArtifactHash>,
    /// Vault hash of the assistant response; set once.
    pub assistant_response_hash: Option<ArtifactHash>,
    /// Free-form metadata map. Updates deep-merge, never replace.
    pub metadata: serde_json::Value,
}

/// Shadow audit verdict category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Audit ran to completion.
    Completed,
    /// Audit produced a partial assessment.
    Partial,
    /// Audit flagged the exchange for human discussion.
    Discussion,
}

impl AuditStatus {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Completed => "completed",
            AuditStatus::Partial => "partial",
            AuditStatus::Discussion => "discussion",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(AuditStatus::Completed),
            "partial" => Ok(AuditStatus::Partial),
            "discussion" => Ok(AuditStatus::Discussion),
            other => Err(TinyMemError::Corrupt(format!(
                "unknown audit status: {other}"
            ))),
        }
    }
}

/// Stored outcome of one shadow audit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    /// Row id.
    pub id: i64,
    /// Episode that was audited.
    pub episode_id: EpisodeId,
    /// Assistant response artifact the audit examined.
    pub artifact_hash: ArtifactHash,
    /// Entity under discussion, when the audit focused on one.
    pub entity_key: Option<String>,
    /// Verdict category.
    pub status: AuditStatus,
    /// Raw audit text. Evidence for humans, not a controller.
    pub audit_response: String,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Memory vocabulary
//─────────────────────────────

/// Typed category of a project memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Evidence-backed truth. Creation is gated by the verifier.
    Fact,
    /// An unproven assertion.
    Claim,
    /// A plan of work.
    Plan,
    /// A recorded decision.
    Decision,
    /// A standing constraint.
    Constraint,
    /// Something observed during a session.
    Observation,
    /// A free-form note.
    Note,
    /// A tracked task.
    Task,
}

impl MemoryKind {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Fact => "fact",
            MemoryKind::Claim => "claim",
            MemoryKind::Plan => "plan",
            MemoryKind::Decision => "decision",
            MemoryKind::Constraint => "constraint",
            MemoryKind::Observation => "observation",
            MemoryKind::Note => "note",
            MemoryKind::Task => "task",
        }
    }

    /// Recall tier assigned when the caller does not choose one.
    pub fn default_tier(&self) -> RecallTier {
        match self {
            MemoryKind::Fact | MemoryKind::Constraint => RecallTier::Always,
            MemoryKind::Decision | MemoryKind::Claim => RecallTier::Contextual,
            MemoryKind::Observation | MemoryKind::Note | MemoryKind::Plan | MemoryKind::Task => {
                RecallTier::Opportunistic
            }
        }
    }

    /// Truth state assigned when the caller does not choose one.
    pub fn default_truth_state(&self) -> TruthState {
        match self {
            MemoryKind::Fact => TruthState::Verified,
            MemoryKind::Decision | MemoryKind::Constraint => TruthState::Asserted,
            _ => TruthState::Tentative,
        }
    }
}

impl FromStr for MemoryKind {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fact" => Ok(MemoryKind::Fact),
            "claim" => Ok(MemoryKind::Claim),
            "plan" => Ok(MemoryKind::Plan),
            "decision" => Ok(MemoryKind::Decision),
            "constraint" => Ok(MemoryKind::Constraint),
            "observation" => Ok(MemoryKind::Observation),
            "note" => Ok(MemoryKind::Note),
            "task" => Ok(MemoryKind::Task),
            other => Err(TinyMemError::Corrupt(format!(
                "unknown memory kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusion priority in bounded context windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallTier {
    /// Injected into every recall, ahead of scoring.
    Always,
    /// Scored against the query.
    Contextual,
    /// Fills whatever budget remains.
    Opportunistic,
}

impl RecallTier {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecallTier::Always => "always",
            RecallTier::Contextual => "contextual",
            RecallTier::Opportunistic => "opportunistic",
        }
    }
}

impl FromStr for RecallTier {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(RecallTier::Always),
            "contextual" => Ok(RecallTier::Contextual),
            "opportunistic" => Ok(RecallTier::Opportunistic),
            other => Err(TinyMemError::Corrupt(format!(
                "unknown recall tier: {other}"
            ))),
        }
    }
}

/// How strongly a memory's content is believed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruthState {
    /// Backed by verified evidence. Only the verifier writes this.
    Verified,
    /// Asserted by a decision or constraint.
    Asserted,
    /// Everything else.
    Tentative,
}

impl TruthState {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            TruthState::Verified => "verified",
            TruthState::Asserted => "asserted",
            TruthState::Tentative => "tentative",
        }
    }
}

impl FromStr for TruthState {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "verified" => Ok(TruthState::Verified),
            "asserted" => Ok(TruthState::Asserted),
            "tentative" => Ok(TruthState::Tentative),
            other => Err(TinyMemError::Corrupt(format!(
                "unknown truth state: {other}"
            ))),
        }
    }
}

/// A typed project memory row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// Row id (UUID v4).
    pub id: MemoryId,
    /// Project scope.
    pub project_id: String,
    /// Typed category.
    pub kind: MemoryKind,
    /// One-line summary; indexed for search.
    pub summary: String,
    /// Longer body; indexed for search.
    pub detail: String,
    /// Optional stable key, unique per project among live rows.
    pub key: Option<String>,
    /// Optional provenance note.
    pub source: Option<String>,
    /// Inclusion priority.
    pub recall_tier: RecallTier,
    /// Belief level.
    pub truth_state: TruthState,
    /// Optional classification label used by contextual scoring.
    pub classification: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Set when a newer memory replaced this one; excluded from recall.
    pub superseded_by: Option<MemoryId>,
}

/// Category of an evidence predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// A path exists on disk.
    FileExists,
    /// A pattern matches at least one line of a file.
    GrepHit,
    /// A shell command exits 0 within the timeout.
    CmdExit0,
    /// A test command exits 0 within the timeout.
    TestPass,
}

impl EvidenceKind {
    /// Canonical storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::FileExists => "file_exists",
            EvidenceKind::GrepHit => "grep_hit",
            EvidenceKind::CmdExit0 => "cmd_exit0",
            EvidenceKind::TestPass => "test_pass",
        }
    }
}

impl FromStr for EvidenceKind {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file_exists" => Ok(EvidenceKind::FileExists),
            "grep_hit" => Ok(EvidenceKind::GrepHit),
            "cmd_exit0" => Ok(EvidenceKind::CmdExit0),
            "test_pass" => Ok(EvidenceKind::TestPass),
            other => Err(TinyMemError::Corrupt(format!(
                "unknown evidence kind: {other}"
            ))),
        }
    }
}

/// An evidence predicate awaiting verification, in `type::content` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePredicate {
    /// Predicate category.
    pub kind: EvidenceKind,
    /// Predicate argument: a path, `pattern::path`, or a shell command.
    pub content: String,
}

impl EvidencePredicate {
    /// Parse the `type::content` wire form.
    pub fn parse(s: &str) -> Result<Self> {
        let (kind, content) = s.split_once("::").ok_or_else(|| {
            TinyMemError::EvidenceUnverified {
                predicate: s.to_string(),
            }
        })?;
        Ok(Self {
            kind: kind.parse().map_err(|_| TinyMemError::EvidenceUnverified {
                predicate: s.to_string(),
            })?,
            content: content.to_string(),
        })
    }
}

impl fmt::Display for EvidencePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.kind.as_str(), self.content)
    }
}

/// A stored, verified-or-not evidence record. Append-only; the verified
/// flag is written once at creation and never flipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Row id.
    pub id: i64,
    /// Memory the evidence supports.
    pub memory_id: MemoryId,
    /// Predicate category.
    pub kind: EvidenceKind,
    /// Predicate argument.
    pub content: String,
    /// Verifier outcome at creation time.
    pub verified: bool,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

/// Observability row recorded per recall when metrics are enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallMetric {
    /// Append time.
    pub created_at: DateTime<Utc>,
    /// Project scope.
    pub project_id: String,
    /// Caller-supplied label, e.g. `chat` or `mcp`.
    pub query_type: String,
    /// Number of memories returned.
    pub memory_count: i64,
    /// Ids of the returned memories.
    pub memory_ids: Vec<MemoryId>,
    /// Token weight of the returned slice.
    pub total_tokens: i64,
    /// End-to-end recall duration.
    pub duration_ms: i64,
}

//─────────────────────────────
//  JSON helpers
//─────────────────────────────

/// Deep-merge `updates` into `base`.
///
/// Objects merge recursively; scalars and arrays in `updates` replace the
/// corresponding value in `base`. Keys absent from `updates` are untouched.
pub fn deep_merge(base: &mut serde_json::Value, updates: &serde_json::Value) {
    match (base, updates) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                deep_merge(
                    base_map
                        .entry(key.clone())
                        .or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (base_slot, update) => *base_slot = update.clone(),
    }
}

/// An empty JSON object, the default episode metadata.
pub fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Parse an RFC 3339 TEXT column back into a UTC timestamp.
///
/// Stored timestamps are always written by this workspace, so a parse
/// failure indicates on-disk corruption rather than caller error.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TinyMemError::Corrupt(format!("bad timestamp {raw}: {e}")))
}

//─────────────────────────────
//  Token estimation
//─────────────────────────────

/// Coarse token estimate for budget accounting: one token per four bytes,
/// rounded up. Used wherever a caller did not supply a real count.
pub fn estimate_tokens(content: &[u8]) -> i64 {
    ((content.len() + 3) / 4) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_round_trips() {
        for raw in [
            "code",
            "diff",
            "decision",
            "user_input",
            "prompt",
            "tool_call",
            "tool_result",
        ] {
            let parsed: ContentType = raw.parse().unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
    }

    #[test]
    fn unknown_content_type_is_a_caller_error() {
        let err = "blob".parse::<ContentType>().unwrap_err();
        assert!(matches!(err, TinyMemError::InvalidContentType(_)));
    }

    #[test]
    fn kind_defaults_match_tier_table() {
        assert_eq!(MemoryKind::Fact.default_tier(), RecallTier::Always);
        assert_eq!(MemoryKind::Constraint.default_tier(), RecallTier::Always);
        assert_eq!(MemoryKind::Decision.default_tier(), RecallTier::Contextual);
        assert_eq!(MemoryKind::Claim.default_tier(), RecallTier::Contextual);
        assert_eq!(MemoryKind::Note.default_tier(), RecallTier::Opportunistic);
        assert_eq!(MemoryKind::Plan.default_tier(), RecallTier::Opportunistic);

        assert_eq!(MemoryKind::Fact.default_truth_state(), TruthState::Verified);
        assert_eq!(
            MemoryKind::Decision.default_truth_state(),
            TruthState::Asserted
        );
        assert_eq!(
            MemoryKind::Observation.default_truth_state(),
            TruthState::Tentative
        );
    }

    #[test]
    fn predicate_wire_form_round_trips() {
        let p = EvidencePredicate::parse("grep_hit::fn main::src/main.rs").unwrap();
        assert_eq!(p.kind, EvidenceKind::GrepHit);
        assert_eq!(p.content, "fn main::src/main.rs");
        assert_eq!(p.to_string(), "grep_hit::fn main::src/main.rs");
    }

    #[test]
    fn predicate_without_separator_is_rejected() {
        assert!(EvidencePredicate::parse("file_exists").is_err());
    }

    #[test]
    fn deep_merge_preserves_unrelated_keys() {
        let mut base = serde_json::json!({
            "hydrated_entities": ["a.go::A"],
            "nested": {"keep": 1, "replace": 2}
        });
        let updates = serde_json::json!({
            "nested": {"replace": 3, "new": 4},
            "extra": true
        });
        deep_merge(&mut base, &updates);
        assert_eq!(
            base,
            serde_json::json!({
                "hydrated_entities": ["a.go::A"],
                "nested": {"keep": 1, "replace": 3, "new": 4},
                "extra": true
            })
        );
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(b""), 0);
        assert_eq!(estimate_tokens(b"abc"), 1);
        assert_eq!(estimate_tokens(b"abcd"), 1);
        assert_eq!(estimate_tokens(b"abcde"), 2);
    }
}
