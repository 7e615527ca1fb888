#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-state** – The promotion state machine.
//!
//! Artifacts enter at PROPOSED and advance to AUTHORITATIVE only by passing
//! three gates in one attempt:
//!
//! - **Gate A, structural proof**: the resolution is CONFIRMED and the new
//!   artifact does not silently lose symbols or collapse its AST relative
//!   to the entity's current authoritative artifact.
//! - **Gate B, authority grant**: the artifact came from a user paste, or
//!   the user implicitly approved it (the entity was hydrated, a later
//!   prompt arrived, no rejection was recorded), or a shadow audit was
//!   positive.
//! - **Gate C, external truth**: the on-disk file at the entity's filepath,
//!   when present, hashes to the artifact. A missing file abstains; a
//!   divergent file denies and marks the entity stale.
//!
//! Transitions are artifact-centric: a denied attempt records the artifact
//! staying PROPOSED while the entity row keeps its current mapping, and a
//! promotion records the displaced artifact's supersession followed by the
//! new artifact's rise. Replaying the transition log in append order
//! reconstructs the entity map exactly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::Row;
use tracing::{debug, info};

use tinymem_ledger::Ledger;
use tinymem_store::Store;
use tinymem_vault::compute_hash;
use tinymem_types::{
    parse_timestamp, ArtifactState, Confidence, EntityKey, EntityState, EpisodeId, Resolution,
    Result, TinyMemError,
};

pub mod gates;

pub use gates::GateResult;

/// AST node counts may not collapse by this fraction or more.
pub const AST_COLLAPSE_LIMIT: f64 = 0.5;

/// How many recent episodes Gate B scans for hydration-then-approval.
const USER_VERIFICATION_WINDOW: i64 = 50;

/// Outcome of one promotion attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionOutcome {
    /// Entity under consideration.
    pub entity_key: EntityKey,
    /// State of the attempted artifact after the decision.
    pub state: ArtifactState,
    /// Whether the artifact was promoted to AUTHORITATIVE.
    pub promoted: bool,
    /// The full gate summary recorded in the ledger.
    pub reason: String,
}

/// The state machine over the entity map.
#[derive(Debug, Clone)]
pub struct StateMachine {
    store: Store,
    ledger: Ledger,
    project_root: PathBuf,
}

impl StateMachine {
    /// Build over the shared store. `project_root` anchors Gate C's
    /// relative filepath checks.
    pub fn new(store: Store, ledger: Ledger, project_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            ledger,
            project_root: project_root.into(),
        }
    }

    /// Current mapping for one entity.
    pub async fn get_entity(&self, entity_key: &str) -> Result<Option<EntityState>> {
        let row = sqlx::query(
            "SELECT entity_key, artifact_hash, state, filepath, stale, updated_at
             FROM entity_states WHERE entity_key = ?",
        )
        .bind(entity_key)
        .fetch_optional(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        row.map(decode_entity).transpose()
    }

    /// All entities currently in `state`, most recently updated first.
    pub async fn list_by_state(&self, state: ArtifactState) -> Result<Vec<EntityState>> {
        let rows = sqlx::query(
            "SELECT entity_key, artifact_hash, state, filepath, stale, updated_at
             FROM entity_states WHERE state = ? ORDER BY updated_at DESC, entity_key",
        )
        .bind(state.as_str())
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_entity).collect()
    }

    /// Register a resolved artifact: new artifacts always enter PROPOSED.
    ///
    /// Creates the entity row on first sighting. For an already-known
    /// entity the row is untouched (resolution never mutates state in
    /// place), but the artifact's PROPOSED transition is still recorded
    /// once.
    pub async fn intake(&self, episode_id: EpisodeId, resolution: &Resolution) -> Result<()> {
        let Some(entity_key) = &resolution.entity_key else {
            return Ok(());
        };
        let key = entity_key.to_string();

        let already_seen = sqlx::query(
            "SELECT 1 FROM ledger_state_transitions
             WHERE entity_key = ? AND artifact_hash = ? LIMIT 1",
        )
        .bind(&key)
        .bind(&resolution.artifact_hash)
        .fetch_optional(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?
        .is_some();
        if already_seen {
            return Ok(());
        }

        if self.get_entity(&key).await?.is_none() {
            sqlx::query(
                "INSERT INTO entity_states (entity_key, artifact_hash, state, filepath, stale, updated_at)
                 VALUES (?, ?, 'PROPOSED', ?, 0, ?)",
            )
            .bind(&key)
            .bind(&resolution.artifact_hash)
            .bind(&resolution.filepath)
            .bind(Utc::now().to_rfc3339())
            .execute(self.store.writer())
            .await
            .map_err(TinyMemError::storage)?;
        }

        self.ledger
            .record_state_transition(
                episode_id,
                &key,
                None,
                ArtifactState::Proposed,
                &resolution.artifact_hash,
                &format!("proposed via {}", resolution.method.as_str()),
            )
            .await?;
        debug!(entity = %key, hash = %resolution.artifact_hash, "artifact proposed");
        Ok(())
    }

    /// Attempt to promote a resolved artifact to AUTHORITATIVE. All three
    /// gates are evaluated and their results recorded in one transition,
    /// whatever the decision.
    pub async fn attempt_promotion(
        &self,
        episode_id: EpisodeId,
        resolution: &Resolution,
        is_user_paste: bool,
    ) -> Result<PromotionOutcome> {
        let entity_key = resolution.entity_key.clone().ok_or_else(|| {
            TinyMemError::InvalidEntityKey("resolution names no entity".to_string())
        })?;
        let key = entity_key.to_string();

        self.intake(episode_id, resolution).await?;
        let current = self.get_entity(&key).await?;

        if let Some(row) = &current {
            if row.state == ArtifactState::Authoritative
                && row.artifact_hash == resolution.artifact_hash
            {
                return Ok(PromotionOutcome {
                    entity_key,
                    state: ArtifactState::Authoritative,
                    promoted: false,
                    reason: "already authoritative".to_string(),
                });
            }
        }

        let gate_a = self.gate_a(resolution, current.as_ref()).await?;
        let gate_b = self.gate_b(&key, is_user_paste).await?;
        let gate_c = self.gate_c(&entity_key, resolution, current.as_ref()).await?;
        let promoted = gate_a.passed && gate_b.passed && gate_c.passed;

        if promoted {
            self.apply_promotion(episode_id, &key, resolution, current.as_ref())
                .await?;
            let reason = gates::summarize(&gate_a, &gate_b, &gate_c, "promoted");
            self.ledger
                .record_state_transition(
                    episode_id,
                    &key,
                    Some(ArtifactState::Proposed),
                    ArtifactState::Authoritative,
                    &resolution.artifact_hash,
                    &reason,
                )
                .await?;
            info!(entity = %key, hash = %resolution.artifact_hash, "promoted to authoritative");
            Ok(PromotionOutcome {
                entity_key,
                state: ArtifactState::Authoritative,
                promoted: true,
                reason,
            })
        } else {
            let reason = gates::summarize(&gate_a, &gate_b, &gate_c, "denied");
            // The attempted artifact stays PROPOSED; the entity row is
            // untouched.
            self.ledger
                .record_state_transition(
                    episode_id,
                    &key,
                    Some(ArtifactState::Proposed),
                    ArtifactState::Proposed,
                    &resolution.artifact_hash,
                    &reason,
                )
                .await?;
            debug!(entity = %key, reason = %reason, "promotion denied");
            Ok(PromotionOutcome {
                entity_key,
                state: ArtifactState::Proposed,
                promoted: false,
                reason,
            })
        }
    }

    /// Explicitly withdraw an entity. Recorded as a transition, never a
    /// row delete.
    pub async fn tombstone(
        &self,
        episode_id: EpisodeId,
        entity_key: &str,
        reason: &str,
    ) -> Result<()> {
        let current = self
            .get_entity(entity_key)
            .await?
            .ok_or_else(|| TinyMemError::InvalidEntityKey(entity_key.to_string()))?;
        sqlx::query(
            "UPDATE entity_states SET state = 'TOMBSTONED', updated_at = ? WHERE entity_key = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(entity_key)
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;
        self.ledger
            .record_state_transition(
                episode_id,
                entity_key,
                Some(current.state),
                ArtifactState::Tombstoned,
                &current.artifact_hash,
                reason,
            )
            .await?;
        Ok(())
    }

    /// Re-evaluate Gate C freshness for one entity and persist the stale
    /// flag. Returns `true` when the entity is fresh (or the check
    /// abstained).
    pub async fn refresh_freshness(&self, entity: &EntityState) -> Result<bool> {
        let fresh = match self.disk_digest(entity.filepath.as_deref(), &entity.entity_key).await {
            Some(digest) => digest == entity.artifact_hash,
            None => true,
        };
        sqlx::query("UPDATE entity_states SET stale = ? WHERE entity_key = ?")
            .bind(i64::from(!fresh))
            .bind(entity.entity_key.to_string())
            .execute(self.store.writer())
            .await
            .map_err(TinyMemError::storage)?;
        Ok(fresh)
    }

    /// Fold the full transition log into an entity map, mirroring exactly
    /// the updates the live table receives.
    pub async fn replay(&self) -> Result<BTreeMap<String, (String, ArtifactState)>> {
        let mut map: BTreeMap<String, (String, ArtifactState)> = BTreeMap::new();
        for transition in self.ledger.get_all_transitions().await? {
            let entry = map.get(&transition.entity_key);
            match transition.to_state {
                ArtifactState::Proposed => {
                    if entry.is_none() {
                        map.insert(
                            transition.entity_key,
                            (transition.artifact_hash, ArtifactState::Proposed),
                        );
                    }
                }
                ArtifactState::Authoritative => {
                    map.insert(
                        transition.entity_key,
                        (transition.artifact_hash, ArtifactState::Authoritative),
                    );
                }
                ArtifactState::Superseded => {
                    if let Some((hash, _)) = entry {
                        if *hash == transition.artifact_hash {
                            map.insert(
                                transition.entity_key,
                                (transition.artifact_hash, ArtifactState::Superseded),
                            );
                        }
                    }
                }
                ArtifactState::Tombstoned => {
                    map.insert(
                        transition.entity_key,
                        (transition.artifact_hash, ArtifactState::Tombstoned),
                    );
                }
            }
        }
        Ok(map)
    }

    /// Compare the replayed map against the live table. Returns a list of
    /// mismatch descriptions; empty means the ledger and the table agree.
    pub async fn verify_replay(&self) -> Result<Vec<String>> {
        let replayed = self.replay().await?;
        let rows = sqlx::query("SELECT entity_key, artifact_hash, state FROM entity_states")
            .fetch_all(self.store.reader())
            .await
            .map_err(TinyMemError::storage)?;

        let mut mismatches = Vec::new();
        let mut live: BTreeMap<String, (String, String)> = BTreeMap::new();
        for row in rows {
            live.insert(
                row.get("entity_key"),
                (row.get("artifact_hash"), row.get("state")),
            );
        }

        for (key, (hash, state)) in &replayed {
            match live.get(key) {
                None => mismatches.push(format!("{key}: in ledger but not in entity map")),
                Some((live_hash, live_state)) => {
                    if live_hash != hash || live_state != state.as_str() {
                        mismatches.push(format!(
                            "{key}: ledger says ({hash}, {state}), map says ({live_hash}, {live_state})"
                        ));
                    }
                }
            }
        }
        for key in live.keys() {
            if !replayed.contains_key(key) {
                mismatches.push(format!("{key}: in entity map but not in ledger"));
            }
        }
        Ok(mismatches)
    }

    //─────────────────────────────
    //  Gates
    //─────────────────────────────

    /// Gate A: CONFIRMED resolution plus structural parity against the
    /// entity's current authoritative artifact.
    async fn gate_a(
        &self,
        resolution: &Resolution,
        current: Option<&EntityState>,
    ) -> Result<GateResult> {
        if resolution.confidence != Confidence::Confirmed {
            return Ok(GateResult::fail(
                "A",
                format!(
                    "confidence {} is not CONFIRMED",
                    resolution.confidence.as_str()
                ),
            ));
        }

        let Some(current) = current.filter(|c| {
            c.state == ArtifactState::Authoritative
                && c.artifact_hash != resolution.artifact_hash
        }) else {
            return Ok(GateResult::pass("A", "no prior authoritative artifact"));
        };

        let prev = sqlx::query(
            "SELECT symbols, ast_node_count FROM resolutions WHERE artifact_hash = ?",
        )
        .bind(&current.artifact_hash)
        .fetch_optional(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        let Some(prev) = prev else {
            return Ok(GateResult::pass("A", "prior artifact has no cached resolution"));
        };

        let prev_symbols: Vec<String> =
            serde_json::from_str(&prev.get::<String, _>("symbols"))?;
        let prev_nodes: Option<i64> = prev.get("ast_node_count");

        let mut failures = Vec::new();
        let missing: Vec<&String> = prev_symbols
            .iter()
            .filter(|s| !resolution.symbols.contains(s))
            .collect();
        if !missing.is_empty() {
            let names = missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",");
            failures.push(format!("parity_symbols_missing=[{names}]"));
        }
        if let (Some(prev_nodes), Some(new_nodes)) = (prev_nodes, resolution.ast_node_count) {
            if prev_nodes > 0 {
                let collapse = 1.0 - (new_nodes as f64 / prev_nodes as f64);
                if collapse >= AST_COLLAPSE_LIMIT {
                    failures.push(format!(
                        "parity_ast_collapse={}%",
                        (collapse * 100.0) as i64
                    ));
                }
            }
        }

        if failures.is_empty() {
            Ok(GateResult::pass("A", "structural parity holds"))
        } else {
            Ok(GateResult::fail("A", failures.join(", ")))
        }
    }

    /// Gate B: authority grant.
    async fn gate_b(&self, entity_key: &str, is_user_paste: bool) -> Result<GateResult> {
        if is_user_paste {
            return Ok(GateResult::pass("B", "user write-head"));
        }
        if self.user_verification(entity_key).await? {
            return Ok(GateResult::pass("B", "implicit user approval after hydration"));
        }
        if self.audit_positive(entity_key).await? {
            return Ok(GateResult::pass("B", "positive shadow audit"));
        }
        Ok(GateResult::fail("B", "no authority grant"))
    }

    /// Implicit approval: the entity was hydrated in an earlier episode,
    /// the user issued a later prompt, and no rejection was recorded.
    async fn user_verification(&self, entity_key: &str) -> Result<bool> {
        let episodes = self
            .ledger
            .get_recent_episodes(USER_VERIFICATION_WINDOW)
            .await?;
        // Newest first: find the newest episode that hydrated this entity,
        // then look at everything after it.
        for (index, episode) in episodes.iter().enumerate() {
            if !metadata_list_contains(&episode.metadata, "hydrated_entities", entity_key) {
                continue;
            }
            let later = &episodes[..index];
            if later.is_empty() {
                return Ok(false);
            }
            let rejected = later.iter().any(|e| {
                metadata_list_contains(&e.metadata, "rejected_entities", entity_key)
            });
            return Ok(!rejected);
        }
        Ok(false)
    }

    async fn audit_positive(&self, entity_key: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM ledger_audit_results
             WHERE entity_key = ? AND status = 'completed' LIMIT 1",
        )
        .bind(entity_key)
        .fetch_optional(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        Ok(row.is_some())
    }

    /// Gate C: the on-disk file, when present, must hash to the artifact.
    async fn gate_c(
        &self,
        entity_key: &EntityKey,
        resolution: &Resolution,
        current: Option<&EntityState>,
    ) -> Result<GateResult> {
        let filepath = resolution
            .filepath
            .clone()
            .or_else(|| current.and_then(|c| c.filepath.clone()));

        match self.disk_digest(filepath.as_deref(), entity_key).await {
            None => Ok(GateResult::pass("C", "file absent, abstain")),
            Some(digest) if digest == resolution.artifact_hash => {
                Ok(GateResult::pass("C", "on-disk file matches"))
            }
            Some(_) => {
                sqlx::query("UPDATE entity_states SET stale = 1 WHERE entity_key = ?")
                    .bind(entity_key.to_string())
                    .execute(self.store.writer())
                    .await
                    .map_err(TinyMemError::storage)?;
                Ok(GateResult::fail("C", "on-disk file differs, artifact stale"))
            }
        }
    }

    async fn disk_digest(
        &self,
        filepath: Option<&str>,
        entity_key: &EntityKey,
    ) -> Option<String> {
        let path = filepath
            .map(str::to_string)
            .or_else(|| entity_key.has_real_filepath().then(|| entity_key.filepath().to_string()))?;
        let resolved = if Path::new(&path).is_absolute() {
            PathBuf::from(&path)
        } else {
            self.project_root.join(&path)
        };
        let content = tokio::fs::read(&resolved).await.ok()?;
        Some(compute_hash(&content))
    }

    async fn apply_promotion(
        &self,
        episode_id: EpisodeId,
        key: &str,
        resolution: &Resolution,
        current: Option<&EntityState>,
    ) -> Result<()> {
        if let Some(current) = current.filter(|c| {
            c.state == ArtifactState::Authoritative
                && c.artifact_hash != resolution.artifact_hash
        }) {
            self.ledger
                .record_state_transition(
                    episode_id,
                    key,
                    Some(ArtifactState::Authoritative),
                    ArtifactState::Superseded,
                    &current.artifact_hash,
                    "superseded by a newer authoritative artifact",
                )
                .await?;
        }

        sqlx::query(
            "UPDATE entity_states
             SET artifact_hash = ?, state = 'AUTHORITATIVE', filepath = COALESCE(?, filepath),
                 stale = 0, updated_at = ?
             WHERE entity_key = ?",
        )
        .bind(&resolution.artifact_hash)
        .bind(&resolution.filepath)
        .bind(Utc::now().to_rfc3339())
        .bind(key)
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;
        Ok(())
    }
}

fn metadata_list_contains(metadata: &serde_json::Value, field: &str, needle: &str) -> bool {
    metadata
        .get(field)
        .and_then(|v| v.as_array())
        .map(|list| list.iter().any(|v| v.as_str() == Some(needle)))
        .unwrap_or(false)
}

fn decode_entity(row: sqlx::sqlite::SqliteRow) -> Result<EntityState> {
    let entity_key: String = row.get("entity_key");
    let state: String = row.get("state");
    let stale: i64 = row.get("stale");
    let updated_at: String = row.get("updated_at");
    Ok(EntityState {
        entity_key: entity_key.parse()?,
        artifact_hash: row.get("artifact_hash"),
        state: state.parse()?,
        filepath: row.get("filepath"),
        stale: stale != 0,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tinymem_resolver::Resolver;
    use tinymem_types::ContentType;
    use tinymem_vault::Vault;

    const COUNTER_FULL: &str = "package counter\n\ntype Counter struct{ n int }\n\nfunc (c *Counter) Increment() { c.n++ }\n\nfunc (c *Counter) Get() int { return c.n }\n";
    const COUNTER_COLLAPSED: &str = "package counter\n\ntype Counter struct{ n int }\n";
    const COUNTER_EXTENDED: &str = "package counter\n\ntype Counter struct{ n int }\n\nfunc (c *Counter) Increment() { c.n++ }\n\nfunc (c *Counter) Get() int { return c.n }\n\nfunc (c *Counter) Reset() { c.n = 0 }\n";

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        vault: Vault,
        ledger: Ledger,
        resolver: Resolver,
        machine: StateMachine,
        episode: EpisodeId,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = Store::in_memory().await.unwrap();
        let vault = Vault::new(store.clone());
        let ledger = Ledger::new(store.clone());
        let resolver = Resolver::new(store.clone());
        let machine = StateMachine::new(store, ledger.clone(), &root);
        let episode = ledger.create_episode(None, None, None).await.unwrap();
        Fixture {
            _dir: dir,
            root,
            vault,
            ledger,
            resolver,
            machine,
            episode,
        }
    }

    async fn resolve(fx: &Fixture, source: &str, filepath: &str) -> Resolution {
        let hash = fx
            .vault
            .store(source.as_bytes(), ContentType::Code, None)
            .await
            .unwrap();
        fx.resolver
            .resolve(&hash, source.as_bytes(), Some(filepath))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn user_paste_promotes_a_fresh_entity() {
        let fx = fixture().await;
        let resolution = resolve(&fx, COUNTER_FULL, "x.go").await;

        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &resolution, true)
            .await
            .unwrap();

        assert!(outcome.promoted);
        assert_eq!(outcome.state, ArtifactState::Authoritative);
        assert!(outcome.reason.contains("gate_b=pass(user write-head)"));

        let entity = fx.machine.get_entity("x.go::Counter").await.unwrap().unwrap();
        assert_eq!(entity.state, ArtifactState::Authoritative);
        assert_eq!(entity.artifact_hash, resolution.artifact_hash);
    }

    #[tokio::test]
    async fn collapse_is_denied_with_parity_reason() {
        let fx = fixture().await;
        let full = resolve(&fx, COUNTER_FULL, "x.go").await;
        assert_eq!(full.symbols, vec!["Counter", "Increment", "Get"]);
        fx.machine
            .attempt_promotion(fx.episode, &full, true)
            .await
            .unwrap();

        let collapsed = resolve(&fx, COUNTER_COLLAPSED, "x.go").await;
        assert_eq!(collapsed.symbols, vec!["Counter"]);
        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &collapsed, true)
            .await
            .unwrap();

        assert!(!outcome.promoted);
        assert_eq!(outcome.state, ArtifactState::Proposed);
        assert!(outcome.reason.contains("parity_symbols_missing=[Increment,Get]"));
        assert!(outcome.reason.contains("parity_ast_collapse="));

        // The entity keeps its authoritative artifact.
        let entity = fx.machine.get_entity("x.go::Counter").await.unwrap().unwrap();
        assert_eq!(entity.state, ArtifactState::Authoritative);
        assert_eq!(entity.artifact_hash, full.artifact_hash);

        // And the denial is in the ledger with the artifact still proposed.
        let transitions = fx.ledger.get_state_transitions("x.go::Counter").await.unwrap();
        let last = transitions.last().unwrap();
        assert_eq!(last.to_state, ArtifactState::Proposed);
        assert_eq!(last.artifact_hash, collapsed.artifact_hash);
        assert!(last.reason.contains("denied"));
    }

    #[tokio::test]
    async fn superset_promotion_supersedes_the_old_artifact() {
        let fx = fixture().await;
        let full = resolve(&fx, COUNTER_FULL, "x.go").await;
        fx.machine
            .attempt_promotion(fx.episode, &full, true)
            .await
            .unwrap();

        let extended = resolve(&fx, COUNTER_EXTENDED, "x.go").await;
        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &extended, true)
            .await
            .unwrap();
        assert!(outcome.promoted);

        let entity = fx.machine.get_entity("x.go::Counter").await.unwrap().unwrap();
        assert_eq!(entity.artifact_hash, extended.artifact_hash);

        let transitions = fx.ledger.get_state_transitions("x.go::Counter").await.unwrap();
        assert!(transitions.iter().any(|t| {
            t.artifact_hash == full.artifact_hash && t.to_state == ArtifactState::Superseded
        }));
        assert!(fx.machine.verify_replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_grant_means_no_promotion() {
        let fx = fixture().await;
        let resolution = resolve(&fx, COUNTER_FULL, "x.go").await;

        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &resolution, false)
            .await
            .unwrap();

        assert!(!outcome.promoted);
        assert!(outcome.reason.contains("gate_b=fail(no authority grant)"));
        let entity = fx.machine.get_entity("x.go::Counter").await.unwrap().unwrap();
        assert_eq!(entity.state, ArtifactState::Proposed);
    }

    #[tokio::test]
    async fn hydration_then_prompt_grants_implicit_approval() {
        let fx = fixture().await;
        let resolution = resolve(&fx, COUNTER_FULL, "x.go").await;

        // The entity was hydrated in one episode and a later prompt arrived.
        fx.ledger
            .create_episode(
                None,
                None,
                Some(serde_json::json!({"hydrated_entities": ["x.go::Counter"]})),
            )
            .await
            .unwrap();
        fx.ledger.create_episode(None, None, None).await.unwrap();

        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &resolution, false)
            .await
            .unwrap();
        assert!(outcome.promoted);
        assert!(outcome.reason.contains("implicit user approval"));
    }

    #[tokio::test]
    async fn recorded_rejection_blocks_implicit_approval() {
        let fx = fixture().await;
        let resolution = resolve(&fx, COUNTER_FULL, "x.go").await;

        fx.ledger
            .create_episode(
                None,
                None,
                Some(serde_json::json!({"hydrated_entities": ["x.go::Counter"]})),
            )
            .await
            .unwrap();
        fx.ledger
            .create_episode(
                None,
                None,
                Some(serde_json::json!({"rejected_entities": ["x.go::Counter"]})),
            )
            .await
            .unwrap();

        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &resolution, false)
            .await
            .unwrap();
        assert!(!outcome.promoted);
    }

    #[tokio::test]
    async fn divergent_disk_file_denies_and_marks_stale() {
        let fx = fixture().await;
        std::fs::write(fx.root.join("x.go"), "package counter // drifted\n").unwrap();
        let resolution = resolve(&fx, COUNTER_FULL, "x.go").await;

        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &resolution, true)
            .await
            .unwrap();

        assert!(!outcome.promoted);
        assert!(outcome.reason.contains("gate_c=fail(on-disk file differs"));
        let entity = fx.machine.get_entity("x.go::Counter").await.unwrap().unwrap();
        assert!(entity.stale);
    }

    #[tokio::test]
    async fn matching_disk_file_passes_gate_c() {
        let fx = fixture().await;
        std::fs::write(fx.root.join("x.go"), COUNTER_FULL).unwrap();
        let resolution = resolve(&fx, COUNTER_FULL, "x.go").await;

        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &resolution, true)
            .await
            .unwrap();
        assert!(outcome.promoted);
        assert!(outcome.reason.contains("gate_c=pass(on-disk file matches)"));
    }

    #[tokio::test]
    async fn inferred_resolutions_never_promote() {
        let fx = fixture().await;
        // Establish the entity, then try to promote a correlated snippet.
        let full = resolve(&fx, COUNTER_FULL, "x.go").await;
        fx.machine
            .attempt_promotion(fx.episode, &full, true)
            .await
            .unwrap();

        let snippet = "Counter Increment Get";
        let hash = fx
            .vault
            .store(snippet.as_bytes(), ContentType::Code, None)
            .await
            .unwrap();
        let correlated = fx
            .resolver
            .resolve(&hash, snippet.as_bytes(), None)
            .await
            .unwrap();
        assert_eq!(correlated.confidence, Confidence::Inferred);

        let outcome = fx
            .machine
            .attempt_promotion(fx.episode, &correlated, true)
            .await
            .unwrap();
        assert!(!outcome.promoted);
        assert!(outcome.reason.contains("is not CONFIRMED"));
    }

    #[tokio::test]
    async fn tombstone_is_a_transition_not_a_delete() {
        let fx = fixture().await;
        let resolution = resolve(&fx, COUNTER_FULL, "x.go").await;
        fx.machine
            .attempt_promotion(fx.episode, &resolution, true)
            .await
            .unwrap();

        fx.machine
            .tombstone(fx.episode, "x.go::Counter", "withdrawn by user")
            .await
            .unwrap();

        let entity = fx.machine.get_entity("x.go::Counter").await.unwrap().unwrap();
        assert_eq!(entity.state, ArtifactState::Tombstoned);
        assert!(fx.machine.verify_replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_reconstructs_the_entity_map() {
        let fx = fixture().await;
        let full = resolve(&fx, COUNTER_FULL, "x.go").await;
        fx.machine
            .attempt_promotion(fx.episode, &full, true)
            .await
            .unwrap();
        let collapsed = resolve(&fx, COUNTER_COLLAPSED, "x.go").await;
        fx.machine
            .attempt_promotion(fx.episode, &collapsed, true)
            .await
            .unwrap();
        let extended = resolve(&fx, COUNTER_EXTENDED, "x.go").await;
        fx.machine
            .attempt_promotion(fx.episode, &extended, true)
            .await
            .unwrap();

        let replayed = fx.machine.replay().await.unwrap();
        let (hash, state) = replayed.get("x.go::Counter").unwrap();
        assert_eq!(hash, &extended.artifact_hash);
        assert_eq!(*state, ArtifactState::Authoritative);
        assert!(fx.machine.verify_replay().await.unwrap().is_empty());
    }
}
