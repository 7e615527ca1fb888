#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-ledger** – Append-only chronological log for tinyMem.
//!
//! The ledger records three things and forgets none of them: episodes (one
//! user/assistant exchange each), entity state transitions, and shadow
//! audit outcomes. Episode metadata may be amended by deep merge and the
//! assistant response hash may be set once; everything else is strictly
//! append. Replaying the transition rows in append order reconstructs the
//! entity state map exactly, which is what makes the rest of the system
//! auditable from this table alone.

use chrono::Utc;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use tinymem_store::Store;
use tinymem_types::{
    deep_merge, empty_metadata, parse_timestamp, ArtifactState, AuditResult, AuditStatus,
    Episode, EpisodeId, Result, StateTransition, TinyMemError,
};

/// The append-only log.
#[derive(Debug, Clone)]
pub struct Ledger {
    store: Store,
}

impl Ledger {
    /// Wrap the shared store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    //─────────────────────────────
    //  Episodes
    //─────────────────────────────

    /// Record a new episode at request arrival. The write is committed
    /// before the id is returned.
    pub async fn create_episode(
        &self,
        user_prompt_hash: Option<&str>,
        assistant_response_hash: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<EpisodeId> {
        let episode_id = Uuid::new_v4();
        let metadata = metadata.unwrap_or_else(empty_metadata);
        sqlx::query(
            "INSERT INTO ledger_episodes
             (episode_id, created_at, user_prompt_hash, assistant_response_hash, metadata)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(episode_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(user_prompt_hash)
        .bind(assistant_response_hash)
        .bind(serde_json::to_string(&metadata)?)
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;
        debug!(%episode_id, "episode created");
        Ok(episode_id)
    }

    /// Deep-merge `updates` into the episode's metadata map. Keys absent
    /// from `updates` are untouched.
    pub async fn update_episode_metadata(
        &self,
        episode_id: EpisodeId,
        updates: &serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.store.tx().await?;
        let row = sqlx::query("SELECT metadata FROM ledger_episodes WHERE episode_id = ?")
            .bind(episode_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(TinyMemError::storage)?
            .ok_or_else(|| TinyMemError::storage(format!("unknown episode {episode_id}")))?;
        let raw: String = row.get("metadata");
        let mut metadata: serde_json::Value = serde_json::from_str(&raw)?;
        deep_merge(&mut metadata, updates);
        sqlx::query("UPDATE ledger_episodes SET metadata = ? WHERE episode_id = ?")
            .bind(serde_json::to_string(&metadata)?)
            .bind(episode_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(TinyMemError::storage)?;
        tx.commit().await.map_err(TinyMemError::storage)
    }

    /// Record the assistant response hash. Set once; a second call on the
    /// same episode is refused.
    pub async fn update_episode_assistant_response(
        &self,
        episode_id: EpisodeId,
        hash: &str,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE ledger_episodes SET assistant_response_hash = ?
             WHERE episode_id = ? AND assistant_response_hash IS NULL",
        )
        .bind(hash)
        .bind(episode_id.to_string())
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;
        if updated.rows_affected() == 0 {
            return Err(TinyMemError::storage(format!(
                "episode {episode_id} missing or response already recorded"
            )));
        }
        Ok(())
    }

    /// Fetch one episode.
    pub async fn get_episode(&self, episode_id: EpisodeId) -> Result<Option<Episode>> {
        let row = sqlx::query(
            "SELECT episode_id, created_at, user_prompt_hash, assistant_response_hash, metadata
             FROM ledger_episodes WHERE episode_id = ?",
        )
        .bind(episode_id.to_string())
        .fetch_optional(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        row.map(decode_episode).transpose()
    }

    /// Most recent episodes, newest first.
    pub async fn get_recent_episodes(&self, limit: i64) -> Result<Vec<Episode>> {
        let rows = sqlx::query(
            "SELECT episode_id, created_at, user_prompt_hash, assistant_response_hash, metadata
             FROM ledger_episodes ORDER BY created_at DESC, episode_id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_episode).collect()
    }

    /// Episodes created strictly before `ts` (RFC 3339), newest first.
    pub async fn get_recent_episodes_before(&self, ts: &str, limit: i64) -> Result<Vec<Episode>> {
        let rows = sqlx::query(
            "SELECT episode_id, created_at, user_prompt_hash, assistant_response_hash, metadata
             FROM ledger_episodes WHERE created_at < ?
             ORDER BY created_at DESC, episode_id DESC LIMIT ?",
        )
        .bind(ts)
        .bind(limit)
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_episode).collect()
    }

    /// Total number of episodes.
    pub async fn count_episodes(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM ledger_episodes")
            .fetch_one(self.store.reader())
            .await
            .map_err(TinyMemError::storage)?;
        Ok(row.get(0))
    }

    //─────────────────────────────
    //  State transitions
    //─────────────────────────────

    /// Append one state transition record. Durable before returning.
    pub async fn record_state_transition(
        &self,
        episode_id: EpisodeId,
        entity_key: &str,
        from_state: Option<ArtifactState>,
        to_state: ArtifactState,
        artifact_hash: &str,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ledger_state_transitions
             (episode_id, entity_key, from_state, to_state, artifact_hash, reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(episode_id.to_string())
        .bind(entity_key)
        .bind(from_state.map(|s| s.as_str()))
        .bind(to_state.as_str())
        .bind(artifact_hash)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;
        Ok(())
    }

    /// All transitions for one entity, in append order.
    pub async fn get_state_transitions(&self, entity_key: &str) -> Result<Vec<StateTransition>> {
        let rows = sqlx::query(
            "SELECT id, episode_id, entity_key, from_state, to_state, artifact_hash, reason, created_at
             FROM ledger_state_transitions WHERE entity_key = ?
             ORDER BY created_at, id",
        )
        .bind(entity_key)
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_transition).collect()
    }

    /// All transitions recorded during one episode, in append order.
    pub async fn get_transitions_for_episode(
        &self,
        episode_id: EpisodeId,
    ) -> Result<Vec<StateTransition>> {
        let rows = sqlx::query(
            "SELECT id, episode_id, entity_key, from_state, to_state, artifact_hash, reason, created_at
             FROM ledger_state_transitions WHERE episode_id = ?
             ORDER BY created_at, id",
        )
        .bind(episode_id.to_string())
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_transition).collect()
    }

    /// Every transition in the ledger, in append order. Used by replay.
    pub async fn get_all_transitions(&self) -> Result<Vec<StateTransition>> {
        let rows = sqlx::query(
            "SELECT id, episode_id, entity_key, from_state, to_state, artifact_hash, reason, created_at
             FROM ledger_state_transitions ORDER BY created_at, id",
        )
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_transition).collect()
    }

    //─────────────────────────────
    //  Audit results
    //─────────────────────────────

    /// Append one shadow audit outcome.
    pub async fn record_audit(
        &self,
        episode_id: EpisodeId,
        artifact_hash: &str,
        entity_key: Option<&str>,
        status: AuditStatus,
        audit_response: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ledger_audit_results
             (episode_id, artifact_hash, entity_key, status, audit_response, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(episode_id.to_string())
        .bind(artifact_hash)
        .bind(entity_key)
        .bind(status.as_str())
        .bind(audit_response)
        .bind(Utc::now().to_rfc3339())
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;
        Ok(())
    }

    /// Audit outcomes for one episode, in append order.
    pub async fn get_audit_results(&self, episode_id: EpisodeId) -> Result<Vec<AuditResult>> {
        let rows = sqlx::query(
            "SELECT id, episode_id, artifact_hash, entity_key, status, audit_response, created_at
             FROM ledger_audit_results WHERE episode_id = ? ORDER BY created_at, id",
        )
        .bind(episode_id.to_string())
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_audit).collect()
    }
}

fn decode_episode(row: sqlx::sqlite::SqliteRow) -> Result<Episode> {
    let id: String = row.get("episode_id");
    let created_at: String = row.get("created_at");
    let metadata: String = row.get("metadata");
    Ok(Episode {
        episode_id: id
            .parse()
            .map_err(|e| TinyMemError::Corrupt(format!("bad episode id {id}: {e}")))?,
        created_at: parse_timestamp(&created_at)?,
        user_prompt_hash: row.get("user_prompt_hash"),
        assistant_response_hash: row.get("assistant_response_hash"),
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn decode_transition(row: sqlx::sqlite::SqliteRow) -> Result<StateTransition> {
    let episode_id: String = row.get("episode_id");
    let from_state: Option<String> = row.get("from_state");
    let to_state: String = row.get("to_state");
    let created_at: String = row.get("created_at");
    Ok(StateTransition {
        id: row.get("id"),
        episode_id: episode_id
            .parse()
            .map_err(|e| TinyMemError::Corrupt(format!("bad episode id {episode_id}: {e}")))?,
        entity_key: row.get("entity_key"),
        from_state: from_state.as_deref().map(str::parse).transpose()?,
        to_state: to_state.parse()?,
        artifact_hash: row.get("artifact_hash"),
        reason: row.get("reason"),
        created_at: parse_timestamp(&created_at)?,
    })
}

fn decode_audit(row: sqlx::sqlite::SqliteRow) -> Result<AuditResult> {
    let episode_id: String = row.get("episode_id");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    Ok(AuditResult {
        id: row.get("id"),
        episode_id: episode_id
            .parse()
            .map_err(|e| TinyMemError::Corrupt(format!("bad episode id {episode_id}: {e}")))?,
        artifact_hash: row.get("artifact_hash"),
        entity_key: row.get("entity_key"),
        status: status.parse()?,
        audit_response: row.get("audit_response"),
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinymem_types::ContentType;
    use tinymem_vault::Vault;

    async fn fixtures() -> (Store, Ledger, Vault) {
        let store = Store::in_memory().await.unwrap();
        (store.clone(), Ledger::new(store.clone()), Vault::new(store))
    }

    #[tokio::test]
    async fn episode_lifecycle() {
        let (_, ledger, _) = fixtures().await;

        let id = ledger.create_episode(Some("abc"), None, None).await.unwrap();
        let episode = ledger.get_episode(id).await.unwrap().unwrap();
        assert_eq!(episode.user_prompt_hash.as_deref(), Some("abc"));
        assert!(episode.assistant_response_hash.is_none());
        assert_eq!(episode.metadata, serde_json::json!({}));
        assert_eq!(ledger.count_episodes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn metadata_merges_without_clobbering() {
        let (_, ledger, _) = fixtures().await;
        let id = ledger
            .create_episode(None, None, Some(serde_json::json!({"a": 1, "keep": true})))
            .await
            .unwrap();

        ledger
            .update_episode_metadata(id, &serde_json::json!({"a": 2, "b": ["x"]}))
            .await
            .unwrap();

        let episode = ledger.get_episode(id).await.unwrap().unwrap();
        assert_eq!(
            episode.metadata,
            serde_json::json!({"a": 2, "b": ["x"], "keep": true})
        );
    }

    #[tokio::test]
    async fn assistant_response_is_set_once() {
        let (_, ledger, _) = fixtures().await;
        let id = ledger.create_episode(None, None, None).await.unwrap();

        ledger
            .update_episode_assistant_response(id, "hash1")
            .await
            .unwrap();
        let second = ledger.update_episode_assistant_response(id, "hash2").await;
        assert!(second.is_err());

        let episode = ledger.get_episode(id).await.unwrap().unwrap();
        assert_eq!(episode.assistant_response_hash.as_deref(), Some("hash1"));
    }

    #[tokio::test]
    async fn transitions_replay_in_append_order() {
        let (_, ledger, vault) = fixtures().await;
        let episode = ledger.create_episode(None, None, None).await.unwrap();
        let hash = vault.store(b"func A() {}", ContentType::Code, None).await.unwrap();

        ledger
            .record_state_transition(
                episode,
                "x.go::A",
                None,
                ArtifactState::Proposed,
                &hash,
                "first sighting",
            )
            .await
            .unwrap();
        ledger
            .record_state_transition(
                episode,
                "x.go::A",
                Some(ArtifactState::Proposed),
                ArtifactState::Authoritative,
                &hash,
                "gates passed",
            )
            .await
            .unwrap();

        let transitions = ledger.get_state_transitions("x.go::A").await.unwrap();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to_state, ArtifactState::Proposed);
        assert_eq!(transitions[0].from_state, None);
        assert_eq!(transitions[1].from_state, Some(ArtifactState::Proposed));
        assert_eq!(transitions[1].to_state, ArtifactState::Authoritative);

        let by_episode = ledger.get_transitions_for_episode(episode).await.unwrap();
        assert_eq!(by_episode.len(), 2);
    }

    #[tokio::test]
    async fn audit_rows_are_recorded_per_episode() {
        let (_, ledger, _) = fixtures().await;
        let episode = ledger.create_episode(None, None, None).await.unwrap();

        ledger
            .record_audit(
                episode,
                "somehash",
                Some("x.go::A"),
                AuditStatus::Completed,
                "response matches the authoritative artifact",
            )
            .await
            .unwrap();

        let audits = ledger.get_audit_results(episode).await.unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status, AuditStatus::Completed);
        assert_eq!(audits[0].entity_key.as_deref(), Some("x.go::A"));
    }

    #[tokio::test]
    async fn episodes_before_a_timestamp_exclude_newer_rows() {
        let (_, ledger, _) = fixtures().await;
        let old = ledger.create_episode(None, None, None).await.unwrap();
        let cutoff = chrono::Utc::now().to_rfc3339();
        let new = ledger.create_episode(None, None, None).await.unwrap();

        let before = ledger.get_recent_episodes_before(&cutoff, 10).await.unwrap();
        let ids: Vec<_> = before.iter().map(|e| e.episode_id).collect();
        assert!(ids.contains(&old));
        assert!(!ids.contains(&new));
    }

    #[tokio::test]
    async fn recent_episodes_are_newest_first() {
        let (_, ledger, _) = fixtures().await;
        let first = ledger.create_episode(None, None, None).await.unwrap();
        let second = ledger.create_episode(None, None, None).await.unwrap();

        let recent = ledger.get_recent_episodes(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Same-timestamp rows fall back to id ordering; both must be present.
        let ids: Vec<_> = recent.iter().map(|e| e.episode_id).collect();
        assert!(ids.contains(&first));
        assert!(ids.contains(&second));
    }
}
