#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-hydration** – Re-materialize authoritative state into prompts.
//!
//! On each new episode the engine selects the authoritative artifacts the
//! model must see so it works from the real state of the project instead of
//! reconstructing it from chat history. Selection is ranked (entities the
//! current prompt references, then recent-episode continuity, then
//! promotion recency) and cut at a token budget. The
//! selection itself is recorded in the episode's metadata, which is what
//! later lets Gate B treat "hydrated, then user moved on" as implicit
//! approval.

use sqlx::Row;
use tracing::{debug, warn};

use tinymem_ledger::Ledger;
use tinymem_state::StateMachine;
use tinymem_store::Store;
use tinymem_types::{ArtifactState, EntityState, EpisodeId, Result, TinyMemError};
use tinymem_vault::Vault;

/// Tuning for the hydration engine.
#[derive(Debug, Clone)]
pub struct HydrationConfig {
    /// Token budget for the whole hydration block.
    pub max_tokens: i64,
    /// How many recent episodes count as "tracking continuity".
    pub recent_episodes: i64,
    /// Include stale entities (with a warning) instead of skipping them.
    pub include_stale: bool,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            recent_episodes: 5,
            include_stale: false,
        }
    }
}

/// One selected artifact, ready for injection.
#[derive(Debug, Clone, PartialEq)]
pub struct HydratedArtifact {
    /// The entity the artifact governs.
    pub entity_key: String,
    /// Artifact content as text.
    pub content: String,
    /// Token weight charged against the budget.
    pub tokens: i64,
}

/// Result of hydrating one episode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hydration {
    /// Selected artifacts in rank order.
    pub artifacts: Vec<HydratedArtifact>,
    /// Total token weight of the selection.
    pub total_tokens: i64,
}

impl Hydration {
    /// Entity keys of the selection, in rank order.
    pub fn entity_keys(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.entity_key.clone()).collect()
    }

    /// Render the selection as one system-role message body, each artifact
    /// labeled by its entity key. Empty selection renders nothing.
    pub fn system_message(&self) -> Option<String> {
        if self.artifacts.is_empty() {
            return None;
        }
        let mut message = String::from(
            "Authoritative project state. These artifacts are the current, verified \
             versions; do not re-derive them from conversation history.\n",
        );
        for artifact in &self.artifacts {
            message.push_str(&format!(
                "\n### {}\n```\n{}\n```\n",
                artifact.entity_key, artifact.content
            ));
        }
        Some(message)
    }
}

/// The hydration engine.
#[derive(Debug, Clone)]
pub struct HydrationEngine {
    store: Store,
    vault: Vault,
    ledger: Ledger,
    machine: StateMachine,
    config: HydrationConfig,
}

impl HydrationEngine {
    /// Build over the shared components.
    pub fn new(
        store: Store,
        vault: Vault,
        ledger: Ledger,
        machine: StateMachine,
        config: HydrationConfig,
    ) -> Self {
        Self {
            store,
            vault,
            ledger,
            machine,
            config,
        }
    }

    /// Select authoritative artifacts for this episode and record the
    /// selection in the episode's metadata.
    pub async fn hydrate(&self, episode_id: EpisodeId, user_prompt: &str) -> Result<Hydration> {
        let mut candidates = self.machine.list_by_state(ArtifactState::Authoritative).await?;
        if candidates.is_empty() {
            return Ok(Hydration::default());
        }

        // Freshness filter (Gate C re-check) before ranking.
        let mut fresh = Vec::new();
        for entity in candidates.drain(..) {
            let is_fresh = self.machine.refresh_freshness(&entity).await?;
            if is_fresh {
                fresh.push(entity);
            } else if self.config.include_stale {
                warn!(entity = %entity.entity_key, "including stale entity in hydration");
                fresh.push(entity);
            } else {
                debug!(entity = %entity.entity_key, "skipping stale entity");
            }
        }

        let recently_hydrated = self.recently_hydrated().await?;
        let mut ranked = Vec::with_capacity(fresh.len());
        for entity in fresh {
            let rank = self.rank(&entity, user_prompt, &recently_hydrated).await?;
            ranked.push((rank, entity));
        }
        // Rank ascending; recency of promotion breaks ties (newest first).
        ranked.sort_by(|(ra, ea), (rb, eb)| {
            ra.cmp(rb).then(eb.updated_at.cmp(&ea.updated_at))
        });

        let mut hydration = Hydration::default();
        for (_, entity) in ranked {
            let Some(artifact) = self.vault.get(&entity.artifact_hash).await? else {
                continue;
            };
            let tokens = artifact.token_weight();
            if hydration.total_tokens + tokens > self.config.max_tokens {
                continue;
            }
            hydration.artifacts.push(HydratedArtifact {
                entity_key: entity.entity_key.to_string(),
                content: String::from_utf8_lossy(&artifact.content).into_owned(),
                tokens,
            });
            hydration.total_tokens += tokens;
        }

        self.ledger
            .update_episode_metadata(
                episode_id,
                &serde_json::json!({ "hydrated_entities": hydration.entity_keys() }),
            )
            .await?;
        debug!(
            episode = %episode_id,
            entities = hydration.artifacts.len(),
            tokens = hydration.total_tokens,
            "hydration selected"
        );
        Ok(hydration)
    }

    /// 0 = referenced by the prompt, 1 = hydrated recently, 2 = the rest.
    async fn rank(
        &self,
        entity: &EntityState,
        user_prompt: &str,
        recently_hydrated: &[String],
    ) -> Result<u8> {
        if self.prompt_references(entity, user_prompt).await? {
            return Ok(0);
        }
        if recently_hydrated.contains(&entity.entity_key.to_string()) {
            return Ok(1);
        }
        Ok(2)
    }

    /// The prompt references an entity by exact filepath or by any symbol
    /// of its governing artifact.
    async fn prompt_references(&self, entity: &EntityState, user_prompt: &str) -> Result<bool> {
        if let Some(filepath) = &entity.filepath {
            if user_prompt.contains(filepath.as_str()) {
                return Ok(true);
            }
        }
        if user_prompt.contains(entity.entity_key.filepath())
            || user_prompt.contains(entity.entity_key.symbol())
        {
            return Ok(true);
        }

        let row = sqlx::query("SELECT symbols FROM resolutions WHERE artifact_hash = ?")
            .bind(&entity.artifact_hash)
            .fetch_optional(self.store.reader())
            .await
            .map_err(TinyMemError::storage)?;
        if let Some(row) = row {
            let symbols: Vec<String> = serde_json::from_str(&row.get::<String, _>("symbols"))?;
            return Ok(symbols.iter().any(|s| user_prompt.contains(s.as_str())));
        }
        Ok(false)
    }

    /// Entity keys hydrated in the most recent N episodes.
    async fn recently_hydrated(&self) -> Result<Vec<String>> {
        let episodes = self
            .ledger
            .get_recent_episodes(self.config.recent_episodes)
            .await?;
        let mut keys = Vec::new();
        for episode in episodes {
            if let Some(list) = episode
                .metadata
                .get("hydrated_entities")
                .and_then(|v| v.as_array())
            {
                for value in list {
                    if let Some(key) = value.as_str() {
                        if !keys.contains(&key.to_string()) {
                            keys.push(key.to_string());
                        }
                    }
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tinymem_resolver::Resolver;
    use tinymem_types::ContentType;

    struct Fixture {
        _dir: TempDir,
        vault: Vault,
        ledger: Ledger,
        resolver: Resolver,
        machine: StateMachine,
        store: Store,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let vault = Vault::new(store.clone());
        let ledger = Ledger::new(store.clone());
        let resolver = Resolver::new(store.clone());
        let machine = StateMachine::new(store.clone(), ledger.clone(), dir.path());
        Fixture {
            _dir: dir,
            vault,
            ledger,
            resolver,
            machine,
            store,
        }
    }

    fn engine(fx: &Fixture, config: HydrationConfig) -> HydrationEngine {
        HydrationEngine::new(
            fx.store.clone(),
            fx.vault.clone(),
            fx.ledger.clone(),
            fx.machine.clone(),
            config,
        )
    }

    async fn promote(fx: &Fixture, source: &str, filepath: &str) -> String {
        let episode = fx.ledger.create_episode(None, None, None).await.unwrap();
        let hash = fx
            .vault
            .store(source.as_bytes(), ContentType::Code, None)
            .await
            .unwrap();
        let resolution = fx
            .resolver
            .resolve(&hash, source.as_bytes(), Some(filepath))
            .await
            .unwrap();
        let outcome = fx
            .machine
            .attempt_promotion(episode, &resolution, true)
            .await
            .unwrap();
        assert!(outcome.promoted, "fixture promotion failed: {}", outcome.reason);
        outcome.entity_key.to_string()
    }

    #[tokio::test]
    async fn empty_state_hydrates_nothing() {
        let fx = fixture().await;
        let engine = engine(&fx, HydrationConfig::default());
        let episode = fx.ledger.create_episode(None, None, None).await.unwrap();

        let hydration = engine.hydrate(episode, "anything").await.unwrap();
        assert!(hydration.artifacts.is_empty());
        assert!(hydration.system_message().is_none());
    }

    #[tokio::test]
    async fn selection_is_recorded_in_episode_metadata() {
        let fx = fixture().await;
        let key = promote(&fx, "package a\n\nfunc Alpha() {}\n", "a.go").await;
        let engine = engine(&fx, HydrationConfig::default());
        let episode = fx.ledger.create_episode(None, None, None).await.unwrap();

        let hydration = engine.hydrate(episode, "work on a.go please").await.unwrap();
        assert_eq!(hydration.entity_keys(), vec![key.clone()]);

        let stored = fx.ledger.get_episode(episode).await.unwrap().unwrap();
        assert_eq!(
            stored.metadata.get("hydrated_entities").unwrap(),
            &serde_json::json!([key])
        );

        let message = hydration.system_message().unwrap();
        assert!(message.contains("### a.go::Alpha"));
        assert!(message.contains("func Alpha()"));
    }

    #[tokio::test]
    async fn prompt_referenced_entities_rank_first() {
        let fx = fixture().await;
        promote(&fx, "package a\n\nfunc Alpha() {}\n", "a.go").await;
        let beta = promote(&fx, "package b\n\nfunc Beta() {}\n", "b.go").await;
        let engine = engine(&fx, HydrationConfig::default());
        let episode = fx.ledger.create_episode(None, None, None).await.unwrap();

        let hydration = engine.hydrate(episode, "please fix Beta").await.unwrap();
        assert_eq!(hydration.artifacts[0].entity_key, beta);
        assert_eq!(hydration.artifacts.len(), 2);
    }

    #[tokio::test]
    async fn token_budget_bounds_the_selection() {
        let fx = fixture().await;
        promote(&fx, "package a\n\nfunc Alpha() {}\n", "a.go").await;
        promote(&fx, "package b\n\nfunc Beta() {}\n", "b.go").await;
        // Budget fits roughly one small artifact.
        let engine = engine(
            &fx,
            HydrationConfig {
                max_tokens: 10,
                ..HydrationConfig::default()
            },
        );
        let episode = fx.ledger.create_episode(None, None, None).await.unwrap();

        let hydration = engine.hydrate(episode, "").await.unwrap();
        assert!(hydration.total_tokens <= 10);
        assert!(hydration.artifacts.len() <= 1);
    }

    #[tokio::test]
    async fn stale_entities_are_skipped_unless_configured() {
        let fx = fixture().await;
        let key = promote(&fx, "package a\n\nfunc Alpha() {}\n", "a.go").await;
        // Drift the on-disk file after promotion.
        std::fs::write(fx._dir.path().join("a.go"), "package a // drifted\n").unwrap();

        let skipping = engine(&fx, HydrationConfig::default());
        let episode = fx.ledger.create_episode(None, None, None).await.unwrap();
        let hydration = skipping.hydrate(episode, "").await.unwrap();
        assert!(hydration.artifacts.is_empty());

        let including = engine(
            &fx,
            HydrationConfig {
                include_stale: true,
                ..HydrationConfig::default()
            },
        );
        let episode = fx.ledger.create_episode(None, None, None).await.unwrap();
        let hydration = including.hydrate(episode, "").await.unwrap();
        assert_eq!(hydration.entity_keys(), vec![key]);
    }

    #[tokio::test]
    async fn recent_hydration_outranks_cold_entities() {
        let fx = fixture().await;
        let alpha = promote(&fx, "package a\n\nfunc Alpha() {}\n", "a.go").await;
        promote(&fx, "package b\n\nfunc Beta() {}\n", "b.go").await;

        // Alpha was hydrated in a recent episode.
        fx.ledger
            .create_episode(
                None,
                None,
                Some(serde_json::json!({"hydrated_entities": [alpha.clone()]})),
            )
            .await
            .unwrap();

        let engine = engine(&fx, HydrationConfig::default());
        let episode = fx.ledger.create_episode(None, None, None).await.unwrap();
        let hydration = engine.hydrate(episode, "no references here").await.unwrap();
        assert_eq!(hydration.artifacts[0].entity_key, alpha);
    }
}
