#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-resolver** – Map an artifact to an entity with an honest
//! confidence.
//!
//! The pipeline is strictly ordered and short-circuits on the first
//! resolved result:
//!
//! 1. **AST** (may CONFIRM): parse with the language's grammar, extract
//!    top-level declarations. A parse failure is a hard failure of the
//!    stage and falls through; a successful parse with no symbols is
//!    UNRESOLVED and does *not* fall through.
//! 2. **Regex** (may CONFIRM or INFER): the embedded catalogue. One unique
//!    symbol captured by a declaration-form pattern confirms
//!    `unknown::symbol`; anything looser is inferred and names no entity.
//! 3. **Correlation** (may only INFER): symbol overlap against entities
//!    already in the state map. Never introduces an entity.
//! 4. UNRESOLVED.
//!
//! CONFIRMED is the only confidence the state machine will promote on;
//! the cheap fallback stages may suggest but never prove. Results are
//! cached per artifact hash, in process and in the `resolutions` table.

use chrono::Utc;
use dashmap::DashMap;
use sqlx::Row;
use tracing::debug;

use tinymem_store::Store;
use tinymem_types::{
    Confidence, EntityKey, Resolution, ResolveMethod, Result, TinyMemError,
};

pub mod ast;
pub mod correlate;
pub mod language;
pub mod patterns;

pub use correlate::KnownEntity;
pub use language::Language;

/// The resolution pipeline with its per-hash cache.
#[derive(Debug)]
pub struct Resolver {
    store: Store,
    cache: DashMap<String, Resolution>,
}

impl Resolver {
    /// Wrap the shared store handle.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Resolve an artifact. The artifact must already exist in the vault;
    /// the cached resolution row references it.
    ///
    /// Internal stage failures convert to UNRESOLVED at this boundary;
    /// the only errors surfaced are storage failures.
    pub async fn resolve(
        &self,
        artifact_hash: &str,
        content: &[u8],
        filepath: Option<&str>,
    ) -> Result<Resolution> {
        if let Some(cached) = self.lookup(artifact_hash).await? {
            return Ok(cached);
        }

        let text = String::from_utf8_lossy(content);
        let resolution = self.run_pipeline(artifact_hash, &text, filepath).await?;
        self.persist(&resolution).await?;
        self.cache
            .insert(artifact_hash.to_string(), resolution.clone());
        Ok(resolution)
    }

    /// The cached resolution for an artifact, if one exists.
    pub async fn lookup(&self, artifact_hash: &str) -> Result<Option<Resolution>> {
        if let Some(cached) = self.cache.get(artifact_hash) {
            return Ok(Some(cached.clone()));
        }
        let row = sqlx::query(
            "SELECT artifact_hash, entity_key, confidence, method, filepath, symbols, ast_node_count
             FROM resolutions WHERE artifact_hash = ?",
        )
        .bind(artifact_hash)
        .fetch_optional(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        match row {
            Some(row) => {
                let resolution = decode_resolution(row)?;
                self.cache
                    .insert(artifact_hash.to_string(), resolution.clone());
                Ok(Some(resolution))
            }
            None => Ok(None),
        }
    }

    async fn run_pipeline(
        &self,
        artifact_hash: &str,
        text: &str,
        filepath: Option<&str>,
    ) -> Result<Resolution> {
        let lang = language::detect(filepath, text);

        // Stage 1: AST.
        if lang.has_grammar() {
            match ast::extract(lang, text) {
                Ok(extraction) => {
                    return Ok(self.from_ast(artifact_hash, filepath, extraction));
                }
                Err(e) => {
                    debug!(%artifact_hash, error = %e, "ast stage failed, trying patterns");
                }
            }
        }

        // Stage 2: regex catalogue.
        let matches = patterns::scan(lang, text);
        if !matches.symbols.is_empty() {
            return Ok(from_patterns(artifact_hash, filepath, matches));
        }

        // Stage 3: correlation against known entities.
        let entities = self.known_entities().await?;
        if let Some((entity_key, overlap)) = correlate::correlate(text, &entities) {
            debug!(%artifact_hash, entity = %entity_key, overlap, "correlated");
            return Ok(Resolution {
                artifact_hash: artifact_hash.to_string(),
                entity_key: Some(entity_key),
                confidence: Confidence::Inferred,
                method: ResolveMethod::Correlation,
                filepath: filepath.map(str::to_string),
                symbols: Vec::new(),
                ast_node_count: None,
            });
        }

        Ok(Resolution {
            filepath: filepath.map(str::to_string),
            ..Resolution::unresolved(artifact_hash, ResolveMethod::Unresolved)
        })
    }

    fn from_ast(
        &self,
        artifact_hash: &str,
        filepath: Option<&str>,
        extraction: ast::AstExtraction,
    ) -> Resolution {
        if extraction.symbols.is_empty() {
            // A clean parse that declares nothing is final for the AST
            // stage: the artifact is structurally empty, not ambiguous.
            return Resolution {
                filepath: filepath.map(str::to_string),
                ast_node_count: Some(extraction.node_count),
                ..Resolution::unresolved(artifact_hash, ResolveMethod::Ast)
            };
        }

        let entity_key = match filepath {
            Some(path) => EntityKey::new(path, extraction.symbols[0].clone()).ok(),
            None if extraction.symbols.len() == 1 => {
                EntityKey::unknown(extraction.symbols[0].clone()).ok()
            }
            None => None,
        };
        Resolution {
            artifact_hash: artifact_hash.to_string(),
            entity_key,
            confidence: Confidence::Confirmed,
            method: ResolveMethod::Ast,
            filepath: filepath.map(str::to_string),
            symbols: extraction.symbols,
            ast_node_count: Some(extraction.node_count),
        }
    }

    /// Entities eligible as correlation targets, with the symbols of their
    /// governing artifacts. Tombstoned entities never correlate.
    async fn known_entities(&self) -> Result<Vec<KnownEntity>> {
        let rows = sqlx::query(
            "SELECT e.entity_key, r.symbols
             FROM entity_states e
             JOIN resolutions r ON r.artifact_hash = e.artifact_hash
             WHERE e.state IN ('PROPOSED', 'AUTHORITATIVE')",
        )
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;

        rows.into_iter()
            .map(|row| {
                let entity_key: String = row.get("entity_key");
                let symbols: String = row.get("symbols");
                Ok(KnownEntity {
                    entity_key: entity_key.parse()?,
                    symbols: serde_json::from_str(&symbols)?,
                })
            })
            .collect()
    }

    async fn persist(&self, resolution: &Resolution) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO resolutions
             (artifact_hash, entity_key, confidence, method, filepath, symbols, ast_node_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&resolution.artifact_hash)
        .bind(resolution.entity_key.as_ref().map(|k| k.to_string()))
        .bind(resolution.confidence.as_str())
        .bind(resolution.method.as_str())
        .bind(&resolution.filepath)
        .bind(serde_json::to_string(&resolution.symbols)?)
        .bind(resolution.ast_node_count)
        .bind(Utc::now().to_rfc3339())
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;
        Ok(())
    }
}

fn from_patterns(
    artifact_hash: &str,
    filepath: Option<&str>,
    matches: patterns::PatternMatches,
) -> Resolution {
    let confirmed = matches.confirmed();
    if matches.symbols.len() == 1 && confirmed.len() == 1 {
        let symbol = confirmed[0].to_string();
        return Resolution {
            artifact_hash: artifact_hash.to_string(),
            entity_key: EntityKey::unknown(&symbol).ok(),
            confidence: Confidence::Confirmed,
            method: ResolveMethod::Regex,
            filepath: filepath.map(str::to_string),
            symbols: vec![symbol],
            ast_node_count: None,
        };
    }

    // Several candidates, or a lone capture from a loose pattern: the
    // match is ambiguous. Report what was seen, name no entity.
    Resolution {
        artifact_hash: artifact_hash.to_string(),
        entity_key: None,
        confidence: Confidence::Inferred,
        method: ResolveMethod::Regex,
        filepath: filepath.map(str::to_string),
        symbols: matches.names(),
        ast_node_count: None,
    }
}

fn decode_resolution(row: sqlx::sqlite::SqliteRow) -> Result<Resolution> {
    let entity_key: Option<String> = row.get("entity_key");
    let confidence: String = row.get("confidence");
    let method: String = row.get("method");
    let symbols: String = row.get("symbols");
    Ok(Resolution {
        artifact_hash: row.get("artifact_hash"),
        entity_key: entity_key.as_deref().map(str::parse).transpose()?,
        confidence: confidence.parse()?,
        method: method.parse()?,
        filepath: row.get("filepath"),
        symbols: serde_json::from_str(&symbols)?,
        ast_node_count: row.get("ast_node_count"),
    })
}
