#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-vault** – Content-addressed immutable artifact store.
//!
//! Every durable blob in tinyMem (prompts, responses, code blocks, diffs,
//! tool payloads) lives here, keyed by the SHA-256 of its bytes. Identical
//! content converges to one row regardless of how many times or under which
//! content type it is stored.
//!
//! Immutability is structural: this type exposes no update and no delete
//! operation, and nothing else in the workspace writes to the `artifacts`
//! table.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::debug;

use tinymem_store::Store;
use tinymem_types::{
    parse_timestamp, Artifact, ArtifactHash, ContentType, Result, TinyMemError,
    MAX_ARTIFACT_BYTES,
};

/// Compute the vault address of a byte string: SHA-256, lowercase hex.
pub fn compute_hash(content: &[u8]) -> ArtifactHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// The content-addressed artifact store.
#[derive(Debug, Clone)]
pub struct Vault {
    store: Store,
}

impl Vault {
    /// Wrap the shared store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Store `content`, returning its hash.
    ///
    /// If a row with the same hash already exists the call is a no-op and
    /// the existing hash is returned; the content type of the first store
    /// wins and does not participate in addressing.
    pub async fn store(
        &self,
        content: &[u8],
        content_type: ContentType,
        token_count: Option<i64>,
    ) -> Result<ArtifactHash> {
        if content.len() > MAX_ARTIFACT_BYTES {
            return Err(TinyMemError::storage(format!(
                "artifact exceeds {MAX_ARTIFACT_BYTES} bytes"
            )));
        }

        let hash = compute_hash(content);
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO artifacts
             (hash, content, content_type, created_at, byte_size, token_count)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&hash)
        .bind(content)
        .bind(content_type.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(content.len() as i64)
        .bind(token_count)
        .execute(self.store.writer())
        .await
        .map_err(TinyMemError::storage)?;

        if inserted.rows_affected() == 0 {
            debug!(%hash, "artifact already present, deduplicated");
        }
        Ok(hash)
    }

    /// Fetch one artifact. A miss is `None`, not an error.
    pub async fn get(&self, hash: &str) -> Result<Option<Artifact>> {
        let row = sqlx::query(
            "SELECT hash, content, content_type, created_at, byte_size, token_count
             FROM artifacts WHERE hash = ?",
        )
        .bind(hash)
        .fetch_optional(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        row.map(decode_artifact).transpose()
    }

    /// Whether an artifact with this hash exists.
    pub async fn exists(&self, hash: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM artifacts WHERE hash = ?")
            .bind(hash)
            .fetch_optional(self.store.reader())
            .await
            .map_err(TinyMemError::storage)?;
        Ok(row.is_some())
    }

    /// Fetch several artifacts, preserving input order; missing hashes
    /// yield `None` at their position.
    pub async fn get_multiple(&self, hashes: &[String]) -> Result<Vec<Option<Artifact>>> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            out.push(self.get(hash).await?);
        }
        Ok(out)
    }

    /// All artifacts of one content type, oldest first.
    pub async fn get_by_type(&self, content_type: ContentType) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            "SELECT hash, content, content_type, created_at, byte_size, token_count
             FROM artifacts WHERE content_type = ? ORDER BY created_at, hash",
        )
        .bind(content_type.as_str())
        .fetch_all(self.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        rows.into_iter().map(decode_artifact).collect()
    }

    /// Total number of stored artifacts.
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM artifacts")
            .fetch_one(self.store.reader())
            .await
            .map_err(TinyMemError::storage)?;
        Ok(row.get(0))
    }

    /// Number of stored artifacts of one content type.
    pub async fn count_by_type(&self, content_type: ContentType) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM artifacts WHERE content_type = ?")
            .bind(content_type.as_str())
            .fetch_one(self.store.reader())
            .await
            .map_err(TinyMemError::storage)?;
        Ok(row.get(0))
    }

    /// Whether `content` hashes to `expected_hash`.
    pub fn verify_hash(&self, content: &[u8], expected_hash: &str) -> bool {
        compute_hash(content) == expected_hash
    }
}

fn decode_artifact(row: sqlx::sqlite::SqliteRow) -> Result<Artifact> {
    let content_type: String = row.get("content_type");
    let created_at: String = row.get("created_at");
    Ok(Artifact {
        hash: row.get("hash"),
        content: row.get("content"),
        content_type: content_type.parse()?,
        created_at: parse_timestamp(&created_at)?,
        byte_size: row.get("byte_size"),
        token_count: row.get("token_count"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    async fn vault() -> Vault {
        Vault::new(Store::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn identical_content_deduplicates() {
        let vault = vault().await;
        let content = b"package main\n\nfunc main() {}";

        let first = vault.store(content, ContentType::Code, None).await.unwrap();
        let second = vault.store(content, ContentType::Code, None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(vault.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn type_does_not_participate_in_hashing() {
        let vault = vault().await;
        let content = b"same bytes";

        let as_code = vault.store(content, ContentType::Code, None).await.unwrap();
        let as_diff = vault.store(content, ContentType::Diff, None).await.unwrap();

        assert_eq!(as_code, as_diff);
        assert_eq!(vault.count().await.unwrap(), 1);
        // First store wins the type label.
        let artifact = vault.get(&as_code).await.unwrap().unwrap();
        assert_eq!(artifact.content_type, ContentType::Code);
    }

    #[tokio::test]
    async fn miss_is_none_not_an_error() {
        let vault = vault().await;
        assert!(vault.get(&"0".repeat(64)).await.unwrap().is_none());
        assert!(!vault.exists(&"0".repeat(64)).await.unwrap());
    }

    #[tokio::test]
    async fn get_multiple_preserves_order_and_fills_gaps() {
        let vault = vault().await;
        let a = vault.store(b"alpha", ContentType::Code, None).await.unwrap();
        let b = vault.store(b"beta", ContentType::Code, None).await.unwrap();

        let results = vault
            .get_multiple(&[b.clone(), "f".repeat(64), a.clone()])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().hash, b);
        assert!(results[1].is_none());
        assert_eq!(results[2].as_ref().unwrap().hash, a);
    }

    #[tokio::test]
    async fn counts_by_type() {
        let vault = vault().await;
        vault.store(b"a", ContentType::Code, None).await.unwrap();
        vault.store(b"b", ContentType::Code, None).await.unwrap();
        vault.store(b"c", ContentType::Prompt, None).await.unwrap();

        assert_eq!(vault.count().await.unwrap(), 3);
        assert_eq!(vault.count_by_type(ContentType::Code).await.unwrap(), 2);
        assert_eq!(vault.count_by_type(ContentType::Prompt).await.unwrap(), 1);
        assert_eq!(vault.count_by_type(ContentType::Diff).await.unwrap(), 0);
        assert_eq!(vault.get_by_type(ContentType::Code).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn verify_hash_checks_content() {
        let vault = vault().await;
        let hash = vault.store(b"payload", ContentType::Code, None).await.unwrap();
        assert!(vault.verify_hash(b"payload", &hash));
        assert!(!vault.verify_hash(b"tampered", &hash));
    }

    #[tokio::test]
    async fn token_count_is_stored_when_supplied() {
        let vault = vault().await;
        let hash = vault
            .store(b"some content", ContentType::Prompt, Some(3))
            .await
            .unwrap();
        let artifact = vault.get(&hash).await.unwrap().unwrap();
        assert_eq!(artifact.token_count, Some(3));
        assert_eq!(artifact.token_weight(), 3);
    }

    proptest! {
        #[test]
        fn hash_is_stable_64_hex(content in proptest::collection::vec(any::<u8>(), 0..512)) {
            let first = compute_hash(&content);
            let second = compute_hash(&content);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), 64);
            prop_assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }
}
