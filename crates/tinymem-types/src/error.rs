//! The typed error vocabulary shared by every tinyMem crate.
//!
//! Caller-contract violations (invalid type, missing evidence, denied
//! promotion) are structured variants returned to the caller. Transient
//! external failures (upstream model, subprocess, advisory filters) are
//! contained at their boundary component with fail-open or rollback
//! semantics; only configuration, store, and migration errors at startup
//! abort the process.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TinyMemError>;

/// Every failure mode a tinyMem component can surface.
#[derive(Debug, Error)]
pub enum TinyMemError {
    /// Configuration failed validation. Startup-fatal.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The SQLite store could not be opened or verified. Startup-fatal.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A schema migration failed to apply. Startup-fatal.
    #[error("migration {version} failed: {reason}")]
    MigrationFailed {
        /// Migration filename that failed.
        version: String,
        /// Underlying failure.
        reason: String,
    },

    /// The caller supplied an unknown artifact content type.
    #[error("invalid content type: {0}")]
    InvalidContentType(String),

    /// The caller supplied a malformed `filepath::symbol` reference.
    #[error("invalid entity key: {0}")]
    InvalidEntityKey(String),

    /// The caller attempted to create or update a fact without the verifier.
    #[error("memories of kind 'fact' require verified evidence")]
    FactRequiresEvidence,

    /// The resolution pipeline failed internally. Converts to UNRESOLVED at
    /// the API boundary.
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    /// A promotion gate denied the attempt. Recorded as a state transition
    /// with the state unchanged; never fatal.
    #[error("promotion denied at gate {gate}: {reason}")]
    PromotionDenied {
        /// Which gate denied: "A", "B", or "C".
        gate: &'static str,
        /// Human-readable denial reason.
        reason: String,
    },

    /// A single evidence predicate failed verification; the enclosing fact
    /// transaction rolls back.
    #[error("evidence predicate failed verification: {predicate}")]
    EvidenceUnverified {
        /// The predicate in `type::content` form.
        predicate: String,
    },

    /// Recall exceeded its deadline. Fail-open; counted, not surfaced.
    #[error("recall timed out")]
    RecallTimeout,

    /// The CoVe filter errored or timed out. Fail-open; counted, not surfaced.
    #[error("cove filter unavailable: {0}")]
    CoVeUnavailable(String),

    /// The shadow audit failed. Logged only; never affects state.
    #[error("shadow audit failed: {0}")]
    AuditFailure(String),

    /// The upstream model endpoint could not be reached.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// A stored row failed to decode. Indicates on-disk corruption or a
    /// version skew, not a caller error.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    /// An underlying storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON (de)serialization failed.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    /// Filesystem or subprocess I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TinyMemError {
    /// Wrap an arbitrary storage-layer failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        TinyMemError::Storage(err.to_string())
    }

    /// Whether this error must abort the process at startup (exit code 1).
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            TinyMemError::ConfigInvalid(_)
                | TinyMemError::StoreUnavailable(_)
                | TinyMemError::MigrationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_fatal_covers_config_store_and_migrations() {
        assert!(TinyMemError::ConfigInvalid("x".into()).is_startup_fatal());
        assert!(TinyMemError::StoreUnavailable("x".into()).is_startup_fatal());
        assert!(TinyMemError::MigrationFailed {
            version: "0001".into(),
            reason: "x".into()
        }
        .is_startup_fatal());
        assert!(!TinyMemError::FactRequiresEvidence.is_startup_fatal());
        assert!(!TinyMemError::PromotionDenied {
            gate: "A",
            reason: "x".into()
        }
        .is_startup_fatal());
    }

    #[test]
    fn denial_message_names_the_gate() {
        let err = TinyMemError::PromotionDenied {
            gate: "C",
            reason: "on-disk file differs".into(),
        };
        assert_eq!(
            err.to_string(),
            "promotion denied at gate C: on-disk file differs"
        );
    }
}
