#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-audit** – Asynchronous shadow audit of assistant output.
//!
//! After a turn completes, the auditor asks the upstream model whether the
//! assistant's response stayed consistent with the authoritative state it
//! was shown. The outcome lands in `ledger_audit_results` and nowhere else:
//! the audit never writes to the vault, the entity map, or the memory
//! tables. It is evidence for humans (and an optional Gate B input), not a
//! controller. Failures are logged and swallowed; a dead audit must never
//! affect the turn that spawned it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use tinymem_ledger::Ledger;
use tinymem_types::{AuditStatus, EpisodeId, Result, TinyMemError};
use tinymem_upstream::ChatBackend;

const AUDIT_SYSTEM_PROMPT: &str = "You audit a coding assistant's reply against the project \
state it was shown. Judge whether the reply invents files, symbols, or facts that were not in \
its context, or contradicts the authoritative artifacts. Begin your reply with exactly one of: \
VERDICT: COMPLETED (reply is consistent), VERDICT: PARTIAL (minor inconsistencies), or \
VERDICT: DISCUSSION (needs human review). Then explain briefly.";

/// Everything one audit needs, captured at enqueue time so the audit task
/// owns its inputs outright.
#[derive(Debug, Clone)]
pub struct AuditRequest {
    /// Episode being audited.
    pub episode_id: EpisodeId,
    /// Vault hash of the assistant response.
    pub artifact_hash: String,
    /// Entity the turn centered on, when known.
    pub entity_key: Option<String>,
    /// The user's prompt text.
    pub user_prompt: String,
    /// The assistant's response text.
    pub assistant_response: String,
}

/// The shadow auditor.
#[derive(Clone)]
pub struct ShadowAuditor {
    ledger: Ledger,
    backend: Arc<dyn ChatBackend>,
}

impl ShadowAuditor {
    /// Build over the ledger and an upstream backend.
    pub fn new(ledger: Ledger, backend: Arc<dyn ChatBackend>) -> Self {
        Self { ledger, backend }
    }

    /// Spawn the audit and return immediately. The task runs to completion
    /// independently of the requesting turn, including after cancellation
    /// of that turn.
    pub fn enqueue(&self, request: AuditRequest) -> JoinHandle<()> {
        let auditor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = auditor.run(request).await {
                // Logged only; an audit failure never affects state.
                error!(error = %e, "shadow audit failed");
            }
        })
    }

    async fn run(&self, request: AuditRequest) -> Result<()> {
        let user = format!(
            "User prompt:\n{}\n\nAssistant response:\n{}",
            request.user_prompt, request.assistant_response
        );
        let reply = self
            .backend
            .complete_text(AUDIT_SYSTEM_PROMPT, &user)
            .await
            .map_err(|e| TinyMemError::AuditFailure(e.to_string()))?;

        let status = parse_verdict(&reply);
        self.ledger
            .record_audit(
                request.episode_id,
                &request.artifact_hash,
                request.entity_key.as_deref(),
                status,
                &reply,
            )
            .await?;
        debug!(episode = %request.episode_id, status = status.as_str(), "shadow audit recorded");
        Ok(())
    }
}

/// Map the model's verdict line onto a status. Anything unrecognizable is
/// `discussion`: an unreadable audit is exactly what a human should see.
fn parse_verdict(reply: &str) -> AuditStatus {
    let head = reply.to_uppercase();
    if head.contains("VERDICT: COMPLETED") {
        AuditStatus::Completed
    } else if head.contains("VERDICT: PARTIAL") {
        AuditStatus::Partial
    } else {
        AuditStatus::Discussion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tinymem_store::Store;

    struct FixedBackend(Result<&'static str>);

    #[async_trait]
    impl ChatBackend for FixedBackend {
        async fn complete_text(&self, _system: &str, _user: &str) -> Result<String> {
            match &self.0 {
                Ok(s) => Ok(s.to_string()),
                Err(_) => Err(TinyMemError::UpstreamUnreachable("down".to_string())),
            }
        }
    }

    async fn fixture(backend: FixedBackend) -> (Ledger, ShadowAuditor, EpisodeId) {
        let store = Store::in_memory().await.unwrap();
        let ledger = Ledger::new(store);
        let auditor = ShadowAuditor::new(ledger.clone(), Arc::new(backend));
        let episode = ledger.create_episode(None, None, None).await.unwrap();
        (ledger, auditor, episode)
    }

    fn request(episode: EpisodeId) -> AuditRequest {
        AuditRequest {
            episode_id: episode,
            artifact_hash: "abc123".to_string(),
            entity_key: Some("x.go::Alpha".to_string()),
            user_prompt: "fix Alpha".to_string(),
            assistant_response: "done, here is Alpha".to_string(),
        }
    }

    #[tokio::test]
    async fn completed_verdict_is_recorded() {
        let (ledger, auditor, episode) =
            fixture(FixedBackend(Ok("VERDICT: COMPLETED\nAll consistent."))).await;

        auditor.enqueue(request(episode)).await.unwrap();

        let audits = ledger.get_audit_results(episode).await.unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status, AuditStatus::Completed);
        assert_eq!(audits[0].entity_key.as_deref(), Some("x.go::Alpha"));
        assert!(audits[0].audit_response.contains("All consistent"));
    }

    #[tokio::test]
    async fn unreadable_verdicts_become_discussion() {
        let (ledger, auditor, episode) =
            fixture(FixedBackend(Ok("I could not really tell."))).await;

        auditor.enqueue(request(episode)).await.unwrap();

        let audits = ledger.get_audit_results(episode).await.unwrap();
        assert_eq!(audits[0].status, AuditStatus::Discussion);
    }

    #[tokio::test]
    async fn backend_failure_records_nothing_and_does_not_panic() {
        let (ledger, auditor, episode) =
            fixture(FixedBackend(Err(TinyMemError::UpstreamUnreachable(
                "down".to_string(),
            ))))
            .await;

        auditor.enqueue(request(episode)).await.unwrap();

        assert!(ledger.get_audit_results(episode).await.unwrap().is_empty());
    }

    #[test]
    fn verdict_parsing_is_case_insensitive() {
        assert_eq!(parse_verdict("verdict: completed"), AuditStatus::Completed);
        assert_eq!(parse_verdict("VERDICT: PARTIAL, minor drift"), AuditStatus::Partial);
        assert_eq!(parse_verdict(""), AuditStatus::Discussion);
    }
}
