//! Evidence predicate execution.
//!
//! The verifier is the only path to truth-state `verified`. Each predicate
//! either holds right now, on this machine, or it does not; the verifier
//! never records, never retries, and never raises; a predicate that cannot
//! be evaluated safely is simply false.
//!
//! Subprocess predicates (`cmd_exit0`, `test_pass`) run under a configured
//! shell with a timeout and a sandbox: the command text is screened against
//! a forbid-command list and a forbid-path list before anything is spawned.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use tinymem_types::{EvidenceKind, EvidencePredicate};

/// Sandbox and timeout settings for predicate execution.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Wall-clock limit for one subprocess predicate.
    pub timeout: Duration,
    /// Shell executable used for `cmd_exit0` and `test_pass`.
    pub shell: String,
    /// Substrings that disqualify a command outright.
    pub forbid_commands: Vec<String>,
    /// Path prefixes a command may not mention.
    pub forbid_paths: Vec<String>,
    /// Working directory for subprocess predicates and relative paths.
    pub working_dir: Option<PathBuf>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            shell: "sh".to_string(),
            forbid_commands: vec![
                "rm -rf".to_string(),
                "sudo".to_string(),
                "mkfs".to_string(),
                "shutdown".to_string(),
                "reboot".to_string(),
            ],
            forbid_paths: vec!["/etc".to_string(), "/dev".to_string(), "/sys".to_string()],
            working_dir: None,
        }
    }
}

/// Executes evidence predicates.
#[derive(Debug, Clone)]
pub struct EvidenceVerifier {
    config: VerifierConfig,
}

impl EvidenceVerifier {
    /// Build a verifier with the given sandbox settings.
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Evaluate one predicate. Never errors: anything that cannot be
    /// verified safely (bad pattern, forbidden command, timeout) is false.
    pub async fn verify(&self, predicate: &EvidencePredicate) -> bool {
        let verified = match predicate.kind {
            EvidenceKind::FileExists => self.verify_file_exists(&predicate.content).await,
            EvidenceKind::GrepHit => self.verify_grep_hit(&predicate.content).await,
            EvidenceKind::CmdExit0 | EvidenceKind::TestPass => {
                self.verify_command(&predicate.content).await
            }
        };
        debug!(predicate = %predicate, verified, "evidence predicate evaluated");
        verified
    }

    async fn verify_file_exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.resolve(path)).await.is_ok()
    }

    /// `pattern::path`: the pattern must match at least one line.
    async fn verify_grep_hit(&self, content: &str) -> bool {
        let Some((pattern, path)) = content.split_once("::") else {
            return false;
        };
        let Ok(regex) = Regex::new(pattern) else {
            warn!(pattern, "grep_hit pattern does not compile");
            return false;
        };
        let Ok(text) = tokio::fs::read_to_string(self.resolve(path)).await else {
            return false;
        };
        text.lines().any(|line| regex.is_match(line))
    }

    async fn verify_command(&self, command: &str) -> bool {
        if !self.command_permitted(command) {
            warn!(command, "command refused by sandbox");
            return false;
        }

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        match tokio::time::timeout(self.config.timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(command, error = %e, "predicate subprocess failed to spawn");
                false
            }
            Err(_) => {
                warn!(command, "predicate subprocess timed out");
                false
            }
        }
    }

    fn command_permitted(&self, command: &str) -> bool {
        for forbidden in &self.config.forbid_commands {
            if command.contains(forbidden.as_str()) {
                return false;
            }
        }
        for path in &self.config.forbid_paths {
            if command.contains(path.as_str()) {
                return false;
            }
        }
        true
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.config.working_dir {
            Some(dir) if !path.starts_with('/') => dir.join(path),
            _ => PathBuf::from(path),
        }
    }
}
