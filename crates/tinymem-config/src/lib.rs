#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-config** – Process-wide configuration.
//!
//! Configuration is loaded once at startup from a TOML file, overridden by
//! `TINYMEM_` environment variables, validated, and then passed by value to
//! the components that need it. There is no global: tests construct their
//! own [`Config`] and never touch the process environment unless they are
//! testing the override path itself.
//!
//! Environment overrides use `__` as the section separator, e.g.
//! `TINYMEM_RECALL__MAX_TOKENS=4096` or `TINYMEM_PORT=9000`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use tinymem_types::{Result, TinyMemError};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "TINYMEM_";

/// Default contents written by `tinymem init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# tinyMem configuration.
# Every key can be overridden with a TINYMEM_ environment variable,
# using __ as the section separator (e.g. TINYMEM_RECALL__MAX_TOKENS).

# Port the HTTP proxy listens on.
port = 8787

# OpenAI-compatible upstream endpoint and model.
upstream_base_url = "http://127.0.0.1:11434"
upstream_model = "qwen2.5-coder:14b"
upstream_timeout_seconds = 120

# Always forward the raw user prompt alongside injected context.
always_include_user_prompt = true

# Byte cap for a single extracted code block.
extraction_buffer_bytes = 262144

# Record recall_metrics rows.
metrics_enabled = false

# Semantic search stays off in the core path.
semantic_enabled = false

log_level = "info"
# log_file = ".tinyMem/logs/tinymem.log"

# Project state directory.
data_dir = ".tinyMem"

[recall]
max_items = 20
max_tokens = 2048
always_tier_fraction = 0.5
timeout_seconds = 5

[hydration]
max_tokens = 4096
recent_episodes = 5
include_stale = false

[cove]
enabled = false
confidence_threshold = 0.7
max_candidates = 20
timeout_seconds = 10
model = ""
recall_filter_enabled = false

[evidence]
timeout_seconds = 30
shell = "sh"
forbid_commands = ["rm -rf", "sudo", "mkfs", "shutdown", "reboot"]
forbid_paths = ["/etc", "/dev", "/sys"]
"#;

/// Recall engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RecallSection {
    /// Hard cap on recalled items.
    pub max_items: usize,
    /// Hard cap on the recalled token weight.
    pub max_tokens: i64,
    /// Fraction of the token budget reserved for the always tier.
    pub always_tier_fraction: f64,
    /// Recall deadline in seconds.
    pub timeout_seconds: u64,
}

impl Default for RecallSection {
    fn default() -> Self {
        Self {
            max_items: 20,
            max_tokens: 2048,
            always_tier_fraction: 0.5,
            timeout_seconds: 5,
        }
    }
}

/// Hydration engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct HydrationSection {
    /// Token budget for the hydration block.
    pub max_tokens: i64,
    /// How many recent episodes count for continuity ranking.
    pub recent_episodes: i64,
    /// Warn-and-include stale entities instead of skipping them.
    pub include_stale: bool,
}

impl Default for HydrationSection {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            recent_episodes: 5,
            include_stale: false,
        }
    }
}

/// CoVe advisory filter settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CoVeSection {
    /// Master switch.
    pub enabled: bool,
    /// Verdicts below this confidence are ignored.
    pub confidence_threshold: f64,
    /// Largest batch shown to the model.
    pub max_candidates: usize,
    /// Per-batch deadline in seconds.
    pub timeout_seconds: u64,
    /// Model for CoVe calls; empty means the main upstream model.
    pub model: String,
    /// Apply the filter to recall results.
    pub recall_filter_enabled: bool,
}

impl Default for CoVeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 0.7,
            max_candidates: 20,
            timeout_seconds: 10,
            model: String::new(),
            recall_filter_enabled: false,
        }
    }
}

/// Evidence verifier sandbox settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct EvidenceSection {
    /// Subprocess predicate deadline in seconds.
    pub timeout_seconds: u64,
    /// Shell executable for command predicates.
    pub shell: String,
    /// Substrings that disqualify a command.
    pub forbid_commands: Vec<String>,
    /// Path prefixes a command may not mention.
    pub forbid_paths: Vec<String>,
}

impl Default for EvidenceSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            shell: "sh".to_string(),
            forbid_commands: vec![
                "rm -rf".to_string(),
                "sudo".to_string(),
                "mkfs".to_string(),
                "shutdown".to_string(),
                "reboot".to_string(),
            ],
            forbid_paths: vec!["/etc".to_string(), "/dev".to_string(), "/sys".to_string()],
        }
    }
}

/// The full configuration. Immutable after [`Config::load`] returns.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// HTTP proxy port.
    pub port: u16,
    /// OpenAI-compatible upstream base URL.
    pub upstream_base_url: String,
    /// Upstream model name.
    pub upstream_model: String,
    /// Upstream request timeout in seconds.
    pub upstream_timeout_seconds: u64,
    /// Semantic search switch; must stay false in the core path.
    pub semantic_enabled: bool,
    /// Always forward the raw user prompt alongside injected context.
    pub always_include_user_prompt: bool,
    /// Byte cap for one extracted code block.
    pub extraction_buffer_bytes: usize,
    /// Record recall metrics rows.
    pub metrics_enabled: bool,
    /// Log filter, e.g. `info` or `tinymem=debug`.
    pub log_level: String,
    /// Optional log file path; stdout when unset.
    pub log_file: Option<String>,
    /// Project state directory.
    pub data_dir: String,
    /// Recall engine settings.
    pub recall: RecallSection,
    /// Hydration engine settings.
    pub hydration: HydrationSection,
    /// CoVe settings.
    pub cove: CoVeSection,
    /// Evidence verifier settings.
    pub evidence: EvidenceSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8787,
            upstream_base_url: "http://127.0.0.1:11434".to_string(),
            upstream_model: "qwen2.5-coder:14b".to_string(),
            upstream_timeout_seconds: 120,
            semantic_enabled: false,
            always_include_user_prompt: true,
            extraction_buffer_bytes: 256 * 1024,
            metrics_enabled: false,
            log_level: "info".to_string(),
            log_file: None,
            data_dir: ".tinyMem".to_string(),
            recall: RecallSection::default(),
            hydration: HydrationSection::default(),
            cove: CoVeSection::default(),
            evidence: EvidenceSection::default(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, apply environment overrides, and
    /// validate. A missing file means defaults; a malformed file or an
    /// unknown key is [`TinyMemError::ConfigInvalid`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    TinyMemError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str(&raw).map_err(|e| {
                    TinyMemError::ConfigInvalid(format!("cannot parse {}: {e}", path.display()))
                })?
            }
            _ => Self::default(),
        };

        for (key, value) in std::env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                config.apply_override(stripped, &value)?;
            }
        }

        config.validate()?;
        debug!(port = config.port, upstream = %config.upstream_base_url, "configuration loaded");
        Ok(config)
    }

    /// Apply one environment override. `name` is the variable name with
    /// the prefix stripped, e.g. `RECALL__MAX_TOKENS`.
    pub fn apply_override(&mut self, name: &str, value: &str) -> Result<()> {
        fn parsed<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| {
                TinyMemError::ConfigInvalid(format!("bad value for {ENV_PREFIX}{name}: {value}"))
            })
        }

        match name {
            "PORT" => self.port = parsed(name, value)?,
            "UPSTREAM_BASE_URL" => self.upstream_base_url = value.to_string(),
            "UPSTREAM_MODEL" => self.upstream_model = value.to_string(),
            "UPSTREAM_TIMEOUT_SECONDS" => self.upstream_timeout_seconds = parsed(name, value)?,
            "SEMANTIC_ENABLED" => self.semantic_enabled = parsed(name, value)?,
            "ALWAYS_INCLUDE_USER_PROMPT" => {
                self.always_include_user_prompt = parsed(name, value)?
            }
            "EXTRACTION_BUFFER_BYTES" => self.extraction_buffer_bytes = parsed(name, value)?,
            "METRICS_ENABLED" => self.metrics_enabled = parsed(name, value)?,
            "LOG_LEVEL" => self.log_level = value.to_string(),
            "LOG_FILE" => self.log_file = Some(value.to_string()),
            "DATA_DIR" => self.data_dir = value.to_string(),
            "RECALL__MAX_ITEMS" => self.recall.max_items = parsed(name, value)?,
            "RECALL__MAX_TOKENS" => self.recall.max_tokens = parsed(name, value)?,
            "RECALL__ALWAYS_TIER_FRACTION" => {
                self.recall.always_tier_fraction = parsed(name, value)?
            }
            "RECALL__TIMEOUT_SECONDS" => self.recall.timeout_seconds = parsed(name, value)?,
            "HYDRATION__MAX_TOKENS" => self.hydration.max_tokens = parsed(name, value)?,
            "HYDRATION__RECENT_EPISODES" => {
                self.hydration.recent_episodes = parsed(name, value)?
            }
            "HYDRATION__INCLUDE_STALE" => self.hydration.include_stale = parsed(name, value)?,
            "COVE__ENABLED" => self.cove.enabled = parsed(name, value)?,
            "COVE__CONFIDENCE_THRESHOLD" => {
                self.cove.confidence_threshold = parsed(name, value)?
            }
            "COVE__MAX_CANDIDATES" => self.cove.max_candidates = parsed(name, value)?,
            "COVE__TIMEOUT_SECONDS" => self.cove.timeout_seconds = parsed(name, value)?,
            "COVE__MODEL" => self.cove.model = value.to_string(),
            "COVE__RECALL_FILTER_ENABLED" => {
                self.cove.recall_filter_enabled = parsed(name, value)?
            }
            "EVIDENCE__TIMEOUT_SECONDS" => self.evidence.timeout_seconds = parsed(name, value)?,
            "EVIDENCE__SHELL" => self.evidence.shell = value.to_string(),
            other => {
                return Err(TinyMemError::ConfigInvalid(format!(
                    "unrecognized override {ENV_PREFIX}{other}"
                )))
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TinyMemError::ConfigInvalid("port must be non-zero".into()));
        }
        if !self.upstream_base_url.starts_with("http://")
            && !self.upstream_base_url.starts_with("https://")
        {
            return Err(TinyMemError::ConfigInvalid(format!(
                "upstream_base_url must be http(s), got {}",
                self.upstream_base_url
            )));
        }
        if self.semantic_enabled {
            return Err(TinyMemError::ConfigInvalid(
                "semantic_enabled is not supported in the core path".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.recall.always_tier_fraction) {
            return Err(TinyMemError::ConfigInvalid(
                "recall.always_tier_fraction must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cove.confidence_threshold) {
            return Err(TinyMemError::ConfigInvalid(
                "cove.confidence_threshold must be within [0, 1]".into(),
            ));
        }
        for (label, seconds) in [
            ("upstream_timeout_seconds", self.upstream_timeout_seconds),
            ("recall.timeout_seconds", self.recall.timeout_seconds),
            ("cove.timeout_seconds", self.cove.timeout_seconds),
            ("evidence.timeout_seconds", self.evidence.timeout_seconds),
        ] {
            if seconds == 0 {
                return Err(TinyMemError::ConfigInvalid(format!(
                    "{label} must be non-zero"
                )));
            }
        }
        Ok(())
    }

    /// Path of the primary SQLite file.
    pub fn store_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("store.sqlite3")
    }

    /// Directory for rolling logs.
    pub fn logs_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("logs")
    }

    /// The project's task file at the repository root.
    pub fn tasks_path(&self) -> PathBuf {
        PathBuf::from("tinyTasks.md")
    }

    /// CoVe model name, falling back to the main upstream model.
    pub fn cove_model(&self) -> &str {
        if self.cove.model.is_empty() {
            &self.upstream_model
        } else {
            &self.cove.model
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_path(), PathBuf::from(".tinyMem/store.sqlite3"));
    }

    #[test]
    fn template_parses_back_to_defaults() {
        let parsed: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9999\n\n[recall]\nmax_tokens = 128").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.recall.max_tokens, 128);
        // Untouched keys keep defaults.
        assert_eq!(config.recall.max_items, 20);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not_a_key = true").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, TinyMemError::ConfigInvalid(_)));
    }

    #[test]
    fn env_style_overrides_map_onto_sections() {
        let mut config = Config::default();
        config.apply_override("RECALL__MAX_TOKENS", "4096").unwrap();
        config.apply_override("COVE__ENABLED", "true").unwrap();
        config.apply_override("PORT", "9000").unwrap();
        assert_eq!(config.recall.max_tokens, 4096);
        assert!(config.cove.enabled);
        assert_eq!(config.port, 9000);

        assert!(config.apply_override("NOT_A_KEY", "x").is_err());
        assert!(config.apply_override("PORT", "not-a-port").is_err());
    }

    #[test]
    fn semantic_search_cannot_be_enabled() {
        let mut config = Config::default();
        config.apply_override("SEMANTIC_ENABLED", "true").unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            TinyMemError::ConfigInvalid(_)
        ));
    }

    #[test]
    fn cove_model_falls_back_to_upstream() {
        let mut config = Config::default();
        assert_eq!(config.cove_model(), config.upstream_model.as_str());
        config.cove.model = "tiny-judge".to_string();
        assert_eq!(config.cove_model(), "tiny-judge");
    }
}
