use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub vectorstore: VectorStoreConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub branching: BranchingConfig,
    #[serde(default)]
    pub auto_checkpoint: AutoCheckpointConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8787 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VectorStoreConfig {
    /// "memory" | "qdrant"
    pub provider: String,
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            url: "http://127.0.0.1:6333".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmbeddingsConfig {
    /// "ollama" | "openai"
    pub provider: String,
    pub model: String,
    pub url: String,
    pub api_key: Option<String>,
    /// Vector dimension, stamped on every collection at creation.
    pub dim: usize,
    pub cache_entries: usize,
    pub cache_ttl_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "nomic-embed-text".to_string(),
            url: "http://127.0.0.1:11434".to_string(),
            api_key: None,
            dim: 768,
            cache_entries: 4096,
            cache_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub secret_scrubbing: SecretScrubbingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecretScrubbingConfig {
    /// Filename looked up next to the project root (gitleaks format).
    pub allowlist_project_filename: String,
    /// Overrides `~/.contextd/config/allowlist.toml` when set.
    pub allowlist_user_path: Option<String>,
    /// "aes-256-gcm" | "chacha20-poly1305"
    pub archive_encryption: String,
    /// When true, raw operation bodies are kept (encrypted) in the archive.
    pub archive_raw_bodies: bool,
}

impl Default for SecretScrubbingConfig {
    fn default() -> Self {
        Self {
            allowlist_project_filename: ".gitleaks.toml".to_string(),
            allowlist_user_path: None,
            archive_encryption: "aes-256-gcm".to_string(),
            archive_raw_bodies: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BranchingConfig {
    pub context_limit_tokens: usize,
    /// Session thresholds, fractions in (0,1), each fires once per session.
    pub thresholds: Vec<f64>,
    /// Unfolded-token warning levels (fractions of the context limit).
    pub unfolded_penalty_warn: f64,
    /// Hard ceiling; `None` disables rejection.
    pub unfolded_penalty_hard: Option<f64>,
    /// Operations below this prompt-similarity are flagged out of scope.
    pub out_of_scope_threshold: f32,
    /// Failure-rate warning threshold within a branch.
    pub failure_rate_warn: f64,
}

impl Default for BranchingConfig {
    fn default() -> Self {
        Self {
            context_limit_tokens: 200_000,
            thresholds: vec![0.25, 0.50, 0.70, 0.90, 0.95],
            unfolded_penalty_warn: 0.5,
            unfolded_penalty_hard: None,
            out_of_scope_threshold: 0.6,
            failure_rate_warn: 0.5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AutoCheckpointConfig {
    pub enabled: bool,
    /// Session-usage fractions that request an auto-checkpoint.
    pub thresholds: Vec<f64>,
}

impl Default for AutoCheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: vec![0.70],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BusConfig {
    /// "memory" is the only in-tree backend.
    pub backend: String,
    /// Retention contract for external backends; in-process state is ephemeral.
    pub ttl_seconds: u64,
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            ttl_seconds: 86_400,
            capacity: 4096,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LimitsConfig {
    pub per_owner_inflight: usize,
    pub tool_deadline_seconds: u64,
    pub indexing_deadline_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_owner_inflight: 64,
            tool_deadline_seconds: 30,
            indexing_deadline_seconds: 600,
        }
    }
}

impl Config {
    /// Load from `~/.contextd/config/contextd.toml`, returning the path the
    /// config was read from. Missing file yields defaults and `None`.
    pub fn load_with_path() -> Result<(Self, Option<PathBuf>)> {
        let path = crate::paths::config_dir().join("contextd.toml");
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok((config, Some(path)))
        } else {
            Ok((Config::default(), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8787);
        assert_eq!(cfg.vectorstore.provider, "memory");
        assert_eq!(cfg.branching.thresholds, vec![0.25, 0.50, 0.70, 0.90, 0.95]);
        assert_eq!(cfg.limits.per_owner_inflight, 64);
        assert_eq!(
            cfg.security.secret_scrubbing.archive_encryption,
            "aes-256-gcm"
        );
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [branching]
            context_limit_tokens = 100000
            thresholds = [0.5, 0.9]
            unfolded_penalty_warn = 0.4
            unfolded_penalty_hard = 0.95
            out_of_scope_threshold = 0.5
            failure_rate_warn = 0.3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.branching.unfolded_penalty_hard, Some(0.95));
        // Untouched sections come from Default.
        assert_eq!(cfg.embeddings.provider, "ollama");
        assert_eq!(cfg.bus.ttl_seconds, 86_400);
    }
}
