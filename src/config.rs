use crate::store::RetryConfig;
use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for agent-hive
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Coordination store connection
    pub store: StoreConfig,
    /// Task backlog settings
    pub tasks: TaskConfig,
    /// File lock settings
    pub locks: LockConfig,
    /// Agent registry settings
    pub agents: AgentConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Process-local store; state is lost on exit.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Redis URL (ignored by the memory backend)
    pub url: String,
    /// Backoff for transient connection failures
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Claim lease length; a claimant that goes silent longer is treated as crashed
    pub claim_ttl_seconds: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            claim_ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL applied when a caller does not pass one
    pub default_ttl_seconds: u64,
    /// Maximum canonical path length
    pub max_path_length: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            max_path_length: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Heartbeat key TTL; an agent is alive while its key exists
    pub heartbeat_ttl_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl HiveConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (agent-hive.toml, .agent-hive-rc)
    /// 3. Environment variables (AGENT_HIVE_ prefix, `__` between nested keys,
    ///    e.g. `AGENT_HIVE_STORE__URL`)
    ///
    /// An explicit `path` replaces the well-known file names.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&HiveConfig::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new("agent-hive.toml").exists() {
                    builder = builder.add_source(File::with_name("agent-hive"));
                }
                if Path::new(".agent-hive-rc").exists() {
                    builder = builder.add_source(
                        File::with_name(".agent-hive-rc").format(config::FileFormat::Toml),
                    );
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("AGENT_HIVE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let hive_config: HiveConfig = builder.build()?.try_deserialize()?;
        hive_config.validate()?;
        Ok(hive_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.claim_ttl_seconds == 0 {
            bail!("tasks.claim_ttl_seconds must be positive");
        }
        if self.locks.default_ttl_seconds == 0 {
            bail!("locks.default_ttl_seconds must be positive");
        }
        if self.agents.heartbeat_ttl_seconds == 0 {
            bail!("agents.heartbeat_ttl_seconds must be positive");
        }
        if self.locks.max_path_length == 0 {
            bail!("locks.max_path_length must be positive");
        }
        if self.store.retry.max_attempts == 0 {
            bail!("store.retry.max_attempts must be at least 1");
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_empty() {
            bail!("store.url is required for the redis backend");
        }
        Ok(())
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.tasks.claim_ttl_seconds)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.locks.default_ttl_seconds)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.agents.heartbeat_ttl_seconds)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HiveConfig::default();
        assert_eq!(config.claim_ttl(), Duration::from_secs(3600));
        assert_eq!(config.lock_ttl(), Duration::from_secs(300));
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(30));
        assert_eq!(config.locks.max_path_length, 512);
        assert_eq!(config.store.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[store]
backend = "memory"

[locks]
default_ttl_seconds = 60
"#,
        )
        .unwrap();

        let config = HiveConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.locks.default_ttl_seconds, 60);
        assert_eq!(config.locks.max_path_length, 512);
        assert_eq!(config.tasks.claim_ttl_seconds, 3600);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.toml");

        let mut config = HiveConfig::default();
        config.agents.heartbeat_ttl_seconds = 10;
        config.save_to_file(&path).unwrap();

        let reloaded = HiveConfig::load_from(Some(&path)).unwrap();
        assert_eq!(reloaded.agents.heartbeat_ttl_seconds, 10);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = HiveConfig::default();
        config.tasks.claim_ttl_seconds = 0;
        assert!(config.validate().is_err());
    }
}
