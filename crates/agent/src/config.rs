//! Agent configuration

use anyhow::{Context, Result};
use quotaturbo::{Config as TurboConfig, PodSpec, ServiceConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "AGENT_CONFIG_FILE";

/// Configuration file read when `AGENT_CONFIG_FILE` is unset
pub const DEFAULT_CONFIG_FILE: &str = "/etc/quotaturbo/agent.toml";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Controller tunables
    #[serde(default)]
    pub turbo: TurboConfig,

    /// Milliseconds between two adjustment ticks
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Pods on this node
    #[serde(default)]
    pub pods: Vec<PodSpec>,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_sync_interval_ms() -> u64 {
    quotaturbo::service::DEFAULT_SYNC_INTERVAL_MS
}

impl AgentConfig {
    /// Load configuration from the config file and `AGENT_*` variables
    ///
    /// Nested keys use a double underscore, e.g.
    /// `AGENT_TURBO__HIGH_WATER_MARK=50`.
    pub fn load() -> Result<Self> {
        let (path, required) = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => (PathBuf::from(path), true),
            Err(_) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()).required(required))
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        Self::from_settings(settings)
    }

    /// Load configuration from a single file
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        Self::from_settings(settings)
    }

    fn from_settings(settings: config::Config) -> Result<Self> {
        let agent: AgentConfig = settings
            .try_deserialize()
            .context("invalid agent configuration")?;
        agent.validate()?;
        Ok(agent)
    }

    pub fn validate(&self) -> Result<()> {
        self.turbo.validate().context("invalid turbo settings")?;
        self.service_config()
            .validate()
            .context("invalid service settings")?;
        Ok(())
    }

    /// Settings of the service loop
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            high_water_mark: self.turbo.high_water_mark,
            alarm_water_mark: self.turbo.alarm_water_mark,
            sync_interval_ms: self.sync_interval_ms,
            cgroup_root: self.turbo.cgroup_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("agent.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_full_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
node_name = "node-a"
api_port = 9100
sync_interval_ms = 500

[turbo]
high_water_mark = 50
alarm_water_mark = 70
cgroup_root = "/tmp/cgroup"
elevate_limit = 2.0

[[pods]]
uid = "u1"
name = "web"
cgroup_path = "kubepods/burstable/podu1"
quota_turbo = true

[[pods.containers]]
id = "c1"
name = "nginx"
cpu_limit = 2
"#,
        );

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.turbo.high_water_mark, 50);
        assert_eq!(config.turbo.elevate_limit, 2.0);
        assert_eq!(config.turbo.slow_fallback_ratio, 0.1);
        assert_eq!(config.pods.len(), 1);
        assert_eq!(config.pods[0].containers[0].cpu_limit, 2.0);

        let service = config.service_config();
        assert_eq!(service.sync_interval_ms, 500);
        assert_eq!(service.alarm_water_mark, 70);
        assert_eq!(service.cgroup_root, PathBuf::from("/tmp/cgroup"));
    }

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "node_name = \"n\"\n");

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.sync_interval_ms, 100);
        assert_eq!(config.turbo, TurboConfig::default());
        assert!(config.pods.is_empty());
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();

        let path = write_config(&dir, "[turbo]\nhigh_water_mark = 90\nalarm_water_mark = 80\n");
        assert!(AgentConfig::from_file(&path).is_err());

        let path = write_config(&dir, "sync_interval_ms = 50\n");
        assert!(AgentConfig::from_file(&path).is_err());

        let path = write_config(&dir, "api_port = \"not a port\"\n");
        assert!(AgentConfig::from_file(&path).is_err());
    }
}
