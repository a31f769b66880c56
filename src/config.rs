use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::ClusterSettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory for overrides, host records, tokens and credentials.
    /// Without one, state lives in memory only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub poll_interval_secs: u64,
    /// Also scan Swarm services.
    pub swarm: bool,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub enroll_token_ttl_secs: u64,
    pub dispatch_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Some(PathBuf::from("data")),
            poll_interval_secs: 6 * 3600,
            swarm: false,
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enroll_token_ttl_secs: 15 * 60,
            dispatch_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("sentinel.toml"))
                .merge(Json::file("sentinel.json"))
                .merge(Env::prefixed("SENTINEL_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        if config.cluster.enabled && config.cluster.dispatch_timeout_secs == 0 {
            anyhow::bail!("cluster.dispatch_timeout_secs must be greater than zero");
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl ClusterConfig {
    pub fn settings(&self) -> ClusterSettings {
        ClusterSettings {
            enroll_token_ttl: Duration::from_secs(self.enroll_token_ttl_secs),
        }
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}
