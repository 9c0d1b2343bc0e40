use std::{net::SocketAddr, path::PathBuf};

use config::{ConfigBuilder, ConfigError, Environment, File, builder::AsyncState};
use factory::factories::{kubernetes::KubernetesConfig, observability::ObservabilityConfig};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server_address: SocketAddr,
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    pub staging: StagingConfig,
    pub build: BuildConfig,
}

/// Work scheduling tunables.
#[derive(Deserialize, Clone, Debug)]
pub struct ControllerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per item before the request is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_qps")]
    pub qps: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StagingConfig {
    pub dir: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
pub struct BuildConfig {
    /// Namespace for build Jobs, context ConfigMaps and auth ConfigMaps.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_executor_image")]
    pub executor_image: String,
    pub registry: String,
    /// dockerconfigjson Secret mounted into the executor for pushes.
    pub registry_secret: Option<String>,
    #[serde(default = "default_image_type")]
    pub image_type: String,
}

fn default_workers() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    1000
}

fn default_qps() -> f64 {
    50.0
}

fn default_burst() -> u32 {
    300
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_executor_image() -> String {
    "gcr.io/kaniko-project/executor:latest".to_string()
}

fn default_image_type() -> String {
    "docker".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl Config {
    pub async fn init(path: PathBuf) -> Result<Self, ConfigError> {
        let cfg = ConfigBuilder::<AsyncState>::default()
            .add_source(File::from(path))
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .await?;

        cfg.try_deserialize()
    }
}
