use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use tracing::info;

use crate::factories::kubernetes::{Kubernetes, KubernetesConfig, error::KubernetesError};

impl Kubernetes {
    pub async fn new(config: &KubernetesConfig) -> Result<Self, KubernetesError> {
        let client = if config.in_cluster {
            let kube_config = Config::incluster()?;
            info!("✅ Connected from incluster environment!");
            Client::try_from(kube_config)?
        } else {
            let kube_config = if let Some(path) = &config.kubeconfig {
                let kubeconfig = Kubeconfig::read_from(path)?;
                let options = KubeConfigOptions::default();
                Config::from_custom_kubeconfig(kubeconfig, &options).await?
            } else {
                Config::infer().await?
            };

            info!("✅ Connected from local environment!");
            Client::try_from(kube_config)?
        };

        Ok(Self { client })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_inferred_out_of_cluster() {
        let config: KubernetesConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.in_cluster);
        assert!(config.kubeconfig.is_none());
    }

    #[tokio::test]
    async fn missing_kubeconfig_path_is_reported() {
        let config = KubernetesConfig {
            in_cluster: false,
            kubeconfig: Some("/definitely/not/here/kubeconfig".to_string()),
        };

        let result = Kubernetes::new(&config).await;

        assert!(matches!(result, Err(KubernetesError::KubeconfigError(_))));
    }
}
