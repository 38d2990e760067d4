//! Kubernetes client construction

use anyhow::Context;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::PathBuf;
use tracing::info;

/// Where to find the API server
#[derive(Clone, Debug, Default)]
pub struct KubeOptions {
    /// Kubeconfig file; in-cluster or default discovery when absent
    pub kubeconfig: Option<PathBuf>,
    /// Overrides the API server URL of the loaded configuration
    pub api_server: Option<String>,
}

/// Build a client and check that the API server answers
pub async fn connect(options: &KubeOptions) -> anyhow::Result<Client> {
    let mut config = match &options.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Cannot read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };

    if let Some(api_server) = &options.api_server {
        config.cluster_url = api_server
            .parse::<hyper::Uri>()
            .with_context(|| format!("Invalid Kubernetes API URL {}", api_server))?;
    }

    let client = Client::try_from(config)?;
    let version = server_version(&client)
        .await
        .context("Cannot reach the Kubernetes API server")?;
    info!("Connected to Kubernetes API server {}", version);

    Ok(client)
}

/// Git version reported by the API server
pub async fn server_version(client: &Client) -> Result<String, kube::Error> {
    Ok(client.apiserver_version().await?.git_version)
}
