use clap::{Parser, ValueEnum};
use k2c_consul::client::DEFAULT_ADDRESS;
use k2c_consul::lock::DEFAULT_LOCK_KEY;
use k2c_core::config::{available_workers, DEFAULT_MANAGED_TAG};
use k2c_core::SyncConfig;
use k2c_kube::KubeOptions;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Mirror Kubernetes endpoints into the Consul catalog
#[derive(Parser, Debug)]
#[command(name = "kube2consul", version)]
pub struct Cli {
    /// Seconds between two full resyncs
    #[arg(long, env = "K2C_RESYNC_PERIOD", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub resync_period: u64,

    /// Kubernetes API server URL, overriding the kubeconfig one
    #[arg(long, env = "K2C_KUBERNETES_API")]
    pub kubernetes_api: Option<String>,

    /// Kubeconfig file; in-cluster configuration when absent
    #[arg(long, env = "K2C_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Consul API address
    #[arg(long, env = "K2C_CONSUL_API", default_value = DEFAULT_ADDRESS)]
    pub consul_api: String,

    /// Consul ACL token
    #[arg(long, env = "K2C_CONSUL_TOKEN", hide_env_values = true)]
    pub consul_token: Option<String>,

    /// Tag marking the services owned by this process
    #[arg(long, env = "K2C_CONSUL_TAG", default_value = DEFAULT_MANAGED_TAG)]
    pub consul_tag: String,

    /// Acquire a Consul lock so that a single instance is active
    #[arg(long, env = "K2C_LOCK")]
    pub lock: bool,

    /// Consul KV key used for locking
    #[arg(long, env = "K2C_LOCK_KEY", default_value = DEFAULT_LOCK_KEY)]
    pub lock_key: String,

    /// Do not serve /health and /metrics
    #[arg(long, env = "K2C_NO_HEALTH")]
    pub no_health: bool,

    /// Port of the health and metrics server
    #[arg(long, env = "K2C_HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Only register services carrying a SERVICE[_<port>]_NAME annotation
    #[arg(long, env = "K2C_EXPLICIT")]
    pub explicit: bool,

    /// Namespace to ignore; repeatable or comma separated
    #[arg(long = "exclude-namespace", env = "K2C_EXCLUDE_NAMESPACE", value_delimiter = ',')]
    pub exclude_namespaces: Vec<String>,

    /// Number of action workers, 0 for one per CPU
    #[arg(long, env = "K2C_JOB_NUMBER", default_value_t = 0)]
    pub job_number: usize,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, env = "K2C_DEBUG")]
    pub debug: bool,

    #[arg(long, env = "K2C_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn sync_config(&self) -> SyncConfig {
        let workers = match self.job_number {
            0 => available_workers(),
            n => n,
        };

        SyncConfig {
            managed_tag: self.consul_tag.clone(),
            explicit: self.explicit,
            excluded_namespaces: self
                .exclude_namespaces
                .iter()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect(),
            resync_period: Duration::from_secs(self.resync_period),
            workers,
        }
    }

    pub fn kube_options(&self) -> KubeOptions {
        KubeOptions {
            kubeconfig: self.kubeconfig.clone(),
            api_server: self.kubernetes_api.clone().filter(|s| !s.is_empty()),
        }
    }
}
