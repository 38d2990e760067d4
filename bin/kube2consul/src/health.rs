//! `/health` and `/metrics` endpoints with background dependency probes

use anyhow::{Context, Result};
use async_trait::async_trait;
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use k2c_core::{Catalog, SyncMetrics};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probe settings
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Interval between two probe rounds
    pub check_interval: Duration,
    /// Timeout for a single probe
    pub timeout: Duration,
    /// Number of consecutive failures before marking unhealthy
    pub unhealthy_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

/// A dependency whose reachability decides our own health
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<()>;
}

pub struct ConsulProbe(pub Arc<dyn Catalog>);

#[async_trait]
impl Probe for ConsulProbe {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn check(&self) -> Result<()> {
        Ok(self.0.ping().await?)
    }
}

pub struct KubernetesProbe(pub kube::Client);

#[async_trait]
impl Probe for KubernetesProbe {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn check(&self) -> Result<()> {
        k2c_kube::server_version(&self.0).await?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
struct ProbeStatus {
    failures: u32,
    last_error: Option<String>,
}

/// Consecutive failure counts per probe
pub struct HealthState {
    config: ProbeConfig,
    probes: RwLock<BTreeMap<&'static str, ProbeStatus>>,
}

impl HealthState {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            probes: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn record(&self, name: &'static str, result: Result<()>) {
        let mut probes = self.probes.write().await;
        let status = probes.entry(name).or_default();
        match result {
            Ok(()) => {
                if status.failures >= self.config.unhealthy_threshold {
                    info!("{} is reachable again", name);
                }
                *status = ProbeStatus::default();
            }
            Err(e) => {
                status.failures += 1;
                warn!("{} probe failed ({} in a row): {}", name, status.failures, e);
                status.last_error = Some(e.to_string());
            }
        }
    }

    /// Probes past the failure threshold, with their last error
    pub async fn failing(&self) -> BTreeMap<&'static str, String> {
        self.probes
            .read()
            .await
            .iter()
            .filter(|(_, status)| status.failures >= self.config.unhealthy_threshold)
            .map(|(name, status)| (*name, status.last_error.clone().unwrap_or_default()))
            .collect()
    }
}

/// Run every probe each interval until `shutdown`
pub fn spawn_probes(
    state: Arc<HealthState>,
    probes: Vec<Arc<dyn Probe>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for probe in &probes {
                let result = match tokio::time::timeout(state.config.timeout, probe.check()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("timed out after {:?}", state.config.timeout)),
                };
                state.record(probe.name(), result).await;
            }
        }
    })
}

/// Listen on `0.0.0.0:<port>`
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot listen on {} for health checks", addr))?;
    info!("Health server listening on {}", addr);
    Ok(listener)
}

/// Serve health and metrics on `listener` until `shutdown`
pub async fn serve(
    listener: TcpListener,
    state: Arc<HealthState>,
    metrics: SyncMetrics,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);

        let state = state.clone();
        let metrics = metrics.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                let metrics = metrics.clone();
                handle_request(req, state, metrics)
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }

    info!("Health server stopped");
    Ok(())
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<HealthState>,
    metrics: SyncMetrics,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &state, &metrics).await)
}

async fn route(
    method: &hyper::Method,
    path: &str,
    state: &HealthState,
    metrics: &SyncMetrics,
) -> Response<Full<Bytes>> {
    if method != hyper::Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed\n");
    }

    match path {
        "/health" => {
            let failing = state.failing().await;
            if failing.is_empty() {
                respond(StatusCode::OK, "text/plain", "OK")
            } else {
                let body = serde_json::json!({ "status": "unhealthy", "failing": failing });
                respond(StatusCode::SERVICE_UNAVAILABLE, "application/json", body.to_string())
            }
        }
        "/metrics" => match metrics.gather() {
            Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "Failed to gather metrics\n")
            }
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found\n"),
    }
}
