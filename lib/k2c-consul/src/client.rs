//! Thin HTTP client for the Consul agent API

use crate::error::{ConsulError, Result};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

const TOKEN_HEADER: &str = "X-Consul-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared by the catalog and the leader lock; cheap to clone
#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl std::fmt::Debug for ConsulClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulClient")
            .field("base", &self.base.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ConsulClient {
    /// Build a client for `address` (`host:port`, with or without scheme)
    pub fn new(address: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base: normalize_address(address)?,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// Current raft leader, used as a liveness probe
    pub async fn leader(&self) -> Result<String> {
        self.get_json(&["v1", "status", "leader"], &[]).await
    }

    /// URL of an API path; every segment is percent-encoded on its own
    pub(crate) fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ConsulError::InvalidAddress(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let mut request = self.http.request(method, self.url(segments)?);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        Ok(request)
    }

    /// Send and turn non-2xx answers into `ConsulError::Status`
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConsulError::Status {
                status,
                body: body.trim().to_string(),
            });
        }
        Ok(response)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T> {
        debug!("GET /{}", segments.join("/"));
        let response = self.send(self.request(Method::GET, segments)?.query(query)).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn normalize_address(address: &str) -> Result<Url> {
    let address = address.trim().trim_end_matches('/');
    if address.is_empty() {
        return Err(ConsulError::InvalidAddress("empty address".to_string()));
    }
    let address = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if address.contains("://") {
        return Err(ConsulError::InvalidAddress(address.to_string()));
    } else {
        format!("http://{}", address)
    };
    Url::parse(&address).map_err(|e| ConsulError::InvalidAddress(format!("{}: {}", address, e)))
}
