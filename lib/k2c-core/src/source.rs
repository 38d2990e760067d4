//! Read access to orchestrator state

use crate::{CoreError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Where Endpoints and their owning Services are read from
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Every Endpoints object in every namespace
    async fn list_endpoints(&self) -> Result<Vec<Endpoints>>;

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;
}

type ObjectKey = (String, String);

fn key_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> ObjectKey {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

/// Source backed by maps, for tests and dry runs
#[derive(Default)]
pub struct MemorySource {
    endpoints: RwLock<BTreeMap<ObjectKey, Endpoints>>,
    services: RwLock<BTreeMap<ObjectKey, Service>>,
    failing: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_endpoints(&self, endpoints: Endpoints) {
        let key = key_of(&endpoints.metadata);
        self.endpoints.write().await.insert(key, endpoints);
    }

    pub async fn put_service(&self, service: Service) {
        let key = key_of(&service.metadata);
        self.services.write().await.insert(key, service);
    }

    pub async fn remove(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        self.endpoints.write().await.remove(&key);
        self.services.write().await.remove(&key);
    }

    /// Make every read fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("source unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointSource for MemorySource {
    async fn list_endpoints(&self) -> Result<Vec<Endpoints>> {
        self.check_failing()?;
        Ok(self.endpoints.read().await.values().cloned().collect())
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.check_failing()?;
        let key = (namespace.to_string(), name.to_string());
        Ok(self.services.read().await.get(&key).cloned())
    }

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        self.check_failing()?;
        let key = (namespace.to_string(), name.to_string());
        Ok(self.endpoints.read().await.get(&key).cloned())
    }
}
