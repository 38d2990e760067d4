//! In-memory catalog
//!
//! Behaves like the registry catalog for the operations this crate uses
//! and counts writes, which makes it the catalog of choice in tests.

use crate::catalog::{
    Catalog, CatalogDeregistration, CatalogNode, CatalogRegistration, CatalogService,
};
use crate::{CoreError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone, Debug)]
struct NodeInfo {
    address: String,
    // service id to service
    services: BTreeMap<String, CatalogService>,
}

/// Catalog held in process memory
#[derive(Default)]
pub struct MemoryCatalog {
    nodes: Arc<RwLock<HashMap<String, NodeInfo>>>,
    failing: RwLock<BTreeSet<String>>,
    registrations: AtomicUsize,
    deregistrations: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call that names `service` fail
    pub async fn fail_service(&self, service: &str) {
        self.failing.write().await.insert(service.to_string());
    }

    /// Every service instance currently held, sorted by (name, node, port)
    pub async fn all_services(&self) -> Vec<CatalogService> {
        let nodes = self.nodes.read().await;
        let mut services: Vec<CatalogService> = nodes
            .values()
            .flat_map(|node| node.services.values().cloned())
            .collect();
        services.sort_by(|a, b| {
            (&a.service_name, &a.node, a.port).cmp(&(&b.service_name, &b.node, b.port))
        });
        services
    }

    pub async fn node_names(&self) -> BTreeSet<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn deregistration_count(&self) -> usize {
        self.deregistrations.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.registration_count() + self.deregistration_count()
    }

    async fn check_failing(&self, service: &str) -> Result<()> {
        if self.failing.read().await.contains(service) {
            return Err(CoreError::Catalog(format!("injected failure for {}", service)));
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn list_services(&self, name: &str, tag: &str) -> Result<Vec<CatalogService>> {
        self.check_failing(name).await?;
        let nodes = self.nodes.read().await;
        Ok(nodes
            .values()
            .flat_map(|node| node.services.values())
            .filter(|s| s.service_name == name && s.tags.iter().any(|t| t == tag))
            .cloned()
            .collect())
    }

    async fn services(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let nodes = self.nodes.read().await;
        let mut services: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for service in nodes.values().flat_map(|node| node.services.values()) {
            services
                .entry(service.service_name.clone())
                .or_default()
                .extend(service.tags.iter().cloned());
        }
        Ok(services
            .into_iter()
            .map(|(name, tags)| (name, tags.into_iter().collect()))
            .collect())
    }

    async fn register(&self, registration: &CatalogRegistration) -> Result<()> {
        self.check_failing(&registration.service.name).await?;
        let service = &registration.service;
        let service_id = service.id.clone().unwrap_or_else(|| service.name.clone());

        let mut nodes = self.nodes.write().await;
        let node = nodes
            .entry(registration.node.clone())
            .or_insert_with(|| NodeInfo {
                address: registration.address.clone(),
                services: BTreeMap::new(),
            });
        node.address = registration.address.clone();
        node.services.insert(
            service_id.clone(),
            CatalogService {
                node: registration.node.clone(),
                address: registration.address.clone(),
                service_id,
                service_name: service.name.clone(),
                port: service.port,
                tags: service.tags.clone(),
                meta: service.meta.clone(),
            },
        );
        self.registrations.fetch_add(1, Ordering::SeqCst);

        debug!("Registered {} on node {}", service.name, registration.node);
        Ok(())
    }

    async fn deregister(&self, deregistration: &CatalogDeregistration) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        match &deregistration.service_id {
            Some(service_id) => {
                if let Some(node) = nodes.get_mut(&deregistration.node) {
                    node.services.remove(service_id);
                }
            }
            None => {
                nodes.remove(&deregistration.node);
            }
        }
        self.deregistrations.fetch_add(1, Ordering::SeqCst);

        debug!("Deregistered {:?} from node {}", deregistration.service_id, deregistration.node);
        Ok(())
    }

    async fn node(&self, name: &str) -> Result<Option<CatalogNode>> {
        let nodes = self.nodes.read().await;
        Ok(nodes.get(name).map(|node| CatalogNode {
            name: name.to_string(),
            address: node.address.clone(),
            services: node.services.keys().cloned().collect(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
