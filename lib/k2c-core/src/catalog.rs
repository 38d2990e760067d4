//! Registry catalog abstraction
//!
//! The catalog is a set of nodes, each holding tagged services. Nodes are
//! created by registering their first service and must be deregistered
//! explicitly once empty.

use crate::endpoint::HealthCheck;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A service instance as listed by the catalog
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogService {
    pub node: String,
    pub address: String,
    pub service_id: String,
    pub service_name: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
}

/// Service part of a registration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Defaults to the service name when absent
    pub id: Option<String>,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
}

/// Upsert of one service on one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogRegistration {
    pub node: String,
    pub address: String,
    pub service: ServiceDefinition,
    pub check: Option<HealthCheck>,
}

/// Removal of one service, or of the whole node when `service_id` is `None`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogDeregistration {
    pub node: String,
    pub address: Option<String>,
    pub service_id: Option<String>,
}

impl CatalogDeregistration {
    pub fn service(service: &CatalogService) -> Self {
        Self {
            node: service.node.clone(),
            address: Some(service.address.clone()),
            service_id: Some(service.service_id.clone()),
        }
    }

    pub fn node(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            address: None,
            service_id: None,
        }
    }
}

/// A node and the ids of the services it still holds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogNode {
    pub name: String,
    pub address: String,
    pub services: Vec<String>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Instances of `name` carrying `tag`
    async fn list_services(&self, name: &str, tag: &str) -> Result<Vec<CatalogService>>;

    /// Every service name with the union of its tags
    async fn services(&self) -> Result<BTreeMap<String, Vec<String>>>;

    async fn register(&self, registration: &CatalogRegistration) -> Result<()>;

    async fn deregister(&self, deregistration: &CatalogDeregistration) -> Result<()>;

    /// `None` when the node does not exist
    async fn node(&self, name: &str) -> Result<Option<CatalogNode>>;

    /// Cheap connectivity probe
    async fn ping(&self) -> Result<()>;
}
