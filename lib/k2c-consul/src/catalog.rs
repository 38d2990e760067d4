//! `Catalog` over the Consul catalog HTTP API

use crate::client::ConsulClient;
use crate::error::Result;
use async_trait::async_trait;
use k2c_core::catalog::{
    Catalog, CatalogDeregistration, CatalogNode, CatalogRegistration, CatalogService,
};
use k2c_core::endpoint::HealthCheck;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    node: String,
    address: String,
    #[serde(rename = "ServiceID")]
    service_id: String,
    service_name: String,
    service_port: u16,
    #[serde(default)]
    service_tags: Option<Vec<String>>,
    #[serde(default)]
    service_meta: Option<BTreeMap<String, String>>,
}

impl From<ServiceEntry> for CatalogService {
    fn from(entry: ServiceEntry) -> Self {
        CatalogService {
            node: entry.node,
            address: entry.address,
            service_id: entry.service_id,
            service_name: entry.service_name,
            port: entry.service_port,
            tags: entry.service_tags.unwrap_or_default(),
            meta: entry.service_meta.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    node: NodeInfo,
    #[serde(default)]
    services: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    node: String,
    address: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RegisterBody<'a> {
    node: &'a str,
    address: &'a str,
    service: ServiceBody<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<CheckBody>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ServiceBody<'a> {
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    service: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    meta: &'a BTreeMap<String, String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct CheckBody {
    #[serde(rename = "CheckID")]
    check_id: String,
    name: String,
    #[serde(rename = "ServiceID")]
    service_id: String,
    definition: CheckDefinition,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct CheckDefinition {
    #[serde(rename = "HTTP")]
    http: String,
    interval: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<String>,
}

impl CheckBody {
    fn new(service_id: &str, check: &HealthCheck) -> Self {
        CheckBody {
            check_id: format!("service:{}", service_id),
            name: format!("Service '{}' check", service_id),
            service_id: service_id.to_string(),
            definition: CheckDefinition {
                http: check.http.clone(),
                interval: humantime::format_duration(check.interval).to_string(),
                timeout: check
                    .timeout
                    .map(|t| humantime::format_duration(t).to_string()),
            },
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct DeregisterBody<'a> {
    node: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<&'a str>,
    #[serde(rename = "ServiceID", skip_serializing_if = "Option::is_none")]
    service_id: Option<&'a str>,
}

fn register_body(registration: &CatalogRegistration) -> RegisterBody<'_> {
    let service = &registration.service;
    let service_id = service.id.as_deref().unwrap_or(&service.name);
    RegisterBody {
        node: &registration.node,
        address: &registration.address,
        service: ServiceBody {
            id: service.id.as_deref(),
            service: &service.name,
            address: &service.address,
            port: service.port,
            tags: &service.tags,
            meta: &service.meta,
        },
        check: registration
            .check
            .as_ref()
            .map(|check| CheckBody::new(service_id, check)),
    }
}

/// Consul-backed catalog
#[derive(Clone, Debug)]
pub struct ConsulCatalog {
    client: ConsulClient,
}

impl ConsulCatalog {
    pub fn new(client: ConsulClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ConsulClient {
        &self.client
    }

    async fn list(&self, name: &str, tag: &str) -> Result<Vec<CatalogService>> {
        let entries: Vec<ServiceEntry> = self
            .client
            .get_json(&["v1", "catalog", "service", name], &[("tag", tag)])
            .await?;
        Ok(entries.into_iter().map(CatalogService::from).collect())
    }

    async fn all(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let services: BTreeMap<String, Option<Vec<String>>> =
            self.client.get_json(&["v1", "catalog", "services"], &[]).await?;
        Ok(services
            .into_iter()
            .map(|(name, tags)| (name, tags.unwrap_or_default()))
            .collect())
    }

    async fn put<B: Serialize>(&self, segments: &[&str], body: &B) -> Result<()> {
        debug!("PUT /{}", segments.join("/"));
        self.client
            .send(self.client.request(Method::PUT, segments)?.json(body))
            .await?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<CatalogNode>> {
        let entry: Option<NodeEntry> = self
            .client
            .get_json(&["v1", "catalog", "node", name], &[])
            .await?;
        Ok(entry.map(|entry| CatalogNode {
            name: entry.node.node,
            address: entry.node.address,
            services: entry
                .services
                .map(|services| services.into_keys().collect())
                .unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl Catalog for ConsulCatalog {
    async fn list_services(&self, name: &str, tag: &str) -> k2c_core::Result<Vec<CatalogService>> {
        Ok(self.list(name, tag).await?)
    }

    async fn services(&self) -> k2c_core::Result<BTreeMap<String, Vec<String>>> {
        Ok(self.all().await?)
    }

    async fn register(&self, registration: &CatalogRegistration) -> k2c_core::Result<()> {
        Ok(self
            .put(&["v1", "catalog", "register"], &register_body(registration))
            .await?)
    }

    async fn deregister(&self, deregistration: &CatalogDeregistration) -> k2c_core::Result<()> {
        let body = DeregisterBody {
            node: &deregistration.node,
            address: deregistration.address.as_deref(),
            service_id: deregistration.service_id.as_deref(),
        };
        Ok(self.put(&["v1", "catalog", "deregister"], &body).await?)
    }

    async fn node(&self, name: &str) -> k2c_core::Result<Option<CatalogNode>> {
        Ok(self.get_node(name).await?)
    }

    async fn ping(&self) -> k2c_core::Result<()> {
        self.client.leader().await?;
        Ok(())
    }
}
