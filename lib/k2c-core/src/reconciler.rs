//! Idempotent registration and pruning against the catalog

use crate::catalog::{Catalog, CatalogDeregistration, CatalogRegistration, ServiceDefinition};
use crate::config::SyncConfig;
use crate::endpoint::Endpoint;
use crate::generator::Generated;
use crate::metrics::SyncMetrics;
use crate::{CoreError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Applies desired endpoints to the catalog.
///
/// Every method compares against live catalog state, so calling any of
/// them twice with the same input writes at most once.
pub struct Reconciler {
    catalog: Arc<dyn Catalog>,
    config: Arc<SyncConfig>,
    metrics: SyncMetrics,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn Catalog>, config: Arc<SyncConfig>, metrics: SyncMetrics) -> Self {
        Self {
            catalog,
            config,
            metrics,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Upsert one endpoint unless an up-to-date entry already exists
    pub async fn register_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let tag = self.config.managed_tag.as_str();
        let Some(node) = endpoint.node_name(tag) else {
            return Ok(());
        };

        let existing = self
            .track(self.catalog.list_services(&endpoint.name, tag).await)
            .map_err(context(format!("Failed to get services {}", endpoint.name)))?;

        if existing.iter().any(|s| endpoint.is_up_to_date(s, tag)) {
            debug!("{} on {} is up to date", endpoint.name, node);
            return Ok(());
        }

        let service_id = endpoint.service_id();
        let tags: Vec<String> = endpoint.registered_tags(tag).into_iter().collect();
        let registration = CatalogRegistration {
            node: node.clone(),
            address: endpoint.address.clone(),
            service: ServiceDefinition {
                id: Some(service_id.clone()),
                name: endpoint.name.clone(),
                address: endpoint.address.clone(),
                port: endpoint.port,
                tags,
                meta: endpoint.service_meta(),
            },
            check: endpoint.check.clone(),
        };

        self.track(self.catalog.register(&registration).await).map_err(context(format!(
            "Error registering service {} ({}, {}, {})",
            endpoint.name, node, endpoint.address, endpoint.port
        )))?;
        self.metrics.registrations_total.inc();

        info!(
            "Update service {} ({}, {}, {}, {:?})",
            endpoint.name, node, endpoint.address, endpoint.port, endpoint.tags
        );

        // same entry registered earlier under another id would otherwise linger
        for stale in existing.iter().filter(|s| {
            s.service_id != service_id && endpoint.is_same_entry(&s.node, &s.address, s.port, tag)
        }) {
            self.track(self.catalog.deregister(&CatalogDeregistration::service(stale)).await)
                .map_err(context(format!(
                    "Error deregistering service {} ({}) from {}",
                    stale.service_name, stale.service_id, stale.node
                )))?;
            self.metrics.deregistrations_total.inc();
            debug!("Removed {} superseded by {}", stale.service_id, service_id);
        }
        Ok(())
    }

    /// Deregister every managed instance of `service_name` absent from
    /// `desired`, then drop the nodes left without services.
    pub async fn remove_deleted_endpoints(&self, service_name: &str, desired: &[Endpoint]) -> Result<()> {
        let tag = self.config.managed_tag.as_str();
        let existing = self
            .track(self.catalog.list_services(service_name, tag).await)
            .map_err(context(format!("Failed to get services {}", service_name)))?;

        let mut touched_nodes = BTreeSet::new();
        for service in &existing {
            if desired
                .iter()
                .any(|e| e.is_same_entry(&service.node, &service.address, service.port, tag))
            {
                continue;
            }

            self.track(self.catalog.deregister(&CatalogDeregistration::service(service)).await)
                .map_err(context(format!(
                    "Error deregistering service {{node: {}, service: {}, address: {}, port: {}}}",
                    service.node, service.service_name, service.address, service.port
                )))?;
            self.metrics.deregistrations_total.inc();

            info!(
                "Deregister service {{node: {}, service: {}, address: {}, port: {}}}",
                service.node, service.service_name, service.address, service.port
            );
            touched_nodes.insert(service.node.clone());
        }

        for node_name in touched_nodes {
            let node = self
                .track(self.catalog.node(&node_name).await)
                .map_err(context(format!("Cannot get node {}", node_name)))?;

            if node.is_some_and(|n| n.services.is_empty()) {
                self.track(self.catalog.deregister(&CatalogDeregistration::node(node_name.as_str())).await)
                    .map_err(context(format!("Error deregistering node {}", node_name)))?;
                self.metrics.node_deregistrations_total.inc();
                info!("Deregister empty node {}", node_name);
            }
        }

        Ok(())
    }

    /// Fully retire services whose owning object is gone.
    ///
    /// A failure on one name is logged and the remaining names are still processed.
    pub async fn remove_deleted_services<I, S>(&self, service_names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in service_names {
            let name = name.as_ref();
            if let Err(e) = self.remove_deleted_endpoints(name, &[]).await {
                error!("Error removing service {}: {}", name, e);
            }
        }
    }

    /// Register every generated endpoint, then prune each service group
    pub async fn update_endpoints(&self, generated: &Generated) -> Result<()> {
        for endpoint in &generated.endpoints {
            self.register_endpoint(endpoint).await?;
        }

        for (service_name, desired) in &generated.per_service {
            self.remove_deleted_endpoints(service_name, desired).await?;
        }
        Ok(())
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.metrics.registry_errors_total.inc();
        }
        result
    }
}

fn context(message: String) -> impl FnOnce(CoreError) -> CoreError {
    move |e| CoreError::Catalog(format!("{}: {}", message, e))
}
