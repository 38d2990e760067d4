//! Full reconciliation of the catalog against orchestrator state
//!
//! A pass recomputes every desired endpoint from scratch, removes managed
//! catalog services that no longer have a source object, and registers and
//! prunes the rest. It heals anything missed by the event path.

use crate::config::SyncConfig;
use crate::endpoint::Endpoint;
use crate::generator::{EntryGenerator, PerServiceEndpoints};
use crate::locks::NamedLocks;
use crate::reconciler::Reconciler;
use crate::source::EndpointSource;
use crate::{CoreError, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

pub struct Resync {
    source: Arc<dyn EndpointSource>,
    reconciler: Arc<Reconciler>,
    generator: EntryGenerator,
    locks: Arc<NamedLocks>,
    config: Arc<SyncConfig>,
    running: AtomicBool,
}

/// Clears the running flag even if a pass panics
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Resync {
    pub fn new(
        source: Arc<dyn EndpointSource>,
        reconciler: Arc<Reconciler>,
        locks: Arc<NamedLocks>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            source,
            reconciler,
            generator: EntryGenerator::new(config.clone()),
            locks,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a pass in the background unless one is already in flight.
    ///
    /// Returns whether a pass was started.
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Resync already running, skipping tick");
            return false;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _running = RunningGuard(&this.running);
            if let Err(e) = this.run_pass().await {
                error!("Resync aborted: {}", e);
            }
        });
        true
    }

    /// Desired endpoints of every non-excluded object, grouped by service name
    pub async fn desired_state(&self) -> Result<PerServiceEndpoints> {
        let mut desired = PerServiceEndpoints::new();

        for endpoints in self.source.list_endpoints().await? {
            let namespace = endpoints.metadata.namespace.as_deref();
            if self.config.is_excluded(namespace) {
                continue;
            }
            let service = match (namespace, endpoints.metadata.name.as_deref()) {
                (Some(ns), Some(name)) => self.source.service(ns, name).await?,
                _ => None,
            };

            let generated = self.generator.generate(&endpoints, service.as_ref());
            for (name, eps) in generated.per_service {
                desired.entry(name).or_default().extend(eps);
            }
        }

        Ok(desired)
    }

    /// Run one full pass now.
    ///
    /// Fails only when the desired or registered state cannot be read; errors
    /// on individual services are logged and the pass moves on.
    pub async fn run_pass(&self) -> Result<()> {
        let started = Instant::now();
        info!("resync");

        let desired = self.desired_state().await?;
        debug!("{} services desired", desired.len());

        let tag = self.config.managed_tag.as_str();
        let registered = self.reconciler.catalog().services().await.map_err(|e| {
            self.reconciler.metrics().registry_errors_total.inc();
            CoreError::Catalog(format!("Cannot list catalog services: {}", e))
        })?;

        let mut present = BTreeSet::new();
        for (name, tags) in registered {
            if !tags.iter().any(|t| t == tag) {
                continue;
            }
            let _guard = self.locks.lock(&name).await;

            match desired.get(&name) {
                None => {
                    debug!("Removing garbage service {}", name);
                    if let Err(e) = self.reconciler.remove_deleted_endpoints(&name, &[]).await {
                        error!("Error removing garbage service {}: {}", name, e);
                    }
                }
                Some(endpoints) => {
                    if let Err(e) = self.sync_service(&name, endpoints).await {
                        error!("Error syncing service {}: {}", name, e);
                    }
                    present.insert(name);
                }
            }
        }

        for (name, endpoints) in &desired {
            if present.contains(name) {
                continue;
            }
            let _guard = self.locks.lock(name).await;
            if let Err(e) = self.register_all(endpoints).await {
                error!("Error registering new service {}: {}", name, e);
            }
        }

        let metrics = self.reconciler.metrics();
        metrics.resyncs_total.inc();
        metrics.resync_duration_seconds.observe(started.elapsed().as_secs_f64());
        info!("resync done in {:?}", started.elapsed());
        Ok(())
    }

    async fn sync_service(&self, name: &str, endpoints: &[Endpoint]) -> Result<()> {
        self.register_all(endpoints).await?;
        self.reconciler.remove_deleted_endpoints(name, endpoints).await
    }

    async fn register_all(&self, endpoints: &[Endpoint]) -> Result<()> {
        for endpoint in endpoints {
            self.reconciler.register_endpoint(endpoint).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogRegistration, CatalogService, ServiceDefinition};
    use crate::fixtures::{address, endpoints, service, subset};
    use crate::memory::MemoryCatalog;
    use crate::metrics::SyncMetrics;
    use crate::source::MemorySource;
    use std::time::Duration;

    const TAG: &str = "managed";

    struct Harness {
        catalog: Arc<MemoryCatalog>,
        source: Arc<MemorySource>,
        resync: Arc<Resync>,
    }

    fn harness() -> Harness {
        let config = Arc::new(SyncConfig {
            managed_tag: TAG.to_string(),
            excluded_namespaces: vec!["kube-system".to_string()],
            ..SyncConfig::default()
        });
        let catalog = Arc::new(MemoryCatalog::new());
        let source = Arc::new(MemorySource::new());
        let reconciler = Arc::new(Reconciler::new(
            catalog.clone(),
            config.clone(),
            SyncMetrics::new().unwrap(),
        ));
        let resync = Arc::new(Resync::new(
            source.clone(),
            reconciler,
            Arc::new(NamedLocks::new()),
            config,
        ));
        Harness {
            catalog,
            source,
            resync,
        }
    }

    async fn seed(catalog: &MemoryCatalog, node: &str, name: &str, ip: &str, port: u16, tags: &[&str]) {
        catalog
            .register(&CatalogRegistration {
                node: node.to_string(),
                address: ip.to_string(),
                service: ServiceDefinition {
                    id: None,
                    name: name.to_string(),
                    address: ip.to_string(),
                    port,
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    meta: Default::default(),
                },
                check: None,
            })
            .await
            .unwrap();
    }

    fn triples(services: &[CatalogService]) -> Vec<(String, String, String, u16)> {
        services
            .iter()
            .map(|s| (s.service_name.clone(), s.node.clone(), s.address.clone(), s.port))
            .collect()
    }

    fn owned(name: &str, node: &str, ip: &str, port: u16) -> (String, String, String, u16) {
        (name.to_string(), node.to_string(), ip.to_string(), port)
    }

    #[tokio::test]
    async fn test_pass_converges_from_arbitrary_state() {
        let h = harness();
        h.source
            .put_endpoints(endpoints("default", "web", vec![subset(&[80], vec![address("10.0.0.5", Some("pod-a"))])]))
            .await;
        h.source
            .put_endpoints(endpoints("default", "api", vec![subset(&[8080], vec![address("10.0.0.6", Some("pod-b"))])]))
            .await;
        h.source
            .put_service(service("default", "api", &[("SERVICE_TAGS", "v2")]))
            .await;

        // garbage, a rotated-out instance, a stale tag set and an unmanaged service
        seed(&h.catalog, "pod-old", "gone", "10.0.9.9", 80, &[TAG]).await;
        seed(&h.catalog, "pod-x", "web", "10.0.0.99", 80, &[TAG]).await;
        seed(&h.catalog, "pod-b", "api", "10.0.0.6", 8080, &[TAG, "v1"]).await;
        seed(&h.catalog, "vm-1", "legacy", "10.2.0.1", 443, &["hand-made"]).await;

        h.resync.run_pass().await.unwrap();

        let services = h.catalog.all_services().await;
        assert_eq!(
            triples(&services),
            vec![
                owned("api", "pod-b", "10.0.0.6", 8080),
                owned("legacy", "vm-1", "10.2.0.1", 443),
                owned("web", "pod-a", "10.0.0.5", 80),
            ]
        );
        let api = services.iter().find(|s| s.service_name == "api").unwrap();
        assert_eq!(api.tags, vec![TAG.to_string(), "v2".to_string()]);

        let nodes: Vec<_> = h.catalog.node_names().await.into_iter().collect();
        assert_eq!(nodes, vec!["pod-a", "pod-b", "vm-1"]);
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let h = harness();
        h.source
            .put_endpoints(endpoints("default", "web", vec![subset(&[80], vec![address("10.0.0.5", Some("pod-a"))])]))
            .await;

        h.resync.run_pass().await.unwrap();
        let writes = h.catalog.write_count();
        h.resync.run_pass().await.unwrap();
        assert_eq!(h.catalog.write_count(), writes);
    }

    #[tokio::test]
    async fn test_multi_port_service_converges() {
        let h = harness();
        h.source
            .put_endpoints(endpoints("default", "web", vec![subset(&[80, 9090], vec![address("10.0.0.5", Some("pod-a"))])]))
            .await;

        h.resync.run_pass().await.unwrap();
        let writes = h.catalog.write_count();
        h.resync.run_pass().await.unwrap();

        assert_eq!(h.catalog.write_count(), writes);
        assert_eq!(
            triples(&h.catalog.all_services().await),
            vec![
                owned("web", "pod-a", "10.0.0.5", 80),
                owned("web", "pod-a", "10.0.0.5", 9090),
            ]
        );
    }

    #[tokio::test]
    async fn test_objects_sharing_a_name_are_merged() {
        let h = harness();
        h.source
            .put_endpoints(endpoints("a", "web", vec![subset(&[80], vec![address("10.0.0.1", Some("pod-1"))])]))
            .await;
        h.source
            .put_endpoints(endpoints("b", "web", vec![subset(&[80], vec![address("10.0.1.1", Some("pod-2"))])]))
            .await;

        h.resync.run_pass().await.unwrap();
        h.resync.run_pass().await.unwrap();

        assert_eq!(h.catalog.all_services().await.len(), 2);
    }

    #[tokio::test]
    async fn test_excluded_namespaces_are_garbage() {
        let h = harness();
        h.source
            .put_endpoints(endpoints("kube-system", "dns", vec![subset(&[53], vec![address("10.0.0.10", Some("dns-0"))])]))
            .await;
        seed(&h.catalog, "dns-0", "dns", "10.0.0.10", 53, &[TAG]).await;

        h.resync.run_pass().await.unwrap();
        assert!(h.catalog.all_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_service_does_not_block_others() {
        let h = harness();
        h.source
            .put_endpoints(endpoints("default", "web", vec![subset(&[80], vec![address("10.0.0.5", Some("pod-a"))])]))
            .await;
        h.source
            .put_endpoints(endpoints("default", "api", vec![subset(&[80], vec![address("10.0.0.6", Some("pod-b"))])]))
            .await;
        h.catalog.fail_service("api").await;

        h.resync.run_pass().await.unwrap();

        let names: Vec<_> = h.catalog.all_services().await.into_iter().map(|s| s.service_name).collect();
        assert_eq!(names, vec!["web"]);
    }

    #[tokio::test]
    async fn test_unreadable_source_aborts_before_touching_catalog() {
        let h = harness();
        seed(&h.catalog, "pod-a", "web", "10.0.0.5", 80, &[TAG]).await;
        h.source.set_failing(true);

        assert!(h.resync.run_pass().await.is_err());
        assert_eq!(h.catalog.all_services().await.len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_skips_while_running() {
        let h = harness();
        let guard = h.resync.locks.lock("web").await;
        seed(&h.catalog, "pod-a", "web", "10.0.0.5", 80, &[TAG]).await;

        // the pass blocks on the "web" lock held above
        assert!(h.resync.trigger());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.resync.is_running());
        assert!(!h.resync.trigger());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), async {
            while h.resync.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pass finished");
        assert!(h.catalog.all_services().await.is_empty());
        assert!(h.resync.trigger());
    }
}
