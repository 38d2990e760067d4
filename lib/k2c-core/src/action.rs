//! Orchestrator change actions and their handler

use crate::config::SyncConfig;
use crate::generator::EntryGenerator;
use crate::locks::NamedLocks;
use crate::metrics::SyncMetrics;
use crate::reconciler::Reconciler;
use crate::source::EndpointSource;
use crate::Result;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Work item queued by the watchers
#[derive(Clone, Debug)]
pub enum Action {
    /// Endpoints were added or changed
    AddOrUpdate(Endpoints),
    /// A Service was deleted
    Delete(Service),
    /// A Service (and so its annotations) changed
    UpdateService(Service),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::AddOrUpdate(_) => "addOrUpdate",
            Action::Delete(_) => "delete",
            Action::UpdateService(_) => "updateService",
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Action::AddOrUpdate(endpoints) => &endpoints.metadata,
            Action::Delete(service) | Action::UpdateService(service) => &service.metadata,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.kind(),
            self.namespace().unwrap_or("default"),
            self.name().unwrap_or("unknown")
        )
    }
}

/// Executes actions against the catalog.
///
/// Registry mutations for an action run while holding the locks of every
/// logical service name the action touches.
pub struct ActionHandler {
    source: Arc<dyn EndpointSource>,
    reconciler: Arc<Reconciler>,
    generator: EntryGenerator,
    locks: Arc<NamedLocks>,
    config: Arc<SyncConfig>,
}

impl ActionHandler {
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
        }
    }

    pub fn metrics(&self) -> &SyncMetrics {
        self.reconciler.metrics()
    }

    pub async fn handle(&self, action: Action) -> Result<()> {
        if self.config.is_excluded(action.namespace()) {
            debug!("Skipping {} in excluded namespace", action);
            return Ok(());
        }
        let namespace = action.namespace().unwrap_or_default().to_string();
        let name = action.name().unwrap_or_default().to_string();

        match action {
            Action::AddOrUpdate(endpoints) => {
                let service = self.source.service(&namespace, &name).await?;
                self.update(&endpoints, service.as_ref()).await
            }
            Action::UpdateService(service) => {
                let endpoints = self
                    .source
                    .endpoints(&namespace, &name)
                    .await?
                    .unwrap_or_else(|| Endpoints {
                        metadata: service.metadata.clone(),
                        subsets: None,
                    });
                self.update(&endpoints, Some(&service)).await
            }
            Action::Delete(service) => {
                let names = self.generator.seed_names(Some(&name), Some(&service));
                let _guard = self.locks.lock_all(&names).await;
                self.reconciler.remove_deleted_services(&names).await;
                Ok(())
            }
        }
    }

    async fn update(&self, endpoints: &Endpoints, service: Option<&Service>) -> Result<()> {
        let generated = self.generator.generate(endpoints, service);
        let _guard = self.locks.lock_all(generated.service_names()).await;
        self.reconciler.update_endpoints(&generated).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{address, endpoints, service, subset};
    use crate::memory::MemoryCatalog;
    use crate::source::MemorySource;

    struct Harness {
        catalog: Arc<MemoryCatalog>,
        source: Arc<MemorySource>,
        handler: ActionHandler,
    }

    fn harness() -> Harness {
        let config = Arc::new(SyncConfig {
            managed_tag: "managed".to_string(),
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
        let handler = ActionHandler::new(source.clone(), reconciler, Arc::new(NamedLocks::new()), config);
        Harness {
            catalog,
            source,
            handler,
        }
    }

    #[tokio::test]
    async fn test_add_or_update_registers_scenario() {
        let h = harness();
        let ep = endpoints("default", "web", vec![subset(&[80], vec![address("10.0.0.5", Some("pod-a"))])]);

        h.handler.handle(Action::AddOrUpdate(ep)).await.unwrap();

        let services = h.catalog.all_services().await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_name, "web");
        assert_eq!(services[0].node, "pod-a");
        assert_eq!(services[0].address, "10.0.0.5");
        assert_eq!(services[0].port, 80);
        assert_eq!(services[0].tags, vec!["managed".to_string()]);
    }

    #[tokio::test]
    async fn test_add_or_update_uses_service_annotations() {
        let h = harness();
        h.source.put_service(service("default", "web", &[("SERVICE_NAME", "frontend")])).await;
        let ep = endpoints("default", "web", vec![subset(&[80], vec![address("10.0.0.5", Some("pod-a"))])]);

        h.handler.handle(Action::AddOrUpdate(ep)).await.unwrap();

        assert_eq!(h.catalog.all_services().await[0].service_name, "frontend");
    }

    #[tokio::test]
    async fn test_update_service_renames() {
        let h = harness();
        let ep = endpoints("default", "web", vec![subset(&[80], vec![address("10.0.0.5", Some("pod-a"))])]);
        h.source.put_endpoints(ep.clone()).await;
        h.handler.handle(Action::AddOrUpdate(ep)).await.unwrap();

        let renamed = service("default", "web", &[("SERVICE_NAME", "frontend")]);
        h.source.put_service(renamed.clone()).await;
        h.handler.handle(Action::UpdateService(renamed)).await.unwrap();

        let names: Vec<_> = h.catalog.all_services().await.into_iter().map(|s| s.service_name).collect();
        assert_eq!(names, vec!["frontend"]);
    }

    #[tokio::test]
    async fn test_update_service_ignore_prunes() {
        let h = harness();
        let ep = endpoints("default", "web", vec![subset(&[80], vec![address("10.0.0.5", Some("pod-a"))])]);
        h.source.put_endpoints(ep.clone()).await;
        h.handler.handle(Action::AddOrUpdate(ep)).await.unwrap();

        let ignored = service("default", "web", &[("SERVICE_IGNORE", "1")]);
        h.handler.handle(Action::UpdateService(ignored)).await.unwrap();

        assert!(h.catalog.all_services().await.is_empty());
        assert!(h.catalog.node_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_retires_all_declared_names() {
        let h = harness();
        let svc = service("default", "web", &[("SERVICE_8080_NAME", "web-admin")]);
        h.source.put_service(svc.clone()).await;
        let ep = endpoints(
            "default",
            "web",
            vec![subset(&[80, 8080], vec![address("10.0.0.5", Some("pod-a"))])],
        );
        h.handler.handle(Action::AddOrUpdate(ep)).await.unwrap();
        assert_eq!(h.catalog.all_services().await.len(), 2);

        h.handler.handle(Action::Delete(svc)).await.unwrap();
        assert!(h.catalog.all_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_excluded_namespace_is_ignored() {
        let h = harness();
        let ep = endpoints("kube-system", "dns", vec![subset(&[53], vec![address("10.0.0.10", Some("dns-0"))])]);
        h.handler.handle(Action::AddOrUpdate(ep)).await.unwrap();
        assert_eq!(h.catalog.write_count(), 0);
    }

    #[tokio::test]
    async fn test_source_error_is_returned() {
        let h = harness();
        h.source.set_failing(true);
        let ep = endpoints("default", "web", vec![]);
        assert!(h.handler.handle(Action::AddOrUpdate(ep)).await.is_err());
    }

    #[test]
    fn test_action_display() {
        let action = Action::Delete(service("default", "web", &[]));
        assert_eq!(action.to_string(), "delete default/web");
    }
}
