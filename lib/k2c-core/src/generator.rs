//! Desired endpoint generation from Kubernetes objects

use crate::config::SyncConfig;
use crate::endpoint::Endpoint;
use crate::metadata::{declared_service_names, service_metadata};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Desired endpoints grouped by logical service name
pub type PerServiceEndpoints = BTreeMap<String, Vec<Endpoint>>;

/// Result of one generation pass over an Endpoints object
#[derive(Clone, Debug, Default)]
pub struct Generated {
    pub endpoints: Vec<Endpoint>,
    pub per_service: PerServiceEndpoints,
}

impl Generated {
    /// Logical service names this pass touches, including empty groups
    pub fn service_names(&self) -> BTreeSet<String> {
        self.per_service.keys().cloned().collect()
    }
}

/// Turns Endpoints plus the annotations of their Service into catalog entries
pub struct EntryGenerator {
    config: Arc<SyncConfig>,
}

impl EntryGenerator {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self { config }
    }

    /// Generate every desired endpoint of `endpoints`.
    ///
    /// `service` is the owning Service; when it is missing no annotation
    /// applies and the object name is the only candidate service name.
    pub fn generate(&self, endpoints: &Endpoints, service: Option<&Service>) -> Generated {
        let object_name = endpoints.metadata.name.as_deref();
        let annotations = service.and_then(|s| s.metadata.annotations.as_ref());

        let mut generated = Generated {
            endpoints: Vec::new(),
            per_service: self
                .seed_names(object_name, service)
                .into_iter()
                .map(|name| (name, Vec::new()))
                .collect(),
        };

        for subset in endpoints.subsets.iter().flatten() {
            for port in subset.ports.iter().flatten() {
                let Ok(port_number) = u16::try_from(port.port) else {
                    warn!("Skipping invalid port {} on {:?}", port.port, object_name);
                    continue;
                };

                let meta = service_metadata(annotations, port_number);
                if meta.ignore {
                    debug!("Port {} of {:?} is ignored", port_number, object_name);
                    continue;
                }

                let fallback = (!self.config.explicit).then_some(object_name).flatten();
                let Some(name) = meta.name.as_deref().or(fallback) else {
                    debug!("No explicit service name for port {} of {:?}", port_number, object_name);
                    continue;
                };

                let tags: Vec<String> = std::iter::once(self.config.managed_tag.clone())
                    .chain(meta.tags.iter().cloned())
                    .collect();

                for address in subset.addresses.iter().flatten() {
                    let ref_name = address.target_ref.as_ref().and_then(|r| r.name.clone());
                    let check = match meta.health_check(&address.ip, port_number) {
                        Ok(check) => check,
                        Err(e) => {
                            warn!("Dropping health check of {} ({}:{}): {}", name, address.ip, port_number, e);
                            None
                        }
                    };

                    let endpoint = Endpoint::new(name, address.ip.clone(), port_number, ref_name, tags.clone())
                        .with_check(check);
                    generated
                        .per_service
                        .entry(name.to_string())
                        .or_default()
                        .push(endpoint.clone());
                    generated.endpoints.push(endpoint);
                }
            }
        }

        generated
    }

    /// Names that must be present in the grouping even without endpoints,
    /// so that services losing their last backend still get pruned.
    pub fn seed_names(&self, object_name: Option<&str>, service: Option<&Service>) -> BTreeSet<String> {
        let mut names = declared_service_names(service.and_then(|s| s.metadata.annotations.as_ref()));
        if !self.config.explicit {
            let own_name = object_name.or_else(|| service.and_then(|s| s.metadata.name.as_deref()));
            if let Some(name) = own_name {
                names.insert(name.to_string());
            }
        }
        names
    }
}
