//! Desired catalog registrations
use crate::catalog::CatalogService;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Service meta key holding the declared health check, so that a changed
/// check makes the entry stale like a changed tag does
pub const CHECK_META_KEY: &str = "kube2consul-check";

/// HTTP health check attached to a catalog service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    /// Full URL probed by the registry
    pub http: String,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl HealthCheck {
    /// Stable text form stored under `CHECK_META_KEY`
    pub fn fingerprint(&self) -> String {
        let mut fingerprint = format!("{} {}", self.http, humantime::format_duration(self.interval));
        if let Some(timeout) = self.timeout {
            fingerprint.push_str(&format!(" {}", humantime::format_duration(timeout)));
        }
        fingerprint
    }
}

/// One backend address that should be present in the catalog.
///
/// Two endpoints are the same catalog entry when node, address and port
/// match. Only `is_up_to_date` looks at the health check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Backend instance (pod) name, used as the catalog node.
    /// `None` until the address is bound to an instance.
    pub ref_name: Option<String>,
    pub tags: BTreeSet<String>,
    pub check: Option<HealthCheck>,
}

impl Endpoint {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        ref_name: Option<String>,
        tags: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            ref_name: ref_name.filter(|r| !r.is_empty()),
            tags: tags.into_iter().collect(),
            check: None,
        }
    }

    pub fn with_check(mut self, check: Option<HealthCheck>) -> Self {
        self.check = check;
        self
    }

    /// Catalog node name for this endpoint, `None` if it cannot be registered
    pub fn node_name(&self, managed_tag: &str) -> Option<String> {
        self.ref_name
            .as_deref()
            .map(|ref_name| mangle_node_name(ref_name, managed_tag))
    }

    /// Tags written to the catalog: the managed tag plus declared tags
    pub fn registered_tags(&self, managed_tag: &str) -> BTreeSet<String> {
        let mut tags = self.tags.clone();
        tags.insert(managed_tag.to_string());
        tags
    }

    /// Catalog service id; distinct for every (name, address, port) so that
    /// several ports of one service can live on the same node
    pub fn service_id(&self) -> String {
        format!("{}:{}:{}", self.name, self.address, self.port)
    }

    /// Service meta written with the registration
    pub fn service_meta(&self) -> BTreeMap<String, String> {
        self.check
            .iter()
            .map(|check| (CHECK_META_KEY.to_string(), check.fingerprint()))
            .collect()
    }

    /// Tag-equivalent and declaring the same health check
    pub fn is_up_to_date(&self, service: &CatalogService, managed_tag: &str) -> bool {
        let check = self.check.as_ref().map(HealthCheck::fingerprint);
        self.is_tag_equivalent(&service.node, &service.address, service.port, &service.tags, managed_tag)
            && service.meta.get(CHECK_META_KEY) == check.as_ref()
    }

    pub fn is_same_entry(&self, node: &str, address: &str, port: u16, managed_tag: &str) -> bool {
        self.port == port
            && self.address == address
            && self.node_name(managed_tag).as_deref() == Some(node)
    }

    /// Same entry and same tag set once the managed tag is folded in on both sides.
    pub fn is_tag_equivalent(
        &self,
        node: &str,
        address: &str,
        port: u16,
        tags: &[String],
        managed_tag: &str,
    ) -> bool {
        if !self.is_same_entry(node, address, port, managed_tag) {
            return false;
        }
        let mut existing: BTreeSet<String> = tags.iter().cloned().collect();
        existing.insert(managed_tag.to_string());
        existing == self.registered_tags(managed_tag)
    }
}

/// Backends named `consul*` would shadow the registry's own agent nodes,
/// so they are registered under `<managed_tag>-<name>`.
pub fn mangle_node_name(ref_name: &str, managed_tag: &str) -> String {
    if ref_name.starts_with("consul") {
        format!("{}-{}", managed_tag, ref_name)
    } else {
        ref_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: &str = "managed";

    fn endpoint(tags: &[&str]) -> Endpoint {
        Endpoint::new(
            "web",
            "10.0.0.5",
            80,
            Some("pod-a".to_string()),
            tags.iter().map(|t| t.to_string()),
        )
    }

    #[test]
    fn test_empty_ref_name_is_unregisterable() {
        let e = Endpoint::new("web", "10.0.0.5", 80, Some(String::new()), Vec::new());
        assert_eq!(e.ref_name, None);
        assert_eq!(e.node_name(TAG), None);
    }

    #[test]
    fn test_node_name_mangling() {
        assert_eq!(mangle_node_name("pod-a", TAG), "pod-a");
        assert_eq!(mangle_node_name("consul-0", TAG), "managed-consul-0");
    }

    #[test]
    fn test_tag_equivalence_folds_managed_tag() {
        let e = endpoint(&["x"]);
        let existing = vec![TAG.to_string(), "x".to_string()];
        assert!(e.is_tag_equivalent("pod-a", "10.0.0.5", 80, &existing, TAG));

        let e = endpoint(&["y"]);
        assert!(!e.is_tag_equivalent("pod-a", "10.0.0.5", 80, &existing, TAG));
    }

    #[test]
    fn test_tag_equivalence_ignores_order_and_duplicates() {
        let e = endpoint(&[TAG, "b", "a"]);
        let existing = vec!["a".to_string(), TAG.to_string(), "b".to_string(), "a".to_string()];
        assert!(e.is_tag_equivalent("pod-a", "10.0.0.5", 80, &existing, TAG));
    }

    fn listed(e: &Endpoint, meta: &[(&str, &str)]) -> CatalogService {
        CatalogService {
            node: "pod-a".to_string(),
            address: e.address.clone(),
            service_id: e.service_id(),
            service_name: e.name.clone(),
            port: e.port,
            tags: vec![TAG.to_string()],
            meta: meta.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_service_id_distinguishes_ports() {
        let a = Endpoint::new("web", "10.0.0.5", 80, Some("pod-a".to_string()), Vec::new());
        let b = Endpoint::new("web", "10.0.0.5", 9090, Some("pod-a".to_string()), Vec::new());
        assert_eq!(a.service_id(), "web:10.0.0.5:80");
        assert_ne!(a.service_id(), b.service_id());
    }

    #[test]
    fn test_check_change_makes_entry_stale() {
        let check = HealthCheck {
            http: "http://10.0.0.5:80/health".to_string(),
            interval: Duration::from_secs(10),
            timeout: Some(Duration::from_secs(2)),
        };
        assert_eq!(check.fingerprint(), "http://10.0.0.5:80/health 10s 2s");

        let plain = endpoint(&[]);
        let checked = endpoint(&[]).with_check(Some(check.clone()));

        assert!(plain.is_up_to_date(&listed(&plain, &[]), TAG));
        assert!(!checked.is_up_to_date(&listed(&plain, &[]), TAG));
        assert!(checked.is_up_to_date(&listed(&checked, &[(CHECK_META_KEY, "http://10.0.0.5:80/health 10s 2s")]), TAG));
        assert!(!plain.is_up_to_date(&listed(&checked, &[(CHECK_META_KEY, "http://10.0.0.5:80/health 10s 2s")]), TAG));

        let slower = endpoint(&[]).with_check(Some(HealthCheck {
            interval: Duration::from_secs(30),
            ..check
        }));
        assert_eq!(slower.service_meta()[CHECK_META_KEY], "http://10.0.0.5:80/health 30s 2s");
        assert!(!slower.is_up_to_date(&listed(&checked, &[(CHECK_META_KEY, "http://10.0.0.5:80/health 10s 2s")]), TAG));
    }

    #[test]
    fn test_same_entry_requires_full_triple() {
        let e = endpoint(&[]);
        assert!(e.is_same_entry("pod-a", "10.0.0.5", 80, TAG));
        assert!(!e.is_same_entry("pod-b", "10.0.0.5", 80, TAG));
        assert!(!e.is_same_entry("pod-a", "10.0.0.6", 80, TAG));
        assert!(!e.is_same_entry("pod-a", "10.0.0.5", 81, TAG));
    }
}
