//! Static reconciliation settings

use std::time::Duration;

pub const DEFAULT_MANAGED_TAG: &str = "kube2consul";
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Settings shared read-only by every component.
///
/// Built once by the binary and handed around as `Arc<SyncConfig>`.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Tag stamped on every catalog service this process owns
    pub managed_tag: String,
    /// Only register objects carrying an explicit `SERVICE[_<port>]_NAME` annotation
    pub explicit: bool,
    /// Namespaces whose objects are never registered
    pub excluded_namespaces: Vec<String>,
    /// Interval between two full resync passes
    pub resync_period: Duration,
    /// Number of action workers
    pub workers: usize,
}

impl SyncConfig {
    pub fn is_excluded(&self, namespace: Option<&str>) -> bool {
        namespace
            .map(|ns| self.excluded_namespaces.iter().any(|ex| ex == ns))
            .unwrap_or(false)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            managed_tag: DEFAULT_MANAGED_TAG.to_string(),
            explicit: false,
            excluded_namespaces: Vec::new(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            workers: available_workers(),
        }
    }
}

/// Worker count used when none is configured.
pub fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
