//! Kubernetes side of kube2consul
//!
//! Client construction, the API-server backed `EndpointSource` and the
//! watchers that turn object changes into queued actions.

pub mod client;
pub mod source;
pub mod watch;

pub use client::{connect, server_version, KubeOptions};
pub use source::KubeSource;
pub use watch::spawn_watchers;
