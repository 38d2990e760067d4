//! Consul backend for kube2consul
//!
//! Provides the catalog implementation used by the reconciler and the
//! session-based leader lock.

pub mod catalog;
pub mod client;
pub mod error;
pub mod lock;

pub use catalog::ConsulCatalog;
pub use client::ConsulClient;
pub use error::{ConsulError, Result};
pub use lock::LeaderLock;
