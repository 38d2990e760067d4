//! Core reconciliation engine for mirroring Kubernetes endpoints into Consul
//!
//! This library provides:
//! - Annotation parsing and catalog entry generation
//! - Idempotent registration and pruning against a registry catalog
//! - The action queue, its workers and the periodic resync pass

pub mod action;
pub mod catalog;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod generator;
pub mod locks;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod reconciler;
pub mod resync;
pub mod source;
pub mod worker;

#[cfg(test)]
mod fixtures;

pub use action::{Action, ActionHandler};
pub use catalog::Catalog;
pub use config::SyncConfig;
pub use endpoint::Endpoint;
pub use error::{CoreError, Result};
pub use locks::NamedLocks;
pub use metrics::SyncMetrics;
pub use reconciler::Reconciler;
pub use resync::Resync;
pub use source::EndpointSource;
pub use worker::{ActionQueue, WorkerPool};
