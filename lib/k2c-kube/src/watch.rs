//! Bridge from Kubernetes watch streams to queued actions

use futures::StreamExt;
use k2c_core::{Action, ActionQueue, SyncConfig};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{Api, Client, Resource};
use kube_runtime::watcher::Event;
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Endpoints changes become registrations; their deletion is left to
/// the Service delete and to resync.
pub fn endpoints_action(event: Event<Endpoints>) -> Option<Action> {
    match event {
        Event::Apply(endpoints) | Event::InitApply(endpoints) => {
            Some(Action::AddOrUpdate(endpoints))
        }
        Event::Delete(_) | Event::Init | Event::InitDone => None,
    }
}

/// Service updates re-read annotations; the initial listing is skipped since
/// the Endpoints listing already covers it.
pub fn service_action(event: Event<Service>) -> Option<Action> {
    match event {
        Event::Apply(service) => Some(Action::UpdateService(service)),
        Event::Delete(service) => Some(Action::Delete(service)),
        Event::InitApply(_) | Event::Init | Event::InitDone => None,
    }
}

fn admit(config: &SyncConfig, action: Option<Action>) -> Option<Action> {
    action.filter(|action| !config.is_excluded(action.namespace()))
}

/// Start one watcher per resource kind, feeding `queue` until `shutdown`
pub fn spawn_watchers(
    client: Client,
    config: Arc<SyncConfig>,
    queue: ActionQueue,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(pump(
            Api::<Endpoints>::all(client.clone()),
            endpoints_action,
            config.clone(),
            queue.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(pump(
            Api::<Service>::all(client),
            service_action,
            config,
            queue,
            shutdown,
        )),
    ]
}

async fn pump<K>(
    api: Api<K>,
    classify: fn(Event<K>) -> Option<Action>,
    config: Arc<SyncConfig>,
    queue: ActionQueue,
    shutdown: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    info!("Watching {} in all namespaces", kind);

    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!("{} watch error: {}", kind, e);
                continue;
            }
            None => {
                warn!("{} watch stream ended", kind);
                break;
            }
        };

        let Some(action) = admit(&config, classify(event)) else {
            continue;
        };
        debug!("Queueing {}", action);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            pushed = queue.push(action) => {
                if pushed.is_err() {
                    warn!("Action queue closed, stopping {} watch", kind);
                    break;
                }
            }
        }
    }
    debug!("{} watch stopped", kind);
}
