//! Bounded action queue drained by a fixed pool of workers

use crate::action::{Action, ActionHandler};
use crate::{CoreError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const QUEUE_CAPACITY: usize = 1024;

/// Producer side of the action queue
#[derive(Clone)]
pub struct ActionQueue {
    tx: mpsc::Sender<Action>,
}

impl ActionQueue {
    /// Enqueue an action, waiting while the queue is full
    pub async fn push(&self, action: Action) -> Result<()> {
        self.tx.send(action).await.map_err(|_| CoreError::QueueClosed)
    }
}

/// Workers sharing one receiver
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `workers` workers (at least one) and return the queue feeding them
    pub fn start(workers: usize, handler: Arc<ActionHandler>) -> (ActionQueue, WorkerPool) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let handles = (1..=workers.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    rx.clone(),
                    handler.clone(),
                    shutdown.clone(),
                ))
            })
            .collect::<Vec<_>>();
        info!("Started {} action workers", handles.len());

        (ActionQueue { tx }, WorkerPool { handles, shutdown })
    }

    /// Signal every worker to stop, then wait for in-flight actions to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker terminated abnormally: {}", e);
            }
        }
        info!("Action workers stopped");
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Action>>>,
    handler: Arc<ActionHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some(action) = next else {
            break;
        };

        let kind = action.kind();
        debug!("[job: {}] {}", id, action);
        let description = action.to_string();
        handler.metrics().actions_total.with_label_values(&[kind]).inc();

        // Not raced against shutdown: an action that started runs to completion
        if let Err(e) = handler.handle(action).await {
            handler.metrics().action_errors_total.with_label_values(&[kind]).inc();
            error!("[job: {}] Error handling {}: {}", id, description, e);
        }
    }
    debug!("[job: {}] stopped", id);
}
