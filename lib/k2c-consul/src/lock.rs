//! Leader lock over a Consul session and a KV key
//!
//! Only the holder of the key's session runs the sync loop. The session is
//! renewed in the background; when it cannot be renewed or the key changes
//! hands, the `lost` token is cancelled.

use crate::client::ConsulClient;
use crate::error::{ConsulError, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_LOCK_KEY: &str = "locks/kube2consul/.lock";

/// Marks a KV entry as a lock so unrelated keys are never destroyed
pub const LOCK_FLAG: u64 = 0x2ddccbc058a50c18;

const SESSION_NAME: &str = "kube2consul lock";
const SESSION_TTL: Duration = Duration::from_secs(15);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
    lock_delay: String,
}

#[derive(Deserialize, Debug)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    flags: u64,
    modify_index: u64,
    #[serde(default)]
    session: Option<String>,
}

impl KvEntry {
    fn held_by(&self, session: &str) -> bool {
        self.session.as_deref() == Some(session)
    }
}

/// What may happen to a lock key on cleanup
#[derive(Debug, PartialEq, Eq)]
enum Cleanup {
    Absent,
    Delete { modify_index: u64 },
}

fn cleanup_for(entry: Option<&KvEntry>) -> Result<Cleanup> {
    let Some(entry) = entry else {
        return Ok(Cleanup::Absent);
    };
    if entry.flags != LOCK_FLAG {
        return Err(ConsulError::Lock(format!(
            "key {} is not used as a lock",
            entry.key
        )));
    }
    if entry.session.as_deref().is_some_and(|s| !s.is_empty()) {
        return Err(ConsulError::LockInUse);
    }
    Ok(Cleanup::Delete {
        modify_index: entry.modify_index,
    })
}

/// A held leader lock
pub struct LeaderLock {
    client: ConsulClient,
    key: String,
    session: String,
    lost: CancellationToken,
    stop: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl LeaderLock {
    /// Block until `key` is acquired or `shutdown` is cancelled
    pub async fn acquire(
        client: ConsulClient,
        key: &str,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let key = key.trim_start_matches('/').to_string();
        let session = create_session(&client).await?;
        debug!("Created lock session {}", session);

        loop {
            match try_acquire(&client, &key, &session).await {
                Ok(true) => break,
                Ok(false) => debug!("Lock {} is held elsewhere, waiting", key),
                Err(e) => warn!("Lock acquisition attempt failed: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = destroy_session(&client, &session).await {
                        warn!("Failed to destroy lock session: {}", e);
                    }
                    return Err(ConsulError::Lock("acquisition cancelled".to_string()));
                }
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }

            if let Err(e) = renew_session(&client, &session).await {
                warn!("Failed to renew lock session while waiting: {}", e);
            }
        }

        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            client.clone(),
            key.clone(),
            session.clone(),
            SESSION_TTL,
            lost.clone(),
            stop.clone(),
        ));

        Ok(Self {
            client,
            key,
            session,
            lost,
            stop,
            monitor: Some(monitor),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cancelled once the lock is no longer held
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Stop renewing, release the key and destroy the session
    pub async fn release(&mut self) -> Result<()> {
        self.stop.cancel();
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                error!("Lock monitor terminated abnormally: {}", e);
            }
        }

        let flags = LOCK_FLAG.to_string();
        let query = [("release", self.session.as_str()), ("flags", flags.as_str())];
        self.client
            .send(self.client.request(Method::PUT, &kv_path(&self.key))?.query(&query))
            .await?;
        destroy_session(&self.client, &self.session).await
    }

    /// Delete the key unless another session holds it.
    ///
    /// Fails with `ConsulError::LockInUse` when it is held.
    pub async fn destroy(&self) -> Result<()> {
        let entry = read_key(&self.client, &self.key).await?;

        match cleanup_for(entry.as_ref())? {
            Cleanup::Absent => Ok(()),
            Cleanup::Delete { modify_index } => {
                let cas = modify_index.to_string();
                let request = self.client.request(Method::DELETE, &kv_path(&self.key))?;
                self.client
                    .send(request.query(&[("cas", cas.as_str())]))
                    .await?;
                Ok(())
            }
        }
    }
}

/// KV keys keep their `/` hierarchy; every part is escaped on its own
fn kv_path(key: &str) -> Vec<&str> {
    let mut segments = vec!["v1", "kv"];
    segments.extend(key.split('/'));
    segments
}

async fn create_session(client: &ConsulClient) -> Result<String> {
    let body = SessionRequest {
        name: SESSION_NAME,
        ttl: humantime::format_duration(SESSION_TTL).to_string(),
        behavior: "release",
        lock_delay: humantime::format_duration(SESSION_TTL).to_string(),
    };
    let response = client
        .send(client.request(Method::PUT, &["v1", "session", "create"])?.json(&body))
        .await?;
    let created: SessionCreated = response.json().await?;
    Ok(created.id)
}

async fn renew_session(client: &ConsulClient, session: &str) -> Result<()> {
    client
        .send(client.request(Method::PUT, &["v1", "session", "renew", session])?)
        .await?;
    Ok(())
}

async fn destroy_session(client: &ConsulClient, session: &str) -> Result<()> {
    client
        .send(client.request(Method::PUT, &["v1", "session", "destroy", session])?)
        .await?;
    Ok(())
}

async fn try_acquire(client: &ConsulClient, key: &str, session: &str) -> Result<bool> {
    let flags = LOCK_FLAG.to_string();
    let query = [("acquire", session), ("flags", flags.as_str())];
    let response = client
        .send(client.request(Method::PUT, &kv_path(key))?.query(&query))
        .await?;
    Ok(response.json().await?)
}

async fn read_key(client: &ConsulClient, key: &str) -> Result<Option<KvEntry>> {
    match client.get_json::<Vec<KvEntry>>(&kv_path(key), &[]).await {
        Ok(entries) => Ok(entries.into_iter().next()),
        Err(ConsulError::Status { status, .. }) if status == StatusCode::NOT_FOUND => Ok(None),
        Err(e) => Err(e),
    }
}

/// Session calls the lock monitor relies on
#[async_trait]
trait SessionStore: Send + Sync + 'static {
    async fn renew(&self, session: &str) -> Result<()>;
    async fn read(&self, key: &str) -> Result<Option<KvEntry>>;
}

#[async_trait]
impl SessionStore for ConsulClient {
    async fn renew(&self, session: &str) -> Result<()> {
        renew_session(self, session).await
    }

    async fn read(&self, key: &str) -> Result<Option<KvEntry>> {
        read_key(self, key).await
    }
}

/// Renew the session and verify ownership until stopped or lost.
///
/// Transient failures are tolerated for as long as `ttl` would still keep
/// the lock alive.
async fn monitor<S: SessionStore>(
    store: S,
    key: String,
    session: String,
    ttl: Duration,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    let mut last_confirmed = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(ttl / 3) => {}
        }

        let held = match store.renew(&session).await {
            Err(ConsulError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                error!("Lock session {} expired", session);
                false
            }
            Err(e) => {
                warn!("Failed to renew lock session: {}", e);
                last_confirmed.elapsed() < ttl
            }
            Ok(()) => match store.read(&key).await {
                Ok(Some(entry)) if entry.held_by(&session) => {
                    last_confirmed = Instant::now();
                    true
                }
                Ok(_) => {
                    error!("Lock {} is no longer held by this process", key);
                    false
                }
                Err(e) => {
                    warn!("Failed to read lock key {}: {}", key, e);
                    last_confirmed.elapsed() < ttl
                }
            },
        };

        if !held {
            lost.cancel();
            return;
        }
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        self.stop.cancel();
        if self.monitor.is_some() {
            info!("Leader lock dropped without release; session will expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const SESSION: &str = "adf4238a-882b-9ddc-4a9d-5b6758e4159e";

    /// Scripted session store; renewals fail with `renew_error` while
    /// `failures_left` is non-zero
    #[derive(Clone)]
    struct ScriptedStore {
        renew_error: StatusCode,
        failures_left: Arc<AtomicUsize>,
        holder: Arc<Mutex<Option<String>>>,
        renewals: Arc<AtomicUsize>,
    }

    impl ScriptedStore {
        fn held() -> Self {
            Self {
                renew_error: StatusCode::INTERNAL_SERVER_ERROR,
                failures_left: Arc::new(AtomicUsize::new(0)),
                holder: Arc::new(Mutex::new(Some(SESSION.to_string()))),
                renewals: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(self, status: StatusCode, times: usize) -> Self {
            self.failures_left.store(times, Ordering::SeqCst);
            Self {
                renew_error: status,
                ..self
            }
        }

        fn held_by(self, holder: Option<&str>) -> Self {
            *self.holder.lock().unwrap() = holder.map(str::to_string);
            self
        }
    }

    #[async_trait]
    impl SessionStore for ScriptedStore {
        async fn renew(&self, _session: &str) -> Result<()> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ConsulError::Status {
                    status: self.renew_error,
                    body: String::new(),
                });
            }
            Ok(())
        }

        async fn read(&self, key: &str) -> Result<Option<KvEntry>> {
            Ok(Some(KvEntry {
                key: key.to_string(),
                flags: LOCK_FLAG,
                modify_index: 7,
                session: self.holder.lock().unwrap().clone(),
            }))
        }
    }

    fn spawn_monitor(
        store: ScriptedStore,
        ttl: Duration,
    ) -> (CancellationToken, CancellationToken, JoinHandle<()>) {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(monitor(
            store,
            DEFAULT_LOCK_KEY.to_string(),
            SESSION.to_string(),
            ttl,
            lost.clone(),
            stop.clone(),
        ));
        (lost, stop, handle)
    }

    fn entry(flags: u64, session: Option<&str>) -> KvEntry {
        KvEntry {
            key: "locks/kube2consul/.lock".to_string(),
            flags,
            modify_index: 42,
            session: session.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_kv_entry() {
        let body = json!([{
            "LockIndex": 1,
            "Key": "locks/kube2consul/.lock",
            "Flags": LOCK_FLAG,
            "Value": null,
            "Session": "adf4238a-882b-9ddc-4a9d-5b6758e4159e",
            "CreateIndex": 10,
            "ModifyIndex": 12
        }]);
        let entries: Vec<KvEntry> = serde_json::from_value(body).unwrap();
        assert_eq!(entries[0].modify_index, 12);
        assert!(entries[0].held_by("adf4238a-882b-9ddc-4a9d-5b6758e4159e"));
        assert!(!entries[0].held_by("other"));
    }

    #[test]
    fn test_cleanup_decisions() {
        assert_eq!(cleanup_for(None).unwrap(), Cleanup::Absent);
        assert_eq!(
            cleanup_for(Some(&entry(LOCK_FLAG, None))).unwrap(),
            Cleanup::Delete { modify_index: 42 }
        );
        assert_eq!(
            cleanup_for(Some(&entry(LOCK_FLAG, Some("")))).unwrap(),
            Cleanup::Delete { modify_index: 42 }
        );
        assert!(matches!(
            cleanup_for(Some(&entry(LOCK_FLAG, Some("s1")))),
            Err(ConsulError::LockInUse)
        ));
        assert!(matches!(
            cleanup_for(Some(&entry(0, None))),
            Err(ConsulError::Lock(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_session_marks_lock_lost() {
        let store = ScriptedStore::held().failing(StatusCode::NOT_FOUND, usize::MAX);
        let (lost, _stop, handle) = spawn_monitor(store, Duration::from_millis(30));

        tokio::time::timeout(Duration::from_secs(2), lost.cancelled())
            .await
            .expect("lock marked lost");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor exits")
            .unwrap();
    }

    #[tokio::test]
    async fn test_key_taken_over_marks_lock_lost() {
        let store = ScriptedStore::held().held_by(Some("other-session"));
        let (lost, _stop, handle) = spawn_monitor(store, Duration::from_millis(30));

        tokio::time::timeout(Duration::from_secs(2), lost.cancelled())
            .await
            .expect("lock marked lost");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor exits")
            .unwrap();
    }

    #[tokio::test]
    async fn test_released_key_marks_lock_lost() {
        let store = ScriptedStore::held().held_by(None);
        let (lost, _stop, _handle) = spawn_monitor(store, Duration::from_millis(30));

        tokio::time::timeout(Duration::from_secs(2), lost.cancelled())
            .await
            .expect("lock marked lost");
    }

    #[tokio::test]
    async fn test_renew_errors_past_ttl_mark_lock_lost() {
        let store = ScriptedStore::held().failing(StatusCode::INTERNAL_SERVER_ERROR, usize::MAX);
        let renewals = store.renewals.clone();
        let (lost, _stop, _handle) = spawn_monitor(store, Duration::from_millis(30));

        tokio::time::timeout(Duration::from_secs(2), lost.cancelled())
            .await
            .expect("lock marked lost");
        assert!(renewals.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_transient_renew_error_keeps_lock() {
        let store = ScriptedStore::held().failing(StatusCode::INTERNAL_SERVER_ERROR, 1);
        let renewals = store.renewals.clone();
        let (lost, stop, handle) = spawn_monitor(store, Duration::from_millis(300));

        tokio::time::timeout(Duration::from_secs(5), async {
            while renewals.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("renewed three times");
        assert!(!lost.is_cancelled());

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor stops")
            .unwrap();
        assert!(!lost.is_cancelled());
    }

    #[test]
    fn test_kv_path_keeps_hierarchy() {
        let client = ConsulClient::new("127.0.0.1:8500", None).unwrap();
        let url = client.url(&kv_path(DEFAULT_LOCK_KEY)).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8500/v1/kv/locks/kube2consul/.lock");

        let url = client.url(&kv_path("locks/a?b#c")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8500/v1/kv/locks/a%3Fb%23c");
    }

    #[test]
    fn test_session_request_body() {
        let body = SessionRequest {
            name: SESSION_NAME,
            ttl: humantime::format_duration(SESSION_TTL).to_string(),
            behavior: "release",
            lock_delay: humantime::format_duration(SESSION_TTL).to_string(),
        };
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({
                "Name": "kube2consul lock",
                "TTL": "15s",
                "Behavior": "release",
                "LockDelay": "15s"
            })
        );
    }
}
