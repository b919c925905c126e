//! Idempotency store: at most one execution per key, replayed responses
//! for repeats.
//!
//! `reserve` claims a key with a short in-flight lease; the owner then either
//! `complete`s it with the response to replay or `release`s it so a retry can
//! run. Completed records live for the configured TTL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::IdempotencyConfig;
use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};

/// Response recorded against a completed key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

impl StoredResponse {
    pub fn new(status_code: u16, body: serde_json::Value) -> Self {
        Self { status_code, body }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller owns the key and must complete or release it.
    New,
    InFlight,
    Completed(StoredResponse),
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt idempotency record for {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<IdempotencyError> for AppError {
    fn from(err: IdempotencyError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::IdempotencyStore {
                message: err.to_string(),
            },
        ))
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claims `key` for `lease`, or reports its current state.
    async fn reserve(&self, key: &str, lease: Duration) -> Result<Reservation, IdempotencyError>;

    async fn complete(
        &self,
        key: &str,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError>;

    /// Drops an in-flight claim. Completed records are left alone.
    async fn release(&self, key: &str) -> Result<(), IdempotencyError>;

    async fn ping(&self) -> Result<(), IdempotencyError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Entry {
    InFlight,
    Completed(StoredResponse),
}

/// Process-local store for tests and `SKIP_EXTERNALS` runs.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (Entry, Instant)>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(&self, key: &str, lease: Duration) -> Result<Reservation, IdempotencyError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if let Some((entry, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(match entry {
                    Entry::InFlight => Reservation::InFlight,
                    Entry::Completed(response) => Reservation::Completed(response.clone()),
                });
            }
        }

        entries.insert(key.to_string(), (Entry::InFlight, now + lease));
        Ok(Reservation::New)
    }

    async fn complete(
        &self,
        key: &str,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        self.entries.lock().await.insert(
            key.to_string(),
            (Entry::Completed(response.clone()), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), IdempotencyError> {
        let mut entries = self.entries.lock().await;
        if matches!(entries.get(key), Some((Entry::InFlight, _))) {
            entries.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyPolicy {
    /// Lifetime of completed records
    pub ttl: Duration,
    /// Lease on an in-flight claim; bounds how long a crashed owner blocks a key
    pub lease: Duration,
    /// How long a duplicate waits for the owner before giving up
    pub wait: Duration,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            lease: Duration::from_secs(300),
            wait: Duration::from_secs(3),
        }
    }
}

impl From<&IdempotencyConfig> for IdempotencyPolicy {
    fn from(config: &IdempotencyConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            wait: Duration::from_millis(config.wait_ms),
            ..Self::default()
        }
    }
}

const WAIT_STEP_START: Duration = Duration::from_millis(50);
const WAIT_STEP_MAX: Duration = Duration::from_millis(500);

async fn reserve_with_wait(
    store: &dyn IdempotencyStore,
    key: &str,
    policy: &IdempotencyPolicy,
) -> Result<Option<StoredResponse>, AppError> {
    let deadline = Instant::now() + policy.wait;
    let mut step = WAIT_STEP_START;

    loop {
        match store.reserve(key, policy.lease).await? {
            Reservation::New => return Ok(None),
            Reservation::Completed(response) => return Ok(Some(response)),
            Reservation::InFlight => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(AppError::new(AppErrorKind::Domain(
                        DomainError::RequestInFlight {
                            key: key.to_string(),
                        },
                    )));
                }
                tokio::time::sleep(step.min(deadline - now)).await;
                step = (step * 2).min(WAIT_STEP_MAX);
            }
        }
    }
}

/// Runs `op` at most once per `key` and replays its response afterwards.
///
/// Failed operations release the key so the caller can retry. A store that
/// cannot be reached fails the request rather than running it unguarded.
pub async fn run_idempotent<F, Fut>(
    store: &dyn IdempotencyStore,
    key: &str,
    policy: &IdempotencyPolicy,
    op: F,
) -> Result<StoredResponse, AppError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, AppError>>,
{
    if let Some(replayed) = reserve_with_wait(store, key, policy).await? {
        debug!(key = %key, "replaying stored response");
        return Ok(replayed);
    }

    match op().await {
        Ok(response) => {
            if let Err(e) = store.complete(key, &response, policy.ttl).await {
                error!(key = %key, error = %e, "failed to record idempotent response");
                if let Err(e) = store.release(key).await {
                    warn!(key = %key, error = %e, "failed to release idempotency key");
                }
            }
            Ok(response)
        }
        Err(err) => {
            if let Err(e) = store.release(key).await {
                warn!(key = %key, error = %e, "failed to release idempotency key");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy() -> IdempotencyPolicy {
        IdempotencyPolicy {
            ttl: Duration::from_secs(60),
            lease: Duration::from_secs(5),
            wait: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn reserve_reports_each_state() {
        let store = InMemoryIdempotencyStore::new();
        let lease = Duration::from_secs(5);

        assert_eq!(store.reserve("k", lease).await.unwrap(), Reservation::New);
        assert_eq!(store.reserve("k", lease).await.unwrap(), Reservation::InFlight);

        let response = StoredResponse::new(200, json!({"ok": true}));
        store.complete("k", &response, Duration::from_secs(60)).await.unwrap();
        assert_eq!(
            store.reserve("k", lease).await.unwrap(),
            Reservation::Completed(response)
        );

        // releasing a completed key keeps it
        store.release("k").await.unwrap();
        assert!(matches!(
            store.reserve("k", lease).await.unwrap(),
            Reservation::Completed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_reclaimed() {
        let store = InMemoryIdempotencyStore::new();
        assert_eq!(
            store.reserve("k", Duration::from_secs(1)).await.unwrap(),
            Reservation::New
        );
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            store.reserve("k", Duration::from_secs(1)).await.unwrap(),
            Reservation::New
        );
    }

    #[tokio::test]
    async fn operation_runs_once_and_is_replayed() {
        let store = InMemoryIdempotencyStore::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let response = run_idempotent(&store, "evt", &policy(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(StoredResponse::new(200, json!({"result": "paid"})))
            })
            .await
            .unwrap();
            assert_eq!(response.body["result"], "paid");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_operation_releases_the_key() {
        let store = InMemoryIdempotencyStore::new();

        let err = run_idempotent(&store, "evt", &policy(), || async {
            Err::<StoredResponse, _>(AppError::internal("boom"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 500);

        let response = run_idempotent(&store, "evt", &policy(), || async {
            Ok(StoredResponse::new(200, json!({})))
        })
        .await
        .unwrap();
        assert_eq!(response.status_code, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_waits_then_reports_in_flight() {
        let store = InMemoryIdempotencyStore::new();
        store.reserve("evt", Duration::from_secs(60)).await.unwrap();

        let err = run_idempotent(&store, "evt", &policy(), || async {
            Ok(StoredResponse::new(200, json!({})))
        })
        .await
        .unwrap_err();

        assert_eq!(err.status_code(), 409);
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_picks_up_the_owner_result() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        store.reserve("evt", Duration::from_secs(60)).await.unwrap();

        let owner = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            owner
                .complete(
                    "evt",
                    &StoredResponse::new(200, json!({"result": "paid"})),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        });

        let response = run_idempotent(store.as_ref(), "evt", &policy(), || async {
            Ok(StoredResponse::new(200, json!({"result": "second"})))
        })
        .await
        .unwrap();
        assert_eq!(response.body["result"], "paid");
    }

    struct DownStore;

    #[async_trait]
    impl IdempotencyStore for DownStore {
        async fn reserve(&self, _: &str, _: Duration) -> Result<Reservation, IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".to_string()))
        }
        async fn complete(
            &self,
            _: &str,
            _: &StoredResponse,
            _: Duration,
        ) -> Result<(), IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".to_string()))
        }
        async fn release(&self, _: &str) -> Result<(), IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn unavailable_store_rejects_without_running() {
        let calls = AtomicUsize::new(0);
        let err = run_idempotent(&DownStore, "evt", &policy(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(StoredResponse::new(200, json!({})))
        })
        .await
        .unwrap_err();

        assert_eq!(err.status_code(), 503);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
