//! Redis implementation of the idempotency store.
//!
//! Claims use `SET key value NX PX lease`, so exactly one caller wins a key
//! even across processes. Completion overwrites the record with the response
//! and the long TTL.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::error::{CacheError, CacheResult};
use super::keys::idempotency_record;
use super::RedisPool;
use crate::services::idempotency::{
    IdempotencyError, IdempotencyStore, Reservation, StoredResponse,
};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum Record {
    InFlight,
    Completed { response: StoredResponse },
}

/// Claims can race with an expiring record; retry a couple of times.
const RESERVE_ROUNDS: usize = 3;

pub struct RedisIdempotencyStore {
    pool: RedisPool,
}

impl RedisIdempotencyStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn try_claim(&self, key: &str, lease: Duration) -> CacheResult<Option<Reservation>> {
        let mut conn = self.pool.get().await?;
        let record = serde_json::to_string(&Record::InFlight)?;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(record)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut *conn)
            .await?;
        if claimed.is_some() {
            return Ok(Some(Reservation::New));
        }

        let existing: Option<String> = conn.get(key).await?;
        match existing {
            None => Ok(None),
            Some(raw) => match serde_json::from_str::<Record>(&raw)? {
                Record::InFlight => Ok(Some(Reservation::InFlight)),
                Record::Completed { response } => Ok(Some(Reservation::Completed(response))),
            },
        }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn reserve(&self, key: &str, lease: Duration) -> Result<Reservation, IdempotencyError> {
        let redis_key = idempotency_record(key);
        for _ in 0..RESERVE_ROUNDS {
            if let Some(reservation) = self
                .try_claim(&redis_key, lease)
                .await
                .map_err(|e| e.for_key(key))?
            {
                return Ok(reservation);
            }
            debug!(key = %key, "idempotency record expired during claim, retrying");
        }
        Err(IdempotencyError::Unavailable(format!(
            "could not claim {} after {} rounds",
            key, RESERVE_ROUNDS
        )))
    }

    async fn complete(
        &self,
        key: &str,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let redis_key = idempotency_record(key);
        let record = serde_json::to_string(&Record::Completed {
            response: response.clone(),
        })
        .map_err(CacheError::from)?;

        let mut conn = self.pool.get().await.map_err(CacheError::from)?;
        let _: () = conn
            .pset_ex(&redis_key, record, ttl.as_millis() as u64)
            .await
            .map_err(CacheError::from)?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), IdempotencyError> {
        let redis_key = idempotency_record(key);
        let mut conn = self.pool.get().await.map_err(CacheError::from)?;

        let existing: Option<String> = conn.get(&redis_key).await.map_err(CacheError::from)?;
        if let Some(raw) = existing {
            if matches!(serde_json::from_str::<Record>(&raw), Ok(Record::InFlight)) {
                let _: () = conn.del(&redis_key).await.map_err(CacheError::from)?;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), IdempotencyError> {
        super::health_check(&self.pool).await.map_err(Into::into)
    }
}
