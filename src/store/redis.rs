use super::{DecisionCache, IdempotencyStore, StoreError};
use crate::models::{CachedDecision, IdempotencyRecord, ModerationResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::MultiplexedConnection};
use std::time::Duration;
use uuid::Uuid;

const DECISION_PREFIX: &str = "moderation:decision";
const IDEMPOTENCY_PREFIX: &str = "moderation:idempotency";

pub fn decision_key(fingerprint: &str) -> String {
    format!("{DECISION_PREFIX}:{fingerprint}")
}

pub fn idempotency_key(user_id: Uuid, key: &str) -> String {
    format!("{IDEMPOTENCY_PREFIX}:{user_id}:{}", urlencoding::encode(key))
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

async fn connect(client: &redis::Client) -> Result<MultiplexedConnection, StoreError> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Fingerprint-keyed decisions stored as JSON with a native Redis expiry.
#[derive(Clone)]
pub struct RedisDecisionCache {
    client: redis::Client,
}

impl RedisDecisionCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self, StoreError> {
        redis::Client::open(url).map(Self::new).map_err(backend)
    }
}

#[async_trait]
impl DecisionCache for RedisDecisionCache {
    async fn get_cached_decision(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedDecision>, StoreError> {
        let mut conn = connect(&self.client).await?;
        let raw: Option<String> = conn.get(decision_key(fingerprint)).await.map_err(backend)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry: CachedDecision =
            serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok((!entry.is_expired(now)).then_some(entry))
    }

    async fn upsert_cached_decision(
        &self,
        fingerprint: &str,
        result: &ModerationResult,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let entry = CachedDecision {
            fingerprint: fingerprint.to_string(),
            result: result.clone(),
            inserted_at: now,
            expires_at: super::expiry(now, ttl),
        };
        let json =
            serde_json::to_string(&entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = connect(&self.client).await?;
        let _: () = conn
            .set_ex(decision_key(fingerprint), json, ttl_secs(ttl))
            .await
            .map_err(backend)?;
        Ok(())
    }
}

/// Idempotency records written with `SET NX EX`, so the first writer keeps the slot.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    client: redis::Client,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self, StoreError> {
        redis::Client::open(url).map(Self::new).map_err(backend)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get_idempotency_record(
        &self,
        user_id: Uuid,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut conn = connect(&self.client).await?;
        let raw: Option<String> = conn
            .get(idempotency_key(user_id, key))
            .await
            .map_err(backend)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: IdempotencyRecord =
            serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok((!record.is_expired(now)).then_some(record))
    }

    async fn save_idempotency_record(
        &self,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut stored = record.clone();
        stored.expires_at = super::expiry(record.created_at, ttl);
        let json =
            serde_json::to_string(&stored).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = connect(&self.client).await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(idempotency_key(record.user_id, &record.key))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }
}
