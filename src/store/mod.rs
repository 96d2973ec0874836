//! Persistence contracts consumed by the moderation pipeline.
//!
//! Backends only need keyed reads/writes; TTL expiry is checked against the
//! caller-supplied `now` so a store may keep stale rows around until it evicts them.

pub mod memory;
pub mod redis;

use crate::models::{
    AuditEntry, CachedDecision, IdempotencyRecord, Listing, ListingStatus, ModerationResult,
    ModerationStatus, ViolationRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryBackend;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend request failed: {0}")]
    Backend(String),
    #[error("invalid stored payload: {0}")]
    Serialization(String),
    #[error("{0} not found")]
    NotFound(String),
}

#[async_trait]
pub trait DecisionCache: Send + Sync {
    /// `None` on miss or when the entry has expired at `now`.
    async fn get_cached_decision(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedDecision>, StoreError>;

    /// Keyed overwrite; the last writer wins.
    async fn upsert_cached_decision(
        &self,
        fingerprint: &str,
        result: &ModerationResult,
        ttl: Duration,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get_idempotency_record(
        &self,
        user_id: Uuid,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Writes only when no live record exists; returns whether this call inserted.
    async fn save_idempotency_record(
        &self,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Idempotent on `(user_id, fingerprint)`.
    async fn record_violation_if_new(
        &self,
        user_id: Uuid,
        listing_id: Option<Uuid>,
        fingerprint: &str,
        result: &ModerationResult,
        threshold: u32,
    ) -> Result<ViolationRecord, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn set_flag_status(&self, user_id: Uuid, flagged: bool) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn insert_listing(&self, listing: &Listing) -> Result<(), StoreError>;

    async fn update_moderation_outcome(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
        moderation_status: ModerationStatus,
        result: &ModerationResult,
        fingerprint: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub(crate) fn expiry(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(365));
    from.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
