use super::{
    AuditStore, DecisionCache, IdempotencyStore, ListingStore, StoreError, UserStore,
    ViolationStore, expiry,
};
use crate::models::{
    AuditEntry, CachedDecision, IdempotencyRecord, Listing, ListingStatus, ModerationResult,
    ModerationStatus, ViolationEvent, ViolationRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryDecisionCache {
    entries: Mutex<HashMap<String, CachedDecision>>,
}

impl MemoryDecisionCache {
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl DecisionCache for MemoryDecisionCache {
    async fn get_cached_decision(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedDecision>, StoreError> {
        let guard = self.entries.lock().await;
        Ok(guard
            .get(fingerprint)
            .filter(|entry| !entry.is_expired(now))
            .cloned())
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
            expires_at: expiry(now, ttl),
        };
        self.entries
            .lock()
            .await
            .insert(fingerprint.to_string(), entry);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<(Uuid, String), IdempotencyRecord>>,
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get_idempotency_record(
        &self,
        user_id: Uuid,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let guard = self.records.lock().await;
        Ok(guard
            .get(&(user_id, key.to_string()))
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn save_idempotency_record(
        &self,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut guard = self.records.lock().await;
        let slot = (record.user_id, record.key.clone());
        if guard
            .get(&slot)
            .is_some_and(|existing| !existing.is_expired(record.created_at))
        {
            return Ok(false);
        }
        let mut stored = record.clone();
        stored.expires_at = expiry(record.created_at, ttl);
        guard.insert(slot, stored);
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditLog {
    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryViolationLedger {
    events: Mutex<HashMap<(Uuid, String), ViolationEvent>>,
}

impl MemoryViolationLedger {
    pub async fn count_for(&self, user_id: Uuid) -> u32 {
        let guard = self.events.lock().await;
        guard.keys().filter(|(user, _)| *user == user_id).count() as u32
    }
}

#[async_trait]
impl ViolationStore for MemoryViolationLedger {
    async fn record_violation_if_new(
        &self,
        user_id: Uuid,
        listing_id: Option<Uuid>,
        fingerprint: &str,
        result: &ModerationResult,
        threshold: u32,
    ) -> Result<ViolationRecord, StoreError> {
        let mut guard = self.events.lock().await;
        let slot = (user_id, fingerprint.to_string());
        let inserted = if guard.contains_key(&slot) {
            false
        } else {
            guard.insert(
                slot,
                ViolationEvent {
                    user_id,
                    listing_id,
                    fingerprint: fingerprint.to_string(),
                    severity: result.severity,
                    summary: result.summary.clone(),
                    created_at: Utc::now(),
                },
            );
            true
        };
        let count = guard.keys().filter(|(user, _)| *user == user_id).count() as u32;
        Ok(ViolationRecord {
            inserted,
            count,
            threshold_reached: threshold > 0 && count >= threshold,
        })
    }
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    flagged: Mutex<HashSet<Uuid>>,
}

impl MemoryUserDirectory {
    pub async fn is_flagged(&self, user_id: Uuid) -> bool {
        self.flagged.lock().await.contains(&user_id)
    }
}

#[async_trait]
impl UserStore for MemoryUserDirectory {
    async fn set_flag_status(&self, user_id: Uuid, flagged: bool) -> Result<(), StoreError> {
        let mut guard = self.flagged.lock().await;
        if flagged {
            guard.insert(user_id);
        } else {
            guard.remove(&user_id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryListingRepository {
    listings: Mutex<HashMap<Uuid, Listing>>,
}

impl MemoryListingRepository {
    pub async fn insert(&self, listing: Listing) {
        self.listings.lock().await.insert(listing.id, listing);
    }

    pub async fn get(&self, listing_id: Uuid) -> Option<Listing> {
        self.listings.lock().await.get(&listing_id).cloned()
    }
}

#[async_trait]
impl ListingStore for MemoryListingRepository {
    async fn insert_listing(&self, listing: &Listing) -> Result<(), StoreError> {
        self.insert(listing.clone()).await;
        Ok(())
    }

    async fn update_moderation_outcome(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
        moderation_status: ModerationStatus,
        result: &ModerationResult,
        fingerprint: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut guard = self.listings.lock().await;
        let listing = guard
            .get_mut(&listing_id)
            .ok_or_else(|| StoreError::NotFound(format!("listing {listing_id}")))?;
        listing.status = status;
        listing.moderation_status = moderation_status;
        listing.moderation_severity = Some(result.severity);
        listing.moderation_summary = Some(result.summary.clone());
        listing.moderation_flag_profile = result.flag_profile;
        listing.moderation_fingerprint = Some(fingerprint.to_string());
        listing.moderation_checked_at = Some(checked_at);
        Ok(())
    }
}

/// Process-local set of every store, for tests and single-node deployments.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub cache: Arc<MemoryDecisionCache>,
    pub idempotency: Arc<MemoryIdempotencyStore>,
    pub audit: Arc<MemoryAuditLog>,
    pub violations: Arc<MemoryViolationLedger>,
    pub users: Arc<MemoryUserDirectory>,
    pub listings: Arc<MemoryListingRepository>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}
