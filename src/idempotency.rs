//! Replay protection for publish requests, keyed by `(user, Idempotency-Key)`.

use crate::models::IdempotencyRecord;
use crate::store::{IdempotencyStore, StoreError};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency key was already used for a different request")]
    Conflict,
    #[error("invalid idempotency key: {0}")]
    InvalidKey(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    Proceed,
    Replay { status: u16, body: String },
}

impl IdempotencyCheck {
    pub fn should_replay(&self) -> bool {
        matches!(self, IdempotencyCheck::Replay { .. })
    }
}

/// Trims the header value; blank keys mean "no idempotency requested".
pub fn normalize_key(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

fn validate_key(key: &str) -> Result<(), IdempotencyError> {
    if key.is_empty() {
        return Err(IdempotencyError::InvalidKey("empty"));
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(IdempotencyError::InvalidKey("too long"));
    }
    if key.chars().any(char::is_control) {
        return Err(IdempotencyError::InvalidKey("control characters"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn check(
        &self,
        user_id: Uuid,
        key: &str,
        request_fingerprint: &str,
    ) -> Result<IdempotencyCheck, IdempotencyError> {
        validate_key(key)?;
        let Some(record) = self
            .store
            .get_idempotency_record(user_id, key, Utc::now())
            .await?
        else {
            return Ok(IdempotencyCheck::Proceed);
        };
        if record.request_fingerprint != request_fingerprint {
            warn!(target = "moderation.idempotency", %user_id, "idempotency_key_conflict");
            return Err(IdempotencyError::Conflict);
        }
        info!(
            target = "moderation.idempotency",
            %user_id,
            status = record.response_status,
            "idempotent_replay"
        );
        Ok(IdempotencyCheck::Replay {
            status: record.response_status,
            body: record.response_body,
        })
    }

    /// Returns `false` when a concurrent request already stored its response.
    pub async fn store(
        &self,
        user_id: Uuid,
        key: &str,
        request_fingerprint: &str,
        status: u16,
        body: &str,
    ) -> Result<bool, IdempotencyError> {
        validate_key(key)?;
        let now = Utc::now();
        let record = IdempotencyRecord {
            user_id,
            key: key.to_string(),
            request_fingerprint: request_fingerprint.to_string(),
            response_status: status,
            response_body: body.to_string(),
            created_at: now,
            expires_at: crate::store::expiry(now, self.ttl),
        };
        Ok(self.store.save_idempotency_record(&record, self.ttl).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryIdempotencyStore;

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(
            Arc::new(MemoryIdempotencyStore::default()),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn keys_are_trimmed_and_blank_ones_ignored() {
        assert_eq!(normalize_key(Some("  abc ")), Some("abc".to_string()));
        assert_eq!(normalize_key(Some("   ")), None);
        assert_eq!(normalize_key(None), None);
    }

    #[tokio::test]
    async fn same_key_and_fingerprint_replays_stored_response() {
        let guard = guard();
        let user = Uuid::new_v4();
        assert_eq!(guard.check(user, "K", "F").await.unwrap(), IdempotencyCheck::Proceed);

        assert!(guard.store(user, "K", "F", 201, r#"{"id":1}"#).await.unwrap());
        let replay = guard.check(user, "K", "F").await.unwrap();
        assert_eq!(
            replay,
            IdempotencyCheck::Replay {
                status: 201,
                body: r#"{"id":1}"#.to_string()
            }
        );
        assert!(replay.should_replay());
    }

    #[tokio::test]
    async fn same_key_with_different_fingerprint_conflicts() {
        let guard = guard();
        let user = Uuid::new_v4();
        guard.store(user, "K", "F", 201, "{}").await.unwrap();

        let err = guard.check(user, "K", "F2").await.unwrap_err();
        assert!(matches!(err, IdempotencyError::Conflict));
    }

    #[tokio::test]
    async fn keys_are_scoped_per_user() {
        let guard = guard();
        guard.store(Uuid::new_v4(), "K", "F", 201, "{}").await.unwrap();
        assert_eq!(
            guard.check(Uuid::new_v4(), "K", "other").await.unwrap(),
            IdempotencyCheck::Proceed
        );
    }

    #[tokio::test]
    async fn first_stored_response_wins() {
        let guard = guard();
        let user = Uuid::new_v4();
        assert!(guard.store(user, "K", "F", 201, "first").await.unwrap());
        assert!(!guard.store(user, "K", "F", 202, "second").await.unwrap());
        match guard.check(user, "K", "F").await.unwrap() {
            IdempotencyCheck::Replay { status, body } => {
                assert_eq!((status, body.as_str()), (201, "first"));
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_keys_are_rejected() {
        let guard = guard();
        let user = Uuid::new_v4();
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            guard.check(user, &long, "F").await,
            Err(IdempotencyError::InvalidKey(_))
        ));
        assert!(matches!(
            guard.check(user, "a\nb", "F").await,
            Err(IdempotencyError::InvalidKey(_))
        ));
    }
}
