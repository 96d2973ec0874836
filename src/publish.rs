//! Publish flow: idempotency guard, draft creation, moderation, stored response.

use crate::fingerprint::fingerprint;
use crate::idempotency::{IdempotencyCheck, IdempotencyError, IdempotencyGuard, normalize_key};
use crate::models::{
    IMAGE_COVERAGE_SUMMARY, Listing, ListingStatus, ModerationStatus, NEUTRAL_REVIEW_SUMMARY,
    ResultSource,
};
use crate::config::ModerationConfig;
use crate::orchestrator::{ModerationDeps, ModerationErrorKind, ModerationService};
use crate::store::{ListingStore, MemoryBackend, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_IMAGE_REFS: usize = 24;

#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_refs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Seller {
    pub id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishBody {
    pub listing_id: Uuid,
    pub status: ListingStatus,
    pub moderation_status: ModerationStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResponse {
    pub status: u16,
    pub body: String,
    pub replayed: bool,
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PublishError {
    stage: &'static str,
    message: String,
    kind: PublishErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorKind {
    InvalidInput,
    Conflict,
    Internal,
}

impl PublishError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PublishErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PublishErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PublishErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    /// HTTP status a handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind {
            PublishErrorKind::InvalidInput => 400,
            PublishErrorKind::Conflict => 409,
            PublishErrorKind::Internal => 500,
        }
    }
}

impl From<IdempotencyError> for PublishError {
    fn from(err: IdempotencyError) -> Self {
        let kind = match err {
            IdempotencyError::Conflict => PublishErrorKind::Conflict,
            IdempotencyError::InvalidKey(_) => PublishErrorKind::InvalidInput,
            IdempotencyError::Store(_) => PublishErrorKind::Internal,
        };
        Self {
            stage: "idempotency",
            message: err.to_string(),
            kind,
        }
    }
}

pub fn validate(request: &PublishRequest) -> Result<(), PublishError> {
    if request.title.trim().is_empty() {
        return Err(PublishError::invalid_input("validate", "title is required"));
    }
    if request.image_refs.len() > MAX_IMAGE_REFS {
        return Err(PublishError::invalid_input("validate", "too_many_images"));
    }
    if let Some(bad) = request
        .image_refs
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .find(|r| !(r.starts_with("https://") || r.starts_with("http://")))
    {
        return Err(PublishError::invalid_input(
            "validate",
            format!("image reference `{bad}` is not an http(s) url"),
        ));
    }
    Ok(())
}

pub struct Publisher {
    moderation: Arc<ModerationService>,
    listings: Arc<dyn ListingStore>,
    guard: IdempotencyGuard,
}

impl Publisher {
    pub fn new(
        moderation: Arc<ModerationService>,
        listings: Arc<dyn ListingStore>,
        guard: IdempotencyGuard,
    ) -> Self {
        Self {
            moderation,
            listings,
            guard,
        }
    }

    /// Environment-wired publisher; stores not backed by Redis come from `backend`.
    pub fn from_config(config: &ModerationConfig, backend: &MemoryBackend) -> Result<Self, StoreError> {
        let (deps, idempotency) = ModerationDeps::from_config(config, backend)?;
        let listings = deps.listings.clone();
        let moderation = ModerationService::new(deps, config);
        Ok(Self::new(
            Arc::new(moderation),
            listings,
            IdempotencyGuard::new(idempotency, config.idempotency_ttl),
        ))
    }

    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        seller: &Seller,
        idempotency_key: Option<&str>,
        request: PublishRequest,
    ) -> Result<PublishResponse, PublishError> {
        validate(&request)?;
        let request_fingerprint =
            fingerprint(&request.title, &request.description, &request.image_refs);
        let key = normalize_key(idempotency_key);

        if let Some(key) = &key
            && let IdempotencyCheck::Replay { status, body } =
                self.guard.check(seller.id, key, &request_fingerprint).await?
        {
            return Ok(PublishResponse {
                status,
                body,
                replayed: true,
            });
        }

        let mut listing = Listing::draft(request.title.trim(), request.description.trim());
        self.listings
            .insert_listing(&listing)
            .await
            .map_err(|err| PublishError::internal("create_listing", err.to_string()))?;

        let execution = self
            .moderation
            .evaluate(
                cancel,
                &mut listing,
                Some(seller.id),
                seller.email.as_deref(),
                &request.image_refs,
            )
            .await
            .map_err(|err| match err.kind() {
                ModerationErrorKind::Cancelled => PublishError::internal("moderation", "cancelled"),
                ModerationErrorKind::Persistence => {
                    PublishError::internal("moderation", err.to_string())
                }
            })?;

        let message = match (execution.listing_status, execution.result.source) {
            (ListingStatus::Active, _) => "Listing published.",
            (_, ResultSource::ImageCoverageGate) => IMAGE_COVERAGE_SUMMARY,
            _ => NEUTRAL_REVIEW_SUMMARY,
        };
        let body = PublishBody {
            listing_id: listing.id,
            status: execution.listing_status,
            moderation_status: execution.moderation_status,
            message: message.to_string(),
        };
        let status = if execution.listing_status == ListingStatus::Active {
            201
        } else {
            202
        };
        let body = serde_json::to_string(&body)
            .map_err(|err| PublishError::internal("render", err.to_string()))?;

        if let Some(key) = &key {
            match self
                .guard
                .store(seller.id, key, &request_fingerprint, status, &body)
                .await
            {
                Ok(true) => {}
                Ok(false) => info!(
                    target = "moderation.idempotency",
                    user_id = %seller.id,
                    "idempotency_record_already_present"
                ),
                Err(err) => warn!(
                    target = "moderation.idempotency",
                    user_id = %seller.id,
                    error = %err,
                    "idempotency_store_failed"
                ),
            }
        }

        Ok(PublishResponse {
            status,
            body,
            replayed: false,
        })
    }
}
