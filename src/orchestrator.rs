use crate::config::ModerationConfig;
use crate::fingerprint::fingerprint;
use crate::images::HttpImageFetcher;
use crate::llm::{GeminiClient, LlmConfig};
use crate::models::{
    AuditEntry, Decision, EscalationTrigger, Listing, ListingStatus, ModerationExecution,
    ModerationInput, ModerationResult, ModerationStatus, NEUTRAL_REVIEW_SUMMARY, ResultSource,
    Severity, ViolationRecord,
};
use crate::moderation::AiModerationClient;
use crate::notify::{EmailSender, HttpMailer, MailerConfig, NotificationPayload, Notifier};
use crate::store::redis::{RedisDecisionCache, RedisIdempotencyStore};
use crate::store::{
    AuditStore, DecisionCache, IdempotencyStore, ListingStore, MemoryBackend, StoreError,
    UserStore, ViolationStore,
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration, time::Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct ModerationError {
    stage: &'static str,
    message: String,
    kind: ModerationErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationErrorKind {
    Cancelled,
    Persistence,
}

impl ModerationError {
    pub fn cancelled(stage: &'static str) -> Self {
        Self {
            stage,
            message: "evaluation cancelled".to_string(),
            kind: ModerationErrorKind::Cancelled,
        }
    }

    pub fn persistence(stage: &'static str, err: StoreError) -> Self {
        Self {
            stage,
            message: err.to_string(),
            kind: ModerationErrorKind::Persistence,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> ModerationErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// Every collaborator the orchestrator talks to.
#[derive(Clone)]
pub struct ModerationDeps {
    pub cache: Arc<dyn DecisionCache>,
    pub audit: Arc<dyn AuditStore>,
    pub violations: Arc<dyn ViolationStore>,
    pub users: Arc<dyn UserStore>,
    pub listings: Arc<dyn ListingStore>,
    pub ai: Option<Arc<AiModerationClient>>,
    pub email: Option<Arc<dyn EmailSender>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl ModerationDeps {
    pub fn in_memory(backend: &MemoryBackend, ai: Option<Arc<AiModerationClient>>) -> Self {
        Self {
            cache: backend.cache.clone(),
            audit: backend.audit.clone(),
            violations: backend.violations.clone(),
            users: backend.users.clone(),
            listings: backend.listings.clone(),
            ai,
            email: None,
            notifier: None,
        }
    }

    /// Wires the environment-configured collaborators: Redis for the decision cache
    /// and idempotency records when `REDIS_URL` is set, Gemini when an API key is
    /// present, and the HTTP mailer when a mail API is configured. Everything else
    /// comes from `backend`.
    pub fn from_config(
        config: &ModerationConfig,
        backend: &MemoryBackend,
    ) -> Result<(Self, Arc<dyn IdempotencyStore>), StoreError> {
        let ai = LlmConfig::from_env().map(|llm| {
            let fetcher = Arc::new(HttpImageFetcher::new(config.fetch.max_bytes));
            Arc::new(AiModerationClient::new(
                Arc::new(GeminiClient::new(llm)),
                fetcher,
                config.max_images,
                config.fetch.clone(),
            ))
        });
        if ai.is_none() {
            warn!(
                target = "moderation.orchestrator",
                "GEMINI_API_KEY not set; every evaluation will fall back to manual review"
            );
        }

        let mut deps = Self::in_memory(backend, ai);
        deps.email = MailerConfig::from_env()
            .map(|mail| Arc::new(HttpMailer::new(mail)) as Arc<dyn EmailSender>);

        let idempotency: Arc<dyn IdempotencyStore> = match &config.redis_url {
            Some(url) => {
                deps.cache = Arc::new(RedisDecisionCache::open(url)?);
                Arc::new(RedisIdempotencyStore::open(url)?)
            }
            None => backend.idempotency.clone(),
        };
        Ok((deps, idempotency))
    }

    pub fn with_email(mut self, email: Arc<dyn EmailSender>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

pub struct ModerationService {
    deps: ModerationDeps,
    cache_ttl: Duration,
    auto_flag_threshold: u32,
}

/// Listing lifecycle transition for a decision. Rejection is never automatic.
pub fn transition(decision: Decision) -> (ListingStatus, ModerationStatus) {
    match decision {
        Decision::Clean => (ListingStatus::Active, ModerationStatus::Clean),
        Decision::Flagged => (ListingStatus::PendingReview, ModerationStatus::Flagged),
        Decision::ReviewNeeded => (ListingStatus::PendingReview, ModerationStatus::Error),
    }
}

fn escalation_for(result: &ModerationResult, record: &ViolationRecord) -> Option<EscalationTrigger> {
    if result.severity == Severity::Critical || result.flag_profile {
        Some(EscalationTrigger::Severity)
    } else if record.threshold_reached {
        Some(EscalationTrigger::Threshold)
    } else {
        None
    }
}

impl ModerationService {
    pub fn new(deps: ModerationDeps, config: &ModerationConfig) -> Self {
        Self {
            deps,
            cache_ttl: config.cache_ttl,
            auto_flag_threshold: config.auto_flag_threshold,
        }
    }

    /// Moderates `listing`, persists the outcome and stamps the listing in place.
    pub async fn evaluate(
        &self,
        cancel: &CancellationToken,
        listing: &mut Listing,
        user_id: Option<Uuid>,
        user_email: Option<&str>,
        image_refs: &[String],
    ) -> Result<ModerationExecution, ModerationError> {
        let started = Instant::now();
        let fingerprint = fingerprint(&listing.title, &listing.description, image_refs);

        let (mut result, cache_hit, ai_error) = match self.cached(&fingerprint).await {
            Some(result) => (result, true, None),
            None => {
                let (result, ai_error) = self.moderate(cancel, listing, image_refs).await;
                (result, false, ai_error)
            }
        };
        if cancel.is_cancelled() {
            return Err(ModerationError::cancelled("evaluate"));
        }
        result.enforce_consistency();

        let checked_at = Utc::now();
        self.deps
            .audit
            .insert_audit(&AuditEntry {
                id: Uuid::new_v4(),
                listing_id: Some(listing.id),
                user_id,
                fingerprint: fingerprint.clone(),
                result: result.clone(),
                created_at: checked_at,
            })
            .await
            .map_err(|err| ModerationError::persistence("audit", err))?;

        let (listing_status, moderation_status) = transition(result.decision);
        self.deps
            .listings
            .update_moderation_outcome(
                listing.id,
                listing_status,
                moderation_status,
                &result,
                &fingerprint,
                checked_at,
            )
            .await
            .map_err(|err| ModerationError::persistence("listing", err))?;
        stamp(listing, listing_status, moderation_status, &result, &fingerprint, checked_at);

        let mut violation = None;
        let mut escalation = None;
        if result.decision == Decision::Flagged
            && let Some(user_id) = user_id
        {
            let record = self
                .deps
                .violations
                .record_violation_if_new(
                    user_id,
                    Some(listing.id),
                    &fingerprint,
                    &result,
                    self.auto_flag_threshold,
                )
                .await
                .map_err(|err| ModerationError::persistence("violation", err))?;
            escalation = escalation_for(&result, &record);
            if let Some(trigger) = escalation {
                self.deps
                    .users
                    .set_flag_status(user_id, true)
                    .await
                    .map_err(|err| ModerationError::persistence("user_flag", err))?;
                warn!(
                    target = "moderation.orchestrator",
                    %user_id,
                    trigger = ?trigger,
                    violations = record.count,
                    "user_flagged"
                );
            }
            violation = Some(record);
        }

        if result.source == ResultSource::Ai
            && let Err(err) = self
                .deps
                .cache
                .upsert_cached_decision(&fingerprint, &result, self.cache_ttl)
                .await
        {
            warn!(target = "moderation.orchestrator", error = %err, "decision_cache_write_failed");
        }

        if result.decision == Decision::Flagged
            && let Some(user_id) = user_id
        {
            self.notify(user_id, user_email, listing, &result).await;
        }

        crate::metrics::decision(result.decision.as_str(), result.source.as_str());
        crate::metrics::stage_elapsed("evaluate", started.elapsed().as_millis());
        info!(
            target = "moderation.orchestrator",
            listing_id = %listing.id,
            decision = result.decision.as_str(),
            severity = result.severity.as_str(),
            source = result.source.as_str(),
            cache_hit,
            "listing_moderated"
        );

        Ok(ModerationExecution {
            result,
            fingerprint,
            listing_status,
            moderation_status,
            cache_hit,
            violation,
            user_flagged: escalation.is_some(),
            escalation,
            ai_error,
        })
    }

    async fn cached(&self, fingerprint: &str) -> Option<ModerationResult> {
        match self.deps.cache.get_cached_decision(fingerprint, Utc::now()).await {
            Ok(Some(entry)) => {
                debug!(target = "moderation.orchestrator", fingerprint, "decision_cache_hit");
                let mut result = entry.result;
                result.source = ResultSource::Cache;
                result.raw_response.clear();
                Some(result)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(target = "moderation.orchestrator", error = %err, "decision_cache_read_failed");
                None
            }
        }
    }

    async fn moderate(
        &self,
        cancel: &CancellationToken,
        listing: &Listing,
        image_refs: &[String],
    ) -> (ModerationResult, Option<String>) {
        let Some(ai) = &self.deps.ai else {
            return (
                ModerationResult::fallback(ResultSource::FallbackError, ""),
                Some("moderation client not configured".to_string()),
            );
        };
        let input = ModerationInput {
            title: listing.title.clone(),
            description: listing.description.clone(),
            image_refs: image_refs.to_vec(),
        };
        match ai.moderate(cancel, &input).await {
            Ok(result) => (result, None),
            Err(err) => (err.fallback, Some(err.error.to_string())),
        }
    }

    async fn notify(
        &self,
        user_id: Uuid,
        user_email: Option<&str>,
        listing: &Listing,
        result: &ModerationResult,
    ) {
        if let (Some(email), Some(to)) = (&self.deps.email, user_email.filter(|v| !v.is_empty()))
            && let Err(err) = email
                .send_moderation_blocked_email(
                    to,
                    &listing.title,
                    NEUTRAL_REVIEW_SUMMARY,
                    result.severity,
                )
                .await
        {
            warn!(target = "moderation.notify", %user_id, error = %err, "blocked_email_failed");
        }

        if let Some(notifier) = &self.deps.notifier {
            let payload = NotificationPayload::pending_review(listing.id, &listing.title, result);
            if let Err(err) = notifier.notify(user_id, &payload, false).await {
                warn!(target = "moderation.notify", %user_id, error = %err, "notification_failed");
            }
        }
    }
}

fn stamp(
    listing: &mut Listing,
    status: ListingStatus,
    moderation_status: ModerationStatus,
    result: &ModerationResult,
    fingerprint: &str,
    checked_at: DateTime<Utc>,
) {
    listing.status = status;
    listing.moderation_status = moderation_status;
    listing.moderation_severity = Some(result.severity);
    listing.moderation_summary = Some(result.summary.clone());
    listing.moderation_flag_profile = result.flag_profile;
    listing.moderation_fingerprint = Some(fingerprint.to_string());
    listing.moderation_checked_at = Some(checked_at);
}
