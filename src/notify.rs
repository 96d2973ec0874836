use crate::http::build_client;
use crate::models::{ModerationResult, Severity, Violation};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

pub const PENDING_REVIEW_KIND: &str = "listing_pending_review";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Transport(String),
    #[error("mail api returned HTTP {0}")]
    Status(u16),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Body text must stay neutral; `summary` is never a policy explanation.
    async fn send_moderation_blocked_email(
        &self,
        to: &str,
        listing_title: &str,
        summary: &str,
        severity: Severity,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

impl MailerConfig {
    /// `None` unless both the API URL and key are configured.
    pub fn from_env() -> Option<Self> {
        let api_url = non_empty_env("MODERATION_MAIL_API_URL")?;
        let api_key = non_empty_env("MODERATION_MAIL_API_KEY")?;
        let from = non_empty_env("MODERATION_MAIL_FROM")
            .unwrap_or_else(|| "no-reply@marketplace.local".to_string());
        Some(Self {
            api_url,
            api_key,
            from,
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Serialize)]
struct OutgoingMail<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    text: String,
}

/// Transactional mail over a JSON HTTP API with bearer auth.
pub struct HttpMailer {
    http: Client,
    config: MailerConfig,
}

impl HttpMailer {
    pub fn new(config: MailerConfig) -> Self {
        Self {
            http: build_client(Duration::from_secs(10)),
            config,
        }
    }
}

pub fn blocked_email_body(listing_title: &str, summary: &str) -> String {
    format!(
        "Hi,\n\nYour listing \"{listing_title}\" was not published yet.\n{summary}\n\nYou will hear from us once the review is complete."
    )
}

#[async_trait]
impl EmailSender for HttpMailer {
    async fn send_moderation_blocked_email(
        &self,
        to: &str,
        listing_title: &str,
        summary: &str,
        severity: Severity,
    ) -> Result<(), NotifyError> {
        let mail = OutgoingMail {
            from: &self.config.from,
            to,
            subject: format!("Your listing \"{listing_title}\" is pending review"),
            text: blocked_email_body(listing_title, summary),
        };
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&mail)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        debug!(
            target = "moderation.notify",
            severity = severity.as_str(),
            "blocked_email_sent"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationMetadata {
    pub severity: Severity,
    pub summary: String,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub kind: String,
    pub listing_id: Uuid,
    pub title: String,
    pub message: String,
    pub metadata: NotificationMetadata,
}

impl NotificationPayload {
    pub fn pending_review(listing_id: Uuid, listing_title: &str, result: &ModerationResult) -> Self {
        Self {
            kind: PENDING_REVIEW_KIND.to_string(),
            listing_id,
            title: "Listing pending review".to_string(),
            message: format!("\"{listing_title}\" is waiting for a manual review."),
            metadata: NotificationMetadata {
                severity: result.severity,
                summary: result.summary.clone(),
                violations: result.violations.clone(),
            },
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: Uuid,
        payload: &NotificationPayload,
        broadcast: bool,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub user_id: Uuid,
    pub broadcast: bool,
    pub payload: NotificationPayload,
}

/// In-process fan-out for socket hubs; each subscriber filters by `user_id`.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<NotificationEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(
        &self,
        user_id: Uuid,
        payload: &NotificationPayload,
        broadcast: bool,
    ) -> Result<(), NotifyError> {
        let event = NotificationEvent {
            user_id,
            broadcast,
            payload: payload.clone(),
        };
        // Nobody connected is not a delivery failure.
        if self.sender.send(event).is_err() {
            debug!(target = "moderation.notify", %user_id, "notification_without_subscribers");
        }
        Ok(())
    }
}
