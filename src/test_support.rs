//! In-process fakes shared by the unit tests.

use crate::images::{FetchError, FetchOptions, FetchedImage, ImageFetcher};
use crate::llm::{Classifier, ClassifierRequest, LlmError};
use crate::models::Severity;
use crate::notify::{EmailSender, NotificationPayload, Notifier, NotifyError};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

pub fn image(mime_type: &str) -> FetchedImage {
    FetchedImage {
        bytes: vec![0xff, 0xd8, 0xff],
        mime_type: mime_type.to_string(),
    }
}

pub fn test_fetch_options() -> FetchOptions {
    FetchOptions {
        concurrency: 3,
        per_attempt_timeout: Duration::from_millis(200),
        max_bytes: 1024 * 1024,
        retry_backoff: Duration::ZERO,
    }
}

enum Behavior {
    Scripted(VecDeque<Result<FetchedImage, FetchError>>),
    Hang,
    Delayed(Duration, FetchedImage),
}

/// Per-URL scripted fetcher. Unknown URLs answer 404.
#[derive(Default)]
pub struct FakeFetcher {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: &str, outcomes: Vec<Result<FetchedImage, FetchError>>) {
        self.set(url, Behavior::Scripted(outcomes.into()));
    }

    pub fn hang(&self, url: &str) {
        self.set(url, Behavior::Hang);
    }

    pub fn delayed(&self, url: &str, delay: Duration, image: FetchedImage) {
        self.set(url, Behavior::Delayed(delay, image));
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn set(&self, url: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(url.to_string(), behavior);
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let (delay, outcome) = {
            let mut behaviors = self.behaviors.lock().unwrap();
            match behaviors.get_mut(url) {
                Some(Behavior::Scripted(queue)) => (
                    Duration::ZERO,
                    queue.pop_front().unwrap_or(Err(FetchError::Status(404))),
                ),
                Some(Behavior::Hang) => (Duration::from_secs(3600), Err(FetchError::Timeout)),
                Some(Behavior::Delayed(delay, image)) => (*delay, Ok(image.clone())),
                None => (Duration::ZERO, Err(FetchError::Status(404))),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

/// Classifier that replays a fixed answer and records every request.
pub struct ScriptedClassifier {
    answer: Result<String, LlmError>,
    requests: Mutex<Vec<ClassifierRequest>>,
}

impl ScriptedClassifier {
    pub fn answering(raw: &str) -> Self {
        Self {
            answer: Ok(raw.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: LlmError) -> Self {
        Self {
            answer: Err(error),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ClassifierRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn classify(&self, request: &ClassifierRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.answer.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    pub to: String,
    pub title: String,
    pub summary: String,
    pub severity: Severity,
}

#[derive(Default)]
pub struct RecordingMailer {
    pub fail: bool,
    sent: Mutex<Vec<SentEmail>>,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send_moderation_blocked_email(
        &self,
        to: &str,
        listing_title: &str,
        summary: &str,
        severity: Severity,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(SentEmail {
            to: to.to_string(),
            title: listing_title.to_string(),
            summary: summary.to_string(),
            severity,
        });
        if self.fail {
            return Err(NotifyError::Transport("smtp relay down".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub fail: bool,
    sent: Mutex<Vec<(Uuid, NotificationPayload, bool)>>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(Uuid, NotificationPayload, bool)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        user_id: Uuid,
        payload: &NotificationPayload,
        broadcast: bool,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((user_id, payload.clone(), broadcast));
        if self.fail {
            return Err(NotifyError::Transport("socket hub unavailable".into()));
        }
        Ok(())
    }
}
