use crate::http::build_client;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, header::CONTENT_TYPE};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Total attempts per image, including the first one.
pub const MAX_FETCH_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("attempt timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("unsupported content type `{0}`")]
    UnsupportedContentType(String),
    #[error("image exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("invalid image url: {0}")]
    InvalidUrl(String),
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Transport(_) => true,
            FetchError::Status(code) => *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub per_attempt_timeout: Duration,
    pub max_bytes: usize,
    /// Base pause between attempts; up to half of it again is added as jitter.
    pub retry_backoff: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            per_attempt_timeout: Duration::from_secs(5),
            max_bytes: 8 * 1024 * 1024,
            retry_backoff: Duration::from_millis(150),
        }
    }
}

/// Byte source for listing images.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError>;
}

pub struct HttpImageFetcher {
    http: Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(max_bytes: usize) -> Self {
        Self::with_client(build_client(Duration::from_secs(30)), max_bytes)
    }

    pub fn with_client(http: Client, max_bytes: usize) -> Self {
        Self { http, max_bytes }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
        let parsed =
            reqwest::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }

        let mut response = self.http.get(parsed).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if !mime_type.starts_with("image/") {
            return Err(FetchError::UnsupportedContentType(mime_type));
        }

        if let Some(length) = response.content_length()
            && length > self.max_bytes as u64
        {
            return Err(FetchError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedImage { bytes, mime_type })
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}

/// Fetches every url with bounded concurrency.
///
/// The output is aligned with `urls`: slot `i` holds the image for `urls[i]`, or
/// `None` when it could not be retrieved. Individual failures never abort the batch.
pub async fn fetch_all(
    cancel: &CancellationToken,
    fetcher: Arc<dyn ImageFetcher>,
    urls: &[String],
    options: &FetchOptions,
) -> Vec<Option<FetchedImage>> {
    let mut slots: Vec<Option<FetchedImage>> = vec![None; urls.len()];
    if urls.is_empty() {
        return slots;
    }

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for (index, url) in urls.iter().cloned().enumerate() {
        let semaphore = semaphore.clone();
        let fetcher = fetcher.clone();
        let cancel = cancel.clone();
        let options = options.clone();
        tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (index, Err(FetchError::Cancelled)),
                permit = semaphore.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return (index, Err(FetchError::Cancelled));
            };
            let outcome = fetch_with_retry(&cancel, fetcher.as_ref(), &url, &options).await;
            (index, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(image))) => slots[index] = Some(image),
            Ok((index, Err(err))) => {
                warn!(
                    target = "moderation.images",
                    index,
                    url = %urls[index],
                    error = %err,
                    "image_fetch_dropped"
                );
            }
            Err(err) => {
                warn!(target = "moderation.images", error = %err, "image_fetch_task_failed");
            }
        }
    }

    slots
}

/// Single-image fetch with per-attempt timeout and one retry on transient errors.
pub async fn fetch_with_retry(
    cancel: &CancellationToken,
    fetcher: &dyn ImageFetcher,
    url: &str,
    options: &FetchOptions,
) -> Result<FetchedImage, FetchError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            crate::metrics::image_fetch("cancelled", attempt - 1);
            return Err(FetchError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(options.per_attempt_timeout, fetcher.fetch(url)) => {
                result.unwrap_or(Err(FetchError::Timeout))
            }
        };

        match outcome {
            Ok(image) => {
                crate::metrics::image_fetch("ok", attempt);
                return Ok(image);
            }
            Err(err) if err.is_transient() && attempt < MAX_FETCH_ATTEMPTS => {
                debug!(
                    target = "moderation.images",
                    url = %url,
                    attempt,
                    error = %err,
                    "image_fetch_retry"
                );
                let delay = jittered(options.retry_backoff);
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            crate::metrics::image_fetch("cancelled", attempt);
                            return Err(FetchError::Cancelled);
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
            Err(err) => {
                let label = match &err {
                    FetchError::Cancelled => "cancelled",
                    err if err.is_transient() => "exhausted",
                    _ => "permanent",
                };
                crate::metrics::image_fetch(label, attempt);
                return Err(err);
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let jitter = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeFetcher, image};
    use tokio::time::Instant;

    fn options() -> FetchOptions {
        FetchOptions {
            concurrency: 3,
            per_attempt_timeout: Duration::from_millis(200),
            max_bytes: 1024,
            retry_backoff: Duration::ZERO,
        }
    }

    fn urls(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn classification_of_errors() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Transport("reset".into()).is_transient());
        assert!(FetchError::Status(429).is_transient());
        assert!(FetchError::Status(503).is_transient());
        assert!(!FetchError::Status(404).is_transient());
        assert!(!FetchError::Status(403).is_transient());
        assert!(!FetchError::UnsupportedContentType("text/html".into()).is_transient());
        assert!(!FetchError::TooLarge { limit: 1 }.is_transient());
        assert!(!FetchError::Cancelled.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_once() {
        let fetcher = FakeFetcher::new();
        fetcher.script("u", vec![Err(FetchError::Status(503)), Ok(image("image/png"))]);
        let cancel = CancellationToken::new();

        let out = fetch_with_retry(&cancel, &fetcher, "u", &options()).await;
        assert!(out.is_ok());
        assert_eq!(fetcher.calls("u"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let fetcher = FakeFetcher::new();
        fetcher.script("u", vec![Err(FetchError::Status(404)), Ok(image("image/png"))]);
        let cancel = CancellationToken::new();

        let out = fetch_with_retry(&cancel, &fetcher, "u", &options()).await;
        assert_eq!(out, Err(FetchError::Status(404)));
        assert_eq!(fetcher.calls("u"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_then_rate_limit_gives_up_after_two_attempts() {
        let fetcher = FakeFetcher::new();
        fetcher.script(
            "u",
            vec![Err(FetchError::Status(429)), Err(FetchError::Status(429))],
        );
        let cancel = CancellationToken::new();

        let out = fetch_with_retry(&cancel, &fetcher, "u", &options()).await;
        assert_eq!(out, Err(FetchError::Status(429)));
        assert_eq!(fetcher.calls("u"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_fetch_times_out_per_attempt() {
        let fetcher = FakeFetcher::new();
        fetcher.hang("u");
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let out = fetch_with_retry(&cancel, &fetcher, "u", &options()).await;
        assert_eq!(out, Err(FetchError::Timeout));
        assert_eq!(fetcher.calls("u"), 2);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips_remaining_attempts() {
        let fetcher = FakeFetcher::new();
        fetcher.hang("u");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let opts = FetchOptions {
            per_attempt_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(1),
            ..options()
        };
        let started = Instant::now();

        let out = fetch_with_retry(&cancel, &fetcher, "u", &opts).await;
        assert_eq!(out, Err(FetchError::Cancelled));
        assert_eq!(fetcher.calls("u"), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_token_makes_no_requests() {
        let fetcher = FakeFetcher::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = fetch_all(&cancel, Arc::new(fetcher), &urls(&["a", "b"]), &options()).await;
        assert_eq!(out, vec![None, None]);
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_input_order_under_concurrency() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.delayed("slow", Duration::from_millis(150), image("image/jpeg"));
        fetcher.delayed("fast", Duration::from_millis(10), image("image/png"));
        fetcher.delayed("medium", Duration::from_millis(80), image("image/webp"));
        let cancel = CancellationToken::new();

        let out = fetch_all(&cancel, fetcher, &urls(&["slow", "fast", "medium"]), &options()).await;
        let mimes: Vec<_> = out
            .iter()
            .map(|slot| slot.as_ref().map(|img| img.mime_type.as_str()))
            .collect();
        assert_eq!(mimes, vec![Some("image/jpeg"), Some("image/png"), Some("image/webp")]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_slots_stay_empty_without_shifting_others() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script("a", vec![Ok(image("image/png"))]);
        fetcher.script("b", vec![Err(FetchError::Status(404))]);
        fetcher.script("c", vec![Ok(image("image/gif"))]);
        let cancel = CancellationToken::new();

        let out = fetch_all(&cancel, fetcher, &urls(&["a", "b", "c"]), &options()).await;
        assert!(out[0].is_some());
        assert!(out[1].is_none());
        assert_eq!(out[2].as_ref().map(|i| i.mime_type.as_str()), Some("image/gif"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_by_semaphore() {
        let fetcher = Arc::new(FakeFetcher::new());
        for name in ["a", "b", "c", "d", "e"] {
            fetcher.delayed(name, Duration::from_millis(100), image("image/png"));
        }
        let cancel = CancellationToken::new();
        let opts = FetchOptions {
            concurrency: 2,
            ..options()
        };

        let out = fetch_all(&cancel, fetcher.clone(), &urls(&["a", "b", "c", "d", "e"]), &opts).await;
        assert!(out.iter().all(Option::is_some));
        assert_eq!(fetcher.max_in_flight(), 2);
    }
}
