use super::parse::{ParseError, parse_moderation_response};
use super::prompt::build_prompt;
use crate::images::{FetchOptions, ImageFetcher, fetch_all};
use crate::llm::{Classifier, ClassifierRequest, LlmError};
use crate::models::{ModerationInput, ModerationResult, ResultSource};
use std::{collections::HashSet, sync::Arc, time::Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("classifier call failed: {0}")]
    Classifier(#[from] LlmError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("moderation cancelled")]
    Cancelled,
}

/// Hard failure of an AI moderation attempt. Always carries the safe
/// review-needed result the caller should apply instead.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ModerateError {
    #[source]
    pub error: AiError,
    pub fallback: ModerationResult,
}

pub struct AiModerationClient {
    classifier: Arc<dyn Classifier>,
    fetcher: Arc<dyn ImageFetcher>,
    max_images: usize,
    fetch: FetchOptions,
}

impl AiModerationClient {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        fetcher: Arc<dyn ImageFetcher>,
        max_images: usize,
        fetch: FetchOptions,
    ) -> Self {
        // At least one image is considered whenever refs are present.
        Self {
            classifier,
            fetcher,
            max_images: max_images.max(1),
            fetch,
        }
    }

    pub fn model(&self) -> &str {
        self.classifier.model()
    }

    pub async fn moderate(
        &self,
        cancel: &CancellationToken,
        input: &ModerationInput,
    ) -> Result<ModerationResult, ModerateError> {
        let started = Instant::now();
        let images = normalize_image_refs(&input.image_refs, self.max_images);
        let prompt = build_prompt(&input.title, &input.description, images.len());

        let fetched = fetch_all(cancel, self.fetcher.clone(), &images, &self.fetch).await;
        if cancel.is_cancelled() {
            return Err(self.fail(AiError::Cancelled));
        }

        let considered = images.len();
        let successful = fetched.iter().filter(|slot| slot.is_some()).count();
        crate::metrics::stage_elapsed("image_fetch", started.elapsed().as_millis());
        if !coverage_quorum_met(considered, successful) {
            info!(
                target = "moderation.ai",
                considered,
                successful,
                "image_coverage_gate_tripped"
            );
            return Ok(ModerationResult::fallback(
                ResultSource::ImageCoverageGate,
                self.model(),
            ));
        }

        let request = ClassifierRequest {
            prompt,
            images: fetched.into_iter().flatten().collect(),
        };
        let classify_started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AiError::Cancelled),
            result = self.classifier.classify(&request) => result.map_err(AiError::from),
        };
        crate::metrics::stage_elapsed("classifier", classify_started.elapsed().as_millis());
        let raw = outcome.map_err(|err| self.fail(err))?;

        let mut result = parse_moderation_response(&raw).map_err(|err| self.fail(err.into()))?;
        result.model = self.model().to_string();
        result.raw_response = raw;
        Ok(result)
    }

    fn fail(&self, error: AiError) -> ModerateError {
        warn!(target = "moderation.ai", error = %error, "ai_moderation_fallback");
        ModerateError {
            error,
            fallback: ModerationResult::fallback(ResultSource::FallbackError, self.model()),
        }
    }
}

/// A strict majority of the attempted images must have been retrieved.
/// Text-only submissions (nothing attempted) always pass.
pub fn coverage_quorum_met(considered: usize, successful: usize) -> bool {
    considered == 0 || successful * 2 > considered
}

/// Trims, drops blanks and duplicates (first occurrence wins), then caps the list.
pub fn normalize_image_refs(refs: &[String], max_images: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    refs.iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .filter(|value| seen.insert(value.to_string()))
        .take(max_images)
        .map(str::to_string)
        .collect()
}
