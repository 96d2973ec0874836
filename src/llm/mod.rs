pub mod gemini;

use crate::images::FetchedImage;
use async_trait::async_trait;
use thiserror::Error;

pub use gemini::{GeminiClient, LlmConfig};

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("missing api key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(String),
    #[error("classifier returned HTTP {status}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One multimodal moderation request: the prompt followed by the images in order.
#[derive(Debug, Clone)]
pub struct ClassifierRequest {
    pub prompt: String,
    pub images: Vec<FetchedImage>,
}

/// External model answering a [`ClassifierRequest`] with raw text (expected JSON).
#[async_trait]
pub trait Classifier: Send + Sync {
    fn model(&self) -> &str;

    async fn classify(&self, request: &ClassifierRequest) -> Result<String, LlmError>;
}
