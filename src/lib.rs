//! Listing publish moderation: fingerprinting, image acquisition, AI classification,
//! decision caching, violation escalation and publish idempotency.

pub mod config;
pub mod fingerprint;
pub mod http;
pub mod idempotency;
pub mod images;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod moderation;
pub mod notify;
pub mod orchestrator;
pub mod publish;
pub mod store;

#[cfg(test)]
mod test_support;

pub use config::ModerationConfig;
pub use idempotency::{IdempotencyCheck, IdempotencyError, IdempotencyGuard};
pub use models::{Decision, ModerationExecution, ModerationResult, ResultSource, Severity};
pub use orchestrator::{ModerationDeps, ModerationError, ModerationService};
pub use publish::{PublishError, PublishRequest, PublishResponse, Publisher, Seller};

use tracing_subscriber::{EnvFilter, fmt};

/// Installs the fmt subscriber once; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_tracing_can_be_called_repeatedly() {
        super::init_tracing();
        super::init_tracing();
        tracing::info!(target = "moderation.test", "subscriber installed");
    }
}
