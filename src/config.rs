use crate::images::FetchOptions;
use eyre::{Result, WrapErr, eyre};
use std::{str::FromStr, time::Duration};

/// Runtime knobs for the moderation pipeline, loaded from the environment.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Images beyond this count are not sent to the classifier.
    pub max_images: usize,
    pub fetch: FetchOptions,
    pub cache_ttl: Duration,
    pub idempotency_ttl: Duration,
    /// Distinct flagged submissions after which a user is flagged.
    pub auto_flag_threshold: u32,
    pub redis_url: Option<String>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            max_images: 5,
            fetch: FetchOptions::default(),
            cache_ttl: Duration::from_secs(2 * 60 * 60),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            auto_flag_threshold: 3,
            redis_url: None,
        }
    }
}

impl ModerationConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source; `lookup` returns `None` for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &'static str| (key, lookup(key));

        let max_images: usize = parse_or(var("MODERATION_MAX_IMAGES"), defaults.max_images)?;
        if max_images == 0 {
            return Err(eyre!("MODERATION_MAX_IMAGES must be at least 1"));
        }
        let concurrency: usize =
            parse_or(var("MODERATION_IMAGE_CONCURRENCY"), defaults.fetch.concurrency)?;
        if concurrency == 0 {
            return Err(eyre!("MODERATION_IMAGE_CONCURRENCY must be at least 1"));
        }
        let threshold: u32 =
            parse_or(var("MODERATION_AUTO_FLAG_THRESHOLD"), defaults.auto_flag_threshold)?;
        if threshold == 0 {
            return Err(eyre!("MODERATION_AUTO_FLAG_THRESHOLD must be at least 1"));
        }

        Ok(Self {
            max_images,
            fetch: FetchOptions {
                concurrency,
                per_attempt_timeout: Duration::from_millis(parse_or(
                    var("MODERATION_IMAGE_TIMEOUT_MS"),
                    defaults.fetch.per_attempt_timeout.as_millis() as u64,
                )?),
                max_bytes: parse_or(var("MODERATION_IMAGE_MAX_BYTES"), defaults.fetch.max_bytes)?,
                retry_backoff: Duration::from_millis(parse_or(
                    var("MODERATION_IMAGE_RETRY_BACKOFF_MS"),
                    defaults.fetch.retry_backoff.as_millis() as u64,
                )?),
            },
            cache_ttl: Duration::from_secs(parse_or(
                var("MODERATION_CACHE_TTL_SECS"),
                defaults.cache_ttl.as_secs(),
            )?),
            idempotency_ttl: Duration::from_secs(parse_or(
                var("IDEMPOTENCY_TTL_SECS"),
                defaults.idempotency_ttl.as_secs(),
            )?),
            auto_flag_threshold: threshold,
            redis_url: lookup("REDIS_URL")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }
}

/// Blank or missing values fall back to `default`.
fn parse_or<T>((key, raw): (&str, Option<String>), default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .wrap_err_with(|| format!("{key} has an invalid value `{raw}`")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = ModerationConfig::default();
        assert_eq!(config.max_images, 5);
        assert_eq!(config.fetch.concurrency, 3);
        assert_eq!(config.fetch.per_attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.cache_ttl, Duration::from_secs(7200));
        assert_eq!(config.idempotency_ttl, Duration::from_secs(86400));
        assert_eq!(config.auto_flag_threshold, 3);
    }

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ModerationConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ModerationConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn parse_or_falls_back_and_reports_bad_values() {
        let value: u32 = parse_or(("UNSET", None), 7).unwrap();
        assert_eq!(value, 7);
        let blank: u32 = parse_or(("BLANK", Some("  ".into())), 7).unwrap();
        assert_eq!(blank, 7);

        let err = parse_or::<u32>(("MODERATION_MAX_IMAGES", Some("seven".into())), 7).unwrap_err();
        assert!(err.to_string().contains("MODERATION_MAX_IMAGES"));
    }

    #[test]
    fn empty_source_yields_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.max_images, 5);
        assert_eq!(config.auto_flag_threshold, 3);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_pairs(&[
            ("MODERATION_MAX_IMAGES", "8"),
            ("MODERATION_IMAGE_TIMEOUT_MS", "750"),
            ("IDEMPOTENCY_TTL_SECS", "60"),
            ("REDIS_URL", " redis://cache:6379 "),
        ])
        .unwrap();
        assert_eq!(config.max_images, 8);
        assert_eq!(config.fetch.per_attempt_timeout, Duration::from_millis(750));
        assert_eq!(config.idempotency_ttl, Duration::from_secs(60));
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn zero_limits_are_rejected() {
        for key in [
            "MODERATION_MAX_IMAGES",
            "MODERATION_IMAGE_CONCURRENCY",
            "MODERATION_AUTO_FLAG_THRESHOLD",
        ] {
            let err = from_pairs(&[(key, "0")]).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }
    }
}
