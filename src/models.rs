use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// Summary shown to sellers whenever the pipeline falls back to manual review.
pub const NEUTRAL_REVIEW_SUMMARY: &str =
    "This listing could not be verified automatically and has been sent for manual review.";

/// Summary attached when too few listing images could be retrieved.
pub const IMAGE_COVERAGE_SUMMARY: &str =
    "Some listing images could not be verified automatically, so the listing has been sent for manual review.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationInput {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub image_refs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Clean,
    Flagged,
    ReviewNeeded,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Clean => "clean",
            Decision::Flagged => "flagged",
            Decision::ReviewNeeded => "review_needed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Clean,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Clean => "clean",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Provenance of a [`ModerationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Ai,
    Cache,
    FallbackError,
    ImageCoverageGate,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Ai => "ai",
            ResultSource::Cache => "cache",
            ResultSource::FallbackError => "fallback_error",
            ResultSource::ImageCoverageGate => "image_coverage_gate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub category: String,
    pub severity: Severity,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationResult {
    pub decision: Decision,
    pub severity: Severity,
    pub flag_profile: bool,
    #[serde(default)]
    pub violations: Vec<Violation>,
    pub summary: String,
    pub source: ResultSource,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub raw_response: String,
}

impl ModerationResult {
    /// Safe review-needed result used whenever automated moderation cannot be trusted.
    pub fn fallback(source: ResultSource, model: impl Into<String>) -> Self {
        let summary = match source {
            ResultSource::ImageCoverageGate => IMAGE_COVERAGE_SUMMARY,
            _ => NEUTRAL_REVIEW_SUMMARY,
        };
        Self {
            decision: Decision::ReviewNeeded,
            severity: Severity::High,
            flag_profile: false,
            violations: Vec::new(),
            summary: summary.to_string(),
            source,
            model: model.into(),
            raw_response: String::new(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.decision, Decision::Flagged | Decision::ReviewNeeded)
    }

    /// Restores the decision/severity invariants. Idempotent.
    pub fn enforce_consistency(&mut self) {
        match self.decision {
            Decision::Clean => {
                self.severity = Severity::Clean;
                self.violations.clear();
            }
            Decision::Flagged if self.severity == Severity::Clean => {
                self.severity = Severity::Medium;
            }
            _ => {}
        }
        for violation in &mut self.violations {
            if violation.severity == Severity::Clean {
                violation.severity = self.severity;
            }
        }
        if self.severity == Severity::Critical {
            self.flag_profile = true;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Draft,
    PendingReview,
    Active,
    Rejected,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Draft => "draft",
            ListingStatus::PendingReview => "pending_review",
            ListingStatus::Active => "active",
            ListingStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    #[default]
    Pending,
    Clean,
    Flagged,
    Error,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: ListingStatus,
    pub moderation_status: ModerationStatus,
    pub moderation_severity: Option<Severity>,
    pub moderation_summary: Option<String>,
    #[serde(default)]
    pub moderation_flag_profile: bool,
    pub moderation_fingerprint: Option<String>,
    pub moderation_checked_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn draft(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDecision {
    pub fingerprint: String,
    pub result: ModerationResult,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedDecision {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub user_id: Uuid,
    pub key: String,
    pub request_fingerprint: String,
    pub response_status: u16,
    pub response_body: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub listing_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub fingerprint: String,
    pub result: ModerationResult,
    pub created_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub user_id: Uuid,
    pub listing_id: Option<Uuid>,
    pub fingerprint: String,
    pub severity: Severity,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// Returned by a violation store after an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    pub inserted: bool,
    pub count: u32,
    pub threshold_reached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    Threshold,
    Severity,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ModerationExecution {
    pub result: ModerationResult,
    pub fingerprint: String,
    pub listing_status: ListingStatus,
    pub moderation_status: ModerationStatus,
    pub cache_hit: bool,
    pub violation: Option<ViolationRecord>,
    pub user_flagged: bool,
    pub escalation: Option<EscalationTrigger>,
    pub ai_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flagged(severity: Severity) -> ModerationResult {
        ModerationResult {
            decision: Decision::Flagged,
            severity,
            flag_profile: false,
            violations: vec![Violation {
                code: "weapons".into(),
                category: "prohibited_item".into(),
                severity: Severity::Clean,
                reason: "replica firearm".into(),
            }],
            summary: "flagged".into(),
            source: ResultSource::Ai,
            model: "test".into(),
            raw_response: String::new(),
        }
    }

    #[test]
    fn clean_clears_severity_and_violations() {
        let mut result = flagged(Severity::High);
        result.decision = Decision::Clean;
        result.enforce_consistency();
        assert_eq!(result.severity, Severity::Clean);
        assert!(result.violations.is_empty());
        assert!(!result.is_blocking());
    }

    #[test]
    fn flagged_clean_is_upgraded_to_medium() {
        let mut result = flagged(Severity::Clean);
        result.enforce_consistency();
        assert_eq!(result.severity, Severity::Medium);
        assert_eq!(result.violations[0].severity, Severity::Medium);
        assert!(result.is_blocking());
    }

    #[test]
    fn critical_forces_flag_profile() {
        let mut result = flagged(Severity::Critical);
        result.enforce_consistency();
        assert!(result.flag_profile);
    }

    #[test]
    fn fallback_is_review_needed_high() {
        let result = ModerationResult::fallback(ResultSource::FallbackError, "");
        assert_eq!(result.decision, Decision::ReviewNeeded);
        assert_eq!(result.severity, Severity::High);
        assert!(result.is_blocking());
        let gate = ModerationResult::fallback(ResultSource::ImageCoverageGate, "");
        assert_eq!(gate.summary, IMAGE_COVERAGE_SUMMARY);
    }

    #[test]
    fn result_source_serializes_snake_case() {
        let json = serde_json::to_value(ResultSource::ImageCoverageGate).unwrap();
        assert_eq!(json, serde_json::json!("image_coverage_gate"));
    }
}
