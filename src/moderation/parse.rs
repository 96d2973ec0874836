//! Turns the classifier's free-form JSON answer into a canonical [`ModerationResult`].
//!
//! Decoding is a fixed strategy chain: strict parse of the (fence-stripped) text,
//! then parse of the outermost `{ ... }` span, then failure. Text that contains no
//! JSON object is never accepted.

use crate::models::{Decision, ModerationResult, ResultSource, Severity, Violation};
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("classifier response was empty")]
    Empty,
    #[error("classifier response contained no JSON object")]
    NoJsonObject,
    #[error("classifier response was not valid moderation JSON: {0}")]
    Invalid(String),
}

static DECISION_SYNONYMS: Lazy<HashMap<&'static str, Decision>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for key in [
        "clean", "approve", "approved", "allow", "allowed", "ok", "pass", "passed", "safe",
        "compliant", "accept", "accepted",
    ] {
        map.insert(key, Decision::Clean);
    }
    for key in [
        "flagged", "flag", "reject", "rejected", "block", "blocked", "deny", "denied",
        "violation", "violating", "unsafe", "prohibited", "remove",
    ] {
        map.insert(key, Decision::Flagged);
    }
    for key in [
        "review_needed", "review", "needs_review", "manual_review", "human_review", "pending",
        "pending_review", "uncertain", "unsure", "escalate",
    ] {
        map.insert(key, Decision::ReviewNeeded);
    }
    map
});

static SEVERITY_SYNONYMS: Lazy<HashMap<&'static str, Severity>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for key in ["clean", "none", "safe", "no_risk"] {
        map.insert(key, Severity::Clean);
    }
    for key in ["medium", "moderate", "low", "minor", "warning"] {
        map.insert(key, Severity::Medium);
    }
    for key in ["high", "severe", "major", "serious"] {
        map.insert(key, Severity::High);
    }
    for key in ["critical", "extreme", "urgent", "egregious"] {
        map.insert(key, Severity::Critical);
    }
    map
});

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default, alias = "verdict")]
    decision: Option<String>,
    #[serde(default, alias = "risk_level")]
    severity: Option<String>,
    #[serde(default, alias = "flagProfile")]
    flag_profile: Option<Value>,
    #[serde(default)]
    violations: Option<Vec<RawViolationEntry>>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawViolationEntry {
    Detailed(RawViolation),
    Label(String),
}

#[derive(Debug, Deserialize)]
struct RawViolation {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Parses and normalizes a classifier answer. The returned result is tagged
/// `source = ai` with consistency rules applied; model and raw text are left empty.
pub fn parse_moderation_response(raw: &str) -> Result<ModerationResult, ParseError> {
    let decoded = decode(raw)?;

    let decision = decoded
        .decision
        .as_deref()
        .map(normalize_decision)
        .unwrap_or(Decision::Flagged);
    let severity = decoded
        .severity
        .as_deref()
        .map(normalize_severity)
        .unwrap_or(match decision {
            Decision::Clean => Severity::Clean,
            _ => Severity::Medium,
        });

    let violations = decoded
        .violations
        .unwrap_or_default()
        .into_iter()
        .map(violation_from_raw)
        .collect();

    let summary = decoded
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_summary(decision).to_string());

    let mut result = ModerationResult {
        decision,
        severity,
        flag_profile: decoded.flag_profile.as_ref().is_some_and(truthy),
        violations,
        summary,
        source: ResultSource::Ai,
        model: String::new(),
        raw_response: String::new(),
    };
    result.enforce_consistency();
    Ok(result)
}

/// Case-insensitive synonym lookup; anything unknown is treated as flagged.
pub fn normalize_decision(value: &str) -> Decision {
    DECISION_SYNONYMS
        .get(canonical_key(value).as_str())
        .copied()
        .unwrap_or(Decision::Flagged)
}

/// Case-insensitive synonym lookup; anything unknown is treated as medium.
pub fn normalize_severity(value: &str) -> Severity {
    SEVERITY_SYNONYMS
        .get(canonical_key(value).as_str())
        .copied()
        .unwrap_or(Severity::Medium)
}

fn canonical_key(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split(|ch: char| ch.is_whitespace() || ch == '-' || ch == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn decode(raw: &str) -> Result<RawDecision, ParseError> {
    let cleaned = strip_code_fence(raw);
    if cleaned.is_empty() {
        return Err(ParseError::Empty);
    }

    let strict_err = match serde_json::from_str::<RawDecision>(cleaned) {
        Ok(decoded) => return Ok(decoded),
        Err(err) => err,
    };

    let Some(object) = extract_json_object(cleaned) else {
        return Err(if cleaned.contains('{') {
            ParseError::Invalid(strict_err.to_string())
        } else {
            ParseError::NoJsonObject
        });
    };
    serde_json::from_str::<RawDecision>(object).map_err(|err| ParseError::Invalid(err.to_string()))
}

fn strip_code_fence(input: &str) -> &str {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) on the opening line.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    let body = match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim()
}

fn extract_json_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (start < end).then(|| &input[start..=end])
}

fn violation_from_raw(entry: RawViolationEntry) -> Violation {
    let raw = match entry {
        RawViolationEntry::Detailed(raw) => raw,
        RawViolationEntry::Label(label) => RawViolation {
            code: Some(label.clone()),
            category: None,
            severity: None,
            reason: Some(label),
        },
    };
    let clean = |value: Option<String>| value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let category = clean(raw.category).unwrap_or_else(|| "other".to_string());
    let code = clean(raw.code)
        .map(|code| canonical_key(&code))
        .unwrap_or_else(|| canonical_key(&category));
    Violation {
        code,
        category,
        // Clean marks "not stated"; enforce_consistency inherits the overall severity.
        severity: clean(raw.severity)
            .map(|s| normalize_severity(&s))
            .unwrap_or(Severity::Clean),
        reason: clean(raw.reason).unwrap_or_default(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => matches!(text.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(number) => number.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

fn default_summary(decision: Decision) -> &'static str {
    match decision {
        Decision::Clean => "No policy issues detected.",
        Decision::Flagged => "Listing flagged for policy review.",
        Decision::ReviewNeeded => "Listing requires manual review.",
    }
}
