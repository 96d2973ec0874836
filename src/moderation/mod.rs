pub mod client;
pub mod parse;
pub mod prompt;

pub use client::{AiError, AiModerationClient, ModerateError, coverage_quorum_met};
pub use parse::{ParseError, parse_moderation_response};
