// ============================
// crates/backend-lib/src/validation.rs
// ============================
//! Input validation for meeting codes, display names and chat lines.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

// Regex patterns for validation
static MEETING_CODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{6,10}$").expect("valid literal regex"));
static DISPLAY_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-\.\s]{2,50}$").expect("valid literal regex"));

/// Possible validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid meeting code: {0}")]
    InvalidMeetingCode(String),

    #[error("Invalid display name: {0}")]
    InvalidDisplayName(String),

    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Message too long ({0} characters)")]
    MessageTooLong(usize),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Normalize and validate a meeting code: trimmed, uppercased, 6-10
/// alphanumeric characters.
pub fn validate_meeting_code(code: &str) -> ValidationResult<String> {
    let normalized = code.trim().to_uppercase();
    if MEETING_CODE_REGEX.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(ValidationError::InvalidMeetingCode(code.to_string()))
    }
}

/// Normalize and validate a display name: trimmed, inner whitespace
/// collapsed, 2-50 characters from a safe alphabet.
pub fn validate_display_name(name: &str) -> ValidationResult<String> {
    let normalized = name.trim().split_whitespace().collect::<Vec<_>>().join(" ");
    if DISPLAY_NAME_REGEX.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(ValidationError::InvalidDisplayName(name.to_string()))
    }
}

/// Validate a chat line: non-empty after trimming, length bounded by
/// the configured maximum.
pub fn validate_chat_message(message: &str, max_length: usize) -> ValidationResult<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    if trimmed.chars().count() > max_length {
        return Err(ValidationError::MessageTooLong(trimmed.chars().count()));
    }
    Ok(trimmed.to_string())
}
