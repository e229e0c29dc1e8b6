//! Phone capture: normalization, verification and kiosk candidate polling.

pub mod poller;
pub mod verify;

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;

pub use poller::{CandidateSnapshot, HttpPhoneSource, PhonePoller, PhoneSource};
pub use verify::{HttpPhoneVerifier, PhoneVerifier};

static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s\-\.()]").unwrap());
static TEN_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{10}$").unwrap());

/// Normalize a Mexican phone number to its 10 national digits.
///
/// Separators and a leading `+52` country code are removed.
pub fn normalize_phone(raw: &str) -> Result<String, ValidationError> {
    let stripped = SEPARATORS.replace_all(raw.trim(), "");
    let national = stripped.strip_prefix("+52").unwrap_or(stripped.as_ref());

    if TEN_DIGITS.is_match(national) {
        Ok(national.to_string())
    } else {
        Err(ValidationError::InvalidPhone(raw.to_string()))
    }
}
