//! # Request Validation Helpers
//!
//! Utilities for validating incoming request data using the `validator` crate.
//!
//! ## Overview
//!
//! This module provides:
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`validate_request`] | Validate a struct implementing `Validate` |
//! | [`parse_and_validate`] | Parse JSON and validate in one step |
//! | [`validators`] | Custom validation functions (redirect URIs, scopes) |
//!
//! ## How Validation Works
//!
//! We use the [`validator`](https://docs.rs/validator/) crate which provides
//! derive macros for declarative validation:
//!
//! ```rust,ignore
//! use validator::Validate;
//!
//! #[derive(Validate)]
//! struct CreateClient {
//!     #[validate(length(min = 1))]
//!     name: String,
//!
//!     #[validate(custom(function = "validators::valid_redirect_uri"))]
//!     redirect_uri: String,
//!
//!     #[validate(custom(function = "validators::not_blank"))]
//!     id: String,
//! }
//! ```
//!
//! ## Validation Flow
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌──────────────┐
//! │ JSON Request │────►│ Deserialize   │────►│   Validate   │
//! │              │     │ (serde)       │     │  (validator) │
//! └──────────────┘     └───────────────┘     └──────┬───────┘
//!                                                   │
//!         ┌─────────────────────────────────────────┴───────┐
//!         │                                                 │
//!         ▼                                                 ▼
//! ┌───────────────┐                               ┌─────────────────┐
//! │   Success     │                               │ ValidationError │
//! │ (continue)    │                               │   (400 + details)│
//! └───────────────┘                               └─────────────────┘
//! ```
//!
//! ## Custom Validators
//!
//! The [`validators`] module provides domain-specific validation functions
//! that complement the derive-based checks (spec §4.1, §4.6):
//!
//! | Validator | Purpose |
//! |-----------|---------|
//! | `not_blank` | String is not empty after trimming |
//! | `valid_redirect_uri` | Absolute URI, no fragment component (RFC 6749 §3.1.2) |
//! | `valid_scope_token` | A single scope value is a valid `scope-token` (RFC 6749 §3.3) |
//! | `valid_client_id` | Client identifier uses the allowed character set |

use serde::de::DeserializeOwned;
use validator::{Validate, ValidationErrors};

/// Error returned by [`parse_and_validate`] when the JSON body itself can't
/// be parsed, distinct from a structurally valid body that fails validation.
#[derive(Debug, thiserror::Error)]
pub enum ParseAndValidateError {
    #[error("malformed JSON body: {0}")]
    Malformed(String),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),
}

// =============================================================================
// Core Validation Functions
// =============================================================================

/// Validates a request DTO that implements `Validate`.
///
/// This is the primary validation function. Use it in handlers to
/// validate incoming data before it reaches the state machine.
///
/// ## Errors
///
/// Returns `ValidationErrors` with field-level details if validation fails.
pub fn validate_request<T: Validate>(data: &T) -> Result<(), ValidationErrors> {
    data.validate()
}

/// Parses JSON string and validates in a single step.
///
/// Useful when you have raw JSON and need to parse + validate.
///
/// ## Errors
///
/// - [`ParseAndValidateError::Malformed`] if JSON parsing fails
/// - [`ParseAndValidateError::Validation`] if validation fails
pub fn parse_and_validate<T: DeserializeOwned + Validate>(
    json: &str,
) -> Result<T, ParseAndValidateError> {
    let data: T =
        serde_json::from_str(json).map_err(|e| ParseAndValidateError::Malformed(e.to_string()))?;

    validate_request(&data)?;

    Ok(data)
}

// =============================================================================
// Custom Validators
// =============================================================================

/// Custom validation functions for use with `#[validate(custom)]`.
///
/// These functions follow the validator crate's signature:
/// `fn(&T) -> Result<(), ValidationError>`
pub mod validators {
    use validator::ValidationError;

    /// Validates that a string is not blank (empty or whitespace-only).
    pub fn not_blank(value: &str) -> Result<(), ValidationError> {
        if value.trim().is_empty() {
            return Err(ValidationError::new("blank"));
        }
        Ok(())
    }

    /// Validates a client redirect URI per RFC 6749 §3.1.2: absolute, and
    /// without a fragment component (a fragment would let the authorization
    /// response leak through the browser's `window.location.hash`).
    ///
    /// ## Valid Examples
    ///
    /// - `"https://app.example.com/callback"` ✓
    /// - `"com.example.app:/oauth2redirect"` ✓ (custom scheme, native apps)
    ///
    /// ## Invalid Examples
    ///
    /// - `"/callback"` ✗ (relative)
    /// - `"https://app.example.com/callback#token"` ✗ (has a fragment)
    pub fn valid_redirect_uri(value: &str) -> Result<(), ValidationError> {
        match url::Url::parse(value) {
            Ok(parsed) if parsed.fragment().is_some() => {
                Err(ValidationError::new("redirect_uri_has_fragment"))
            }
            Ok(_) => Ok(()),
            Err(_) => Err(ValidationError::new("redirect_uri_not_absolute")),
        }
    }

    /// Validates a single scope value against RFC 6749 §3.3's
    /// `scope-token` production: `%x21 / %x23-5B / %x5D-7E` (any printable
    /// ASCII character other than space and the double quote).
    ///
    /// ## Valid Examples
    ///
    /// - `"openid"` ✓
    /// - `"audience:server:client_id:partner-app"` ✓
    ///
    /// ## Invalid Examples
    ///
    /// - `""` ✗ (empty)
    /// - `"open id"` ✗ (contains a space)
    /// - `"open\"id"` ✗ (contains a quote)
    pub fn valid_scope_token(value: &str) -> Result<(), ValidationError> {
        if value.is_empty()
            || !value
                .bytes()
                .all(|b| (0x23..=0x5b).contains(&b) || (0x5d..=0x7e).contains(&b) || b == 0x21)
        {
            return Err(ValidationError::new("invalid_scope_token"));
        }
        Ok(())
    }

    /// Validates a client identifier's character set: lowercase ASCII
    /// letters, digits, and hyphens, matching the identifiers generated for
    /// dynamically registered clients and expected in static config.
    ///
    /// ## Valid Examples
    ///
    /// - `"example-app"` ✓
    /// - `"partner-client-01"` ✓
    ///
    /// ## Invalid Examples
    ///
    /// - `"Example-App"` ✗ (uppercase)
    /// - `"client id"` ✗ (space)
    pub fn valid_client_id(value: &str) -> Result<(), ValidationError> {
        if value.is_empty()
            || !value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(ValidationError::new("invalid_client_id"));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::validators::*;

    #[test]
    fn not_blank_accepts_non_empty() {
        assert!(not_blank("hello").is_ok());
        assert!(not_blank("  hello  ").is_ok());
    }

    #[test]
    fn not_blank_rejects_whitespace_only() {
        assert!(not_blank("").is_err());
        assert!(not_blank("   ").is_err());
        assert!(not_blank("\t\n").is_err());
    }

    #[test]
    fn valid_redirect_uri_accepts_absolute_uris() {
        assert!(valid_redirect_uri("https://app.example.com/callback").is_ok());
        assert!(valid_redirect_uri("com.example.app:/oauth2redirect").is_ok());
        assert!(valid_redirect_uri("http://127.0.0.1:5555/callback").is_ok());
    }

    #[test]
    fn valid_redirect_uri_rejects_relative_and_fragments() {
        assert!(valid_redirect_uri("/callback").is_err());
        assert!(valid_redirect_uri("https://app.example.com/callback#token").is_err());
    }

    #[test]
    fn valid_scope_token_accepts_oauth_scopes() {
        assert!(valid_scope_token("openid").is_ok());
        assert!(valid_scope_token("audience:server:client_id:partner-app").is_ok());
    }

    #[test]
    fn valid_scope_token_rejects_space_and_quote() {
        assert!(valid_scope_token("").is_err());
        assert!(valid_scope_token("open id").is_err());
        assert!(valid_scope_token("open\"id").is_err());
    }

    #[test]
    fn valid_client_id_accepts_lowercase_kebab() {
        assert!(valid_client_id("example-app").is_ok());
        assert!(valid_client_id("partner_client_01").is_ok());
    }

    #[test]
    fn valid_client_id_rejects_uppercase_and_space() {
        assert!(valid_client_id("Example-App").is_err());
        assert!(valid_client_id("client id").is_err());
    }
}
