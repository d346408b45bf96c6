//! Token and offset identifiers.
//!
//! A token correlates every piece of work done for one client request. It is
//! opaque to the relay: the only rules are that it is non-empty and bounded in
//! length so it can be used safely as a store key and a frame header.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Opaque per-request correlation token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(String);

impl Token {
    /// Maximum accepted token length in bytes.
    pub const MAX_LEN: usize = 512;

    /// Validates and wraps a token string.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ValidationError::EmptyToken);
        }
        if value.len() > Self::MAX_LEN {
            return Err(ValidationError::FieldTooLong {
                field: "token".to_string(),
                max_length: Self::MAX_LEN,
            });
        }
        Ok(Self(value))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Token {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Token {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl Borrow<str> for Token {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position in a token's partition of the filtered-result feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(u64);

impl Offset {
    /// First position of every partition.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw offset.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw offset.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The offset immediately after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_rejects_empty() {
        assert!(matches!(Token::new(""), Err(ValidationError::EmptyToken)));
        assert!(matches!(Token::new("   "), Err(ValidationError::EmptyToken)));
    }

    #[test]
    fn test_token_rejects_oversized() {
        let long = "x".repeat(Token::MAX_LEN + 1);
        assert!(matches!(
            Token::new(long),
            Err(ValidationError::FieldTooLong { max_length, .. }) if max_length == Token::MAX_LEN
        ));
    }

    #[test]
    fn test_token_serde_validates() {
        let token: Token = serde_json::from_str("\"t1\"").unwrap();
        assert_eq!(token.as_str(), "t1");
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"t1\"");

        let bad: Result<Token, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_offset_next_saturates() {
        assert_eq!(Offset::new(4).next(), Offset::new(5));
        assert_eq!(Offset::new(u64::MAX).next(), Offset::new(u64::MAX));
    }
}
