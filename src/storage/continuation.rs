//! # Continuation Token Codec
//!
//! Opaque pagination cursor carrying the last-seen internal row id, encoded
//! as the ASCII string `"start:<id>"`. Tokens are only meaningful against the
//! same backend and sort order that produced them. The codec is pure: it
//! never consults storage.

use crate::errors::{KeepsakeError, Result};

/// Pagination cursor: resume scanning strictly after internal row id `id`.
/// An id of 0 means "start from the beginning".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContinuationToken {
    pub id: i64,
}

impl ContinuationToken {
    pub fn new(id: i64) -> Self {
        Self { id }
    }

    /// Encode as `"start:<id>"`.
    pub fn encode(&self) -> String {
        format!("start:{}", self.id)
    }

    /// Decode a token string. The empty string decodes to the zero token;
    /// anything else must have a first `/`-delimited segment of the form
    /// `start:<int64>`.
    pub fn decode(token: &str) -> Result<Self> {
        if token.is_empty() {
            return Ok(Self::default());
        }

        let first = token
            .split('/')
            .next()
            .ok_or_else(|| KeepsakeError::validation(format!("Invalid token: {}", token)))?;

        let (prefix, id) = first
            .split_once(':')
            .ok_or_else(|| KeepsakeError::validation(format!("Invalid token: {}", token)))?;

        if prefix != "start" {
            return Err(KeepsakeError::validation(format!("Invalid token: {}", token)));
        }

        let id = id
            .parse::<i64>()
            .map_err(|_| KeepsakeError::validation(format!("Invalid token: {}", token)))?;

        Ok(Self { id })
    }
}

impl std::fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}
