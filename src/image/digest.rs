//! Content digest model and SHA256 utilities
//!
//! Digests carry an algorithm tag and an encoded hex value, rendered as
//! `<algorithm>:<encoded>`. Layer and config blobs pulled from a registry are
//! verified against their descriptor digest before they reach the staging
//! directory.

use crate::error::{Result, SaverError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Standard SHA256 digest of empty content
pub const EMPTY_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A content digest split into its algorithm tag and encoded hex value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageDigest {
    algorithm: String,
    encoded: String,
}

impl ImageDigest {
    /// Parse a `<algorithm>:<encoded>` digest string.
    pub fn parse(digest: &str) -> Result<Self> {
        let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
            SaverError::ImageParsing(format!("digest missing algorithm prefix: {}", digest))
        })?;
        if algorithm.is_empty() || !algorithm.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SaverError::ImageParsing(format!(
                "invalid digest algorithm: {}",
                digest
            )));
        }
        if algorithm == "sha256" && encoded.len() != 64 {
            return Err(SaverError::ImageParsing(format!(
                "invalid sha256 digest length: expected 64 hex characters, got {}",
                encoded.len()
            )));
        }
        if encoded.is_empty() || !encoded.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SaverError::ImageParsing(format!(
                "digest contains non-hex characters: {}",
                digest
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_lowercase(),
        })
    }

    /// Compute the sha256 digest of raw content.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            encoded: compute_sha256(data),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn is_empty_content(&self) -> bool {
        self.algorithm == "sha256" && self.encoded == EMPTY_SHA256
    }

    /// Truncated form for log lines
    pub fn short(&self) -> String {
        let full = self.to_string();
        if full.len() > 23 {
            format!("{}...", &full[..23])
        } else {
            full
        }
    }

    /// Verify raw content against this digest. Only sha256 content can be
    /// recomputed here; other algorithms fail validation.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if self.algorithm != "sha256" {
            return Err(SaverError::Validation(format!(
                "cannot verify content with unsupported digest algorithm {}",
                self.algorithm
            )));
        }
        let computed = compute_sha256(data);
        if computed != self.encoded {
            return Err(SaverError::Validation(format!(
                "data integrity check failed: expected {}, computed sha256:{}",
                self, computed
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl TryFrom<String> for ImageDigest {
    type Error = SaverError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ImageDigest> for String {
    fn from(digest: ImageDigest) -> Self {
        digest.to_string()
    }
}

/// Compute the SHA256 hex digest of byte data
pub fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Validate a bare SHA256 hex string (64 characters, all hex)
pub fn is_valid_sha256_hex(digest: &str) -> bool {
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}
