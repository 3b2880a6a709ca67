//! Archive index: the catalog of successfully saved images

use crate::error::Result;
use crate::image::ImageDigest;
use serde::{Deserialize, Serialize};

/// Append-only catalog serialized into the archive as a sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    pub images: Vec<ImageEntry>,
}

/// Copied-image descriptor: one per archived image, reported by the copy
/// engine and recorded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    /// `registry/project/name`
    pub source: String,
    pub tag: String,
    /// Name of the staging tree inside the archive
    pub path: String,
    /// Per-platform variants that were copied
    pub images: Vec<PlatformImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformImage {
    pub os: String,
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Manifest digest of this variant
    pub digest: ImageDigest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageDigest>,
    pub layers: Vec<ImageDigest>,
}

/// Membership query resolved through the copy engine's manifest-only path.
#[derive(Debug, Clone)]
pub struct ImageQuery {
    pub source: String,
    pub tag: String,
    /// Manifest digests of the platforms requested for validation
    pub digests: Vec<ImageDigest>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: ImageEntry) {
        self.images.push(entry);
    }

    /// True when an entry matches the query's source and tag and carries
    /// every queried manifest digest. A query that resolved no platform
    /// digests cannot be attested and never matches.
    pub fn has(&self, query: &ImageQuery) -> bool {
        if query.digests.is_empty() {
            return false;
        }
        self.images.iter().any(|entry| {
            entry.source == query.source
                && entry.tag == query.tag
                && query
                    .digests
                    .iter()
                    .all(|d| entry.images.iter().any(|img| &img.digest == d))
        })
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
