//! Image reference parsing
//!
//! Splits a default-format list line into registry / project / name / tag
//! components. Missing components get the conventional defaults: `docker.io`,
//! `library`, `latest`. References may pin a digest with `@<algo>:<hex>`
//! instead of a tag.

use crate::error::{Result, SaverError};
use crate::image::digest::ImageDigest;
use std::fmt;

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_PROJECT: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub project: String,
    pub name: String,
    pub tag: String,
    /// Set when the reference pins a digest instead of a tag
    pub digest: Option<ImageDigest>,
}

impl ImageReference {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(SaverError::ImageParsing("empty image reference".to_string()));
        }
        if line.chars().any(char::is_whitespace) {
            return Err(SaverError::ImageParsing(format!(
                "image reference contains whitespace: {:?}",
                line
            )));
        }

        let (path, digest) = match line.split_once('@') {
            Some((path, digest)) => (path, Some(ImageDigest::parse(digest)?)),
            None => (line, None),
        };

        let mut segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(SaverError::ImageParsing(format!(
                "image reference has an empty path segment: {:?}",
                line
            )));
        }

        let registry = if segments.len() > 1 && is_registry_segment(segments[0]) {
            segments.remove(0).to_string()
        } else {
            DEFAULT_REGISTRY.to_string()
        };

        // Tag lives after the last ':' of the final segment; a ':' in the
        // first segment belongs to a registry port and was consumed above.
        let last = segments
            .pop()
            .ok_or_else(|| SaverError::ImageParsing(format!("no image name in {:?}", line)))?;
        let (name_last, tag) = match last.rsplit_once(':') {
            Some((name, tag)) if digest.is_none() => {
                if tag.is_empty() || name.is_empty() {
                    return Err(SaverError::ImageParsing(format!(
                        "malformed tag in image reference: {:?}",
                        line
                    )));
                }
                (name, tag.to_string())
            }
            Some(_) => {
                return Err(SaverError::ImageParsing(format!(
                    "image reference carries both a tag and a digest: {:?}",
                    line
                )));
            }
            None => (last, DEFAULT_TAG.to_string()),
        };

        let (project, name) = match segments.len() {
            0 => (DEFAULT_PROJECT.to_string(), name_last.to_string()),
            _ => {
                let project = segments.remove(0).to_string();
                let mut name_parts = segments;
                name_parts.push(name_last);
                (project, name_parts.join("/"))
            }
        };

        if name.is_empty() {
            return Err(SaverError::ImageParsing(format!(
                "no image name in {:?}",
                line
            )));
        }

        Ok(Self {
            registry,
            project,
            name,
            tag,
            digest,
        })
    }

    /// `registry/project/name` without tag or digest
    pub fn full_name(&self) -> String {
        format!("{}/{}/{}", self.registry, self.project, self.name)
    }

    /// `project/name`, the repository path a registry client expects
    pub fn repository(&self) -> String {
        format!("{}/{}", self.project, self.name)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}@{}", self.full_name(), digest),
            None => write!(f, "{}:{}", self.full_name(), self.tag),
        }
    }
}

// A first path segment is a registry when it looks like a host: it carries a
// dot, a port, or is the literal "localhost".
fn is_registry_segment(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}
