//! Platform filter for multi-platform images

use crate::error::{Result, SaverError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One requested platform, parsed from `os/arch` or `os/arch/variant`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.trim().split('/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();
        let variant = parts.next().map(str::to_string);
        if os.is_empty() || arch.is_empty() || parts.next().is_some() {
            return Err(SaverError::Validation(format!(
                "invalid platform {:?}: expected os/arch or os/arch/variant",
                spec
            )));
        }
        Ok(Self {
            os: os.to_string(),
            arch: arch.to_string(),
            variant,
        })
    }

    pub fn parse_set(specs: &[String]) -> Result<Vec<Self>> {
        specs.iter().map(|s| Self::parse(s)).collect()
    }

    /// Match a manifest-list platform descriptor. A filter without a variant
    /// accepts any variant.
    pub fn matches(&self, os: &str, arch: &str, variant: Option<&str>) -> bool {
        if self.os != os || self.arch != arch {
            return false;
        }
        match &self.variant {
            Some(want) => variant == Some(want.as_str()),
            None => true,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.arch, variant),
            None => write!(f, "{}/{}", self.os, self.arch),
        }
    }
}

/// True when a descriptor platform passes the filter set. An empty set
/// accepts every platform.
pub fn set_matches(set: &[Platform], os: &str, arch: &str, variant: Option<&str>) -> bool {
    set.is_empty() || set.iter().any(|p| p.matches(os, arch, variant))
}
