//! Error types for save and validate operations

pub mod collector;

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SaverError>;

#[derive(Debug, Error)]
pub enum SaverError {
    /// Registry related errors (auth, manifest fetch, blob pulls)
    #[error("Registry error: {0}")]
    Registry(String),
    /// File IO errors
    #[error("IO error: {0}")]
    Io(String),
    /// Parse errors
    #[error("Parse error: {0}")]
    Parse(String),
    /// Image reference / list-format errors
    #[error("Image parsing error: {0}")]
    ImageParsing(String),
    /// Archive writer / reader errors
    #[error("Archive error: {0}")]
    Archive(String),
    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    /// Cache / staging directory errors
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        path: Option<PathBuf>,
    },
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// The source has no manifest matching the requested platform set.
    /// Treated as a recoverable skip, never as a job failure.
    #[error("no image available for the requested platforms")]
    NoAvailableImage,
    /// Per-job deadline elapsed
    #[error("operation timed out after {0}s")]
    Timeout(u64),
    /// Run context was cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Terminal error: one or more images failed the run
    #[error("some images failed to {0}")]
    ImagesFailed(String),
}

impl From<std::io::Error> for SaverError {
    fn from(err: std::io::Error) -> Self {
        SaverError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SaverError {
    fn from(err: serde_json::Error) -> Self {
        SaverError::Parse(err.to_string())
    }
}

impl From<oci_client::errors::OciDistributionError> for SaverError {
    fn from(err: oci_client::errors::OciDistributionError) -> Self {
        SaverError::Registry(err.to_string())
    }
}

impl From<crate::concurrency::ConcurrencyError> for SaverError {
    fn from(err: crate::concurrency::ConcurrencyError) -> Self {
        SaverError::Cancelled(format!("Concurrency error: {}", err))
    }
}

/// Per-job error envelope. Workers never log failures themselves; they wrap
/// the cause together with the job id and both handles and push the envelope
/// into the [`collector::ErrorCollector`].
#[derive(Debug)]
pub struct JobError {
    pub id: usize,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub cause: SaverError,
}

impl JobError {
    pub fn new(
        id: usize,
        source: Option<String>,
        destination: Option<String>,
        cause: SaverError,
    ) -> Self {
        Self {
            id,
            source,
            destination,
            cause,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IMG={} {}", self.id, self.cause)?;
        if let Some(source) = &self.source {
            write!(f, " [source: {}]", source)?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " [destination: {}]", destination)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}
