//! Container-image fleet saver
//!
//! Pulls each image of an input list from its source registry and packs the
//! resulting OCI content into a single gzip-compressed archive with a sidecar
//! index, deduplicating blobs shared across images. A validate pass reopens
//! an archive and checks every listed image against its index.

pub mod archive;
pub mod cli;
pub mod concurrency;
pub mod destination;
pub mod error;
pub mod image;
pub mod logging;
pub mod saver;
pub mod source;

pub use error::{Result, SaverError};
pub use logging::Logger;
pub use saver::{CommonConfig, Saver, SaverConfig};
