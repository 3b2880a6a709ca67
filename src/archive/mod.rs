//! On-disk archive format
//!
//! A saved archive is a gzip-compressed tar containing one staging tree per
//! saved image plus a trailing `index.json` catalog. Blobs shared across
//! images live under each tree's nested shared-blob directory; duplicates are
//! elided before the tree reaches the writer.

pub mod index;
pub mod reader;
pub mod writer;

pub use index::{ImageEntry, ImageQuery, Index, PlatformImage};
pub use reader::ArchiveReader;
pub use writer::ArchiveWriter;

/// Canonical name of the shared-blob directory nested in every staging tree.
/// Part of the archive format: the load pipeline resolves blobs through it.
pub const SHARED_BLOB_DIR: &str = "share";

/// Name of the index entry appended after the last image.
pub const INDEX_FILE: &str = "index.json";
