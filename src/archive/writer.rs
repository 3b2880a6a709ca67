//! Append-only archive writer
//!
//! Wraps a `tar::Builder` over a gzip stream. Not safe for concurrent use:
//! the save pipeline serializes access with a single lock whose critical
//! section spans deduplication, `write_dir` and the index append.

use crate::archive::index::Index;
use crate::archive::INDEX_FILE;
use crate::error::{Result, SaverError};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct ArchiveWriter {
    builder: tar::Builder<GzEncoder<File>>,
    path: PathBuf,
}

impl ArchiveWriter {
    /// Create the archive file. Fails without side effects beyond the
    /// (truncated) output file itself.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            SaverError::Archive(format!("failed to create archive {:?}: {}", path, e))
        })?;
        let encoder = GzEncoder::new(file, Compression::default());
        Ok(Self {
            builder: tar::Builder::new(encoder),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ingest a staging directory as the archive entry `name`.
    pub fn write_dir(&mut self, name: &str, dir: &Path) -> Result<()> {
        self.builder.append_dir_all(name, dir).map_err(|e| {
            SaverError::Archive(format!(
                "failed to write {:?} into archive {:?}: {}",
                dir, self.path, e
            ))
        })
    }

    /// Store the index catalog as the trailing `index.json` entry.
    pub fn write_index(&mut self, index: &Index) -> Result<()> {
        let data = index.marshal()?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        self.builder
            .append_data(&mut header, INDEX_FILE, data.as_slice())
            .map_err(|e| {
                SaverError::Archive(format!(
                    "failed to write index into archive {:?}: {}",
                    self.path, e
                ))
            })
    }

    /// Write the tar terminator and flush the gzip stream.
    pub fn finish(self) -> Result<()> {
        let path = self.path;
        let encoder = self
            .builder
            .into_inner()
            .map_err(|e| SaverError::Archive(format!("failed to finish archive {:?}: {}", path, e)))?;
        encoder
            .finish()
            .map_err(|e| SaverError::Archive(format!("failed to flush archive {:?}: {}", path, e)))?;
        Ok(())
    }
}
