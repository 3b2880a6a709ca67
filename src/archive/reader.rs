//! Archive reader: index extraction for the validate pass

use crate::archive::INDEX_FILE;
use crate::error::{Result, SaverError};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

pub struct ArchiveReader {
    path: PathBuf,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SaverError::NotFound(format!("archive {:?}", path)));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Raw bytes of the archive's `index.json` entry. The index is appended
    /// last, so the final match wins if the entry was ever rewritten.
    pub fn index(&self) -> Result<Vec<u8>> {
        let mut found = None;
        self.scan(|path, entry| {
            if path == INDEX_FILE {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                found = Some(data);
            }
            Ok(())
        })?;
        found.ok_or_else(|| {
            SaverError::NotFound(format!("index entry {:?} in archive {:?}", INDEX_FILE, self.path))
        })
    }

    /// All entry paths, in archive order.
    pub fn entries(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.scan(|path, _| {
            names.push(path.to_string());
            Ok(())
        })?;
        Ok(names)
    }

    fn scan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, &mut tar::Entry<'_, GzDecoder<File>>) -> std::io::Result<()>,
    {
        let file = File::open(&self.path)
            .map_err(|e| SaverError::Archive(format!("failed to open archive {:?}: {}", self.path, e)))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let entries = archive.entries().map_err(|e| {
            SaverError::Archive(format!("failed to read archive {:?}: {}", self.path, e))
        })?;
        for entry in entries {
            let mut entry = entry.map_err(|e| {
                SaverError::Archive(format!("failed to read archive entry: {}", e))
            })?;
            let path = entry
                .path()
                .map_err(|e| SaverError::Archive(format!("failed to read entry path: {}", e)))?
                .to_string_lossy()
                .to_string();
            visit(&path, &mut entry).map_err(|e| {
                SaverError::Archive(format!("failed to read entry {:?}: {}", path, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_archive() {
        let workspace = tempfile::tempdir().unwrap();
        assert!(ArchiveReader::open(&workspace.path().join("nope.tar.gz")).is_err());
    }

    #[test]
    fn test_index_missing_from_archive() {
        let workspace = tempfile::tempdir().unwrap();
        let staging = workspace.path().join("tree");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("blob"), b"data").unwrap();

        let path = workspace.path().join("no-index.tar.gz");
        let mut writer = crate::archive::ArchiveWriter::create(&path).unwrap();
        writer.write_dir("tree", &staging).unwrap();
        writer.finish().unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        assert!(matches!(reader.index(), Err(SaverError::NotFound(_))));
        let entries: Vec<String> = reader
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();
        assert_eq!(entries, vec!["tree", "tree/blob"]);
    }
}
