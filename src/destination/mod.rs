//! Per-job staging destination
//!
//! Each save job owns one staging directory under the cache root. The copy
//! engine fills it with an OCI layout whose blobs live in a nested
//! shared-blob directory; the archive writer ingests the whole tree under a
//! name derived from the image reference.
//!
//! Layout:
//!
//! ```text
//! <staging>/
//!   oci-layout
//!   index.json                      # descriptors of the copied manifests
//!   <manifest-encoded>              # top-level manifest copy
//!   <shared-blob-dir>/<algo>/<enc>  # layers, configs, manifests
//! ```

use crate::error::{Result, SaverError};
use crate::image::ImageDigest;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Descriptor of a manifest recorded in the staging layout's `index.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: ImageDigest,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct LayoutIndex<'a> {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    manifests: &'a [ManifestDescriptor],
}

#[derive(Debug, Clone)]
pub struct Destination {
    directory: PathBuf,
    shared_blob_dir: String,
    /// Full image reference, used for log lines and the archive entry name
    reference: String,
}

impl Destination {
    pub fn new(directory: PathBuf, shared_blob_dir: String, reference: String) -> Self {
        Self {
            directory,
            shared_blob_dir,
            reference,
        }
    }

    /// Prepare the staging layout skeleton.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.directory.join(&self.shared_blob_dir))
            .await
            .map_err(|e| SaverError::Cache {
                message: format!("failed to create shared blob dir: {}", e),
                path: Some(self.directory.clone()),
            })?;
        let marker = serde_json::to_vec(&LayoutMarker {
            image_layout_version: "1.0.0",
        })?;
        tokio::fs::write(self.directory.join("oci-layout"), marker)
            .await
            .map_err(|e| SaverError::Cache {
                message: format!("failed to write oci-layout: {}", e),
                path: Some(self.directory.clone()),
            })?;
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn shared_blob_dir(&self) -> &str {
        &self.shared_blob_dir
    }

    pub fn reference_name(&self) -> &str {
        &self.reference
    }

    /// Name of this image's tree inside the archive.
    pub fn archive_entry_name(&self) -> String {
        sanitize_reference(&self.reference)
    }

    /// Path of a blob inside the shared-blob directory.
    pub fn blob_path(&self, digest: &ImageDigest) -> PathBuf {
        self.directory
            .join(&self.shared_blob_dir)
            .join(digest.algorithm())
            .join(digest.encoded())
    }

    /// Path of the top-level manifest copy.
    pub fn manifest_copy_path(&self, digest: &ImageDigest) -> PathBuf {
        self.directory.join(digest.encoded())
    }

    /// Write a blob into the shared-blob directory. An existing file of the
    /// same size is left untouched.
    pub async fn write_blob(&self, digest: &ImageDigest, data: &[u8]) -> Result<PathBuf> {
        let path = self.blob_path(digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SaverError::Cache {
                    message: format!("failed to create blob dir: {}", e),
                    path: Some(parent.to_path_buf()),
                })?;
        }
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.len() == data.len() as u64 {
                return Ok(path);
            }
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| SaverError::Cache {
                message: format!("failed to write blob {}: {}", digest, e),
                path: Some(path.clone()),
            })?;
        Ok(path)
    }

    /// Write the manifest blob plus its top-level copy.
    pub async fn write_manifest(&self, digest: &ImageDigest, data: &[u8]) -> Result<()> {
        self.write_blob(digest, data).await?;
        tokio::fs::write(self.manifest_copy_path(digest), data)
            .await
            .map_err(|e| SaverError::Cache {
                message: format!("failed to write manifest copy {}: {}", digest, e),
                path: Some(self.directory.clone()),
            })?;
        Ok(())
    }

    /// Write the staging layout's `index.json` enumerating the copied
    /// manifests.
    pub async fn write_layout_index(&self, manifests: &[ManifestDescriptor]) -> Result<()> {
        let index = serde_json::to_vec_pretty(&LayoutIndex {
            schema_version: 2,
            manifests,
        })?;
        tokio::fs::write(self.directory.join("index.json"), index)
            .await
            .map_err(|e| SaverError::Cache {
                message: format!("failed to write layout index: {}", e),
                path: Some(self.directory.clone()),
            })?;
        Ok(())
    }
}

/// Flatten an image reference into a filesystem / tar-entry safe name.
pub fn sanitize_reference(reference: &str) -> String {
    reference
        .replace('/', "_")
        .replace(':', "_")
        .replace('@', "_")
}
