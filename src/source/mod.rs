//! Copy engine: source handles that realize a remote image as files in a
//! staging destination
//!
//! [`CopySource`] is the seam between the save pipeline and the registry:
//! the pipeline constructs handles through a [`SourceFactory`], initializes
//! them (manifest fetch only), and drives `copy` to stream blobs into the
//! staging layout. [`RegistrySource`] is the production implementation over
//! `oci-client`; tests inject scripted sources through the same factory.

use crate::archive::index::{ImageEntry, ImageQuery, PlatformImage};
use crate::destination::{Destination, ManifestDescriptor};
use crate::error::{Result, SaverError};
use crate::image::digest::ImageDigest;
use crate::image::platform::{self, Platform};
use crate::image::reference::ImageReference;
use async_trait::async_trait;
use futures::future::try_join_all;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::{OciDescriptor, OciImageIndex, OciImageManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference, RegistryOperation};

const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// Registry credentials for the source registry.
#[derive(Debug, Clone)]
pub struct AuthSpec {
    pub username: String,
    pub password: String,
}

/// Everything needed to construct one source handle. No network happens at
/// construction time.
#[derive(Debug, Clone)]
pub struct SourceOption {
    pub reference: ImageReference,
    pub insecure_skip_tls: bool,
    pub auth: Option<AuthSpec>,
}

/// One resolvable source image.
#[async_trait]
pub trait CopySource: Send {
    /// Full reference for log lines, e.g. `docker.io/library/nginx:1.22`
    fn reference(&self) -> String;

    /// `registry/project/name` without tag
    fn source_name(&self) -> String;

    fn tag(&self) -> String;

    /// Resolve the image: fetch the top manifest (or manifest list). This is
    /// the only network step the validate pass performs.
    async fn init(&mut self) -> Result<()>;

    /// Stream manifests, config and layers into the staging destination and
    /// report the copied-image descriptor. Returns
    /// [`SaverError::NoAvailableImage`] when the manifest list has no entry
    /// matching the platform filter.
    async fn copy(&mut self, dest: &Destination, platforms: &[Platform]) -> Result<ImageEntry>;

    /// Index-membership query for the platforms under validation. Requires a
    /// prior successful `init`.
    fn image_query(&self, platforms: &[Platform]) -> ImageQuery;
}

/// Constructs source handles; the seam the tests script against.
pub trait SourceFactory: Send + Sync {
    fn create(&self, opt: SourceOption) -> Result<Box<dyn CopySource>>;
}

/// A platform manifest resolved from the top-level manifest or index.
#[derive(Debug, Clone)]
struct ResolvedManifest {
    os: String,
    arch: String,
    variant: Option<String>,
    digest: ImageDigest,
    media_type: String,
}

/// Production source over `oci-client`.
pub struct RegistrySource {
    opt: SourceOption,
    client: Client,
    oci_reference: Reference,
    /// Raw top-level manifest bytes, kept for the single-manifest copy path
    top_manifest: Option<(Vec<u8>, ImageDigest)>,
    /// Platform manifests advertised by the source
    resolved: Vec<ResolvedManifest>,
}

impl RegistrySource {
    pub fn new(opt: SourceOption) -> Self {
        let protocol = if opt.insecure_skip_tls {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            accept_invalid_certificates: opt.insecure_skip_tls,
            ..Default::default()
        });
        let oci_reference = match &opt.reference.digest {
            Some(digest) => Reference::with_digest(
                opt.reference.registry.clone(),
                opt.reference.repository(),
                digest.to_string(),
            ),
            None => Reference::with_tag(
                opt.reference.registry.clone(),
                opt.reference.repository(),
                opt.reference.tag.clone(),
            ),
        };
        Self {
            opt,
            client,
            oci_reference,
            top_manifest: None,
            resolved: Vec::new(),
        }
    }

    fn registry_auth(&self) -> RegistryAuth {
        match &self.opt.auth {
            Some(auth) => RegistryAuth::Basic(auth.username.clone(), auth.password.clone()),
            None => RegistryAuth::Anonymous,
        }
    }

    // A manifest with an unknown platform (single-manifest image, resolved
    // from its config only during copy) always passes the filter.
    fn selected<'a>(&'a self, platforms: &[Platform]) -> Vec<&'a ResolvedManifest> {
        self.resolved
            .iter()
            .filter(|m| {
                (m.os.is_empty() && m.arch.is_empty())
                    || platform::set_matches(platforms, &m.os, &m.arch, m.variant.as_deref())
            })
            .collect()
    }

    /// Pull one platform manifest, its config and its layers into the
    /// staging layout; returns the per-platform descriptor entry.
    async fn copy_platform_manifest(
        &self,
        dest: &Destination,
        manifest: &ResolvedManifest,
        raw: Vec<u8>,
    ) -> Result<PlatformImage> {
        manifest.digest.verify(&raw)?;
        let parsed: OciImageManifest = serde_json::from_slice(&raw).map_err(|e| {
            SaverError::ImageParsing(format!(
                "failed to parse manifest {}: {}",
                manifest.digest, e
            ))
        })?;

        // Config blob
        let config_digest = ImageDigest::parse(&parsed.config.digest)?;
        let config_data = self.pull_blob_bytes(&parsed.config).await?;
        config_digest.verify(&config_data)?;
        dest.write_blob(&config_digest, &config_data).await?;

        // Platform of a single-manifest image comes from its config.
        let (os, arch) = if manifest.os.is_empty() {
            parse_config_platform(&config_data)
        } else {
            (manifest.os.clone(), manifest.arch.clone())
        };

        // Layers, pulled concurrently
        let layer_futures: Vec<_> = parsed
            .layers
            .iter()
            .map(|layer| async move {
                let digest = ImageDigest::parse(&layer.digest)?;
                let data = self.pull_blob_bytes(layer).await?;
                digest.verify(&data)?;
                dest.write_blob(&digest, &data).await?;
                Ok::<ImageDigest, SaverError>(digest)
            })
            .collect();
        let layers = try_join_all(layer_futures).await?;

        dest.write_manifest(&manifest.digest, &raw).await?;

        Ok(PlatformImage {
            os,
            arch,
            variant: manifest.variant.clone(),
            digest: manifest.digest.clone(),
            config: Some(config_digest),
            layers,
        })
    }

    async fn pull_blob_bytes(&self, descriptor: &OciDescriptor) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.client
            .pull_blob(&self.oci_reference, descriptor, &mut data)
            .await
            .map_err(|e| {
                SaverError::Registry(format!(
                    "failed to pull blob {} from [{}]: {}",
                    descriptor.digest,
                    self.reference(),
                    e
                ))
            })?;
        Ok(data)
    }

    async fn pull_manifest_raw(&self, auth: &RegistryAuth, digest: &ImageDigest) -> Result<Vec<u8>> {
        let reference = Reference::with_digest(
            self.opt.reference.registry.clone(),
            self.opt.reference.repository(),
            digest.to_string(),
        );
        let (raw, _) = self
            .client
            .pull_manifest_raw(&reference, auth, ACCEPTED_MEDIA_TYPES)
            .await
            .map_err(|e| {
                SaverError::Registry(format!(
                    "failed to pull manifest {} from [{}]: {}",
                    digest,
                    self.reference(),
                    e
                ))
            })?;
        Ok(raw)
    }
}

#[async_trait]
impl CopySource for RegistrySource {
    fn reference(&self) -> String {
        self.opt.reference.to_string()
    }

    fn source_name(&self) -> String {
        self.opt.reference.full_name()
    }

    fn tag(&self) -> String {
        self.opt.reference.tag.clone()
    }

    async fn init(&mut self) -> Result<()> {
        let auth = self.registry_auth();
        self.client
            .auth(&self.oci_reference, &auth, RegistryOperation::Pull)
            .await
            .map_err(|e| {
                SaverError::Registry(format!("failed to auth against [{}]: {}", self.reference(), e))
            })?;
        let (raw, digest) = self
            .client
            .pull_manifest_raw(&self.oci_reference, &auth, ACCEPTED_MEDIA_TYPES)
            .await
            .map_err(|e| {
                SaverError::Registry(format!(
                    "failed to resolve manifest of [{}]: {}",
                    self.reference(),
                    e
                ))
            })?;
        let top_digest = ImageDigest::parse(&digest)?;

        let value: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| {
            SaverError::ImageParsing(format!("failed to parse manifest of [{}]: {}", self.reference(), e))
        })?;
        if value.get("manifests").is_some() {
            // Manifest list: record the advertised platform manifests; the
            // children are only fetched during copy.
            let index: OciImageIndex = serde_json::from_value(value)?;
            for entry in &index.manifests {
                let (os, arch, variant) = match &entry.platform {
                    Some(p) => (p.os.clone(), p.architecture.clone(), p.variant.clone()),
                    None => continue,
                };
                // Attestation pseudo-manifests advertise os/arch "unknown".
                if os == "unknown" || arch == "unknown" {
                    continue;
                }
                self.resolved.push(ResolvedManifest {
                    os,
                    arch,
                    variant,
                    digest: ImageDigest::parse(&entry.digest)?,
                    media_type: entry.media_type.clone(),
                });
            }
            self.top_manifest = None;
        } else {
            let media_type = value
                .get("mediaType")
                .and_then(|m| m.as_str())
                .unwrap_or("application/vnd.oci.image.manifest.v1+json")
                .to_string();
            self.resolved.push(ResolvedManifest {
                os: String::new(),
                arch: String::new(),
                variant: None,
                digest: top_digest.clone(),
                media_type,
            });
            self.top_manifest = Some((raw, top_digest));
        }
        Ok(())
    }

    async fn copy(&mut self, dest: &Destination, platforms: &[Platform]) -> Result<ImageEntry> {
        let auth = self.registry_auth();
        let selected: Vec<ResolvedManifest> =
            self.selected(platforms).into_iter().cloned().collect();
        if selected.is_empty() {
            return Err(SaverError::NoAvailableImage);
        }

        let mut images = Vec::with_capacity(selected.len());
        let mut descriptors = Vec::with_capacity(selected.len());
        for manifest in &selected {
            let raw = match &self.top_manifest {
                Some((raw, digest)) if digest == &manifest.digest => raw.clone(),
                _ => self.pull_manifest_raw(&auth, &manifest.digest).await?,
            };
            descriptors.push(ManifestDescriptor {
                media_type: manifest.media_type.clone(),
                digest: manifest.digest.clone(),
                size: raw.len() as u64,
            });
            images.push(self.copy_platform_manifest(dest, manifest, raw).await?);
        }
        dest.write_layout_index(&descriptors).await?;

        Ok(ImageEntry {
            source: self.source_name(),
            tag: self.tag(),
            path: dest.archive_entry_name(),
            images,
        })
    }

    fn image_query(&self, platforms: &[Platform]) -> ImageQuery {
        ImageQuery {
            source: self.source_name(),
            tag: self.tag(),
            digests: self
                .selected(platforms)
                .into_iter()
                .map(|m| m.digest.clone())
                .collect(),
        }
    }
}

/// Default factory constructing [`RegistrySource`] handles.
#[derive(Debug, Clone, Default)]
pub struct RegistrySourceFactory;

impl SourceFactory for RegistrySourceFactory {
    fn create(&self, opt: SourceOption) -> Result<Box<dyn CopySource>> {
        Ok(Box::new(RegistrySource::new(opt)))
    }
}

fn parse_config_platform(config: &[u8]) -> (String, String) {
    let parsed: serde_json::Value = match serde_json::from_slice(config) {
        Ok(v) => v,
        Err(_) => return (String::new(), String::new()),
    };
    let os = parsed
        .get("os")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let arch = parsed
        .get("architecture")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    (os, arch)
}
