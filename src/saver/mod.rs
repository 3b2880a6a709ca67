//! Save pipeline: dispatcher, workers, dedup ledger and validator
//!
//! `Saver::run` drives one save end-to-end: it creates the archive writer,
//! constructs one job per input line, pushes the jobs through the bounded
//! worker pool, and tears everything down after the pool drains. Workers own
//! their staging directory outright and only touch the archive through a
//! single critical section that spans deduplication, the archive write and
//! the index append. `Saver::validate` reopens an archive and checks every
//! listed image against its index.

use crate::archive::index::{ImageEntry, Index};
use crate::archive::{ArchiveReader, ArchiveWriter, SHARED_BLOB_DIR};
use crate::concurrency::WorkerPool;
use crate::destination::Destination;
use crate::error::collector::{ErrorCollector, ErrorSender};
use crate::error::{JobError, Result, SaverError};
use crate::image::digest::ImageDigest;
use crate::image::list::{self, ListFormat};
use crate::image::platform::Platform;
use crate::image::reference::ImageReference;
use crate::logging::Logger;
use crate::source::{AuthSpec, CopySource, RegistrySourceFactory, SourceFactory, SourceOption};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Options shared by the save and validate passes.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// Worker pool size
    pub workers: usize,
    /// Per-job deadline; `None` disables it
    pub timeout: Option<Duration>,
    /// Platform filter; empty saves every platform
    pub platforms: Vec<Platform>,
    pub insecure_skip_tls: bool,
    /// Root under which per-job staging directories are created
    pub cache_dir: PathBuf,
    pub auth: Option<AuthSpec>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            timeout: None,
            platforms: Vec::new(),
            insecure_skip_tls: false,
            cache_dir: std::env::temp_dir().join("image-saver-cache"),
            auth: None,
        }
    }
}

impl CommonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SaverError::Validation(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(SaverError::Validation(
                "cache_dir cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Save-specific options.
#[derive(Debug, Clone)]
pub struct SaverConfig {
    pub common: CommonConfig,
    /// Override the registry of every source image; empty keeps the parsed one
    pub source_registry: String,
    /// Override the project of every source image; empty keeps the parsed one
    pub source_project: String,
    /// Name of the shared-blob directory inside each staging tree
    pub shared_blob_dir: String,
    /// Output archive path
    pub archive_path: PathBuf,
}

impl SaverConfig {
    pub fn new(archive_path: PathBuf) -> Self {
        Self {
            common: CommonConfig::default(),
            source_registry: String::new(),
            source_project: String::new(),
            shared_blob_dir: SHARED_BLOB_DIR.to_string(),
            archive_path,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if self.shared_blob_dir.is_empty() {
            return Err(SaverError::Validation(
                "shared_blob_dir cannot be empty".to_string(),
            ));
        }
        if self.archive_path.as_os_str().is_empty() {
            return Err(SaverError::Validation(
                "archive_path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a worker mutates under the archive-writer lock. Keeping the
/// writer, the index and the committed-digest ledger in one mutex makes the
/// ledger-reflects-archive invariant hold by construction.
struct ArchiveState {
    writer: Option<ArchiveWriter>,
    index: Index,
    committed: HashSet<ImageDigest>,
}

struct SaveJob {
    id: usize,
    image: String,
    source: Box<dyn CopySource>,
    destination: Destination,
    timeout: Option<Duration>,
}

struct ValidateJob {
    id: usize,
    image: String,
    source: Box<dyn CopySource>,
    timeout: Option<Duration>,
}

#[derive(Clone)]
struct WorkerContext {
    state: Arc<Mutex<ArchiveState>>,
    logger: Logger,
    errors: ErrorSender,
    failed: Arc<StdMutex<BTreeSet<String>>>,
    platforms: Vec<Platform>,
    token: CancellationToken,
}

#[derive(Clone)]
struct ValidateContext {
    index: Arc<Index>,
    logger: Logger,
    errors: ErrorSender,
    failed: Arc<StdMutex<BTreeSet<String>>>,
    platforms: Vec<Platform>,
    token: CancellationToken,
}

pub struct Saver {
    config: SaverConfig,
    images: Vec<String>,
    logger: Logger,
    factory: Box<dyn SourceFactory>,
    failed: Arc<StdMutex<BTreeSet<String>>>,
}

impl Saver {
    pub fn new(config: SaverConfig, images: Vec<String>, logger: Logger) -> Result<Self> {
        Self::with_factory(config, images, logger, Box::new(RegistrySourceFactory))
    }

    /// Construct with an injected source factory. The test suite scripts the
    /// copy engine through this seam.
    pub fn with_factory(
        config: SaverConfig,
        images: Vec<String>,
        logger: Logger,
        factory: Box<dyn SourceFactory>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            images,
            logger,
            factory,
            failed: Arc::new(StdMutex::new(BTreeSet::new())),
        })
    }

    /// Save every listed image into the archive. Returns a terminal error
    /// when any image failed; the archive is still closed cleanly.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let writer = ArchiveWriter::create(&self.config.archive_path)?;
        let state = Arc::new(Mutex::new(ArchiveState {
            writer: Some(writer),
            index: Index::new(),
            committed: HashSet::new(),
        }));
        std::fs::create_dir_all(&self.config.common.cache_dir).map_err(|e| SaverError::Cache {
            message: format!("failed to create cache dir: {}", e),
            path: Some(self.config.common.cache_dir.clone()),
        })?;

        let collector = ErrorCollector::start(self.logger.clone());
        let mut pool = WorkerPool::new(self.config.common.workers, token.clone());

        for (i, image) in self.images.iter().enumerate() {
            let id = i + 1;
            let reference = match self.parse_line(image) {
                Ok(r) => r,
                Err(e) => {
                    collector.sender().report(JobError::new(id, None, None, e));
                    self.record_failed(image);
                    continue;
                }
            };
            let source = match self.factory.create(SourceOption {
                reference: reference.clone(),
                insecure_skip_tls: self.config.common.insecure_skip_tls,
                auth: self.config.common.auth.clone(),
            }) {
                Ok(s) => s,
                Err(e) => {
                    collector.sender().report(JobError::new(
                        id,
                        Some(reference.to_string()),
                        None,
                        SaverError::Registry(format!("failed to init source image: {}", e)),
                    ));
                    self.record_failed(image);
                    continue;
                }
            };
            let staging = match self.new_cache_dir() {
                Ok(d) => d,
                Err(e) => {
                    collector.sender().report(JobError::new(
                        id,
                        Some(reference.to_string()),
                        None,
                        e,
                    ));
                    self.record_failed(image);
                    continue;
                }
            };
            let destination = Destination::new(
                staging.clone(),
                self.config.shared_blob_dir.clone(),
                reference.to_string(),
            );
            let job = SaveJob {
                id,
                image: image.clone(),
                source,
                destination,
                timeout: self.config.common.timeout,
            };
            let ctx = WorkerContext {
                state: state.clone(),
                logger: self.logger.clone(),
                errors: collector.sender(),
                failed: self.failed.clone(),
                platforms: self.config.common.platforms.clone(),
                token: token.clone(),
            };
            if let Err(e) = pool.submit(save_worker(job, ctx)).await {
                // The job never reached a worker; its staging dir is ours to
                // remove.
                let _ = std::fs::remove_dir_all(&staging);
                collector.sender().report(JobError::new(
                    id,
                    Some(reference.to_string()),
                    None,
                    e.into(),
                ));
                self.record_failed(image);
            }
        }

        let panicked = pool.join().await;
        if panicked > 0 {
            self.logger
                .error(&format!("{} worker(s) exited abnormally", panicked));
        }

        // Teardown always runs; its errors are logged, never terminal.
        {
            let mut guard = state.lock().await;
            let state = &mut *guard;
            if let Some(mut writer) = state.writer.take() {
                if let Err(e) = writer.write_index(&state.index) {
                    self.logger.error(&format!("failed to write index file: {}", e));
                }
                if let Err(e) = writer.finish() {
                    self.logger
                        .error(&format!("failed to close archive writer: {}", e));
                }
            }
        }
        collector.close().await;
        self.report_failures("save")
    }

    /// Check every listed image against the archive's index.
    pub async fn validate(&self, token: CancellationToken) -> Result<()> {
        let reader = ArchiveReader::open(&self.config.archive_path)?;
        let data = reader.index()?;
        let index = Arc::new(Index::unmarshal(&data)?);

        let collector = ErrorCollector::start(self.logger.clone());
        let mut pool = WorkerPool::new(self.config.common.workers, token.clone());

        for (i, image) in self.images.iter().enumerate() {
            let id = i + 1;
            let reference = match self.parse_line(image) {
                Ok(r) => r,
                Err(e) => {
                    collector.sender().report(JobError::new(id, None, None, e));
                    self.record_failed(image);
                    continue;
                }
            };
            let source = match self.factory.create(SourceOption {
                reference: reference.clone(),
                insecure_skip_tls: self.config.common.insecure_skip_tls,
                auth: self.config.common.auth.clone(),
            }) {
                Ok(s) => s,
                Err(e) => {
                    collector.sender().report(JobError::new(
                        id,
                        Some(reference.to_string()),
                        None,
                        SaverError::Registry(format!("failed to init source image: {}", e)),
                    ));
                    self.record_failed(image);
                    continue;
                }
            };
            let job = ValidateJob {
                id,
                image: image.clone(),
                source,
                timeout: self.config.common.timeout,
            };
            let ctx = ValidateContext {
                index: index.clone(),
                logger: self.logger.clone(),
                errors: collector.sender(),
                failed: self.failed.clone(),
                platforms: self.config.common.platforms.clone(),
                token: token.clone(),
            };
            if let Err(e) = pool.submit(validate_worker(job, ctx)).await {
                collector.sender().report(JobError::new(
                    id,
                    Some(reference.to_string()),
                    None,
                    e.into(),
                ));
                self.record_failed(image);
            }
        }

        pool.join().await;
        collector.close().await;
        self.report_failures("validate")
    }

    /// Parse a default-format line, applying the run-wide registry and
    /// project overrides.
    fn parse_line(&self, line: &str) -> Result<ImageReference> {
        match list::detect(line) {
            ListFormat::Default => {}
            ListFormat::Mirror => {
                return Err(SaverError::ImageParsing(format!(
                    "mirror-format line is not supported by save: {:?}",
                    line
                )));
            }
            ListFormat::Unknown => {
                return Err(SaverError::ImageParsing(format!(
                    "unrecognized image list line: {:?}",
                    line
                )));
            }
        }
        let mut reference = ImageReference::parse(line)?;
        if !self.config.source_registry.is_empty() {
            reference.registry = self.config.source_registry.clone();
        }
        if !self.config.source_project.is_empty() {
            reference.project = self.config.source_project.clone();
        }
        Ok(reference)
    }

    fn new_cache_dir(&self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("save-")
            .tempdir_in(&self.config.common.cache_dir)
            .map_err(|e| SaverError::Cache {
                message: format!("failed to create cache dir: {}", e),
                path: Some(self.config.common.cache_dir.clone()),
            })?;
        let path = dir.keep();
        self.logger.debug(&format!("create save cache dir: {:?}", path));
        Ok(path)
    }

    fn record_failed(&self, image: &str) {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(image.to_string());
    }

    fn report_failures(&self, action: &str) -> Result<()> {
        let failed = self.failed.lock().unwrap_or_else(|e| e.into_inner());
        if failed.is_empty() {
            return Ok(());
        }
        self.logger.error("Failed image list:");
        for image in failed.iter() {
            println!("{}", image);
        }
        Err(SaverError::ImagesFailed(action.to_string()))
    }
}

enum SaveOutcome {
    Saved,
    Skipped,
}

async fn save_worker(mut job: SaveJob, ctx: WorkerContext) {
    let staging = job.destination.directory().to_path_buf();
    let result = run_save_job(&mut job, &ctx).await;
    if let Err(e) = result {
        ctx.errors.report(JobError::new(
            job.id,
            Some(job.source.reference()),
            Some(job.destination.reference_name().to_string()),
            e,
        ));
        ctx.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.image.clone());
    }
    // The staging dir goes away on every exit path.
    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        ctx.logger
            .error(&format!("failed to delete cache dir {:?}: {}", staging, e));
    }
}

async fn run_save_job(job: &mut SaveJob, ctx: &WorkerContext) -> Result<SaveOutcome> {
    let id = job.id;
    let copied = {
        let source = &mut job.source;
        let destination = &job.destination;
        let logger = &ctx.logger;
        let platforms = &ctx.platforms;
        run_bounded(&ctx.token, job.timeout, async move {
            source
                .init()
                .await
                .map_err(|e| SaverError::Registry(format!("failed to init source: {}", e)))?;
            logger.img(id).info(&format!("Saving [{}]", source.reference()));
            destination.init().await?;
            source.copy(destination, platforms).await
        })
        .await
    };
    let copied = match copied {
        Ok(copied) => copied,
        Err(SaverError::NoAvailableImage) => {
            ctx.logger.img(id).warning(&format!(
                "Skip save image [{}]: {}",
                job.source.reference(),
                SaverError::NoAvailableImage
            ));
            return Ok(SaveOutcome::Skipped);
        }
        Err(e) => return Err(e),
    };

    // Critical section: dedup decisions, duplicate pruning, archive write
    // and index append all happen under the one archive lock.
    let mut guard = ctx.state.lock().await;
    let state = &mut *guard;
    ctx.logger
        .img(id)
        .debug(&format!("Compressing [{}]", job.destination.reference_name()));

    let duplicates = duplicate_blob_paths(&mut state.committed, &copied, &job.destination);
    for path in &duplicates {
        if let Err(e) = std::fs::metadata(path) {
            ctx.logger.debug(&format!(
                "failed to clean duplicated file {:?}: stat: {}",
                path, e
            ));
        }
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                ctx.logger.warning(&format!(
                    "failed to clean duplicated file {:?}: {}",
                    path, e
                ));
            }
        }
    }

    let writer = state
        .writer
        .as_mut()
        .ok_or_else(|| SaverError::Archive("archive writer already closed".to_string()))?;
    writer
        .write_dir(&job.destination.archive_entry_name(), job.destination.directory())
        .map_err(|e| {
            SaverError::Archive(format!(
                "failed to write [{}] to archive: {}",
                job.destination.reference_name(),
                e
            ))
        })?;
    state.index.append(copied);
    Ok(SaveOutcome::Saved)
}

async fn validate_worker(mut job: ValidateJob, ctx: ValidateContext) {
    let id = job.id;
    let result = {
        let source = &mut job.source;
        let index = &ctx.index;
        let logger = &ctx.logger;
        let platforms = &ctx.platforms;
        run_bounded(&ctx.token, job.timeout, async move {
            source.init().await?;
            let query = source.image_query(platforms);
            if !index.has(&query) {
                logger.img(id).error(&format!(
                    "Image [{}] does not exist in archive index",
                    source.reference()
                ));
                return Err(SaverError::Validation(format!(
                    "FAILED: [{}]",
                    source.reference()
                )));
            }
            logger.info(&format!("PASS: [{}]", source.reference()));
            Ok(())
        })
        .await
    };
    if let Err(e) = result {
        ctx.errors
            .report(JobError::new(id, Some(job.source.reference()), None, e));
        ctx.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.image.clone());
    }
}

/// Apply the per-job deadline and run-token cancellation to a fallible step.
async fn run_bounded<T>(
    token: &CancellationToken,
    timeout: Option<Duration>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let bounded = async {
        match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(result) => result,
                Err(_) => Err(SaverError::Timeout(deadline.as_secs())),
            },
            None => work.await,
        }
    };
    tokio::select! {
        _ = token.cancelled() => Err(SaverError::Cancelled("run context cancelled".to_string())),
        result = bounded => result,
    }
}

/// Decide which staged files are duplicates of blobs already committed to
/// the archive. Digests absent from the ledger are inserted and their files
/// kept; digests already present map to deletions. Order within one image:
/// layers, then manifest (both its shared blob and its top-level copy), then
/// config, per platform entry. Must be called with the archive lock held.
fn duplicate_blob_paths(
    committed: &mut HashSet<ImageDigest>,
    entry: &ImageEntry,
    destination: &Destination,
) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for image in &entry.images {
        for layer in &image.layers {
            if !committed.insert(layer.clone()) {
                files.push(destination.blob_path(layer));
            }
        }
        if !committed.insert(image.digest.clone()) {
            files.push(destination.blob_path(&image.digest));
            files.push(destination.manifest_copy_path(&image.digest));
        }
        if let Some(config) = &image.config {
            if !committed.insert(config.clone()) {
                files.push(destination.blob_path(config));
            }
        }
    }
    files
}

/// Load an image list file: one reference per line, blank and comment lines
/// skipped.
pub fn load_image_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SaverError::Io(format!("failed to read image list {:?}: {}", path, e)))?;
    Ok(content
        .lines()
        .filter(|line| !list::is_comment_or_blank(line))
        .map(|line| line.trim().to_string())
        .collect())
}
