//! End-to-end save pipeline tests driven by a scripted copy engine

use async_trait::async_trait;
use docker_image_saver::archive::{ArchiveReader, ImageEntry, ImageQuery, Index, PlatformImage};
use docker_image_saver::destination::Destination;
use docker_image_saver::error::{Result, SaverError};
use docker_image_saver::image::{ImageDigest, Platform};
use docker_image_saver::source::{CopySource, SourceFactory, SourceOption};
use docker_image_saver::{Logger, Saver, SaverConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn d(label: &str) -> ImageDigest {
    ImageDigest::sha256_of(label.as_bytes())
}

#[derive(Clone)]
struct FakeImage {
    manifest: ImageDigest,
    config: Option<ImageDigest>,
    layers: Vec<ImageDigest>,
}

impl FakeImage {
    fn new(manifest: &str, config: &str, layers: &[&str]) -> Self {
        Self {
            manifest: d(manifest),
            config: Some(d(config)),
            layers: layers.iter().map(|l| d(l)).collect(),
        }
    }
}

#[derive(Clone)]
enum Behavior {
    /// Successful copy producing these platform variants
    Copy(Vec<FakeImage>),
    FailInit(String),
    FailCopy(String),
    NoAvailable,
    /// Signal once copy starts, then block until the job is cancelled
    HangCopy(Arc<Notify>),
}

#[derive(Default)]
struct FakeFactory {
    behaviors: HashMap<String, Behavior>,
}

impl FakeFactory {
    fn with(mut self, name: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }
}

impl SourceFactory for FakeFactory {
    fn create(&self, opt: SourceOption) -> Result<Box<dyn CopySource>> {
        let behavior = self
            .behaviors
            .get(&opt.reference.name)
            .cloned()
            .unwrap_or_else(|| Behavior::FailInit("image not scripted".to_string()));
        Ok(Box::new(FakeSource { opt, behavior }))
    }
}

struct FakeSource {
    opt: SourceOption,
    behavior: Behavior,
}

impl FakeSource {
    fn images(&self) -> Vec<FakeImage> {
        match &self.behavior {
            Behavior::Copy(images) => images.clone(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl CopySource for FakeSource {
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
        match &self.behavior {
            Behavior::FailInit(msg) => Err(SaverError::Registry(msg.clone())),
            _ => Ok(()),
        }
    }

    async fn copy(&mut self, dest: &Destination, _platforms: &[Platform]) -> Result<ImageEntry> {
        match &self.behavior {
            Behavior::FailInit(msg) | Behavior::FailCopy(msg) => {
                Err(SaverError::Registry(msg.clone()))
            }
            Behavior::NoAvailable => Err(SaverError::NoAvailableImage),
            Behavior::HangCopy(started) => {
                started.notify_one();
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behavior::Copy(images) => {
                for image in images {
                    for layer in &image.layers {
                        dest.write_blob(layer, layer.encoded().as_bytes()).await?;
                    }
                    if let Some(config) = &image.config {
                        dest.write_blob(config, config.encoded().as_bytes()).await?;
                    }
                    dest.write_manifest(&image.manifest, image.manifest.encoded().as_bytes())
                        .await?;
                }
                Ok(ImageEntry {
                    source: self.source_name(),
                    tag: self.tag(),
                    path: dest.archive_entry_name(),
                    images: images
                        .iter()
                        .map(|image| PlatformImage {
                            os: "linux".to_string(),
                            arch: "amd64".to_string(),
                            variant: None,
                            digest: image.manifest.clone(),
                            config: image.config.clone(),
                            layers: image.layers.clone(),
                        })
                        .collect(),
                })
            }
        }
    }

    fn image_query(&self, _platforms: &[Platform]) -> ImageQuery {
        ImageQuery {
            source: self.source_name(),
            tag: self.tag(),
            digests: self.images().iter().map(|i| i.manifest.clone()).collect(),
        }
    }
}

struct TestRun {
    _workspace: tempfile::TempDir,
    archive: PathBuf,
    cache: PathBuf,
}

fn setup() -> TestRun {
    let workspace = tempfile::tempdir().unwrap();
    let archive = workspace.path().join("out.tar.gz");
    let cache = workspace.path().join("cache");
    TestRun {
        _workspace: workspace,
        archive,
        cache,
    }
}

fn saver(
    run: &TestRun,
    images: &[&str],
    factory: FakeFactory,
    workers: usize,
    timeout: Option<Duration>,
) -> Saver {
    let mut config = SaverConfig::new(run.archive.clone());
    config.common.workers = workers;
    config.common.cache_dir = run.cache.clone();
    config.common.timeout = timeout;
    Saver::with_factory(
        config,
        images.iter().map(|s| s.to_string()).collect(),
        Logger::new_quiet(),
        Box::new(factory),
    )
    .unwrap()
}

fn read_index(run: &TestRun) -> Index {
    let reader = ArchiveReader::open(&run.archive).unwrap();
    Index::unmarshal(&reader.index().unwrap()).unwrap()
}

/// Shared-blob file entries, as `(tree, encoded-digest)` pairs.
fn shared_blobs(run: &TestRun) -> Vec<(String, String)> {
    let reader = ArchiveReader::open(&run.archive).unwrap();
    reader
        .entries()
        .unwrap()
        .into_iter()
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.split('/').collect();
            match parts.as_slice() {
                [tree, "share", "sha256", encoded] if !encoded.is_empty() => {
                    Some((tree.to_string(), encoded.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

fn assert_no_staging_leak(run: &TestRun) {
    let leftovers: Vec<_> = match std::fs::read_dir(&run.cache) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    };
    assert!(leftovers.is_empty(), "staging dirs leaked: {:?}", leftovers);
}

#[tokio::test]
async fn test_happy_path_two_images_disjoint_layers() {
    let run = setup();
    let factory = FakeFactory::default()
        .with("a", Behavior::Copy(vec![FakeImage::new("Ma", "Ca", &["L1", "L2"])]))
        .with("b", Behavior::Copy(vec![FakeImage::new("Mb", "Cb", &["L3"])]));
    let saver = saver(&run, &["r.io/p/a:1", "r.io/p/b:1"], factory, 1, None);
    saver.run(CancellationToken::new()).await.unwrap();

    let index = read_index(&run);
    assert_eq!(index.images.len(), 2);
    assert_eq!(index.images[0].source, "r.io/p/a");
    assert_eq!(index.images[1].source, "r.io/p/b");

    let blobs = shared_blobs(&run);
    let expected: Vec<ImageDigest> = ["L1", "L2", "Ca", "Ma", "L3", "Cb", "Mb"]
        .iter()
        .map(|l| d(l))
        .collect();
    assert_eq!(blobs.len(), expected.len());
    for digest in &expected {
        let count = blobs.iter().filter(|(_, e)| e == digest.encoded()).count();
        assert_eq!(count, 1, "digest {} must appear exactly once", digest);
    }
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_dedup_across_identical_images() {
    let run = setup();
    let image = FakeImage::new("Ma", "Ca", &["L1", "L2"]);
    let factory = FakeFactory::default()
        .with("a", Behavior::Copy(vec![image.clone()]))
        .with("b", Behavior::Copy(vec![image]));
    let saver = saver(&run, &["r.io/p/a:1", "r.io/p/b:1"], factory, 1, None);
    saver.run(CancellationToken::new()).await.unwrap();

    let index = read_index(&run);
    assert_eq!(index.images.len(), 2);

    let blobs = shared_blobs(&run);
    // The second image contributes no shared-blob files at all.
    assert!(blobs.iter().all(|(tree, _)| tree == "r.io_p_a_1"));
    assert_eq!(blobs.len(), 4); // L1, L2, Ca, Ma under a's tree only

    // b's top-level manifest copy was pruned too.
    let reader = ArchiveReader::open(&run.archive).unwrap();
    let manifest_copy = format!("r.io_p_b_1/{}", d("Ma").encoded());
    assert!(!reader.entries().unwrap().contains(&manifest_copy));
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_unparseable_line_fails_only_that_image() {
    let run = setup();
    let factory = FakeFactory::default()
        .with("a", Behavior::Copy(vec![FakeImage::new("Ma", "Ca", &["L1"])]));
    let saver = saver(
        &run,
        &["r.io/p/bad@sha256:nothex", "r.io/p/a:1"],
        factory,
        1,
        None,
    );
    let err = saver.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SaverError::ImagesFailed(op) if op == "save"));

    // The archive still closed cleanly with the surviving image.
    let index = read_index(&run);
    assert_eq!(index.images.len(), 1);
    assert_eq!(index.images[0].source, "r.io/p/a");
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_source_init_failure_is_isolated() {
    let run = setup();
    let factory = FakeFactory::default()
        .with("bad", Behavior::FailInit("connection refused".to_string()))
        .with("a", Behavior::Copy(vec![FakeImage::new("Ma", "Ca", &["L1"])]));
    let saver = saver(&run, &["r.io/p/bad:1", "r.io/p/a:1"], factory, 2, None);
    let err = saver.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SaverError::ImagesFailed(_)));

    let index = read_index(&run);
    assert_eq!(index.images.len(), 1);
    assert_eq!(index.images[0].source, "r.io/p/a");
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_no_available_image_is_a_recoverable_skip() {
    let run = setup();
    let factory = FakeFactory::default().with("x", Behavior::NoAvailable);
    let saver = saver(&run, &["r.io/p/x:1"], factory, 1, None);
    saver.run(CancellationToken::new()).await.unwrap();

    let index = read_index(&run);
    assert!(index.images.is_empty());
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_empty_list_produces_empty_archive() {
    let run = setup();
    let saver = saver(&run, &[], FakeFactory::default(), 1, None);
    saver.run(CancellationToken::new()).await.unwrap();

    let index = read_index(&run);
    assert!(index.images.is_empty());
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_mixed_successes_and_failures() {
    let run = setup();
    let factory = FakeFactory::default()
        .with("a", Behavior::Copy(vec![FakeImage::new("Ma", "Ca", &["L1"])]))
        .with("b", Behavior::FailCopy("registry hiccup".to_string()))
        .with("c", Behavior::Copy(vec![FakeImage::new("Mc", "Cc", &["L2"])]))
        .with("d", Behavior::FailInit("unreachable".to_string()));
    let saver = saver(
        &run,
        &["r.io/p/a:1", "r.io/p/b:1", "r.io/p/c:1", "r.io/p/d:1"],
        factory,
        2,
        None,
    );
    let err = saver.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SaverError::ImagesFailed(_)));

    let index = read_index(&run);
    assert_eq!(index.images.len(), 2);
    let sources: Vec<&str> = index.images.iter().map(|e| e.source.as_str()).collect();
    assert!(sources.contains(&"r.io/p/a"));
    assert!(sources.contains(&"r.io/p/c"));
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_timeout_fails_only_the_slow_image() {
    let run = setup();
    let factory = FakeFactory::default()
        .with("slow", Behavior::HangCopy(Arc::new(Notify::new())))
        .with("a", Behavior::Copy(vec![FakeImage::new("Ma", "Ca", &["L1"])]));
    let saver = saver(
        &run,
        &["r.io/p/slow:1", "r.io/p/a:1"],
        factory,
        2,
        Some(Duration::from_millis(100)),
    );
    let err = saver.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SaverError::ImagesFailed(_)));

    let index = read_index(&run);
    assert_eq!(index.images.len(), 1);
    assert_eq!(index.images[0].source, "r.io/p/a");
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_cancellation_mid_run() {
    let run = setup();
    let started = Arc::new(Notify::new());
    let factory = FakeFactory::default()
        .with("a", Behavior::HangCopy(started.clone()))
        .with("b", Behavior::Copy(vec![FakeImage::new("Mb", "Cb", &["L1"])]))
        .with("c", Behavior::Copy(vec![FakeImage::new("Mc", "Cc", &["L2"])]));
    let saver = saver(
        &run,
        &["r.io/p/a:1", "r.io/p/b:1", "r.io/p/c:1"],
        factory,
        1,
        None,
    );

    let token = CancellationToken::new();
    let cancel = token.clone();
    let handle = tokio::spawn(async move { saver.run(token).await });
    started.notified().await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, SaverError::ImagesFailed(_)));

    // The hung image never reached the archive; the queued ones were
    // rejected at enqueue.
    let index = read_index(&run);
    assert!(index.images.is_empty());
    assert_no_staging_leak(&run);
}

#[tokio::test]
async fn test_validate_hits_and_misses() {
    let run = setup();
    let a = FakeImage::new("Ma", "Ca", &["L1", "L2"]);
    let factory = FakeFactory::default().with("a", Behavior::Copy(vec![a.clone()]));
    let save = saver(&run, &["r.io/p/a:1"], factory, 1, None);
    save.run(CancellationToken::new()).await.unwrap();

    // Re-validate over the archive's own list passes.
    let factory = FakeFactory::default().with("a", Behavior::Copy(vec![a.clone()]));
    let validate = saver(&run, &["r.io/p/a:1"], factory, 1, None);
    validate.validate(CancellationToken::new()).await.unwrap();

    // An image missing from the index fails the validate pass.
    let factory = FakeFactory::default()
        .with("a", Behavior::Copy(vec![a]))
        .with("c", Behavior::Copy(vec![FakeImage::new("Mc", "Cc", &["L9"])]));
    let validate = saver(&run, &["r.io/p/a:1", "r.io/p/c:1"], factory, 1, None);
    let err = validate.validate(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SaverError::ImagesFailed(op) if op == "validate"));
}

#[tokio::test]
async fn test_validate_rejects_wrong_tag() {
    let run = setup();
    let a = FakeImage::new("Ma", "Ca", &["L1"]);
    let factory = FakeFactory::default().with("a", Behavior::Copy(vec![a.clone()]));
    let save = saver(&run, &["r.io/p/a:1"], factory, 1, None);
    save.run(CancellationToken::new()).await.unwrap();

    let factory = FakeFactory::default().with("a", Behavior::Copy(vec![a]));
    let validate = saver(&run, &["r.io/p/a:2"], factory, 1, None);
    assert!(validate.validate(CancellationToken::new()).await.is_err());
}

#[tokio::test]
async fn test_layer_shared_across_variants_is_elided_once_committed() {
    let run = setup();
    // One image advertising two platform variants sharing a layer. The
    // second variant sees the digest already committed, so the staged file
    // (one path for both variants) is pruned before the archive write.
    let amd64 = FakeImage::new("Ma", "Ca", &["L1", "Lshared"]);
    let arm64 = FakeImage::new("Mb", "Cb", &["L2", "Lshared"]);
    let factory =
        FakeFactory::default().with("multi", Behavior::Copy(vec![amd64, arm64]));
    let saver = saver(&run, &["r.io/p/multi:1"], factory, 1, None);
    saver.run(CancellationToken::new()).await.unwrap();

    let blobs = shared_blobs(&run);
    let shared_count = blobs
        .iter()
        .filter(|(_, e)| e == d("Lshared").encoded())
        .count();
    assert_eq!(shared_count, 0);
    // L1, L2, Ca, Cb, Ma, Mb
    assert_eq!(blobs.len(), 6);

    let index = read_index(&run);
    assert_eq!(index.images.len(), 1);
    assert_eq!(index.images[0].images.len(), 2);
}
