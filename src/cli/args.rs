//! Command-line argument parsing

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "docker-image-saver")]
#[command(about = "Save container images from registries into a deduplicated archive")]
#[command(version, author)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Quiet mode
    #[arg(long = "quiet", short = 'q', global = true, help = "Suppress non-error output")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Save listed images into an archive
    Save(SaveArgs),
    /// Check that every listed image is present in an archive's index
    Validate(ValidateArgs),
}

#[derive(ClapArgs)]
pub struct CommonArgs {
    /// Image list file
    #[arg(
        long = "file",
        short = 'f',
        help = "Path to the image list file, one reference per line"
    )]
    pub file: String,

    /// Archive path
    #[arg(
        long = "destination",
        short = 'd',
        default_value = "saved-images.tar.gz",
        help = "Archive file path"
    )]
    pub destination: String,

    /// Worker count
    #[arg(
        long = "jobs",
        short = 'j',
        default_value = "1",
        help = "Number of concurrent save workers"
    )]
    pub jobs: usize,

    /// Per-image timeout
    #[arg(
        long = "timeout",
        short = 't',
        default_value = "0",
        help = "Per-image timeout in seconds, 0 disables it"
    )]
    pub timeout: u64,

    /// Platform filter
    #[arg(
        long = "platform",
        help = "Limit to os/arch platforms, repeatable (e.g. linux/amd64)"
    )]
    pub platform: Vec<String>,

    /// Source registry override
    #[arg(
        long = "source-registry",
        help = "Override the registry of every source image"
    )]
    pub source_registry: Option<String>,

    /// Source project override
    #[arg(
        long = "source-project",
        help = "Override the project of every source image"
    )]
    pub source_project: Option<String>,

    /// Staging cache root
    #[arg(long = "cache-dir", help = "Root directory for per-image staging dirs")]
    pub cache_dir: Option<String>,

    /// Registry username
    #[arg(
        long = "username",
        short = 'u',
        help = "Username for registry authentication"
    )]
    pub username: Option<String>,

    /// Registry password
    #[arg(
        long = "password",
        short = 'p',
        help = "Password for registry authentication"
    )]
    pub password: Option<String>,

    /// Skip TLS verification
    #[arg(
        long = "skip-tls",
        short = 'k',
        help = "Use plain HTTP and skip TLS certificate verification"
    )]
    pub skip_tls: bool,
}

#[derive(ClapArgs)]
pub struct SaveArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Shared-blob directory name
    #[arg(
        long = "shared-blob-dir",
        help = "Name of the shared-blob directory inside each staging tree"
    )]
    pub shared_blob_dir: Option<String>,
}

#[derive(ClapArgs)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}
