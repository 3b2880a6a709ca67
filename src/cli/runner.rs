//! Runner wiring CLI arguments to the save pipeline

use crate::cli::args::{Commands, CommonArgs, SaveArgs, ValidateArgs};
use crate::error::Result;
use crate::image::platform::Platform;
use crate::logging::Logger;
use crate::saver::{load_image_list, CommonConfig, Saver, SaverConfig};
use crate::source::AuthSpec;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Runner {
    logger: Logger,
}

impl Runner {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Save(args) => self.save(args).await,
            Commands::Validate(args) => self.validate(args).await,
        }
    }

    async fn save(&self, args: SaveArgs) -> Result<()> {
        self.logger.section("Saving images");
        let images = load_image_list(Path::new(&args.common.file))?;
        let mut config = SaverConfig::new(PathBuf::from(&args.common.destination));
        config.common = self.common_config(&args.common)?;
        if let Some(registry) = &args.common.source_registry {
            config.source_registry = registry.clone();
        }
        if let Some(project) = &args.common.source_project {
            config.source_project = project.clone();
        }
        if let Some(dir) = &args.shared_blob_dir {
            config.shared_blob_dir = dir.clone();
        }

        let total = images.len();
        let saver = Saver::new(config, images, self.logger.clone())?;
        saver.run(self.cancel_on_ctrl_c()).await?;
        self.logger
            .success(&format!("Saved {} image(s) to {}", total, args.common.destination));
        Ok(())
    }

    async fn validate(&self, args: ValidateArgs) -> Result<()> {
        self.logger.section("Validating archive");
        let images = load_image_list(Path::new(&args.common.file))?;
        let mut config = SaverConfig::new(PathBuf::from(&args.common.destination));
        config.common = self.common_config(&args.common)?;
        if let Some(registry) = &args.common.source_registry {
            config.source_registry = registry.clone();
        }
        if let Some(project) = &args.common.source_project {
            config.source_project = project.clone();
        }

        let saver = Saver::new(config, images, self.logger.clone())?;
        saver.validate(self.cancel_on_ctrl_c()).await?;
        self.logger.success("All images present in archive index");
        Ok(())
    }

    fn common_config(&self, args: &CommonArgs) -> Result<CommonConfig> {
        let mut config = CommonConfig {
            workers: args.jobs,
            timeout: match args.timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            platforms: Platform::parse_set(&args.platform)?,
            insecure_skip_tls: args.skip_tls,
            ..CommonConfig::default()
        };
        if let Some(dir) = &args.cache_dir {
            config.cache_dir = PathBuf::from(dir);
        }
        if let (Some(username), Some(password)) = (&args.username, &args.password) {
            config.auth = Some(AuthSpec {
                username: username.clone(),
                password: password.clone(),
            });
        }
        Ok(config)
    }

    /// Run token cancelled on the first Ctrl-C.
    fn cancel_on_ctrl_c(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let child = token.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                logger.warning("interrupt received, cancelling in-flight jobs");
                child.cancel();
            }
        });
        token
    }
}
