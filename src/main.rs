use anyhow::Result;
use clap::Parser;
use docker_image_saver::cli::{Args, Runner};
use docker_image_saver::Logger;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let logger = if args.quiet {
        Logger::new_quiet()
    } else {
        Logger::new(args.verbose)
    };
    let runner = Runner::new(logger);
    runner.run(args.command).await?;
    Ok(())
}
