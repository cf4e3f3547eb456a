use anyhow::Result;
use tracing::{info, error};

mod cli;
mod crawler;
mod storage;
mod stream;
mod utils;

#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    utils::init_logging(args.verbose, args.log_destination())?;

    info!("Starting crawl pipeline v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
