use anyhow::Result;
use tracing::{error, info};

use crawl_orchestrator::cli::{self, config::EngineConfig};
use crawl_orchestrator::utils::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    let config = if args.needs_config() {
        EngineConfig::load(args.config.as_deref())?
    } else {
        EngineConfig::default()
    };

    init_logging(&config.logging.level, args.verbose, config.logging.file.clone())?;

    info!("Starting crawl orchestrator v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args, config).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {}", e);
            Err(e)
        }
    }
}
