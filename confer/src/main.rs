use anyhow::Result;
use clap::Parser;
use tracing::info;

use confer::{load_config, logging, server::ConferServer};

#[derive(Parser, Debug)]
#[command(name = "confer")]
#[command(about = "Confer SFU signaling server", long_about = None)]
struct Args {
    /// Path to a YAML or TOML config file
    #[arg(long, short)]
    config: Option<String>,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Confer server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Serve
    ConferServer::new(config).run().await
}
