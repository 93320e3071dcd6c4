//! marksync sync server
//!
//! Serves the bookmark sync protocol over WebSocket.
//!
//! # Configuration
//!
//! Settings come from `~/.config/marksync/config.yaml` (or `--config`),
//! overridden by environment variables:
//! - `MARKSYNC_PORT`: Port to listen on (default: 8080)
//! - `MARKSYNC_DATA_DIR`: Directory for the database and token file
//! - `MARKSYNC_DATABASE_PATH`: SQLite database path
//! - `MARKSYNC_TOKENS`: Token file path (managed with `marksync-admin token`)
//! - `MARKSYNC_INSTANCE_ID`: Name of this instance when several share a database
//!
//! Log verbosity follows `RUST_LOG` (default: `marksync=info,tower_http=info`).

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marksync::config::ServerConfig;

#[derive(Parser)]
#[command(name = "marksync-server")]
#[command(version)]
#[command(about = "Bookmark sync server")]
struct Cli {
    /// Path to config file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marksync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match ServerConfig::load(cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = marksync::server::serve(config).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
