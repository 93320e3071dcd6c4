//! marksync Admin CLI
//!
//! Administration tool for the sync server's tokens, devices and event log.
//!
//! # Usage
//!
//! ```bash
//! marksync-admin token add alice --device firefox-laptop --expires-days 365
//! marksync-admin token list
//! marksync-admin token remove k7Qp...
//! marksync-admin device list alice
//! marksync-admin device prune --days 90
//! marksync-admin log alice --since 120
//! ```
//!
//! Paths are resolved the same way as the server's (config file, then
//! `MARKSYNC_*` environment variables).

use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use marksync::auth::{generate_token, TokenEntry, TokenFile};
use marksync::config::ServerConfig;
use marksync::db::{init_db, DeltaStore, DeviceRegistry};

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "marksync-admin")]
#[command(version)]
#[command(about = "marksync server administration tool")]
struct Cli {
    /// Path to the server config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage access tokens
    Token(TokenCommand),
    /// Inspect and prune devices
    Device(DeviceCommand),
    /// Print a user's event log
    Log {
        /// User ID
        user_id: String,
        /// Only show events after this cursor
        #[arg(long, default_value_t = 0)]
        since: i64,
    },
}

#[derive(Args)]
struct TokenCommand {
    #[command(subcommand)]
    command: TokenSubcommand,
}

#[derive(Subcommand)]
enum TokenSubcommand {
    /// Issue a new token
    Add {
        /// User the token authenticates as
        user_id: String,
        /// Restrict the token to one device
        #[arg(long, short)]
        device: Option<String>,
        /// Expire the token after this many days
        #[arg(long)]
        expires_days: Option<i64>,
    },
    /// List all tokens
    List,
    /// Revoke a token
    Remove {
        /// The token, or a unique prefix of it
        token: String,
    },
}

#[derive(Args)]
struct DeviceCommand {
    #[command(subcommand)]
    command: DeviceSubcommand,
}

#[derive(Subcommand)]
enum DeviceSubcommand {
    /// List a user's devices
    List {
        /// User ID
        user_id: String,
    },
    /// Mark devices unseen for N days inactive
    Prune {
        #[arg(long, default_value_t = 90)]
        days: i64,
    },
}

// ============================================================================
// Commands
// ============================================================================

fn add_token(
    config: &ServerConfig,
    user_id: String,
    device_id: Option<String>,
    expires_days: Option<i64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = config.tokens_path();
    let mut file = TokenFile::read(&path)?;

    let entry = TokenEntry {
        token: generate_token(),
        user_id,
        device_id,
        expires_at: expires_days.map(|days| Utc::now() + Duration::days(days)),
    };
    file.tokens.push(entry.clone());
    file.write(&path)?;

    println!("Added token for user: {}", entry.user_id);
    if let Some(device) = &entry.device_id {
        println!("  Device: {}", device);
    }
    if let Some(expires) = entry.expires_at {
        println!("  Expires: {}", expires.to_rfc3339());
    }
    println!();
    println!("  {}", entry.token);
    println!();
    println!("Restart the server to load the new token.");

    Ok(())
}

fn list_tokens(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let file = TokenFile::read(&config.tokens_path())?;

    if file.tokens.is_empty() {
        println!("No tokens issued.");
        return Ok(());
    }

    println!("{:<12} {:<24} {:<24} {:<25}", "TOKEN", "USER", "DEVICE", "EXPIRES");
    println!("{}", "-".repeat(88));

    for entry in &file.tokens {
        let prefix: String = entry.token.chars().take(8).collect();
        println!(
            "{:<12} {:<24} {:<24} {:<25}",
            format!("{}...", prefix),
            entry.user_id,
            entry.device_id.as_deref().unwrap_or("-"),
            entry
                .expires_at
                .map(|e| e.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        );
    }

    println!();
    println!("Total: {} token(s)", file.tokens.len());

    Ok(())
}

fn remove_token(config: &ServerConfig, token: String) -> Result<(), Box<dyn std::error::Error>> {
    let path = config.tokens_path();
    let mut file = TokenFile::read(&path)?;

    let matches: Vec<usize> = file
        .tokens
        .iter()
        .enumerate()
        .filter(|(_, e)| e.token.starts_with(&token))
        .map(|(i, _)| i)
        .collect();

    match matches.as_slice() {
        [] => {
            eprintln!("Error: No token matches '{}'", token);
            std::process::exit(1);
        }
        [index] => {
            let removed = file.tokens.remove(*index);
            file.write(&path)?;
            println!("Removed token for user: {}", removed.user_id);
        }
        _ => {
            eprintln!("Error: '{}' matches {} tokens, use a longer prefix", token, matches.len());
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn list_devices(config: &ServerConfig, user_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_path()).await?;
    let devices = DeviceRegistry::new(pool).list(&user_id).await?;

    if devices.is_empty() {
        println!("No devices registered for {}.", user_id);
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<12} {:<28}",
        "DEVICE", "CURSOR", "STATUS", "LAST SEEN"
    );
    println!("{}", "-".repeat(76));

    for device in &devices {
        let status = if device.is_connected() {
            "connected"
        } else if device.inactive {
            "inactive"
        } else {
            "offline"
        };
        println!(
            "{:<24} {:<10} {:<12} {:<28}",
            device.device_id,
            device.last_cursor,
            status,
            device.last_seen_at.to_rfc3339()
        );
    }

    println!();
    println!("Total: {} device(s)", devices.len());

    Ok(())
}

async fn prune_devices(config: &ServerConfig, days: i64) -> Result<(), Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_path()).await?;
    let marked = DeviceRegistry::new(pool)
        .mark_inactive(Utc::now() - Duration::days(days))
        .await?;
    println!("Marked {} device(s) inactive", marked);
    Ok(())
}

async fn show_log(config: &ServerConfig, user_id: String, since: i64) -> Result<(), Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_path()).await?;
    let store = DeltaStore::new(pool, config.instance_id.clone(), config.page_size);
    let mut pages = store.since(&user_id, since).await?;

    let mut count = 0;
    while let Some(page) = pages.next_page().await? {
        for event in page {
            println!(
                "{:>8}  {}  {:<10} {:<8} {:<24} {}",
                event.event_id,
                event.server_timestamp.to_rfc3339(),
                event.entity_type.as_str(),
                event.operation.as_str(),
                event.entity_id,
                event.originating_device_id
            );
            count += 1;
        }
    }

    if count == 0 {
        println!("No events after cursor {}.", since);
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config)?;

    match cli.command {
        Commands::Token(cmd) => match cmd.command {
            TokenSubcommand::Add {
                user_id,
                device,
                expires_days,
            } => add_token(&config, user_id, device, expires_days),
            TokenSubcommand::List => list_tokens(&config),
            TokenSubcommand::Remove { token } => remove_token(&config, token),
        },
        Commands::Device(cmd) => match cmd.command {
            DeviceSubcommand::List { user_id } => list_devices(&config, user_id).await,
            DeviceSubcommand::Prune { days } => prune_devices(&config, days).await,
        },
        Commands::Log { user_id, since } => show_log(&config, user_id, since).await,
    }
}
