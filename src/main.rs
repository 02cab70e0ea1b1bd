use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasekeeper::{Config, DhcpServer, JsonFileStore, LeaseStore, Persistence, Result};

#[derive(Parser)]
#[command(name = "leasekeeper")]
#[command(author, version, about = "A DHCP server with persistent leases", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve until Ctrl-C (default)
    Run,
    /// Print the effective configuration
    ShowConfig,
    /// Print the persisted lease records
    ListLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let server = DhcpServer::new(config).await?;

            server
                .run(async {
                    if let Err(error) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl-C: {}", error);
                        std::future::pending::<()>().await;
                    }
                })
                .await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let persistence = Persistence::new(JsonFileStore::new(&config.leases_file));
            let leases = persistence.load_all().await?;

            if leases.is_empty() {
                println!("No leases in {}.", persistence.store().describe());
                return Ok(());
            }

            println!(
                "{:<20} {:<16} {:<10} {:<24} {:<12} {}",
                "Hardware Address", "IP Address", "State", "State Ends", "Remaining", "Hostname"
            );
            println!("{}", "-".repeat(96));

            let now = Utc::now();
            for lease in leases {
                let (ends, remaining) = match lease.state_end() {
                    Some(end) if end > now => (
                        end.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        format!("{}s", (end - now).num_seconds()),
                    ),
                    Some(end) => (
                        end.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        "ended".to_string(),
                    ),
                    None => ("never".to_string(), "infinite".to_string()),
                };

                println!(
                    "{:<20} {:<16} {:<10} {:<24} {:<12} {}",
                    leasekeeper::lease::format_hex(&lease.hardware_address),
                    lease.ip_address,
                    lease.state.to_string(),
                    ends,
                    remaining,
                    lease.hostname
                );
            }

            Ok(())
        }
    }
}
