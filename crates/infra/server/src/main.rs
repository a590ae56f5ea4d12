//! Hookrelay binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;

use hookrelay_server::{AppConfig, Relay, init_tracing, load_config};

/// Hookrelay - signed webhook delivery with retries.
#[derive(Parser)]
#[command(name = "hookrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Dispatch events read as JSON lines.
    Dispatch {
        /// Input file; stdin when omitted.
        file: Option<PathBuf>,

        /// Seconds to wait for deliveries (retries included) before exiting.
        #[arg(short, long, default_value = "60")]
        wait: u64,
    },

    /// Send a test event to a webhook and print the result.
    Test {
        /// Webhook ID.
        webhook_id: String,
    },

    /// Print delivery summaries.
    Summary {
        /// Only webhooks of this tenant.
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Drop journal records older than the given number of days.
    Prune {
        /// Retention in days.
        #[arg(short, long, default_value = "30")]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    init_tracing(&config.server);

    let relay = Relay::new(config).await?;

    match cli.command {
        Commands::Dispatch { file, wait } => {
            relay.start().await?;
            let report = match file {
                Some(path) => {
                    let file = tokio::fs::File::open(path).await?;
                    relay.dispatch_lines(BufReader::new(file)).await?
                }
                None => relay.dispatch_lines(BufReader::new(tokio::io::stdin())).await?,
            };
            if !relay.drain(Duration::from_secs(wait)).await {
                tracing::warn!("Deliveries still pending; they resume on the next run");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Test { webhook_id } => {
            // Diagnostics only: journaled deliveries resume on the next dispatch run.
            relay.start_workers().await?;
            let result = relay.send_test(&webhook_id).await;
            relay.drain(Duration::ZERO).await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Commands::Summary { tenant } => {
            let summaries = relay.summary(tenant.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Commands::Prune { days } => {
            let removed = relay.prune(days).await?;
            println!("{removed}");
        }
    }

    Ok(())
}
