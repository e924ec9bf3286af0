//! Relaygate - resilient HTTP/HTTPS reverse proxy
//!
//! This is the main entry point for the Relaygate CLI. `run` starts the
//! supervisor, which forks peer workers; a process launched with
//! `WORKER_ID` in its environment runs a single worker instead.

use clap::{Parser, Subcommand};
use relaygate_core::ProxyConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod supervisor;
mod worker;

/// Relaygate - reverse proxy with hot-swappable routing and automatic TLS
#[derive(Parser)]
#[command(name = "relaygate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy (supervisor and workers)
    Run,

    /// Insert a routing rule into the mapping table
    #[command(name = "add-mapping")]
    AddMapping {
        /// Exact host to match (lowercase, no port)
        domain: String,

        /// Loopback destination port
        back_port: u16,

        /// Path prefix without leading slash; empty matches any path
        #[arg(long, default_value = "")]
        front_uri: String,

        /// Path fragment substituted on the upstream
        #[arg(long, default_value = "")]
        back_uri: String,
    },

    /// Print the mapping table
    #[command(name = "list-mappings")]
    ListMappings,

    /// Delete a routing rule by id
    #[command(name = "remove-mapping")]
    RemoveMapping {
        /// The rule id as shown by list-mappings
        id: String,
    },

    /// Hot-swap the mapping database with another database file
    #[command(name = "swap-db")]
    SwapDb {
        /// Path of the replacement database
        path: PathBuf,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Run => {
            if config.worker_id.is_some() {
                // Forked by the supervisor (or run single-process on purpose).
                if let Err(e) = worker::run(config).await {
                    tracing::error!("❌ worker failed: {:#}", e);
                    std::process::exit(1);
                }
            } else {
                let code = supervisor::run(&config).await;
                std::process::exit(code);
            }
        }

        Commands::AddMapping {
            domain,
            back_port,
            front_uri,
            back_uri,
        } => {
            let store = relaygate_store::MappingStore::initialize(&config.db_path).await?;
            let mapping = store.add(&domain, &front_uri, back_port, &back_uri).await?;
            store.close().await;
            println!(
                "added {} {} -> localhost:{} {} ({})",
                mapping.domain,
                display_uri(&mapping.front_uri),
                mapping.back_port,
                display_uri(&mapping.back_uri),
                mapping.id
            );
        }

        Commands::ListMappings => {
            let store = relaygate_store::MappingStore::initialize(&config.db_path).await?;
            let mappings = store.get_all().await?;
            store.close().await;
            if mappings.is_empty() {
                println!("no mappings configured");
            }
            for m in mappings {
                println!(
                    "{} {} -> localhost:{} {} ({})",
                    m.domain,
                    display_uri(&m.front_uri),
                    m.back_port,
                    display_uri(&m.back_uri),
                    m.id
                );
            }
        }

        Commands::RemoveMapping { id } => {
            let store = relaygate_store::MappingStore::initialize(&config.db_path).await?;
            let removed = store.remove(&id).await?;
            store.close().await;
            if removed {
                println!("removed {id}");
            } else {
                println!("no mapping with id {id}");
            }
        }

        Commands::SwapDb { path } => {
            let store = relaygate_store::MappingStore::initialize(&config.db_path).await?;
            store.hot_replace(&path).await?;
            store.close().await;
            println!("swapped {} into place", path.display());
        }

        Commands::Version => {
            println!("relaygate {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn display_uri(uri: &str) -> String {
    if uri.is_empty() {
        "/".to_string()
    } else {
        format!("/{uri}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
