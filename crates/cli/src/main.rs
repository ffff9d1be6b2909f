//! Operator entry point: `pisa start` runs the watchtower against a
//! configured chain, `pisa status` inspects the persisted state of a
//! stopped instance.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pisa_core::config::AppConfig;
use pisa_core::responder::{SignerError, TransactionSigner};
use pisa_core::runtime::Watchtower;
use pisa_core::store::{ItemStore, ItemStoreExt, SledStore};
use pisa_core::types::{Address, TransactionRequest};

#[derive(Parser)]
#[command(name = "pisa", about = "PISA watchtower service", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watchtower until interrupted.
    Start {
        /// Path to a TOML config file (falls back to PISA_CONFIG, then
        /// defaults).
        #[arg(long)]
        config: Option<String>,

        /// Responder address, 0x-prefixed. Development only: transactions
        /// are serialized unsigned. Production deployments embed a real
        /// signer through `WatchtowerBuilder::with_signer`.
        #[arg(long)]
        address: String,
    },

    /// Print the persisted head and responder state of a stopped
    /// instance.
    Status {
        #[arg(long)]
        config: Option<String>,
    },
}

/// Serializes requests instead of signing them. Stands in for the real
/// key holder during development; never use against a live network.
struct DevSigner {
    address: Address,
}

impl TransactionSigner for DevSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, tx: &TransactionRequest) -> Result<Vec<u8>, SignerError> {
        serde_json::to_vec(tx).map_err(|e| SignerError::Unavailable(e.to_string()))
    }
}

fn parse_address(raw: &str) -> Result<Address> {
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    if hex.len() != 40 {
        bail!("address must be 20 bytes of hex, got {raw:?}");
    }
    let mut address = [0u8; 20];
    for (i, chunk) in address.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| anyhow!("address contains non-hex characters: {raw:?}"))?;
    }
    Ok(address)
}

fn load_config(path: Option<&str>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from(path).context("loading config file"),
        None => AppConfig::load().context("loading config"),
    }
}

async fn run_start(config: AppConfig, address: Address) -> Result<()> {
    let signer = Arc::new(DevSigner { address });
    let mut watchtower = Watchtower::builder(config)
        .with_signer(signer)
        .build()
        .context("building watchtower")?;

    watchtower.start().await.context("starting watchtower")?;

    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("interrupt received, shutting down");
    watchtower.stop().await;

    let health = watchtower.health();
    info!(
        head = ?health.head_number,
        queue_depth = health.queue_depth,
        "final state"
    );
    Ok(())
}

fn run_status(config: &AppConfig) -> Result<()> {
    #[derive(serde::Deserialize)]
    struct HeadPointer {
        head: u64,
    }

    let store = SledStore::open(&config.store.path).context("opening store")?;

    match store.get_json::<HeadPointer>("block-processor", b"head")? {
        Some(pointer) => println!("persisted head: {}", pointer.head),
        None => println!("persisted head: none"),
    }
    let appointments = store.scan_prefix("appointments", &[])?.len();
    println!("appointments: {appointments}");
    let journal_entries = store.scan_prefix("responder", b"j:")?.len();
    println!("responder journal entries: {journal_entries}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, address } => {
            let config = load_config(config.as_deref())?;
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
                )
                .init();
            let address = parse_address(&address)?;
            run_start(config, address).await
        }
        Commands::Status { config } => {
            let config = load_config(config.as_deref())?;
            run_status(&config)
        }
    }
}
