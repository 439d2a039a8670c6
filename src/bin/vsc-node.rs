#![forbid(unsafe_code)]
//! VSportChain full node

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vscnode::accounts::{AccountManager, LocalWallet};
use vscnode::config::load_config;
use vscnode::crypto::Address;
use vscnode::node::{create_db, NodeService, ServiceContext};
use vscnode::p2p::Server;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, default_value = "vscnode.toml")]
    config: PathBuf,

    /// Overrides the configured data directory
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// Key file of the local signing account, created when missing
    #[arg(long)]
    keyfile: Option<PathBuf>,

    #[arg(long)]
    etherbase: Option<Address>,

    /// Start mining once the node is up
    #[arg(long)]
    mine: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(dir) = cli.datadir {
        config.data_dir = Some(dir);
    }
    if let Some(etherbase) = cli.etherbase {
        config.etherbase = etherbase;
    }
    config.mine |= cli.mine;

    let accounts = Arc::new(AccountManager::new());
    if let Some(keyfile) = cli.keyfile {
        let wallet = LocalWallet::load_or_create(&keyfile)?;
        wallet.unlock();
        accounts.add_wallet(Arc::new(wallet));
    }

    let ctx = ServiceContext::with_accounts(config.data_dir.clone(), accounts);
    let db = create_db(&ctx, &config, "chaindata")?;
    let node = NodeService::new(&ctx, config.clone(), db)?;

    let server = Arc::new(Server::new(config.p2p.clone()));
    server.start();
    node.start(server.clone())?;
    for api in node.apis() {
        info!(
            "Registered API: {} {} public {} methods {:?}",
            api.namespace,
            api.version,
            api.public,
            api.service.methods()
        );
    }
    if config.mine {
        node.start_mining(true)?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Got interrupt, shutting down...");

    let stopping = node.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await??;
    server.stop();
    Ok(())
}
