use dotenvy::dotenv;
use log::{error, info, warn};
use std::env;

use pharmachain::blockchain::Blockchain;
use pharmachain::config::NodeConfig;
use pharmachain::network::Network;
use pharmachain::node::Node;
use pharmachain::storage::LedgerStore;
use pharmachain::wallet::Wallet;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let _ = dotenv();
    env_logger::init();

    if env::args().any(|a| a == "--new-wallet") {
        let wallet = Wallet::generate();
        let json = serde_json::to_string_pretty(&wallet).map_err(std::io::Error::other)?;
        println!("{json}");
        return Ok(());
    }

    let config = NodeConfig::from_env().map_err(std::io::Error::other)?;

    let store = LedgerStore::open(&config.data_dir).map_err(std::io::Error::other)?;
    let ledger = Blockchain::open(config.ledger.clone(), store);
    info!(
        "⛓️ Ledger ready at {} ({} blocks, difficulty {})",
        config.data_dir.display(),
        ledger.len(),
        config.ledger.difficulty
    );

    let node = Node::new(ledger, config.network.max_peers);
    let network = Network::start(node.clone(), config.network.clone()).await?;
    info!("P2P accepting on {}", network.local_addr());

    let miner = match &config.miner_address {
        Some(address) => {
            info!(
                "Auto-miner paying {address} every {:?}",
                config.mine_interval
            );
            Some(node.spawn_auto_miner(address.clone(), config.mine_interval))
        }
        None => {
            warn!("MINER_ADDRESS not set, blocks are only pulled from peers");
            None
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {e}");
    }
    info!(
        "Shutting down at height {}, tip {}",
        node.height(),
        node.tip_hash()
    );
    if let Some(miner) = miner {
        miner.abort();
    }
    network.shutdown().await;
    if node.is_durability_degraded() {
        warn!("Ledger persistence failed during this run; on-disk state may be behind");
    }
    Ok(())
}
