use anyhow::{Context, Result};
use log::{info, warn};

use pow_ledger::blockchain::{EventDispatcher, LedgerStorage, Miner};
use pow_ledger::config::NodeConfig;
use pow_ledger::sync::{transport, SyncNode};

// Opens the on-disk store when a data directory is configured
fn open_storage(config: &NodeConfig) -> LedgerStorage {
    let Some(data_dir) = &config.data_dir else {
        info!("No data directory configured, keeping state in memory");
        return LedgerStorage::in_memory();
    };

    if let Err(e) = std::fs::create_dir_all(data_dir) {
        warn!("Failed to create data directory: {}", e);
    }

    match LedgerStorage::open(data_dir) {
        Ok(storage) => {
            info!("Using storage at {}", data_dir.display());
            storage
        }
        Err(err) => {
            warn!("Failed to open storage at {}: {}", data_dir.display(), err);
            warn!("Keeping state in memory instead");
            LedgerStorage::in_memory()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_env().context("failed to read configuration")?;

    let storage = open_storage(&config);
    let chain = storage
        .load_chain(config.chain_config())
        .context("failed to load the stored chain")?;
    info!(
        "Chain loaded: {} blocks, tip {}",
        chain.len(),
        chain.latest_block().hash
    );

    let dispatcher = EventDispatcher::new(chain, Some(storage));
    let node = SyncNode::new(dispatcher.clone());
    let _relay = node.spawn_relay();

    let (addr, _accept) = transport::listen(node.clone(), config.listen_addr)
        .await
        .context("failed to start the sync listener")?;
    info!("Sync listener bound to {}", addr);

    for peer in &config.peers {
        match transport::connect(&node, peer).await {
            Ok(id) => info!("Connected to peer {}", id),
            Err(err) => warn!("Failed to connect to peer {}: {}", peer, err),
        }
    }

    let miner = config.miner_address.clone().map(|address| {
        Miner::new(
            address,
            dispatcher.clone(),
            config.mining_policy(),
            config.expected_block_time_ms,
        )
        .spawn()
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    if let Some(miner) = miner {
        miner.stop().await;
    }
    dispatcher.persist().context("failed to persist chain on shutdown")?;

    Ok(())
}
