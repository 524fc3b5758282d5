use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use meridian_node::api_service::{run_api_service, ApiAppState};
use meridian_node::blockchain::dag_index::DagIndex;
use meridian_node::blockchain::orphan_manager::OrphanManager;
use meridian_node::chainparams::{self, MAINNET_PARAMS};
use meridian_node::node_config::NodeConfig;
use meridian_node::p2p::connection::{
    spawn_outbound_dispatcher, spawn_peer_dialer, start_listener, PeerRegistry,
};
use meridian_node::p2p::sync_manager::SyncManager;
use meridian_node::storage::{BlockStore, FileBlockStore};

const SWEEP_INTERVAL_SECS: u64 = 10;

fn startup_error(message: String) -> std::io::Error {
    log::error!("{}", message);
    std::io::Error::new(std::io::ErrorKind::Other, message)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    log::info!("Meridian node starting up...");

    let config = NodeConfig::load()
        .map_err(|e| startup_error(format!("failed to load configuration: {}", e)))?;

    let store: Arc<dyn BlockStore> = Arc::new(
        FileBlockStore::open(Path::new(&config.data_dir))
            .map_err(|e| startup_error(format!("failed to open block store: {}", e)))?,
    );

    if store.blocks_count() == 0 {
        let genesis = chainparams::genesis_block();
        store
            .put(&genesis)
            .map_err(|e| startup_error(format!("failed to persist genesis block: {}", e)))?;
        log::info!("initialized empty store with genesis block");
    }

    // The index rebuild must complete before any queries are answered or
    // sync traffic is accepted.
    let rebuild_started = Instant::now();
    let dag = Arc::new(
        DagIndex::rebuild(store.as_ref())
            .map_err(|e| startup_error(format!("failed to rebuild DAG index: {}", e)))?,
    );
    log::info!(
        "DAG index ready after {:?}: {} blocks, max height {}",
        rebuild_started.elapsed(),
        dag.len(),
        dag.max_height()
    );

    let orphans = Arc::new(OrphanManager::new(
        Arc::clone(&dag),
        Arc::clone(&store),
        config.sync.max_orphan_blocks,
        config.sync.orphan_ttl(),
    ));

    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let sync = Arc::new(SyncManager::new(
        Arc::clone(&dag),
        Arc::clone(&store),
        Arc::clone(&orphans),
        outbound_tx,
        config.sync.clone(),
    ));

    let registry = Arc::new(PeerRegistry::new());
    spawn_outbound_dispatcher(Arc::clone(&registry), outbound_rx, Arc::clone(&sync));

    let p2p_listen_addr = config
        .p2p_listen_addr
        .parse()
        .map_err(|e| startup_error(format!("invalid p2p_listen_addr: {}", e)))?;
    {
        let registry = Arc::clone(&registry);
        let sync = Arc::clone(&sync);
        tokio::spawn(async move {
            if let Err(e) = start_listener(p2p_listen_addr, registry, sync).await {
                log::error!("p2p listener failed: {}", e);
            }
        });
    }
    spawn_peer_dialer(config.peers.clone(), Arc::clone(&registry), Arc::clone(&sync));

    // Periodic housekeeping: expire in-flight sync requests and stale
    // orphans.
    {
        let sync = Arc::clone(&sync);
        let orphans = Arc::clone(&orphans);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                sync.sweep_timeouts().await;
                orphans.sweep_stale().await;
            }
        });
    }

    let app_state = ApiAppState {
        store,
        dag,
        sync,
        orphans,
        params: &MAINNET_PARAMS,
        started_at: Utc::now(),
    };
    run_api_service(app_state, &config.api_listen_addr).await
}
