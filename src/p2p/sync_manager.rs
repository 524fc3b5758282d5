use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

use crate::blockchain::dag_index::DagIndex;
use crate::blockchain::orphan_manager::{AddOutcome, OrphanManager};
use crate::node_config::SyncConfig;
use crate::p2p::messages::{
    BlockRequestMessage, BlockResponseMessage, Digest, SyncMessage, TipAdvertisementMessage,
    MAX_BLOCKS_PER_MSG,
};
use crate::storage::BlockStore;
use crate::util::short_hash;
use log::{debug, error, info, warn};

pub type PeerId = SocketAddr;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("catch-up walk with peer {peer} exceeded depth limit {limit}")]
    DepthExceeded { peer: PeerId, limit: u32 },
    #[error("request to peer {peer} timed out")]
    Timeout { peer: PeerId },
}

/// Per-peer negotiator state. `RequestSent` is the short-lived phase
/// between building a request and handing it to the transport.
#[derive(Debug, Clone)]
pub enum PeerSyncState {
    Idle,
    RequestSent {
        nonce: u64,
    },
    AwaitingBlocks {
        nonce: u64,
        sent_at: Instant,
        outstanding: BTreeSet<Digest>,
        depth: u32,
        advertised: Vec<Digest>,
    },
}

struct PeerSync {
    state: PeerSyncState,
    last_advert: Vec<Digest>,
}

impl PeerSync {
    fn idle() -> Self {
        PeerSync { state: PeerSyncState::Idle, last_advert: Vec::new() }
    }
}

/// Incremental sync, one negotiator per peer.
///
/// On a tip advertisement the negotiator requests only the advertised
/// blocks it does not already hold; each response block whose parents are
/// still unknown widens the next request by exactly those parents. A node
/// that already holds a prefix of the DAG therefore downloads only the
/// suffix created while it was away, never the full history. The backward
/// walk is bounded by `max_request_depth`.
pub struct SyncManager {
    dag: Arc<DagIndex>,
    store: Arc<dyn BlockStore>,
    orphans: Arc<OrphanManager>,
    peers: TokioMutex<HashMap<PeerId, PeerSync>>,
    outbound: mpsc::Sender<(PeerId, SyncMessage)>,
    config: SyncConfig,
}

impl SyncManager {
    pub fn new(
        dag: Arc<DagIndex>,
        store: Arc<dyn BlockStore>,
        orphans: Arc<OrphanManager>,
        outbound: mpsc::Sender<(PeerId, SyncMessage)>,
        config: SyncConfig,
    ) -> Self {
        SyncManager {
            dag,
            store,
            orphans,
            peers: TokioMutex::new(HashMap::new()),
            outbound,
            config,
        }
    }

    pub async fn register_peer(&self, peer: PeerId) {
        self.peers.lock().await.entry(peer).or_insert_with(PeerSync::idle);
        info!("registered peer {}", peer);
        self.send_tips_to(peer).await;
    }

    pub async fn remove_peer(&self, peer: PeerId) {
        if self.peers.lock().await.remove(&peer).is_some() {
            info!("removed peer {}", peer);
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn peer_state(&self, peer: &PeerId) -> Option<PeerSyncState> {
        self.peers.lock().await.get(peer).map(|p| p.state.clone())
    }

    async fn send_tips_to(&self, peer: PeerId) {
        let tips = self.dag.get_tips();
        let msg = SyncMessage::TipAdvertisement(TipAdvertisementMessage { tips });
        if self.outbound.send((peer, msg)).await.is_err() {
            warn!("outbound channel closed, could not advertise tips to {}", peer);
        }
    }

    /// Advertises the current tips to every registered peer. Called after
    /// a local block is accepted and after a sync round completes.
    pub async fn announce_tips(&self) {
        let peer_ids: Vec<PeerId> = self.peers.lock().await.keys().copied().collect();
        for peer in peer_ids {
            self.send_tips_to(peer).await;
        }
    }

    pub async fn handle_message(&self, peer: PeerId, msg: SyncMessage) -> Result<(), SyncError> {
        match msg {
            SyncMessage::TipAdvertisement(m) => self.on_tip_advertisement(peer, m.tips).await,
            SyncMessage::BlockRequest(m) => {
                self.on_block_request(peer, m).await;
                Ok(())
            }
            SyncMessage::BlockResponse(m) => self.on_block_response(peer, m).await,
        }
    }

    async fn on_tip_advertisement(&self, peer: PeerId, tips: Vec<Digest>) -> Result<(), SyncError> {
        let frontier = {
            let mut peers = self.peers.lock().await;
            let entry = peers.entry(peer).or_insert_with(PeerSync::idle);
            entry.last_advert = tips.clone();
            if !matches!(entry.state, PeerSyncState::Idle) {
                debug!(
                    "sync with {} already in progress, noted {} advertised tip(s)",
                    peer,
                    tips.len()
                );
                return Ok(());
            }
            let mut frontier: Vec<Digest> =
                tips.iter().filter(|t| !self.dag.contains(t)).copied().collect();
            frontier.dedup();
            if frontier.is_empty() {
                debug!("in sync with {} ({} tips, all known)", peer, tips.len());
                return Ok(());
            }
            frontier
        };
        self.send_request(peer, frontier, 0, tips).await
    }

    /// Serves a peer's request straight from the store. Hashes we do not
    /// hold are simply absent from the response.
    async fn on_block_request(&self, peer: PeerId, request: BlockRequestMessage) {
        let mut blocks = Vec::new();
        for hash in request.hashes.iter().take(MAX_BLOCKS_PER_MSG) {
            match self.store.get(hash) {
                Ok(Some(block)) => blocks.push(block),
                Ok(None) => debug!("peer {} requested unknown block {}", peer, short_hash(hash)),
                Err(e) => {
                    error!("failed reading block {} for {}: {}", short_hash(hash), peer, e)
                }
            }
        }
        debug!(
            "serving {} of {} requested block(s) to {}",
            blocks.len(),
            request.hashes.len(),
            peer
        );
        let msg = SyncMessage::BlockResponse(BlockResponseMessage { nonce: request.nonce, blocks });
        if self.outbound.send((peer, msg)).await.is_err() {
            warn!("outbound channel closed, dropping response to {}", peer);
        }
    }

    async fn on_block_response(
        &self,
        peer: PeerId,
        response: BlockResponseMessage,
    ) -> Result<(), SyncError> {
        // Snapshot the in-flight state; block processing must not hold the
        // peer table lock.
        let (mut outstanding, depth, advertised) = {
            let peers = self.peers.lock().await;
            match peers.get(&peer).map(|p| &p.state) {
                Some(PeerSyncState::AwaitingBlocks { nonce, outstanding, depth, advertised, .. })
                    if *nonce == response.nonce =>
                {
                    (outstanding.clone(), *depth, advertised.clone())
                }
                _ => {
                    warn!(
                        "unexpected block response from {} (nonce {}), ignoring",
                        peer, response.nonce
                    );
                    return Ok(());
                }
            }
        };

        let mut newly_missing: BTreeSet<Digest> = BTreeSet::new();
        let mut progressed = false;
        for block in response.blocks {
            let hash = block.get_hash();
            if !outstanding.remove(&hash) {
                warn!("peer {} sent unrequested block {}", peer, short_hash(&hash));
                continue;
            }
            progressed = true;
            match self.orphans.add_block(block).await {
                Ok(AddOutcome::Accepted { released }) => {
                    if released > 0 {
                        debug!("block {} released {} parked orphan(s)", short_hash(&hash), released);
                    }
                }
                Ok(AddOutcome::AlreadyKnown) => {}
                Ok(AddOutcome::Parked { missing }) => {
                    newly_missing.extend(missing);
                }
                Err(e) => warn!("rejecting block {} from {}: {}", short_hash(&hash), peer, e),
            }
        }

        // Whatever got linked in the meantime (possibly via another peer)
        // no longer needs requesting.
        let mut next: BTreeSet<Digest> = outstanding;
        next.extend(newly_missing.iter().copied());
        next.retain(|h| !self.dag.contains(h));

        if next.is_empty() {
            self.set_state(peer, PeerSyncState::Idle).await;
            let unresolved =
                advertised.iter().filter(|t| !self.dag.contains(t)).count();
            if unresolved == 0 {
                info!("synced with {}: all advertised tips linked", peer);
                self.announce_tips().await;
            } else {
                warn!(
                    "sync with {} left {} advertised tip(s) unresolved, awaiting next advertisement",
                    peer, unresolved
                );
            }
            return Ok(());
        }

        if !progressed {
            // The peer answered but supplied none of the requested blocks.
            // Re-requesting the same set would spin forever.
            warn!("peer {} returned none of the requested blocks, going idle", peer);
            self.set_state(peer, PeerSyncState::Idle).await;
            return Ok(());
        }

        let next_depth = if newly_missing.is_empty() { depth } else { depth + 1 };
        if next_depth > self.config.max_request_depth {
            self.set_state(peer, PeerSyncState::Idle).await;
            let err = SyncError::DepthExceeded { peer, limit: self.config.max_request_depth };
            error!("{}; parked blocks kept, retrying on the next tip advertisement", err);
            return Err(err);
        }
        self.send_request(peer, next.into_iter().collect(), next_depth, advertised).await
    }

    async fn send_request(
        &self,
        peer: PeerId,
        mut hashes: Vec<Digest>,
        depth: u32,
        advertised: Vec<Digest>,
    ) -> Result<(), SyncError> {
        if hashes.len() > self.config.max_blocks_per_request {
            warn!(
                "capping request to {} of {} wanted block(s) for {}",
                self.config.max_blocks_per_request,
                hashes.len(),
                peer
            );
            hashes.truncate(self.config.max_blocks_per_request);
        }
        let nonce = rand::random::<u64>();
        self.set_state(peer, PeerSyncState::RequestSent { nonce }).await;
        let outstanding: BTreeSet<Digest> = hashes.iter().copied().collect();
        debug!("requesting {} block(s) from {} (walk depth {})", hashes.len(), peer, depth);
        let msg = SyncMessage::BlockRequest(BlockRequestMessage { nonce, hashes });
        if self.outbound.send((peer, msg)).await.is_err() {
            warn!("outbound channel closed, dropping request to {}", peer);
            self.set_state(peer, PeerSyncState::Idle).await;
            return Ok(());
        }
        self.set_state(
            peer,
            PeerSyncState::AwaitingBlocks {
                nonce,
                sent_at: Instant::now(),
                outstanding,
                depth,
                advertised,
            },
        )
        .await;
        Ok(())
    }

    async fn set_state(&self, peer: PeerId, state: PeerSyncState) {
        if let Some(entry) = self.peers.lock().await.get_mut(&peer) {
            entry.state = state;
        }
    }

    /// Returns negotiators whose request has been in flight longer than
    /// the configured timeout to `Idle`. Blocks already validated stay;
    /// parked orphans stay parked for the next advertisement.
    pub async fn sweep_timeouts(&self) {
        let now = Instant::now();
        let timeout = self.config.request_timeout();
        let mut peers = self.peers.lock().await;
        for (peer, entry) in peers.iter_mut() {
            if let PeerSyncState::AwaitingBlocks { sent_at, .. } = &entry.state {
                if now.duration_since(*sent_at) > timeout {
                    warn!("{}", SyncError::Timeout { peer: *peer });
                    entry.state = PeerSyncState::Idle;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::messages::Block;
    use crate::storage::FileBlockStore;
    use secp256k1::SecretKey;
    use std::time::Duration;

    fn test_key() -> SecretKey {
        SecretKey::from_slice(&[0x51u8; 32]).expect("valid test key")
    }

    fn make_chain(len: u64) -> Vec<Block> {
        let mut blocks = vec![Block::new(vec![], vec![], 0, 1_700_000_000, b"genesis".to_vec())];
        for height in 1..len {
            let parent = blocks.last().unwrap().get_hash();
            let mut block = Block::new(
                vec![parent],
                vec![],
                height,
                1_700_000_000 + height,
                format!("block {}", height).into_bytes(),
            );
            block.sign(&test_key());
            blocks.push(block);
        }
        blocks
    }

    struct TestNode {
        sync: Arc<SyncManager>,
        dag: Arc<DagIndex>,
        rx: mpsc::Receiver<(PeerId, SyncMessage)>,
        _dir: tempfile::TempDir,
    }

    async fn test_node(prefix: &[Block], config: SyncConfig) -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(dir.path()).unwrap());
        let dag = Arc::new(DagIndex::new());
        let orphans = Arc::new(OrphanManager::new(
            dag.clone(),
            store.clone(),
            config.max_orphan_blocks,
            config.orphan_ttl(),
        ));
        for block in prefix {
            orphans.add_block(block.clone()).await.unwrap();
        }
        let (tx, rx) = mpsc::channel(1024);
        let sync = Arc::new(SyncManager::new(dag.clone(), store, orphans, tx, config));
        TestNode { sync, dag, rx, _dir: dir }
    }

    fn addr(port: u16) -> PeerId {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// Shuttles queued messages between two nodes until both go quiet.
    /// Returns every hash node `a` requested and any sync errors it hit.
    async fn pump(
        a: &mut TestNode,
        a_addr: PeerId,
        b: &mut TestNode,
        b_addr: PeerId,
    ) -> (Vec<Digest>, Vec<SyncError>) {
        let mut requested = Vec::new();
        let mut errors = Vec::new();
        loop {
            let mut progressed = false;
            while let Ok((target, msg)) = a.rx.try_recv() {
                assert_eq!(target, b_addr);
                progressed = true;
                if let SyncMessage::BlockRequest(req) = &msg {
                    requested.extend(req.hashes.iter().copied());
                }
                b.sync.handle_message(a_addr, msg).await.unwrap();
            }
            while let Ok((target, msg)) = b.rx.try_recv() {
                assert_eq!(target, a_addr);
                progressed = true;
                if let Err(e) = a.sync.handle_message(b_addr, msg).await {
                    errors.push(e);
                }
            }
            if !progressed {
                break;
            }
        }
        (requested, errors)
    }

    #[tokio::test]
    async fn lagging_node_downloads_only_the_gap() {
        let blocks = make_chain(8);
        let mut behind = test_node(&blocks[..5], SyncConfig::default()).await;
        let mut ahead = test_node(&blocks, SyncConfig::default()).await;
        let (behind_addr, ahead_addr) = (addr(1111), addr(2222));

        behind
            .sync
            .handle_message(
                ahead_addr,
                SyncMessage::TipAdvertisement(TipAdvertisementMessage {
                    tips: ahead.dag.get_tips(),
                }),
            )
            .await
            .unwrap();
        let (requested, errors) = pump(&mut behind, behind_addr, &mut ahead, ahead_addr).await;

        assert!(errors.is_empty());
        // Only the three post-downtime blocks cross the wire.
        assert_eq!(requested.len(), 3);
        assert_eq!(behind.dag.len(), 8);
        assert_eq!(behind.dag.get_tips(), ahead.dag.get_tips());
        assert!(matches!(
            behind.sync.peer_state(&ahead_addr).await,
            Some(PeerSyncState::Idle)
        ));
    }

    #[tokio::test]
    async fn nodes_already_in_sync_exchange_nothing() {
        let blocks = make_chain(4);
        let mut left = test_node(&blocks, SyncConfig::default()).await;
        let mut right = test_node(&blocks, SyncConfig::default()).await;
        let (left_addr, right_addr) = (addr(3333), addr(4444));

        left.sync
            .handle_message(
                right_addr,
                SyncMessage::TipAdvertisement(TipAdvertisementMessage {
                    tips: right.dag.get_tips(),
                }),
            )
            .await
            .unwrap();
        let (requested, errors) = pump(&mut left, left_addr, &mut right, right_addr).await;
        assert!(requested.is_empty());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn deep_gap_trips_the_depth_guard() {
        let blocks = make_chain(10);
        let config = SyncConfig { max_request_depth: 3, ..SyncConfig::default() };
        let mut behind = test_node(&blocks[..1], config.clone()).await;
        let mut ahead = test_node(&blocks, config).await;
        let (behind_addr, ahead_addr) = (addr(5555), addr(6666));

        behind
            .sync
            .handle_message(
                ahead_addr,
                SyncMessage::TipAdvertisement(TipAdvertisementMessage {
                    tips: ahead.dag.get_tips(),
                }),
            )
            .await
            .unwrap();
        let (_, errors) = pump(&mut behind, behind_addr, &mut ahead, ahead_addr).await;
        assert!(matches!(errors.as_slice(), [SyncError::DepthExceeded { limit: 3, .. }]));
        assert!(matches!(
            behind.sync.peer_state(&ahead_addr).await,
            Some(PeerSyncState::Idle)
        ));
    }

    #[tokio::test]
    async fn timeout_returns_negotiator_to_idle() {
        let blocks = make_chain(3);
        let config = SyncConfig { request_timeout_secs: 0, ..SyncConfig::default() };
        let mut behind = test_node(&blocks[..1], config.clone()).await;
        let ahead = test_node(&blocks, config).await;
        let ahead_addr = addr(7777);

        behind
            .sync
            .handle_message(
                ahead_addr,
                SyncMessage::TipAdvertisement(TipAdvertisementMessage {
                    tips: ahead.dag.get_tips(),
                }),
            )
            .await
            .unwrap();
        assert!(matches!(
            behind.sync.peer_state(&ahead_addr).await,
            Some(PeerSyncState::AwaitingBlocks { .. })
        ));
        // No response arrives. The sweeper gives up on the request.
        tokio::time::sleep(Duration::from_millis(20)).await;
        behind.sync.sweep_timeouts().await;
        assert!(matches!(
            behind.sync.peer_state(&ahead_addr).await,
            Some(PeerSyncState::Idle)
        ));
        drop(behind.rx);
    }

    #[tokio::test]
    async fn stale_nonce_response_is_ignored() {
        let blocks = make_chain(3);
        let mut behind = test_node(&blocks[..1], SyncConfig::default()).await;
        let ahead = test_node(&blocks, SyncConfig::default()).await;
        let ahead_addr = addr(8888);

        behind
            .sync
            .handle_message(
                ahead_addr,
                SyncMessage::TipAdvertisement(TipAdvertisementMessage {
                    tips: ahead.dag.get_tips(),
                }),
            )
            .await
            .unwrap();
        behind
            .sync
            .handle_message(
                ahead_addr,
                SyncMessage::BlockResponse(BlockResponseMessage {
                    nonce: 0xdead_beef,
                    blocks: blocks[1..].to_vec(),
                }),
            )
            .await
            .unwrap();
        // The mismatched nonce left the in-flight request untouched.
        assert!(matches!(
            behind.sync.peer_state(&ahead_addr).await,
            Some(PeerSyncState::AwaitingBlocks { .. })
        ));
        assert_eq!(behind.dag.len(), 1);
    }
}
