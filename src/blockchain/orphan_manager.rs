use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;

use crate::blockchain::dag_index::{DagIndex, IndexError};
use crate::p2p::messages::{Block, Digest};
use crate::storage::{BlockStore, StoreError};
use crate::util::short_hash;
use log::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("invalid signature on block {}", short_hash(.hash))]
    BadSignature { hash: Digest },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("orphan pool full ({limit} blocks)")]
    PoolFull { limit: usize },
}

/// What happened to a block handed to `add_block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Persisted and linked; `released` orphans became linkable as a result.
    Accepted { released: usize },
    AlreadyKnown,
    /// Parked until the listed parents arrive.
    Parked { missing: Vec<Digest> },
}

struct OrphanBlock {
    block: Block,
    received_at: Instant,
}

/// Single ingress point for blocks, local or from sync. Blocks whose
/// parents are all linked are validated, persisted and registered in one
/// step; blocks with missing parents wait here until the last missing
/// parent lands. Orphans never touch the store or the index, so a timed
/// out sync leaves no half-linked state behind.
pub struct OrphanManager {
    // Map from block hash to the parked block.
    orphans: TokioMutex<HashMap<Digest, OrphanBlock>>,
    // Map from missing parent hash to the orphans waiting for it.
    waiting_on: TokioMutex<HashMap<Digest, Vec<Digest>>>,
    dag: Arc<DagIndex>,
    store: Arc<dyn BlockStore>,
    max_orphans: usize,
    orphan_ttl: Duration,
}

impl OrphanManager {
    pub fn new(
        dag: Arc<DagIndex>,
        store: Arc<dyn BlockStore>,
        max_orphans: usize,
        orphan_ttl: Duration,
    ) -> Self {
        OrphanManager {
            orphans: TokioMutex::new(HashMap::new()),
            waiting_on: TokioMutex::new(HashMap::new()),
            dag,
            store,
            max_orphans,
            orphan_ttl,
        }
    }

    pub async fn add_block(&self, block: Block) -> Result<AddOutcome, AcceptError> {
        let block_hash = block.get_hash();

        if self.dag.contains(&block_hash) {
            debug!("block {} already linked, skipping", short_hash(&block_hash));
            return Ok(AddOutcome::AlreadyKnown);
        }

        let missing: Vec<Digest> = block
            .parent_hashes
            .iter()
            .filter(|p| !self.dag.contains(p))
            .copied()
            .collect();

        if missing.is_empty() {
            self.process_block(&block)?;
            let released = self.release_orphan_descendants(block_hash).await;
            return Ok(AddOutcome::Accepted { released });
        }

        self.park_orphan(block_hash, block, missing).await
    }

    /// Validates, persists and links a block whose parents are all known.
    /// Validation happens before the append so a bad block never reaches
    /// the log.
    fn process_block(&self, block: &Block) -> Result<(), AcceptError> {
        let block_hash = block.get_hash();
        match block.verify_signature() {
            Ok(true) => {}
            Ok(false) => return Err(AcceptError::BadSignature { hash: block_hash }),
            Err(e) => {
                warn!("unparseable signature material on block {}: {}", short_hash(&block_hash), e);
                return Err(AcceptError::BadSignature { hash: block_hash });
            }
        }
        self.dag.check_insertable(block)?;
        self.store.put(block)?;
        self.dag.insert(block)?;
        info!("accepted block {} at height {}", short_hash(&block_hash), block.height);
        Ok(())
    }

    async fn park_orphan(
        &self,
        block_hash: Digest,
        block: Block,
        missing: Vec<Digest>,
    ) -> Result<AddOutcome, AcceptError> {
        let mut orphans = self.orphans.lock().await;
        let mut waiting_on = self.waiting_on.lock().await;

        if orphans.contains_key(&block_hash) {
            return Ok(AddOutcome::Parked { missing });
        }
        if orphans.len() >= self.max_orphans {
            return Err(AcceptError::PoolFull { limit: self.max_orphans });
        }

        orphans.insert(block_hash, OrphanBlock { block, received_at: Instant::now() });
        for parent in &missing {
            waiting_on.entry(*parent).or_default().push(block_hash);
        }
        debug!(
            "parked orphan block {} waiting for {} parent(s), first {}",
            short_hash(&block_hash),
            missing.len(),
            short_hash(&missing[0])
        );
        Ok(AddOutcome::Parked { missing })
    }

    /// Releases every orphan whose last missing parent just became linked,
    /// cascading through their own descendants. An orphan that fails
    /// validation at release time is dropped rather than wedging the rest.
    async fn release_orphan_descendants(&self, parent_hash: Digest) -> usize {
        let mut released = 0usize;
        let mut ready_parents = VecDeque::new();
        ready_parents.push_back(parent_hash);

        while let Some(current) = ready_parents.pop_front() {
            let waiters = {
                let mut waiting_on = self.waiting_on.lock().await;
                waiting_on.remove(&current).unwrap_or_default()
            };

            for waiter_hash in waiters {
                let releasable = {
                    let orphans = self.orphans.lock().await;
                    match orphans.get(&waiter_hash) {
                        Some(orphan) => {
                            orphan.block.parent_hashes.iter().all(|p| self.dag.contains(p))
                        }
                        // Already released through another parent's list.
                        None => false,
                    }
                };
                if !releasable {
                    continue;
                }
                let orphan = {
                    let mut orphans = self.orphans.lock().await;
                    orphans.remove(&waiter_hash)
                };
                if let Some(orphan) = orphan {
                    match self.process_block(&orphan.block) {
                        Ok(()) => {
                            released += 1;
                            ready_parents.push_back(waiter_hash);
                            debug!(
                                "released orphan {} after parent {} arrived",
                                short_hash(&waiter_hash),
                                short_hash(&current)
                            );
                        }
                        Err(e) => {
                            warn!("dropping orphan {}: {}", short_hash(&waiter_hash), e);
                        }
                    }
                }
            }
        }
        released
    }

    /// Drops orphans that have waited longer than the TTL. Their parents
    /// may simply never arrive (a peer advertised a branch it later lost),
    /// and a future advertisement re-delivers anything still relevant.
    pub async fn sweep_stale(&self) {
        let mut orphans = self.orphans.lock().await;
        let mut waiting_on = self.waiting_on.lock().await;

        let now = Instant::now();
        let stale: Vec<Digest> = orphans
            .iter()
            .filter(|(_, o)| now.duration_since(o.received_at) > self.orphan_ttl)
            .map(|(hash, _)| *hash)
            .collect();

        for hash in stale {
            if let Some(orphan) = orphans.remove(&hash) {
                for parent in &orphan.block.parent_hashes {
                    if let Some(waiters) = waiting_on.get_mut(parent) {
                        waiters.retain(|w| w != &hash);
                        if waiters.is_empty() {
                            waiting_on.remove(parent);
                        }
                    }
                }
                warn!(
                    "dropped stale orphan {} (age {:?})",
                    short_hash(&hash),
                    now.duration_since(orphan.received_at)
                );
            }
        }
    }

    pub async fn orphan_count(&self) -> usize {
        self.orphans.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileBlockStore;
    use secp256k1::SecretKey;

    fn test_key() -> SecretKey {
        SecretKey::from_slice(&[0x17u8; 32]).expect("valid test key")
    }

    fn signed_block(parents: &[&Block], height: u64, tag: u8) -> Block {
        let mut block = Block::new(
            parents.iter().map(|p| p.get_hash()).collect(),
            vec![],
            height,
            1_700_000_000 + height,
            vec![tag],
        );
        block.sign(&test_key());
        block
    }

    fn manager(dir: &std::path::Path) -> (OrphanManager, Arc<DagIndex>, Arc<dyn BlockStore>) {
        let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(dir).unwrap());
        let dag = Arc::new(DagIndex::new());
        let mgr = OrphanManager::new(
            dag.clone(),
            store.clone(),
            100,
            Duration::from_secs(300),
        );
        (mgr, dag, store)
    }

    #[tokio::test]
    async fn accepts_in_order_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, dag, store) = manager(dir.path());
        let genesis = Block::new(vec![], vec![], 0, 1_700_000_000, vec![]);
        let child = signed_block(&[&genesis], 1, 1);

        assert_eq!(mgr.add_block(genesis.clone()).await.unwrap(), AddOutcome::Accepted { released: 0 });
        assert_eq!(mgr.add_block(child.clone()).await.unwrap(), AddOutcome::Accepted { released: 0 });
        assert_eq!(mgr.add_block(child.clone()).await.unwrap(), AddOutcome::AlreadyKnown);
        assert!(dag.contains(&child.get_hash()));
        assert!(store.contains(&child.get_hash()));
        assert_eq!(mgr.orphan_count().await, 0);
    }

    #[tokio::test]
    async fn parks_and_releases_out_of_order_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, dag, _store) = manager(dir.path());
        let genesis = Block::new(vec![], vec![], 0, 1_700_000_000, vec![]);
        let a = signed_block(&[&genesis], 1, 1);
        let b = signed_block(&[&a], 2, 2);

        match mgr.add_block(b.clone()).await.unwrap() {
            AddOutcome::Parked { missing } => assert_eq!(missing, vec![a.get_hash()]),
            other => panic!("expected Parked, got {:?}", other),
        }
        match mgr.add_block(a.clone()).await.unwrap() {
            AddOutcome::Parked { missing } => assert_eq!(missing, vec![genesis.get_hash()]),
            other => panic!("expected Parked, got {:?}", other),
        }
        assert_eq!(mgr.orphan_count().await, 2);

        // Genesis releases the whole parked lineage.
        assert_eq!(
            mgr.add_block(genesis.clone()).await.unwrap(),
            AddOutcome::Accepted { released: 2 }
        );
        assert_eq!(mgr.orphan_count().await, 0);
        assert!(dag.contains(&b.get_hash()));
        assert_eq!(dag.get_tips(), vec![b.get_hash()]);
    }

    #[tokio::test]
    async fn multi_parent_orphan_waits_for_all_parents() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, dag, _store) = manager(dir.path());
        let genesis = Block::new(vec![], vec![], 0, 1_700_000_000, vec![]);
        let a = signed_block(&[&genesis], 1, 1);
        let b = signed_block(&[&genesis], 1, 2);
        let merge = signed_block(&[&a, &b], 2, 3);

        mgr.add_block(genesis.clone()).await.unwrap();
        assert!(matches!(
            mgr.add_block(merge.clone()).await.unwrap(),
            AddOutcome::Parked { .. }
        ));
        // First parent alone is not enough.
        assert_eq!(mgr.add_block(a.clone()).await.unwrap(), AddOutcome::Accepted { released: 0 });
        assert!(!dag.contains(&merge.get_hash()));
        // Second parent releases the merge block.
        assert_eq!(mgr.add_block(b.clone()).await.unwrap(), AddOutcome::Accepted { released: 1 });
        assert!(dag.contains(&merge.get_hash()));
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, dag, store) = manager(dir.path());
        let genesis = Block::new(vec![], vec![], 0, 1_700_000_000, vec![]);
        mgr.add_block(genesis.clone()).await.unwrap();

        let mut forged = signed_block(&[&genesis], 1, 1);
        forged.body = b"forged".to_vec();
        let forged_hash = forged.get_hash();
        assert!(matches!(
            mgr.add_block(forged).await,
            Err(AcceptError::BadSignature { .. })
        ));
        // A rejected block reaches neither the store nor the index.
        assert!(!store.contains(&forged_hash));
        assert!(!dag.contains(&forged_hash));
    }

    #[tokio::test]
    async fn pool_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(dir.path()).unwrap());
        let dag = Arc::new(DagIndex::new());
        let mgr = OrphanManager::new(dag, store, 2, Duration::from_secs(300));
        let genesis = Block::new(vec![], vec![], 0, 1_700_000_000, vec![]);
        let a = signed_block(&[&genesis], 1, 1);

        for tag in 0..2u8 {
            let orphan = signed_block(&[&a], 2, tag);
            assert!(matches!(mgr.add_block(orphan).await.unwrap(), AddOutcome::Parked { .. }));
        }
        let overflow = signed_block(&[&a], 2, 0xff);
        assert!(matches!(
            mgr.add_block(overflow).await,
            Err(AcceptError::PoolFull { limit: 2 })
        ));
    }
}
