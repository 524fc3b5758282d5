use crate::blockchain::block_meta::BlockMeta;
use crate::p2p::messages::{Block, Digest};
use crate::storage::{BlockStore, StoreError};
use crate::util::short_hash;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unknown block {}", short_hash(.hash))]
    UnknownBlock { hash: Digest },
    #[error("block {} references missing parent {}", short_hash(.child), short_hash(.missing))]
    MissingParent { child: Digest, missing: Digest },
    #[error("block {} has height {got}, expected {expected}", short_hash(.hash))]
    HeightMismatch { hash: Digest, expected: u64, got: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyKnown,
}

/// One row of a DAG view: the block's metadata plus its derived, mutable
/// relations at the time of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagViewRow {
    pub meta: Arc<BlockMeta>,
    pub children: Vec<Digest>,
    pub finalized: bool,
}

#[derive(Default)]
struct DagInner {
    entries: HashMap<Digest, Arc<BlockMeta>>,
    children: HashMap<Digest, BTreeSet<Digest>>,
    tips: BTreeSet<Digest>,
    finalized: HashSet<Digest>,
    latest_finalized: Option<(u64, Digest)>,
    max_height: u64,
}

/// In-memory view of the block DAG: parent/child links, tips, heights and
/// finalization status. Fully rebuildable from the block store, which is
/// what makes restart equality checks possible. One instance per node
/// process; all mutation goes through a single write lock so a block is
/// either fully linked or not present at all.
pub struct DagIndex {
    inner: RwLock<DagInner>,
}

impl std::fmt::Debug for DagIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("DagIndex")
            .field("blocks", &inner.entries.len())
            .field("tips", &inner.tips.len())
            .field("max_height", &inner.max_height)
            .finish()
    }
}

impl Default for DagIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DagIndex {
    pub fn new() -> Self {
        DagIndex { inner: RwLock::new(DagInner::default()) }
    }

    /// Replays the store into a fresh index. Blocks whose parents appear
    /// later in the log (out-of-order arrival across the network) are
    /// parked and resolved by repeated passes until a fixpoint; the loop
    /// is bounded by the number of parked blocks.
    pub fn rebuild(store: &dyn BlockStore) -> Result<Self, StoreError> {
        let index = DagIndex::new();
        let mut pending: Vec<Block> = Vec::new();
        let mut replayed = 0u64;
        for item in store.scan_all()? {
            let block = item?;
            replayed += 1;
            match index.insert(&block) {
                Ok(_) => {}
                Err(IndexError::MissingParent { .. }) => pending.push(block),
                Err(e) => log::warn!("skipping block during index rebuild: {}", e),
            }
        }
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|block| match index.insert(block) {
                Ok(_) => false,
                Err(IndexError::MissingParent { .. }) => true,
                Err(e) => {
                    log::warn!("skipping block during index rebuild: {}", e);
                    false
                }
            });
            if pending.len() == before {
                break;
            }
        }
        for block in &pending {
            log::error!(
                "block {} references parents missing from the store, leaving it unlinked",
                short_hash(&block.get_hash())
            );
        }
        log::info!(
            "rebuilt DAG index from {} stored blocks: {} linked, {} tips, max height {}",
            replayed,
            index.len(),
            index.get_tips().len(),
            index.max_height()
        );
        Ok(index)
    }

    fn validate_against(inner: &DagInner, block: &Block, hash: &Digest) -> Result<(), IndexError> {
        let expected = if block.parent_hashes.is_empty() {
            0
        } else {
            let mut max_parent = 0u64;
            for parent in &block.parent_hashes {
                match inner.entries.get(parent) {
                    Some(meta) => max_parent = max_parent.max(meta.height),
                    None => {
                        return Err(IndexError::MissingParent { child: *hash, missing: *parent })
                    }
                }
            }
            max_parent + 1
        };
        if expected != block.height {
            return Err(IndexError::HeightMismatch { hash: *hash, expected, got: block.height });
        }
        Ok(())
    }

    /// Same checks as `insert` without mutating, so callers can validate a
    /// block before persisting it.
    pub fn check_insertable(&self, block: &Block) -> Result<(), IndexError> {
        let inner = self.inner.read().unwrap();
        let hash = block.get_hash();
        if inner.entries.contains_key(&hash) {
            return Ok(());
        }
        Self::validate_against(&inner, block, &hash)
    }

    /// Registers a block and links it to its parents. All-or-nothing: on
    /// any error the index is untouched. Re-inserting a known block is a
    /// no-op.
    pub fn insert(&self, block: &Block) -> Result<InsertOutcome, IndexError> {
        let hash = block.get_hash();
        let mut inner = self.inner.write().unwrap();
        if inner.entries.contains_key(&hash) {
            return Ok(InsertOutcome::AlreadyKnown);
        }
        Self::validate_against(&inner, block, &hash)?;
        let meta = Arc::new(BlockMeta::from_block(block));
        for parent in &block.parent_hashes {
            inner.children.entry(*parent).or_default().insert(hash);
            inner.tips.remove(parent);
        }
        // A parent always precedes its children here, so a fresh block can
        // never already have registered children.
        inner.tips.insert(hash);
        inner.max_height = inner.max_height.max(meta.height);
        inner.entries.insert(hash, meta);
        Ok(InsertOutcome::Inserted)
    }

    pub fn contains(&self, hash: &Digest) -> bool {
        self.inner.read().unwrap().entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Digest) -> Option<Arc<BlockMeta>> {
        self.inner.read().unwrap().entries.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().entries.is_empty()
    }

    pub fn max_height(&self) -> u64 {
        self.inner.read().unwrap().max_height
    }

    /// Blocks without any known child, in ascending hash order.
    pub fn get_tips(&self) -> Vec<Digest> {
        self.inner.read().unwrap().tips.iter().copied().collect()
    }

    pub fn children_of(&self, hash: &Digest) -> Vec<Digest> {
        let inner = self.inner.read().unwrap();
        inner.children.get(hash).map(|c| c.iter().copied().collect()).unwrap_or_default()
    }

    pub fn is_finalized(&self, hash: &Digest) -> bool {
        self.inner.read().unwrap().finalized.contains(hash)
    }

    pub fn finalized_height(&self) -> Option<u64> {
        self.inner.read().unwrap().latest_finalized.map(|(height, _)| height)
    }

    /// Finality signal from the consensus collaborator. Marks the block
    /// and every ancestor finalized; repeat calls are no-ops. Returns how
    /// many blocks were newly finalized.
    pub fn mark_finalized(&self, hash: &Digest) -> Result<usize, IndexError> {
        let mut inner = self.inner.write().unwrap();
        let height = match inner.entries.get(hash) {
            Some(meta) => meta.height,
            None => return Err(IndexError::UnknownBlock { hash: *hash }),
        };
        let mut newly = 0usize;
        let mut worklist = vec![*hash];
        while let Some(current) = worklist.pop() {
            if inner.finalized.insert(current) {
                newly += 1;
                if let Some(meta) = inner.entries.get(&current) {
                    worklist.extend(meta.parent_hashes.iter().copied());
                }
            }
        }
        if inner.latest_finalized.map_or(true, |(h, _)| height > h) {
            inner.latest_finalized = Some((height, *hash));
        }
        if newly > 0 {
            log::info!(
                "finalized block {} plus {} ancestor(s)",
                short_hash(hash),
                newly - 1
            );
        }
        Ok(newly)
    }

    /// The main-parent path from genesis to the highest finalized block,
    /// ascending. Every block on it is finalized by prefix closure.
    pub fn get_finalized_chain(&self) -> Vec<Digest> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        let mut cursor = inner.latest_finalized.map(|(_, hash)| hash);
        while let Some(hash) = cursor {
            out.push(hash);
            cursor = inner.entries.get(&hash).and_then(|meta| meta.parent_hashes.first().copied());
        }
        out.reverse();
        out
    }

    /// Ancestors of a block ordered by height descending, hash ascending
    /// within a height, at most `limit` entries.
    pub fn ancestors_of(&self, hash: &Digest, limit: usize) -> Result<Vec<Digest>, IndexError> {
        let inner = self.inner.read().unwrap();
        let start = inner
            .entries
            .get(hash)
            .ok_or(IndexError::UnknownBlock { hash: *hash })?;
        let mut frontier: BTreeSet<(u64, Digest)> = BTreeSet::new();
        let mut seen: HashSet<Digest> = HashSet::new();
        for parent in &start.parent_hashes {
            if let Some(meta) = inner.entries.get(parent) {
                if seen.insert(*parent) {
                    frontier.insert((meta.height, *parent));
                }
            }
        }
        let mut out = Vec::new();
        while out.len() < limit {
            let entry = match frontier.iter().next_back() {
                Some(&(max_height, _)) => {
                    // Within the highest height, take the smallest hash.
                    *frontier
                        .range((max_height, [0u8; 32])..)
                        .next()
                        .expect("frontier range is non-empty at its own max height")
                }
                None => break,
            };
            frontier.remove(&entry);
            let (_, digest) = entry;
            out.push(digest);
            if let Some(meta) = inner.entries.get(&digest) {
                for parent in &meta.parent_hashes {
                    if let Some(parent_meta) = inner.entries.get(parent) {
                        if seen.insert(*parent) {
                            frontier.insert((parent_meta.height, *parent));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Descendants of a block ordered by height ascending, hash ascending
    /// within a height, at most `limit` entries.
    pub fn descendants_of(&self, hash: &Digest, limit: usize) -> Result<Vec<Digest>, IndexError> {
        let inner = self.inner.read().unwrap();
        if !inner.entries.contains_key(hash) {
            return Err(IndexError::UnknownBlock { hash: *hash });
        }
        let mut frontier: BTreeSet<(u64, Digest)> = BTreeSet::new();
        let mut seen: HashSet<Digest> = HashSet::new();
        let extend = |frontier: &mut BTreeSet<(u64, Digest)>,
                          seen: &mut HashSet<Digest>,
                          of: &Digest| {
            if let Some(children) = inner.children.get(of) {
                for child in children {
                    if let Some(meta) = inner.entries.get(child) {
                        if seen.insert(*child) {
                            frontier.insert((meta.height, *child));
                        }
                    }
                }
            }
        };
        extend(&mut frontier, &mut seen, hash);
        let mut out = Vec::new();
        while out.len() < limit {
            let entry = match frontier.iter().next() {
                Some(&e) => e,
                None => break,
            };
            frontier.remove(&entry);
            let (_, digest) = entry;
            out.push(digest);
            extend(&mut frontier, &mut seen, &digest);
        }
        Ok(out)
    }

    /// The slice of the DAG within `depth` heights of the maximum known
    /// height, ordered by height descending then hash ascending. This is
    /// the backing data for every operator view, so its order must be a
    /// total one.
    pub fn view_slice(&self, depth: u64) -> Vec<DagViewRow> {
        let inner = self.inner.read().unwrap();
        if depth == 0 || inner.entries.is_empty() {
            return Vec::new();
        }
        let min_height = inner.max_height.saturating_sub(depth - 1);
        let mut metas: Vec<Arc<BlockMeta>> = inner
            .entries
            .values()
            .filter(|meta| meta.height >= min_height)
            .cloned()
            .collect();
        metas.sort_by(|a, b| b.height.cmp(&a.height).then(a.hash.cmp(&b.hash)));
        metas
            .into_iter()
            .map(|meta| {
                let children = inner
                    .children
                    .get(&meta.hash)
                    .map(|c| c.iter().copied().collect())
                    .unwrap_or_default();
                let finalized = inner.finalized.contains(&meta.hash);
                DagViewRow { meta, children, finalized }
            })
            .collect()
    }
}
