// src/blockchain/block_meta.rs

use crate::p2p::messages::{Block, Digest};

/// Header-level facts about a registered block, kept in memory by the DAG
/// index. Derived from the stored block and always rebuildable from it;
/// the mutable parts of a block's metadata (children, finalization) live
/// in the index itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub hash: Digest,
    pub parent_hashes: Vec<Digest>,
    pub justification_hashes: Vec<Digest>,
    pub height: u64,
    pub timestamp: u64,
    pub sender: [u8; 33],
    pub body_len: u32,
}

impl BlockMeta {
    pub fn from_block(block: &Block) -> Self {
        BlockMeta {
            hash: block.get_hash(),
            parent_hashes: block.parent_hashes.clone(),
            justification_hashes: block.justification_hashes.clone(),
            height: block.height,
            timestamp: block.timestamp,
            sender: block.sender,
            body_len: block.body.len() as u32,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_hashes.is_empty() && self.height == 0
    }
}
