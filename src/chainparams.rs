// src/chainparams.rs

use crate::p2p::messages::{Block, MAINNET_MAGIC, PROTOCOL_VERSION};

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network_id_string: &'static str,
    pub magic: [u8; 4],
    pub protocol_version: i32,
    pub genesis_timestamp: u64,
}

pub const MAINNET_PARAMS: ChainParams = ChainParams {
    network_id_string: "mainnet",
    magic: MAINNET_MAGIC,
    protocol_version: PROTOCOL_VERSION,
    genesis_timestamp: 1_704_067_200,
};

/// The canonical genesis block every node starts from: no parents, zero
/// sender and signature, fixed timestamp, so its hash is identical across
/// all nodes.
pub fn genesis_block() -> Block {
    Block::new(
        vec![],
        vec![],
        0,
        MAINNET_PARAMS.genesis_timestamp,
        b"meridian mainnet genesis".to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_stable() {
        let a = genesis_block();
        let b = genesis_block();
        assert!(a.is_genesis());
        assert_eq!(a.get_hash(), b.get_hash());
        assert!(a.verify_signature().expect("genesis exempt from signing"));
    }
}
