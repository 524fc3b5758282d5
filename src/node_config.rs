use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Node settings, layered from defaults, an optional `meridian_node.toml`
/// next to the binary, and `NODE_*` environment overrides (e.g.
/// `NODE_DATA_DIR`, `NODE_SYNC__MAX_REQUEST_DEPTH`).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub data_dir: String,
    pub api_listen_addr: String,
    pub p2p_listen_addr: String,
    /// Peer addresses to dial at startup. Peer discovery is up to the
    /// operator; anything listed here is also re-dialed when dropped.
    pub peers: Vec<String>,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Cap on how many backward steps a catch-up walk may take before the
    /// peer is declared unusable for this round.
    pub max_request_depth: u32,
    pub max_blocks_per_request: usize,
    pub request_timeout_secs: u64,
    pub max_orphan_blocks: usize,
    pub orphan_ttl_secs: u64,
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_secs(self.orphan_ttl_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_request_depth: 512,
            max_blocks_per_request: 256,
            request_timeout_secs: 30,
            max_orphan_blocks: 10_000,
            orphan_ttl_secs: 300,
        }
    }
}

impl NodeConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("data_dir", "meridian_node_data")?
            .set_default("api_listen_addr", "0.0.0.0:3001")?
            .set_default("p2p_listen_addr", "0.0.0.0:7331")?
            .set_default("peers", Vec::<String>::new())?
            .set_default("sync.max_request_depth", 512i64)?
            .set_default("sync.max_blocks_per_request", 256i64)?
            .set_default("sync.request_timeout_secs", 30i64)?
            .set_default("sync.max_orphan_blocks", 10_000i64)?
            .set_default("sync.orphan_ttl_secs", 300i64)?
            .add_source(File::with_name("meridian_node").required(false))
            .add_source(Environment::with_prefix("NODE").separator("__"))
            .build()?
            .try_deserialize()
    }
}
