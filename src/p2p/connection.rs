use crate::p2p::messages::{
    frame_message, Decodable, MessageHeader, SyncMessage, MAINNET_MAGIC, MAX_MESSAGE_SIZE,
};
use crate::p2p::sync_manager::{PeerId, SyncManager};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as TokioMutex};

const REDIAL_INTERVAL_SECS: u64 = 30;

/// Reads one framed message: fixed envelope, then the checksummed payload.
pub async fn read_network_message(stream: &mut OwnedReadHalf) -> Result<SyncMessage, IoError> {
    let mut header_bytes = [0u8; MessageHeader::SIZE];
    stream.read_exact(&mut header_bytes).await?;
    let header = MessageHeader::consensus_decode(&mut Cursor::new(&header_bytes[..]))
        .map_err(|e| IoError::new(IoErrorKind::InvalidData, e.to_string()))?;
    if header.magic != MAINNET_MAGIC {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!("wrong network magic {}", hex::encode(header.magic)),
        ));
    }
    if header.length > MAX_MESSAGE_SIZE {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!("message length {} exceeds limit {}", header.length, MAX_MESSAGE_SIZE),
        ));
    }
    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await?;
    let computed = crate::p2p::messages::checksum4(&payload);
    if computed != header.checksum {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!(
                "payload checksum mismatch: header {}, computed {}",
                hex::encode(header.checksum),
                hex::encode(computed)
            ),
        ));
    }
    SyncMessage::decode_payload(&header.command, &payload)
        .map_err(|e| IoError::new(IoErrorKind::InvalidData, e.to_string()))
}

pub async fn send_message(stream: &mut OwnedWriteHalf, msg: &SyncMessage) -> Result<(), IoError> {
    let framed = frame_message(msg);
    stream.write_all(&framed).await?;
    stream.flush().await
}

/// Write halves of every live connection, keyed by peer address. The
/// outbound dispatcher is the only writer per connection, so frames are
/// never interleaved.
pub struct PeerRegistry {
    writers: TokioMutex<HashMap<PeerId, OwnedWriteHalf>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry { writers: TokioMutex::new(HashMap::new()) }
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.writers.lock().await.contains_key(peer)
    }

    async fn add(&self, peer: PeerId, writer: OwnedWriteHalf) {
        self.writers.lock().await.insert(peer, writer);
    }

    async fn remove(&self, peer: &PeerId) {
        self.writers.lock().await.remove(peer);
    }

    async fn send_to(&self, peer: &PeerId, msg: &SyncMessage) -> Result<(), IoError> {
        let mut writers = self.writers.lock().await;
        match writers.get_mut(peer) {
            Some(writer) => send_message(writer, msg).await,
            None => Err(IoError::new(
                IoErrorKind::NotConnected,
                format!("no connection to {}", peer),
            )),
        }
    }
}

/// Drains the sync manager's outbound queue onto the right sockets. A
/// failed write tears the peer down; the dialer brings configured peers
/// back later.
pub fn spawn_outbound_dispatcher(
    registry: Arc<PeerRegistry>,
    mut rx: mpsc::Receiver<(PeerId, SyncMessage)>,
    sync: Arc<SyncManager>,
) {
    tokio::spawn(async move {
        while let Some((peer, msg)) = rx.recv().await {
            if let Err(e) = registry.send_to(&peer, &msg).await {
                warn!("dropping peer {}: send failed: {}", peer, e);
                registry.remove(&peer).await;
                sync.remove_peer(peer).await;
            }
        }
        debug!("outbound dispatcher stopped: channel closed");
    });
}

async fn handle_new_peer(
    stream: TcpStream,
    peer: PeerId,
    registry: Arc<PeerRegistry>,
    sync: Arc<SyncManager>,
) {
    let (mut read_half, write_half) = stream.into_split();
    registry.add(peer, write_half).await;
    // Registration advertises our tips, which is what prompts a lagging
    // peer to start catching up.
    sync.register_peer(peer).await;

    tokio::spawn(async move {
        loop {
            match read_network_message(&mut read_half).await {
                Ok(msg) => {
                    if let Err(e) = sync.handle_message(peer, msg).await {
                        error!("sync error with {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == IoErrorKind::UnexpectedEof => {
                    info!("peer {} disconnected", peer);
                    break;
                }
                Err(e) => {
                    warn!("dropping peer {}: read failed: {}", peer, e);
                    break;
                }
            }
        }
        registry.remove(&peer).await;
        sync.remove_peer(peer).await;
    });
}

pub async fn start_listener(
    listen_addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    sync: Arc<SyncManager>,
) -> Result<(), IoError> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("listening for peers on {}", listen_addr);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("accepted connection from {}", peer);
                handle_new_peer(stream, peer, registry.clone(), sync.clone()).await;
            }
            Err(e) => warn!("failed to accept connection: {}", e),
        }
    }
}

/// Dials the configured peers and keeps re-dialing any that are not
/// currently connected.
pub fn spawn_peer_dialer(
    peers: Vec<String>,
    registry: Arc<PeerRegistry>,
    sync: Arc<SyncManager>,
) {
    if peers.is_empty() {
        info!("no peers configured, relying on inbound connections");
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(REDIAL_INTERVAL_SECS));
        loop {
            interval.tick().await;
            for peer_str in &peers {
                let peer: PeerId = match peer_str.parse() {
                    Ok(addr) => addr,
                    Err(e) => {
                        error!("invalid peer address {}: {}", peer_str, e);
                        continue;
                    }
                };
                if registry.contains(&peer).await {
                    continue;
                }
                match TcpStream::connect(peer).await {
                    Ok(stream) => {
                        info!("connected to peer {}", peer);
                        handle_new_peer(stream, peer, registry.clone(), sync.clone()).await;
                    }
                    Err(e) => debug!("could not reach peer {}: {}", peer, e),
                }
            }
        }
    });
}
