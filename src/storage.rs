use crate::p2p::messages::{checksum4, Block, Decodable, DecodeError, Digest};
use crate::util::short_hash;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Cursor;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

/// Per-record framing in the block log: magic, payload length, payload
/// checksum, payload. The payload is the block's canonical wire encoding.
pub const RECORD_MAGIC: [u8; 4] = [0x42, 0x4c, 0x4b, 0x01];
pub const RECORD_HEADER_SIZE: usize = 12;
const MAX_RECORD_PAYLOAD: u32 = 16 * 1024 * 1024;

pub const BLOCK_LOG_FILE: &str = "blocks.dat";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block store I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),
    #[error("corrupt block record at offset {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: DecodeError,
    },
}

/// Storage seam for the block log. Blocks are append-only and never
/// deleted; a `put` that returns `Ok` has been fsynced and survives a
/// process crash.
pub trait BlockStore: Send + Sync {
    /// Appends a block. Re-putting an already stored hash is a success
    /// no-op and never double-appends.
    fn put(&self, block: &Block) -> Result<(), StoreError>;
    /// Index lookup plus one positional read.
    fn get(&self, hash: &Digest) -> Result<Option<Block>, StoreError>;
    fn contains(&self, hash: &Digest) -> bool;
    /// Blocks in append order. Each call starts a fresh scan; used to
    /// rebuild the DAG index on startup.
    fn scan_all(&self) -> Result<Box<dyn Iterator<Item = Result<Block, StoreError>> + Send>, StoreError>;
    /// Count of durably stored blocks, readable by the metrics poller.
    fn blocks_count(&self) -> u64;
}

#[derive(Clone, Copy, Debug)]
struct RecordLocation {
    offset: u64,
    len: u32,
}

struct LogWriter {
    file: File,
    tail: u64,
}

pub struct FileBlockStore {
    log_path: PathBuf,
    writer: Mutex<LogWriter>,
    reader: File,
    index: RwLock<HashMap<Digest, RecordLocation>>,
    available: AtomicU64,
}

impl std::fmt::Debug for FileBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlockStore")
            .field("log_path", &self.log_path)
            .field("blocks", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

/// Reads and verifies one record. `DecodeError::Truncated` here means the
/// record extends past end-of-file, which a sequential scan treats as the
/// end of the log.
fn read_record_at(file: &File, offset: u64) -> Result<(Block, u32), StoreError> {
    let corrupt = |source: DecodeError| StoreError::Corrupt { offset, source };
    let mut header = [0u8; RECORD_HEADER_SIZE];
    read_exact_at(file, &mut header, offset).map_err(corrupt)?;
    if header[..4] != RECORD_MAGIC {
        return Err(corrupt(DecodeError::BadField("bad record magic".to_string())));
    }
    let payload_len = LittleEndian::read_u32(&header[4..8]);
    if payload_len > MAX_RECORD_PAYLOAD {
        return Err(corrupt(DecodeError::BadField(format!(
            "record length {} exceeds limit {}",
            payload_len, MAX_RECORD_PAYLOAD
        ))));
    }
    let mut payload = vec![0u8; payload_len as usize];
    read_exact_at(file, &mut payload, offset + RECORD_HEADER_SIZE as u64).map_err(corrupt)?;
    let computed = checksum4(&payload);
    if computed != header[8..12] {
        return Err(corrupt(DecodeError::ChecksumMismatch {
            expected: hex::encode(&header[8..12]),
            computed: hex::encode(computed),
        }));
    }
    let mut cursor = Cursor::new(&payload[..]);
    let block = Block::consensus_decode(&mut cursor).map_err(corrupt)?;
    if cursor.position() != u64::from(payload_len) {
        return Err(corrupt(DecodeError::BadField("trailing bytes in record".to_string())));
    }
    Ok((block, RECORD_HEADER_SIZE as u32 + payload_len))
}

fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<(), DecodeError> {
    match file.read_exact_at(buf, offset) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(DecodeError::Truncated),
        Err(e) => Err(DecodeError::BadField(e.to_string())),
    }
}

impl FileBlockStore {
    /// Opens (or creates) the block log under `data_dir` and rebuilds the
    /// hash-to-offset index by scanning it. A torn record at the tail is
    /// the remnant of a write that never acknowledged success; it is
    /// truncated away. Corruption anywhere earlier aborts the open.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let log_path = data_dir.join(BLOCK_LOG_FILE);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&log_path)?;
        let file_len = file.metadata()?.len();

        let mut index = HashMap::new();
        let mut offset = 0u64;
        while offset < file_len {
            match read_record_at(&file, offset) {
                Ok((block, len)) => {
                    index.insert(block.get_hash(), RecordLocation { offset, len });
                    offset += u64::from(len);
                }
                Err(StoreError::Corrupt { source: DecodeError::Truncated, .. }) => {
                    log::warn!(
                        "block log {} has a torn record at offset {}, truncating {} trailing bytes",
                        log_path.display(),
                        offset,
                        file_len - offset
                    );
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let available = index.len() as u64;
        log::info!(
            "opened block log {}: {} blocks, {} bytes",
            log_path.display(),
            available,
            offset
        );
        let reader = file.try_clone()?;
        Ok(FileBlockStore {
            log_path,
            writer: Mutex::new(LogWriter { file, tail: offset }),
            reader,
            index: RwLock::new(index),
            available: AtomicU64::new(available),
        })
    }
}

impl BlockStore for FileBlockStore {
    fn put(&self, block: &Block) -> Result<(), StoreError> {
        let hash = block.get_hash();
        if self.contains(&hash) {
            log::debug!("block {} already stored, skipping append", short_hash(&hash));
            return Ok(());
        }

        let payload = block.encode_to_vec();
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.extend_from_slice(&RECORD_MAGIC);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&checksum4(&payload));
        record.extend_from_slice(&payload);

        let mut writer = self.writer.lock().unwrap();
        // Re-check under the writer lock so two racing puts of the same
        // new block cannot both append.
        if self.index.read().unwrap().contains_key(&hash) {
            return Ok(());
        }
        writer.file.write_all_at(&record, writer.tail)?;
        writer.file.sync_data()?;
        let location = RecordLocation { offset: writer.tail, len: record.len() as u32 };
        writer.tail += u64::from(location.len);
        // Only now does the record become visible: readers either see the
        // whole durable record or nothing.
        self.index.write().unwrap().insert(hash, location);
        self.available.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "appended block {} at offset {} ({} bytes)",
            short_hash(&hash),
            location.offset,
            location.len
        );
        Ok(())
    }

    fn get(&self, hash: &Digest) -> Result<Option<Block>, StoreError> {
        let location = match self.index.read().unwrap().get(hash) {
            Some(loc) => *loc,
            None => return Ok(None),
        };
        let (block, _) = read_record_at(&self.reader, location.offset)?;
        Ok(Some(block))
    }

    fn contains(&self, hash: &Digest) -> bool {
        self.index.read().unwrap().contains_key(hash)
    }

    fn scan_all(&self) -> Result<Box<dyn Iterator<Item = Result<Block, StoreError>> + Send>, StoreError> {
        let file = File::open(&self.log_path)?;
        Ok(Box::new(ScanIter { file, offset: 0, done: false }))
    }

    fn blocks_count(&self) -> u64 {
        self.available.load(Ordering::SeqCst)
    }
}

struct ScanIter {
    file: File,
    offset: u64,
    done: bool,
}

impl Iterator for ScanIter {
    type Item = Result<Block, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record_at(&self.file, self.offset) {
            Ok((block, len)) => {
                self.offset += u64::from(len);
                Some(Ok(block))
            }
            // End of log: either a clean EOF or an in-flight append whose
            // record is not yet committed.
            Err(StoreError::Corrupt { source: DecodeError::Truncated, .. }) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
