use std::io::{Cursor, Error as IoError, Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use secp256k1::{ecdsa::Signature, Message as SecpMessage, PublicKey, SecretKey};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

/// Content address of a block: double-SHA256 over its canonical encoding.
pub type Digest = [u8; 32];

pub const MAINNET_MAGIC: [u8; 4] = [0x4d, 0x52, 0x44, 0x4e];
pub const PROTOCOL_VERSION: i32 = 1;

pub const CMD_TIPS: &[u8; 12] = b"tips\0\0\0\0\0\0\0\0";
pub const CMD_GETBLOCKS: &[u8; 12] = b"getblocks\0\0\0";
pub const CMD_BLOCKS: &[u8; 12] = b"blocks\0\0\0\0\0\0";

pub const MAX_MESSAGE_SIZE: u32 = 8 * 1024 * 1024;
pub const MAX_TIPS_PER_MSG: usize = 1024;
pub const MAX_HASHES_PER_REQUEST: usize = 2048;
pub const MAX_BLOCKS_PER_MSG: usize = 512;
pub const MAX_PARENTS_PER_BLOCK: usize = 64;
pub const MAX_JUSTIFICATIONS_PER_BLOCK: usize = 256;
pub const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Decoding failure. Decoders never panic and never leave partial state
/// behind; callers get the original buffer back untouched.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record truncated")]
    Truncated,
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
    #[error("bad field: {0}")]
    BadField(String),
}

impl From<IoError> for DecodeError {
    fn from(e: IoError) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DecodeError::Truncated
        } else {
            DecodeError::BadField(e.to_string())
        }
    }
}

pub trait Encodable {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError>;
}

pub trait Decodable: Sized {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, DecodeError>;
}

pub fn sha256d(data: &[u8]) -> Digest {
    let h1 = Sha256::digest(data);
    let h2 = Sha256::digest(h1);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h2);
    out
}

/// First four bytes of the double-SHA256 of a payload. Used by both the
/// network envelope and the on-disk record framing.
pub fn checksum4(payload: &[u8]) -> [u8; 4] {
    let d = sha256d(payload);
    [d[0], d[1], d[2], d[3]]
}

pub fn write_var_int<W: Write + WriteBytesExt>(w: &mut W, n: u64) -> Result<usize, IoError> {
    if n < 0xfd {
        w.write_u8(n as u8)?;
        Ok(1)
    } else if n <= 0xffff {
        w.write_u8(0xfd)?;
        w.write_u16::<LittleEndian>(n as u16)?;
        Ok(3)
    } else if n <= 0xffff_ffff {
        w.write_u8(0xfe)?;
        w.write_u32::<LittleEndian>(n as u32)?;
        Ok(5)
    } else {
        w.write_u8(0xff)?;
        w.write_u64::<LittleEndian>(n)?;
        Ok(9)
    }
}

pub fn read_var_int<R: Read + ReadBytesExt>(r: &mut R) -> Result<u64, DecodeError> {
    Ok(match r.read_u8()? {
        0xff => r.read_u64::<LittleEndian>()?,
        0xfe => u64::from(r.read_u32::<LittleEndian>()?),
        0xfd => u64::from(r.read_u16::<LittleEndian>()?),
        n => u64::from(n),
    })
}

fn write_var_bytes<W: Write + WriteBytesExt>(w: &mut W, b: &[u8]) -> Result<usize, IoError> {
    let mut written = write_var_int(w, b.len() as u64)?;
    w.write_all(b)?;
    written += b.len();
    Ok(written)
}

fn read_var_bytes<R: Read + ReadBytesExt>(r: &mut R, max_len: usize) -> Result<Vec<u8>, DecodeError> {
    let len = read_var_int(r)?;
    if len > max_len as u64 {
        return Err(DecodeError::BadField(format!(
            "byte field length {} exceeds limit {}",
            len, max_len
        )));
    }
    let len = len as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut buf)?;
    }
    Ok(buf)
}

fn read_digest<R: Read>(r: &mut R) -> Result<Digest, DecodeError> {
    let mut d = [0u8; 32];
    r.read_exact(&mut d)?;
    Ok(d)
}

fn read_digest_list<R: Read + ReadBytesExt>(
    r: &mut R,
    max: usize,
    what: &str,
) -> Result<Vec<Digest>, DecodeError> {
    let count = read_var_int(r)?;
    if count > max as u64 {
        return Err(DecodeError::BadField(format!(
            "{} count {} exceeds limit {}",
            what, count, max
        )));
    }
    let count = count as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_digest(r)?);
    }
    Ok(out)
}

/// Envelope prefixed to every network message: magic, command tag,
/// payload length, payload checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; 12],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub const SIZE: usize = 24;

    pub fn new(command: [u8; 12], length: u32, checksum: [u8; 4]) -> Self {
        Self { magic: MAINNET_MAGIC, command, length, checksum }
    }
}

impl Encodable for MessageHeader {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_all(&self.magic)?;
        w.write_all(&self.command)?;
        w.write_u32::<LittleEndian>(self.length)?;
        w.write_all(&self.checksum)?;
        Ok(Self::SIZE)
    }
}

impl Decodable for MessageHeader {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        let mut command = [0u8; 12];
        r.read_exact(&mut command)?;
        let length = r.read_u32::<LittleEndian>()?;
        let mut checksum = [0u8; 4];
        r.read_exact(&mut checksum)?;
        Ok(Self { magic, command, length, checksum })
    }
}

/// A block as carried on the wire and in the block log. The layout is
/// identical in both contexts so a block received from a peer can be
/// persisted unchanged.
///
/// `justification_hashes` are kept in canonical form (strictly ascending,
/// no duplicates) so encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub parent_hashes: Vec<Digest>,
    pub justification_hashes: Vec<Digest>,
    pub height: u64,
    pub timestamp: u64,
    pub sender: [u8; 33],
    pub signature: [u8; 64],
    pub body: Vec<u8>,
}

impl Block {
    /// Unsigned block with justifications brought into canonical form.
    pub fn new(
        parent_hashes: Vec<Digest>,
        justification_hashes: Vec<Digest>,
        height: u64,
        timestamp: u64,
        body: Vec<u8>,
    ) -> Self {
        let mut justifications = justification_hashes;
        justifications.sort_unstable();
        justifications.dedup();
        Block {
            parent_hashes,
            justification_hashes: justifications,
            height,
            timestamp,
            sender: [0u8; 33],
            signature: [0u8; 64],
            body,
        }
    }

    fn encode_fields<W: Write + WriteBytesExt>(
        &self,
        w: &mut W,
        include_signature: bool,
    ) -> Result<usize, IoError> {
        let mut written = 0;
        written += write_var_int(w, self.parent_hashes.len() as u64)?;
        for h in &self.parent_hashes {
            w.write_all(h)?;
            written += 32;
        }
        written += write_var_int(w, self.justification_hashes.len() as u64)?;
        for h in &self.justification_hashes {
            w.write_all(h)?;
            written += 32;
        }
        w.write_u64::<LittleEndian>(self.height)?;
        written += 8;
        w.write_u64::<LittleEndian>(self.timestamp)?;
        written += 8;
        w.write_all(&self.sender)?;
        written += 33;
        if include_signature {
            w.write_all(&self.signature)?;
            written += 64;
        }
        written += write_var_bytes(w, &self.body)?;
        Ok(written)
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.consensus_encode(&mut buf).expect("encoding to memory cannot fail");
        buf
    }

    /// Block identity: double-SHA256 over the full canonical encoding,
    /// signature included.
    pub fn get_hash(&self) -> Digest {
        sha256d(&self.encode_to_vec())
    }

    /// Digest the sender signs: every field except the signature itself.
    pub fn signing_digest(&self) -> Digest {
        let mut buf = Vec::new();
        self.encode_fields(&mut buf, false).expect("encoding to memory cannot fail");
        sha256d(&buf)
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_hashes.is_empty() && self.height == 0 && self.sender == [0u8; 33]
    }

    pub fn sign(&mut self, secret_key: &SecretKey) {
        self.sender = PublicKey::from_secret_key(secp256k1::SECP256K1, secret_key).serialize();
        let message = SecpMessage::from_digest(self.signing_digest());
        self.signature =
            secp256k1::SECP256K1.sign_ecdsa(&message, secret_key).serialize_compact();
    }

    /// Checks the sender signature. Genesis blocks carry a zero sender and
    /// are exempt. `Ok(false)` means a well-formed but invalid signature;
    /// `Err` means the key or signature bytes do not even parse.
    pub fn verify_signature(&self) -> Result<bool, secp256k1::Error> {
        if self.is_genesis() {
            return Ok(true);
        }
        let public_key = PublicKey::from_slice(&self.sender)?;
        let signature = Signature::from_compact(&self.signature)?;
        let message = SecpMessage::from_digest(self.signing_digest());
        match secp256k1::SECP256K1.verify_ecdsa(&message, &signature, &public_key) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

impl Encodable for Block {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        self.encode_fields(w, true)
    }
}

impl Decodable for Block {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, DecodeError> {
        let parent_hashes = read_digest_list(r, MAX_PARENTS_PER_BLOCK, "parent hash")?;
        let justification_hashes =
            read_digest_list(r, MAX_JUSTIFICATIONS_PER_BLOCK, "justification hash")?;
        for pair in justification_hashes.windows(2) {
            if pair[0] >= pair[1] {
                return Err(DecodeError::BadField(
                    "justification hashes not in canonical order".to_string(),
                ));
            }
        }
        let height = r.read_u64::<LittleEndian>()?;
        let timestamp = r.read_u64::<LittleEndian>()?;
        let mut sender = [0u8; 33];
        r.read_exact(&mut sender)?;
        let mut signature = [0u8; 64];
        r.read_exact(&mut signature)?;
        let body = read_var_bytes(r, MAX_BODY_SIZE)?;
        Ok(Block {
            parent_hashes,
            justification_hashes,
            height,
            timestamp,
            sender,
            signature,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipAdvertisementMessage {
    pub tips: Vec<Digest>,
}

impl Encodable for TipAdvertisementMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = write_var_int(w, self.tips.len() as u64)?;
        for h in &self.tips {
            w.write_all(h)?;
            written += 32;
        }
        Ok(written)
    }
}

impl Decodable for TipAdvertisementMessage {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(Self { tips: read_digest_list(r, MAX_TIPS_PER_MSG, "tip")? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequestMessage {
    pub nonce: u64,
    pub hashes: Vec<Digest>,
}

impl Encodable for BlockRequestMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_u64::<LittleEndian>(self.nonce)?;
        let mut written = 8;
        written += write_var_int(w, self.hashes.len() as u64)?;
        for h in &self.hashes {
            w.write_all(h)?;
            written += 32;
        }
        Ok(written)
    }
}

impl Decodable for BlockRequestMessage {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, DecodeError> {
        let nonce = r.read_u64::<LittleEndian>()?;
        let hashes = read_digest_list(r, MAX_HASHES_PER_REQUEST, "requested hash")?;
        Ok(Self { nonce, hashes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResponseMessage {
    pub nonce: u64,
    pub blocks: Vec<Block>,
}

impl Encodable for BlockResponseMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_u64::<LittleEndian>(self.nonce)?;
        let mut written = 8;
        written += write_var_int(w, self.blocks.len() as u64)?;
        for b in &self.blocks {
            written += b.consensus_encode(w)?;
        }
        Ok(written)
    }
}

impl Decodable for BlockResponseMessage {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, DecodeError> {
        let nonce = r.read_u64::<LittleEndian>()?;
        let count = read_var_int(r)?;
        if count > MAX_BLOCKS_PER_MSG as u64 {
            return Err(DecodeError::BadField(format!(
                "block count {} exceeds limit {}",
                count, MAX_BLOCKS_PER_MSG
            )));
        }
        let count = count as usize;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(Block::consensus_decode(r)?);
        }
        Ok(Self { nonce, blocks })
    }
}

/// Everything peers exchange during sync, tagged by the envelope command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    TipAdvertisement(TipAdvertisementMessage),
    BlockRequest(BlockRequestMessage),
    BlockResponse(BlockResponseMessage),
}

impl SyncMessage {
    pub fn command(&self) -> [u8; 12] {
        match self {
            SyncMessage::TipAdvertisement(_) => *CMD_TIPS,
            SyncMessage::BlockRequest(_) => *CMD_GETBLOCKS,
            SyncMessage::BlockResponse(_) => *CMD_BLOCKS,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let result = match self {
            SyncMessage::TipAdvertisement(m) => m.consensus_encode(&mut buf),
            SyncMessage::BlockRequest(m) => m.consensus_encode(&mut buf),
            SyncMessage::BlockResponse(m) => m.consensus_encode(&mut buf),
        };
        result.expect("encoding to memory cannot fail");
        buf
    }

    pub fn decode_payload(command: &[u8; 12], payload: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(payload);
        let msg = match command {
            c if c == CMD_TIPS => {
                SyncMessage::TipAdvertisement(TipAdvertisementMessage::consensus_decode(&mut cursor)?)
            }
            c if c == CMD_GETBLOCKS => {
                SyncMessage::BlockRequest(BlockRequestMessage::consensus_decode(&mut cursor)?)
            }
            c if c == CMD_BLOCKS => {
                SyncMessage::BlockResponse(BlockResponseMessage::consensus_decode(&mut cursor)?)
            }
            other => {
                return Err(DecodeError::BadField(format!(
                    "unknown command {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        if cursor.position() as usize != payload.len() {
            return Err(DecodeError::BadField("trailing bytes after payload".to_string()));
        }
        Ok(msg)
    }
}

/// Full on-wire frame: envelope header followed by the payload.
pub fn frame_message(msg: &SyncMessage) -> Vec<u8> {
    let payload = msg.encode_payload();
    let header = MessageHeader::new(msg.command(), payload.len() as u32, checksum4(&payload));
    let mut out = Vec::with_capacity(MessageHeader::SIZE + payload.len());
    header.consensus_encode(&mut out).expect("encoding to memory cannot fail");
    out.extend_from_slice(&payload);
    out
}
