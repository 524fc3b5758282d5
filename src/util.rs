// src/util.rs

use crate::p2p::messages::Digest;

/// Abbreviated hex form of a digest for log lines and labels.
pub fn short_hash(hash: &Digest) -> String {
    hex::encode(&hash[..8])
}

/// Parses a full 64-character hex digest, e.g. from an API path segment.
pub fn parse_digest(s: &str) -> Option<Digest> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_digest_round_trips() {
        let digest = [0xabu8; 32];
        let hex_form = hex::encode(digest);
        assert_eq!(parse_digest(&hex_form), Some(digest));
    }

    #[test]
    fn parse_digest_rejects_bad_input() {
        assert_eq!(parse_digest("abcd"), None);
        assert_eq!(parse_digest(&"zz".repeat(32)), None);
    }
}
