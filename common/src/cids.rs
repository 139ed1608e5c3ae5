//! Content identifier helpers.
//!
//! Blocks are addressed by CIDv1 (`raw` codec, sha2-256 multihash). Archives
//! and buckets are keyed by the hex-encoded multihash of the root CID, so a
//! CIDv0 and a CIDv1 over the same bytes resolve to the same content hash.

use cid::Cid;
use cid::multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Multicodec code for raw binary blocks.
pub const RAW_CODEC: u64 = 0x55;

/// Multihash code for sha2-256.
pub const SHA2_256_CODE: u64 = 0x12;

/// Errors produced while parsing or deriving content identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CidError {
    #[error("invalid cid {input}: {reason}")]
    Invalid { input: String, reason: String },

    #[error("invalid content hash {0}")]
    InvalidHash(String),

    #[error("cannot derive a cid from an empty block")]
    EmptyBlock,
}

/// Parse a CID from its string form (base58 v0 or multibase v1).
pub fn parse_cid(input: &str) -> Result<Cid, CidError> {
    Cid::try_from(input).map_err(|e| CidError::Invalid {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a CID from its binary form.
pub fn cid_from_bytes(bytes: &[u8]) -> Result<Cid, CidError> {
    Cid::try_from(bytes).map_err(|e| CidError::Invalid {
        input: hex::encode(bytes),
        reason: e.to_string(),
    })
}

/// Compute the CID of a raw block. The identifier is bound to the bytes, so
/// a node cannot produce a matching CID for a block it does not hold.
pub fn cid_of_block(data: &[u8]) -> Result<Cid, CidError> {
    if data.is_empty() {
        return Err(CidError::EmptyBlock);
    }
    let digest = Sha256::digest(data);
    let mh = Multihash::<64>::wrap(SHA2_256_CODE, &digest).map_err(|e| CidError::Invalid {
        input: hex::encode(&digest[..]),
        reason: e.to_string(),
    })?;
    Ok(Cid::new_v1(RAW_CODEC, mh))
}

/// Hex-encoded multihash of a CID. This is the canonical archive key.
pub fn content_hash(cid: &Cid) -> String {
    hex::encode(cid.hash().to_bytes())
}

/// Parse a CID string and return its canonical content hash.
pub fn content_hash_of(input: &str) -> Result<String, CidError> {
    parse_cid(input).map(|c| content_hash(&c))
}

/// Decode a content hash back into multihash bytes.
pub fn hash_bytes(hash: &str) -> Result<Vec<u8>, CidError> {
    hex::decode(hash).map_err(|_| CidError::InvalidHash(hash.to_string()))
}

/// Two CID strings refer to the same content when their multihashes match.
/// Unparseable input never matches.
pub fn same_content(a: &str, b: &str) -> bool {
    match (parse_cid(a), parse_cid(b)) {
        (Ok(a), Ok(b)) => a.hash() == b.hash(),
        _ => false,
    }
}
