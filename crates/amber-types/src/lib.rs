#![forbid(unsafe_code)]
//! Core identifiers and geometry for amberfs.
//!
//! Defines the content digest that names every blob, the newtypes used to
//! keep block addresses and node indices from mixing, the fixed on-disk
//! geometry constants, and the little-endian parse helpers shared by the
//! format and journal crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ── Geometry constants ──────────────────────────────────────────────────────

/// Filesystem block size in bytes. Every on-disk region is block-aligned.
pub const BLOCK_SIZE: u64 = 8192;

/// [`BLOCK_SIZE`] as `usize`, for buffer sizing.
pub const BLOCK_SIZE_BYTES: usize = 8192;

/// Bits tracked by one block of the allocation bitmap.
pub const BLOCK_BITS: u64 = BLOCK_SIZE * 8;

/// Size of one node record (inode or extent container) in bytes.
pub const NODE_SIZE: u64 = 64;

/// Node records per node-map block.
pub const NODES_PER_BLOCK: u64 = BLOCK_SIZE / NODE_SIZE;

/// Length of a content digest in bytes (SHA-256).
pub const DIGEST_LEN: usize = 32;

/// Merkle hash fan-out: digests per tree block.
pub const HASH_FANOUT: u64 = BLOCK_SIZE / DIGEST_LEN as u64;

/// Extents stored inline in a head inode.
pub const INLINE_MAX_EXTENTS: usize = 1;

/// Extents stored in one extent container node.
pub const CONTAINER_MAX_EXTENTS: usize = 6;

/// Hard cap on the number of extents a single blob may occupy.
pub const MAX_BLOB_EXTENTS: usize = 96;

/// A blob is stored compressed only when compression saves at least this
/// many bytes, measured against the uncompressed size.
pub const COMPRESSION_MIN_BYTES_SAVED: u64 = BLOCK_SIZE;

/// Capacity of the writeback ring in bytes.
pub const WRITE_BUFFER_BYTES: u64 = 8 * 1024 * 1024;

/// Round a byte length up to a whole number of blocks.
#[must_use]
pub fn blocks_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE)
}

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Absolute block address on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block, returning `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(BLOCK_SIZE)
    }
}

/// Index into the node map (inode table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub u32);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Digest ──────────────────────────────────────────────────────────────────

/// 32-byte content identifier: the Merkle root of a blob's contents.
///
/// Displayed as 64 lowercase hex digits, which is also the blob's name in
/// the flat root directory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub const ZERO: Self = Self([0_u8; DIGEST_LEN]);

    #[must_use]
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Parse from a byte slice; fails unless exactly [`DIGEST_LEN`] bytes.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        let arr: [u8; DIGEST_LEN] =
            bytes
                .try_into()
                .map_err(|_| ParseError::InvalidField {
                    field: "digest",
                    reason: "must be exactly 32 bytes",
                })?;
        Ok(Self(arr))
    }

    /// Render as 64 lowercase hex digits.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(DIGEST_LEN * 2);
        for byte in &self.0 {
            out.push(HEX_DIGITS[usize::from(byte >> 4)]);
            out.push(HEX_DIGITS[usize::from(byte & 0x0F)]);
        }
        out
    }
}

const HEX_DIGITS: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

impl FromStr for Digest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != DIGEST_LEN * 2 {
            return Err(ParseError::InvalidField {
                field: "digest",
                reason: "must be 64 hex digits",
            });
        }
        let mut out = [0_u8; DIGEST_LEN];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_value(pair[0]).ok_or(ParseError::InvalidField {
                field: "digest",
                reason: "non-hex digit",
            })?;
            let lo = hex_value(pair[1]).ok_or(ParseError::InvalidField {
                field: "digest",
                reason: "non-hex digit",
            })?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian slice helpers ─────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_hex_round_trip() {
        let mut bytes = [0_u8; DIGEST_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::try_from(i).unwrap().wrapping_mul(7);
        }
        let digest = Digest::from_bytes(bytes);
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Digest>().unwrap(), digest);
    }

    #[test]
    fn digest_rejects_bad_hex() {
        assert!("deadbeef".parse::<Digest>().is_err());
        assert!("zz".repeat(32).parse::<Digest>().is_err());
        let upper = "AB".repeat(32);
        // Uppercase input parses, display is lowercase.
        let digest = upper.parse::<Digest>().unwrap();
        assert_eq!(digest.to_hex(), "ab".repeat(32));
    }

    #[test]
    fn digest_slice_conversion() {
        let bytes = [0xA5_u8; DIGEST_LEN];
        let digest = Digest::try_from_slice(&bytes).unwrap();
        assert_eq!(digest.as_bytes(), &bytes);
        assert!(Digest::try_from_slice(&bytes[..31]).is_err());
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(read_le_u64(&bytes, 4).is_err());
    }

    #[test]
    fn blocks_for_bytes_rounds_up() {
        assert_eq!(blocks_for_bytes(0), 0);
        assert_eq!(blocks_for_bytes(1), 1);
        assert_eq!(blocks_for_bytes(BLOCK_SIZE), 1);
        assert_eq!(blocks_for_bytes(BLOCK_SIZE + 1), 2);
        assert_eq!(blocks_for_bytes(20_000), 3);
    }

    #[test]
    fn block_number_math() {
        assert_eq!(BlockNumber(2).to_byte_offset(), Some(2 * BLOCK_SIZE));
        assert_eq!(BlockNumber(u64::MAX).to_byte_offset(), None);
        assert_eq!(BlockNumber(1).checked_add(2), Some(BlockNumber(3)));
        assert_eq!(BlockNumber(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn geometry_relations() {
        assert_eq!(NODES_PER_BLOCK, 128);
        assert_eq!(HASH_FANOUT, 256);
        assert_eq!(BLOCK_BITS, 65_536);
    }
}
