#![forbid(unsafe_code)]
//! Merkle tree construction and verification.
//!
//! A blob's identity is the root of a SHA-256 tree over its contents: one
//! digest per 8 KiB leaf (the final partial leaf zero-padded), then levels
//! of fan-out 256 up to a single root. Blobs of at most one block store no
//! tree at all — their root is the digest of the (padded) data itself, and
//! the empty blob's root is the digest of empty input.
//!
//! The stored tree layout places the leaf level first; every level is
//! padded to a block boundary; the root is never stored.

use amber_error::{AmberError, Result};
use amber_types::{blocks_for_bytes, Digest, BLOCK_SIZE, BLOCK_SIZE_BYTES, DIGEST_LEN, HASH_FANOUT};
use sha2::{Digest as _, Sha256};

/// Bytes hashed per leaf.
pub const LEAF_SIZE: u64 = BLOCK_SIZE;

/// Digest of one leaf: the chunk zero-padded to a full block.
fn hash_leaf(chunk: &[u8]) -> [u8; DIGEST_LEN] {
    debug_assert!(chunk.len() <= BLOCK_SIZE_BYTES);
    let mut hasher = Sha256::new();
    hasher.update(chunk);
    if chunk.len() < BLOCK_SIZE_BYTES {
        hasher.update(&ZERO_BLOCK[chunk.len()..]);
    }
    hasher.finalize().into()
}

static ZERO_BLOCK: [u8; BLOCK_SIZE_BYTES] = [0_u8; BLOCK_SIZE_BYTES];

/// Number of digests at the level above one holding `count` digests.
fn parent_count(count: u64) -> u64 {
    count.div_ceil(HASH_FANOUT)
}

/// Bytes a level of `count` digests occupies in the stored tree
/// (block-aligned).
fn level_bytes(count: u64) -> u64 {
    blocks_for_bytes(count * DIGEST_LEN as u64) * BLOCK_SIZE
}

/// Size in bytes of the stored tree for a blob of `data_len` bytes.
///
/// Zero when the blob fits in a single leaf: tiny blobs store no tree.
#[must_use]
pub fn tree_length(data_len: u64) -> u64 {
    if data_len <= LEAF_SIZE {
        return 0;
    }
    let mut total = 0_u64;
    let mut count = blocks_for_bytes(data_len);
    while count > 1 {
        total += level_bytes(count);
        count = parent_count(count);
    }
    total
}

/// Number of blocks the stored tree occupies.
#[must_use]
pub fn tree_blocks(data_len: u64) -> u64 {
    tree_length(data_len) / BLOCK_SIZE
}

/// Root digest of a blob small enough to have no stored tree.
#[must_use]
pub fn leaf_digest(data: &[u8]) -> Digest {
    if data.is_empty() {
        // Canonical empty-blob hash: SHA-256 of empty input.
        return Digest::from_bytes(Sha256::digest([]).into());
    }
    Digest::from_bytes(hash_leaf(data))
}

fn hash_level(digests: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        usize::try_from(parent_count((digests.len() / DIGEST_LEN) as u64)).unwrap_or(0)
            * DIGEST_LEN,
    );
    for group in digests.chunks(BLOCK_SIZE_BYTES) {
        out.extend_from_slice(&hash_leaf(group));
    }
    out
}

fn leaf_digests(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len().div_ceil(BLOCK_SIZE_BYTES) * DIGEST_LEN);
    for chunk in data.chunks(BLOCK_SIZE_BYTES) {
        out.extend_from_slice(&hash_leaf(chunk));
    }
    out
}

/// Build the tree for `data` into `tree` and return the root digest.
///
/// `tree.len()` must equal [`tree_length`] of the data length; for tiny
/// blobs that is zero and only the root is produced.
pub fn build(data: &[u8], tree: &mut [u8]) -> Result<Digest> {
    let data_len = u64::try_from(data.len())
        .map_err(|_| AmberError::Format("blob length overflows u64".to_owned()))?;
    let expected = usize::try_from(tree_length(data_len))
        .map_err(|_| AmberError::NoMemory)?;
    if tree.len() != expected {
        return Err(AmberError::Format(format!(
            "tree buffer size mismatch: got {}, need {expected}",
            tree.len()
        )));
    }

    if data_len <= LEAF_SIZE {
        return Ok(leaf_digest(data));
    }

    let mut offset = 0_usize;
    let mut level = leaf_digests(data);
    loop {
        let padded = usize::try_from(level_bytes((level.len() / DIGEST_LEN) as u64))
            .map_err(|_| AmberError::NoMemory)?;
        tree[offset..offset + level.len()].copy_from_slice(&level);
        tree[offset + level.len()..offset + padded].fill(0);
        offset += padded;

        let parents = hash_level(&tree[offset - padded..offset]);
        if parents.len() == DIGEST_LEN {
            debug_assert_eq!(offset, tree.len());
            return Ok(Digest::from_bytes(
                parents.as_slice().try_into().expect("one digest"),
            ));
        }
        level = parents;
    }
}

/// Verify that `data[offset..offset + length]` is consistent with
/// `expected` given the stored `tree`.
///
/// The whole blob is verified on first access, so `offset`/`length` are
/// bounds-checked and the entire contents are re-hashed.
pub fn verify(
    data: &[u8],
    data_len: u64,
    tree: &[u8],
    offset: u64,
    length: u64,
    expected: &Digest,
) -> Result<()> {
    if u64::try_from(data.len()).unwrap_or(u64::MAX) < data_len {
        return Err(AmberError::Format(
            "data buffer shorter than blob length".to_owned(),
        ));
    }
    let end = offset
        .checked_add(length)
        .ok_or(AmberError::OutOfRange("verify range overflow"))?;
    if end > data_len {
        return Err(AmberError::OutOfRange("verify range beyond blob"));
    }

    let data = &data[..usize::try_from(data_len).map_err(|_| AmberError::NoMemory)?];
    let expected_tree_len =
        usize::try_from(tree_length(data_len)).map_err(|_| AmberError::NoMemory)?;
    if tree.len() < expected_tree_len {
        return Err(AmberError::Format(
            "tree buffer shorter than tree length".to_owned(),
        ));
    }

    if expected_tree_len == 0 {
        let computed = leaf_digest(data);
        if computed != *expected {
            return Err(AmberError::Corruption {
                block: 0,
                detail: format!("digest mismatch: computed {computed}, expected {expected}"),
            });
        }
        return Ok(());
    }

    let mut computed_tree = vec![0_u8; expected_tree_len];
    let computed = build(data, &mut computed_tree)?;
    if computed != *expected {
        return Err(AmberError::Corruption {
            block: 0,
            detail: format!("digest mismatch: computed {computed}, expected {expected}"),
        });
    }
    if computed_tree != tree[..expected_tree_len] {
        return Err(AmberError::Corruption {
            block: 0,
            detail: "stored merkle tree does not match contents".to_owned(),
        });
    }
    Ok(())
}

/// Compute the root digest of `data` without keeping the tree.
pub fn root_digest(data: &[u8]) -> Result<Digest> {
    let data_len = u64::try_from(data.len())
        .map_err(|_| AmberError::Format("blob length overflows u64".to_owned()))?;
    let mut tree =
        vec![0_u8; usize::try_from(tree_length(data_len)).map_err(|_| AmberError::NoMemory)?];
    build(data, &mut tree)
}
