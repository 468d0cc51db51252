#![forbid(unsafe_code)]
//! On-disk format for amberfs.
//!
//! Pure parsing and serialization — no I/O, no side effects. Covers the
//! superblock at block 0, the 64-byte node records (head inodes and extent
//! containers), packed extents, and the layout math that derives region
//! offsets from the superblock.

use amber_types::{
    ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, BlockNumber, Digest,
    NodeIndex, ParseError, BLOCK_BITS, BLOCK_SIZE, CONTAINER_MAX_EXTENTS, NODES_PER_BLOCK,
    NODE_SIZE,
};

// ── Superblock constants ────────────────────────────────────────────────────

/// First eight bytes of block 0: "amberfs\0".
pub const SUPERBLOCK_MAGIC0: u64 = u64::from_le_bytes(*b"amberfs\0");
/// Second magic word guarding against foreign images with a matching prefix.
pub const SUPERBLOCK_MAGIC1: u64 = 0x77ac_5f93_1e04_d8b6;
/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// The filesystem was unmounted cleanly.
pub const FLAG_CLEAN: u32 = 0x1;
/// Metadata regions are backed by volume-manager slices.
pub const FLAG_FVM: u32 = 0x2;

/// Serialized superblock length in bytes (the rest of block 0 is zero).
pub const SUPERBLOCK_LEN: usize = 0x68;

/// Block map region start on a slice-backed (FVM) layout, in blocks.
pub const FVM_BLOCK_MAP_START: u64 = 0x10000;
/// Node map region start on an FVM layout, in blocks.
pub const FVM_NODE_MAP_START: u64 = 0x20000;
/// Journal region start on an FVM layout, in blocks.
pub const FVM_JOURNAL_START: u64 = 0x30000;
/// Data region start on an FVM layout, in blocks.
pub const FVM_DATA_START: u64 = 0x40000;

// ── Superblock ──────────────────────────────────────────────────────────────

/// The filesystem's root record, stored at block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic0: u64,
    pub magic1: u64,
    pub version: u32,
    pub flags: u32,
    pub block_size: u32,
    pub data_block_count: u64,
    pub journal_block_count: u64,
    pub inode_count: u64,
    pub alloc_block_count: u64,
    pub alloc_inode_count: u64,
    pub slice_size: u64,
    pub vslice_count: u64,
    pub abm_slices: u32,
    pub ino_slices: u32,
    pub journal_slices: u32,
    pub dat_slices: u32,
}

impl Superblock {
    /// Build a fresh fixed-geometry superblock for mkfs.
    #[must_use]
    pub fn new_fixed(data_block_count: u64, journal_block_count: u64, inode_count: u64) -> Self {
        Self {
            magic0: SUPERBLOCK_MAGIC0,
            magic1: SUPERBLOCK_MAGIC1,
            version: FORMAT_VERSION,
            flags: FLAG_CLEAN,
            block_size: u32::try_from(BLOCK_SIZE).expect("block size fits u32"),
            data_block_count,
            journal_block_count,
            inode_count,
            alloc_block_count: 0,
            alloc_inode_count: 0,
            slice_size: 0,
            vslice_count: 0,
            abm_slices: 0,
            ino_slices: 0,
            journal_slices: 0,
            dat_slices: 0,
        }
    }

    #[must_use]
    pub fn is_fvm(&self) -> bool {
        self.flags & FLAG_FVM != 0
    }

    /// Data blocks per volume-manager slice. Zero on fixed layouts.
    #[must_use]
    pub fn blocks_per_slice(&self) -> u64 {
        if self.slice_size == 0 {
            0
        } else {
            self.slice_size / BLOCK_SIZE
        }
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(block, 0, SUPERBLOCK_LEN)?;
        let magic0 = read_le_u64(block, 0x00)?;
        if magic0 != SUPERBLOCK_MAGIC0 {
            return Err(ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC0,
                actual: magic0,
            });
        }
        let magic1 = read_le_u64(block, 0x08)?;
        if magic1 != SUPERBLOCK_MAGIC1 {
            return Err(ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC1,
                actual: magic1,
            });
        }
        Ok(Self {
            magic0,
            magic1,
            version: read_le_u32(block, 0x10)?,
            flags: read_le_u32(block, 0x14)?,
            block_size: read_le_u32(block, 0x18)?,
            data_block_count: read_le_u64(block, 0x20)?,
            journal_block_count: read_le_u64(block, 0x28)?,
            inode_count: read_le_u64(block, 0x30)?,
            alloc_block_count: read_le_u64(block, 0x38)?,
            alloc_inode_count: read_le_u64(block, 0x40)?,
            slice_size: read_le_u64(block, 0x48)?,
            vslice_count: read_le_u64(block, 0x50)?,
            abm_slices: read_le_u32(block, 0x58)?,
            ino_slices: read_le_u32(block, 0x5C)?,
            journal_slices: read_le_u32(block, 0x60)?,
            dat_slices: read_le_u32(block, 0x64)?,
        })
    }

    /// Serialize into the first [`SUPERBLOCK_LEN`] bytes of `block`.
    pub fn serialize(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if block.len() < SUPERBLOCK_LEN {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_LEN,
                offset: 0,
                actual: block.len(),
            });
        }
        block[0x00..0x08].copy_from_slice(&self.magic0.to_le_bytes());
        block[0x08..0x10].copy_from_slice(&self.magic1.to_le_bytes());
        block[0x10..0x14].copy_from_slice(&self.version.to_le_bytes());
        block[0x14..0x18].copy_from_slice(&self.flags.to_le_bytes());
        block[0x18..0x1C].copy_from_slice(&self.block_size.to_le_bytes());
        block[0x1C..0x20].copy_from_slice(&0_u32.to_le_bytes());
        block[0x20..0x28].copy_from_slice(&self.data_block_count.to_le_bytes());
        block[0x28..0x30].copy_from_slice(&self.journal_block_count.to_le_bytes());
        block[0x30..0x38].copy_from_slice(&self.inode_count.to_le_bytes());
        block[0x38..0x40].copy_from_slice(&self.alloc_block_count.to_le_bytes());
        block[0x40..0x48].copy_from_slice(&self.alloc_inode_count.to_le_bytes());
        block[0x48..0x50].copy_from_slice(&self.slice_size.to_le_bytes());
        block[0x50..0x58].copy_from_slice(&self.vslice_count.to_le_bytes());
        block[0x58..0x5C].copy_from_slice(&self.abm_slices.to_le_bytes());
        block[0x5C..0x60].copy_from_slice(&self.ino_slices.to_le_bytes());
        block[0x60..0x64].copy_from_slice(&self.journal_slices.to_le_bytes());
        block[0x64..0x68].copy_from_slice(&self.dat_slices.to_le_bytes());
        Ok(())
    }
}

// ── Layout math ─────────────────────────────────────────────────────────────

/// First block of the allocation bitmap region.
#[must_use]
pub fn block_map_start_block(sb: &Superblock) -> u64 {
    if sb.is_fvm() {
        FVM_BLOCK_MAP_START
    } else {
        1
    }
}

/// Number of blocks occupied by the allocation bitmap.
#[must_use]
pub fn block_map_blocks(sb: &Superblock) -> u64 {
    sb.data_block_count.div_ceil(BLOCK_BITS)
}

/// First block of the node map region.
#[must_use]
pub fn node_map_start_block(sb: &Superblock) -> u64 {
    if sb.is_fvm() {
        FVM_NODE_MAP_START
    } else {
        block_map_start_block(sb) + block_map_blocks(sb)
    }
}

/// Number of blocks occupied by the node map.
#[must_use]
pub fn node_map_blocks(sb: &Superblock) -> u64 {
    sb.inode_count.div_ceil(NODES_PER_BLOCK)
}

/// First block of the journal region.
#[must_use]
pub fn journal_start_block(sb: &Superblock) -> u64 {
    if sb.is_fvm() {
        FVM_JOURNAL_START
    } else {
        node_map_start_block(sb) + node_map_blocks(sb)
    }
}

/// Number of blocks in the journal region.
#[must_use]
pub fn journal_blocks(sb: &Superblock) -> u64 {
    sb.journal_block_count
}

/// First block of the data region. Extent start addresses are relative to
/// this block.
#[must_use]
pub fn data_start_block(sb: &Superblock) -> u64 {
    if sb.is_fvm() {
        FVM_DATA_START
    } else {
        journal_start_block(sb) + journal_blocks(sb)
    }
}

/// Total number of blocks the filesystem occupies on the device.
#[must_use]
pub fn total_blocks(sb: &Superblock) -> u64 {
    data_start_block(sb) + sb.data_block_count
}

/// Validate a parsed superblock against the backing device size.
///
/// Fails on magic/version/block-size mismatch, allocation counts exceeding
/// capacity, derived offsets overflowing, or regions exceeding the device.
pub fn check_superblock(sb: &Superblock, device_blocks: u64) -> Result<(), ParseError> {
    if sb.magic0 != SUPERBLOCK_MAGIC0 || sb.magic1 != SUPERBLOCK_MAGIC1 {
        return Err(ParseError::InvalidMagic {
            expected: SUPERBLOCK_MAGIC0,
            actual: sb.magic0,
        });
    }
    if sb.version != FORMAT_VERSION {
        return Err(ParseError::InvalidField {
            field: "version",
            reason: "unsupported format version",
        });
    }
    if u64::from(sb.block_size) != BLOCK_SIZE {
        return Err(ParseError::InvalidField {
            field: "block_size",
            reason: "block size mismatch",
        });
    }
    if sb.alloc_block_count > sb.data_block_count {
        return Err(ParseError::InvalidField {
            field: "alloc_block_count",
            reason: "exceeds data_block_count",
        });
    }
    if sb.alloc_inode_count > sb.inode_count {
        return Err(ParseError::InvalidField {
            field: "alloc_inode_count",
            reason: "exceeds inode_count",
        });
    }

    // Derived offsets must be strictly increasing without overflow.
    let bm_end = block_map_start_block(sb)
        .checked_add(block_map_blocks(sb))
        .ok_or(ParseError::InvalidField {
            field: "block_map",
            reason: "offset overflow",
        })?;
    let nm_end = node_map_start_block(sb)
        .checked_add(node_map_blocks(sb))
        .ok_or(ParseError::InvalidField {
            field: "node_map",
            reason: "offset overflow",
        })?;
    let jnl_end = journal_start_block(sb)
        .checked_add(journal_blocks(sb))
        .ok_or(ParseError::InvalidField {
            field: "journal",
            reason: "offset overflow",
        })?;
    let data_end = data_start_block(sb)
        .checked_add(sb.data_block_count)
        .ok_or(ParseError::InvalidField {
            field: "data",
            reason: "offset overflow",
        })?;

    if sb.is_fvm() {
        if sb.slice_size == 0 || sb.slice_size % BLOCK_SIZE != 0 {
            return Err(ParseError::InvalidField {
                field: "slice_size",
                reason: "must be a non-zero multiple of the block size",
            });
        }
        let bps = sb.blocks_per_slice();
        if block_map_blocks(sb) > u64::from(sb.abm_slices) * bps {
            return Err(ParseError::InvalidField {
                field: "abm_slices",
                reason: "block map exceeds provisioned slices",
            });
        }
        if node_map_blocks(sb) > u64::from(sb.ino_slices) * bps {
            return Err(ParseError::InvalidField {
                field: "ino_slices",
                reason: "node map exceeds provisioned slices",
            });
        }
        if journal_blocks(sb) > u64::from(sb.journal_slices) * bps {
            return Err(ParseError::InvalidField {
                field: "journal_slices",
                reason: "journal exceeds provisioned slices",
            });
        }
        if sb.data_block_count > u64::from(sb.dat_slices) * bps {
            return Err(ParseError::InvalidField {
                field: "dat_slices",
                reason: "data region exceeds provisioned slices",
            });
        }
    } else {
        if nm_end < bm_end || jnl_end < nm_end || data_end < jnl_end {
            return Err(ParseError::InvalidField {
                field: "layout",
                reason: "regions out of order",
            });
        }
        if data_end > device_blocks {
            return Err(ParseError::InvalidField {
                field: "layout",
                reason: "filesystem larger than device",
            });
        }
    }
    Ok(())
}

// ── Extents ─────────────────────────────────────────────────────────────────

const EXTENT_START_BITS: u32 = 48;
const EXTENT_START_MASK: u64 = (1 << EXTENT_START_BITS) - 1;

/// Maximum block run one extent can describe.
pub const EXTENT_MAX_LENGTH: u16 = u16::MAX;

/// A contiguous run of data blocks belonging to one blob.
///
/// `start` is relative to the data region. Packed on disk into one `u64`:
/// low 48 bits start, high 16 bits length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    start: u64,
    length: u16,
}

impl Extent {
    pub fn new(start: u64, length: u16) -> Result<Self, ParseError> {
        if start > EXTENT_START_MASK {
            return Err(ParseError::InvalidField {
                field: "extent",
                reason: "start exceeds 48 bits",
            });
        }
        Ok(Self { start, length })
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        u64::from(self.length)
    }

    /// One past the last block.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.length()
    }

    #[must_use]
    pub fn pack(&self) -> u64 {
        (u64::from(self.length) << EXTENT_START_BITS) | self.start
    }

    #[must_use]
    pub fn unpack(raw: u64) -> Self {
        Self {
            start: raw & EXTENT_START_MASK,
            // High 16 bits always fit.
            #[allow(clippy::cast_possible_truncation)]
            length: (raw >> EXTENT_START_BITS) as u16,
        }
    }
}

// ── Node records ────────────────────────────────────────────────────────────

/// Node flag: the slot holds live metadata.
pub const NODE_FLAG_ALLOCATED: u16 = 1 << 0;
/// Node flag: the slot is an extent container, not a head inode.
pub const NODE_FLAG_EXTENT_CONTAINER: u16 = 1 << 1;
/// Node flag: the blob's data region holds compressed bytes.
pub const NODE_FLAG_COMPRESSED: u16 = 1 << 2;

/// Common 8-byte header shared by head inodes and extent containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodePrelude {
    pub flags: u16,
    pub version: u16,
    pub next_node: u32,
}

impl NodePrelude {
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.flags & NODE_FLAG_ALLOCATED != 0
    }

    #[must_use]
    pub fn is_extent_container(&self) -> bool {
        self.flags & NODE_FLAG_EXTENT_CONTAINER != 0
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & NODE_FLAG_COMPRESSED != 0
    }

    fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            flags: read_le_u16(raw, 0x00)?,
            version: read_le_u16(raw, 0x02)?,
            next_node: read_le_u32(raw, 0x04)?,
        })
    }

    fn serialize(&self, raw: &mut [u8]) {
        raw[0x00..0x02].copy_from_slice(&self.flags.to_le_bytes());
        raw[0x02..0x04].copy_from_slice(&self.version.to_le_bytes());
        raw[0x04..0x08].copy_from_slice(&self.next_node.to_le_bytes());
    }
}

/// Head inode: one per blob, 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub prelude: NodePrelude,
    pub merkle_root_hash: Digest,
    pub blob_size: u64,
    pub block_count: u32,
    pub extent_count: u16,
    pub inline_extent: Extent,
}

impl Inode {
    /// Fresh unallocated inode.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            prelude: NodePrelude::default(),
            merkle_root_hash: Digest::ZERO,
            blob_size: 0,
            block_count: 0,
            extent_count: 0,
            inline_extent: Extent::unpack(0),
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(raw, 0, NODE_SIZE_BYTES)?;
        let prelude = NodePrelude::parse(raw)?;
        let hash: [u8; 32] = read_fixed(raw, 0x08)?;
        Ok(Self {
            prelude,
            merkle_root_hash: Digest::from_bytes(hash),
            blob_size: read_le_u64(raw, 0x28)?,
            block_count: read_le_u32(raw, 0x30)?,
            extent_count: read_le_u16(raw, 0x34)?,
            inline_extent: Extent::unpack(read_le_u64(raw, 0x38)?),
        })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; NODE_SIZE_BYTES] {
        let mut raw = [0_u8; NODE_SIZE_BYTES];
        self.prelude.serialize(&mut raw);
        raw[0x08..0x28].copy_from_slice(self.merkle_root_hash.as_bytes());
        raw[0x28..0x30].copy_from_slice(&self.blob_size.to_le_bytes());
        raw[0x30..0x34].copy_from_slice(&self.block_count.to_le_bytes());
        raw[0x34..0x36].copy_from_slice(&self.extent_count.to_le_bytes());
        raw[0x38..0x40].copy_from_slice(&self.inline_extent.pack().to_le_bytes());
        raw
    }
}

/// Extent container: holds overflow extents for a blob whose head is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentContainer {
    pub prelude: NodePrelude,
    pub previous_node: u32,
    pub extent_count: u16,
    pub extents: [Extent; CONTAINER_MAX_EXTENTS],
}

impl ExtentContainer {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            prelude: NodePrelude {
                flags: NODE_FLAG_ALLOCATED | NODE_FLAG_EXTENT_CONTAINER,
                version: 0,
                next_node: 0,
            },
            previous_node: 0,
            extent_count: 0,
            extents: [Extent::unpack(0); CONTAINER_MAX_EXTENTS],
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(raw, 0, NODE_SIZE_BYTES)?;
        let prelude = NodePrelude::parse(raw)?;
        if !prelude.is_extent_container() {
            return Err(ParseError::InvalidField {
                field: "node",
                reason: "not an extent container",
            });
        }
        let mut extents = [Extent::unpack(0); CONTAINER_MAX_EXTENTS];
        for (i, slot) in extents.iter_mut().enumerate() {
            *slot = Extent::unpack(read_le_u64(raw, 0x10 + i * 8)?);
        }
        Ok(Self {
            prelude,
            previous_node: read_le_u32(raw, 0x08)?,
            extent_count: read_le_u16(raw, 0x0C)?,
            extents,
        })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; NODE_SIZE_BYTES] {
        let mut raw = [0_u8; NODE_SIZE_BYTES];
        self.prelude.serialize(&mut raw);
        raw[0x08..0x0C].copy_from_slice(&self.previous_node.to_le_bytes());
        raw[0x0C..0x0E].copy_from_slice(&self.extent_count.to_le_bytes());
        for (i, extent) in self.extents.iter().enumerate() {
            let off = 0x10 + i * 8;
            raw[off..off + 8].copy_from_slice(&extent.pack().to_le_bytes());
        }
        raw
    }
}

/// [`amber_types::NODE_SIZE`] as `usize`.
pub const NODE_SIZE_BYTES: usize = NODE_SIZE as usize;

/// Node-map block holding a given node index, relative to the node map start.
#[must_use]
pub fn node_map_block_for(index: NodeIndex) -> u64 {
    u64::from(index.0) / NODES_PER_BLOCK
}

/// Absolute device block holding a given node index.
#[must_use]
pub fn node_device_block(sb: &Superblock, index: NodeIndex) -> BlockNumber {
    BlockNumber(node_map_start_block(sb) + node_map_block_for(index))
}
