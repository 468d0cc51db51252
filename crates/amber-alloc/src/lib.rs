#![forbid(unsafe_code)]
//! Block and node allocation.
//!
//! The allocator owns the in-memory block bitmap and node map images and a
//! ledger of in-flight reservations. Reservation and allocation are
//! deliberately separate steps: a writer reserves first-fit extents and
//! nodes up front, streams its data, and commits only what it actually used
//! — compression can shrink a blob after reservation, in which case the
//! tail reservation is split off and released untouched.
//!
//! Reservations are RAII: dropping an uncommitted handle returns its range
//! to the free pool. Committing sets bits in the bitmap (or the allocated
//! flag in the node record); the reservation itself is always released on
//! drop, since the bitmap alone then excludes the range from future
//! searches.

use amber_error::{AmberError, Result};
use amber_format::{Extent, ExtentContainer, Inode, NODE_SIZE_BYTES};
use amber_types::{NodeIndex, BLOCK_SIZE_BYTES, NODES_PER_BLOCK};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace};

// ── Raw bitmap ──────────────────────────────────────────────────────────────

/// Packed bitmap, one bit per data block, LSB-first within each byte.
///
/// The byte image is what goes to disk; it is always sized to a whole
/// number of filesystem blocks so bitmap writes are block-granular.
#[derive(Debug, Clone)]
pub struct RawBitmap {
    bits: u64,
    bytes: Vec<u8>,
}

impl RawBitmap {
    /// Create an all-free bitmap covering `bits` blocks.
    #[must_use]
    pub fn new(bits: u64) -> Self {
        let mut map = Self {
            bits: 0,
            bytes: Vec::new(),
        };
        map.grow(bits);
        map
    }

    /// Rebuild from a storage image, keeping only the first `bits` bits.
    pub fn from_bytes(bytes: Vec<u8>, bits: u64) -> Result<Self> {
        if bytes.len() * 8 < usize::try_from(bits).map_err(|_| AmberError::NoMemory)? {
            return Err(AmberError::Format(
                "bitmap image shorter than bit count".to_owned(),
            ));
        }
        let mut map = Self { bits, bytes };
        map.pad_to_block();
        Ok(map)
    }

    fn pad_to_block(&mut self) {
        let rem = self.bytes.len() % BLOCK_SIZE_BYTES;
        if rem != 0 {
            self.bytes.resize(self.bytes.len() + BLOCK_SIZE_BYTES - rem, 0);
        }
    }

    /// Number of tracked bits.
    #[must_use]
    pub fn bit_count(&self) -> u64 {
        self.bits
    }

    /// Grow to track `bits` bits; new bits start free.
    pub fn grow(&mut self, bits: u64) {
        if bits < self.bits {
            return;
        }
        self.bits = bits;
        let needed = usize::try_from(bits.div_ceil(8)).expect("bitmap fits memory");
        if needed > self.bytes.len() {
            self.bytes.resize(needed, 0);
        }
        self.pad_to_block();
    }

    /// Shrink to track `bits` bits. Bits beyond the boundary are cleared so
    /// a later grow starts from free space.
    pub fn shrink(&mut self, bits: u64) {
        if bits > self.bits {
            return;
        }
        for idx in bits..self.bits {
            self.clear(idx);
        }
        self.bits = bits;
    }

    #[must_use]
    pub fn get(&self, idx: u64) -> bool {
        if idx >= self.bits {
            return false;
        }
        let byte = usize::try_from(idx / 8).expect("bitmap index fits memory");
        let bit = idx % 8;
        (self.bytes[byte] >> bit) & 1 == 1
    }

    pub fn set(&mut self, idx: u64) {
        debug_assert!(idx < self.bits);
        let byte = usize::try_from(idx / 8).expect("bitmap index fits memory");
        self.bytes[byte] |= 1 << (idx % 8);
    }

    pub fn clear(&mut self, idx: u64) {
        let byte = usize::try_from(idx / 8).expect("bitmap index fits memory");
        self.bytes[byte] &= !(1 << (idx % 8));
    }

    pub fn set_range(&mut self, start: u64, end: u64) {
        for idx in start..end {
            self.set(idx);
        }
    }

    pub fn clear_range(&mut self, start: u64, end: u64) {
        for idx in start..end {
            self.clear(idx);
        }
    }

    /// Whether every bit in `[start, end)` is set.
    #[must_use]
    pub fn all_set(&self, start: u64, end: u64) -> bool {
        (start..end).all(|idx| self.get(idx))
    }

    /// Total set bits.
    #[must_use]
    pub fn count_ones(&self) -> u64 {
        let mut total = 0_u64;
        for idx in 0..self.bits {
            if self.get(idx) {
                total += 1;
            }
        }
        total
    }

    /// First free bit at or after `from`, if any.
    #[must_use]
    pub fn find_free(&self, from: u64) -> Option<u64> {
        (from..self.bits).find(|&idx| !self.get(idx))
    }

    /// Full byte image (block-padded).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Snapshot of one bitmap block (relative to the bitmap region).
    pub fn block_bytes(&self, rel_block: u64) -> Result<Vec<u8>> {
        let start = usize::try_from(rel_block)
            .ok()
            .and_then(|b| b.checked_mul(BLOCK_SIZE_BYTES))
            .ok_or(AmberError::OutOfRange("bitmap block overflow"))?;
        let end = start
            .checked_add(BLOCK_SIZE_BYTES)
            .ok_or(AmberError::OutOfRange("bitmap block overflow"))?;
        if end > self.bytes.len() {
            return Err(AmberError::OutOfRange("bitmap block beyond image"));
        }
        Ok(self.bytes[start..end].to_vec())
    }
}

// ── Node map ────────────────────────────────────────────────────────────────

/// In-memory image of the node table: raw 64-byte records.
#[derive(Debug, Clone)]
pub struct NodeMap {
    records: Vec<u8>,
    count: u64,
}

impl NodeMap {
    /// Create an all-zero node map holding `count` records.
    #[must_use]
    pub fn new(count: u64) -> Self {
        let bytes = usize::try_from(count).expect("node count fits memory") * NODE_SIZE_BYTES;
        let mut map = Self {
            records: vec![0_u8; bytes],
            count,
        };
        map.pad_to_block();
        map
    }

    /// Rebuild from a storage image holding `count` records.
    pub fn from_bytes(records: Vec<u8>, count: u64) -> Result<Self> {
        let needed = usize::try_from(count).map_err(|_| AmberError::NoMemory)? * NODE_SIZE_BYTES;
        if records.len() < needed {
            return Err(AmberError::Format(
                "node map image shorter than node count".to_owned(),
            ));
        }
        let mut map = Self { records, count };
        map.pad_to_block();
        Ok(map)
    }

    fn pad_to_block(&mut self) {
        let rem = self.records.len() % BLOCK_SIZE_BYTES;
        if rem != 0 {
            self.records
                .resize(self.records.len() + BLOCK_SIZE_BYTES - rem, 0);
        }
    }

    #[must_use]
    pub fn node_count(&self) -> u64 {
        self.count
    }

    /// Grow to hold `count` records; new records start unallocated.
    pub fn grow(&mut self, count: u64) {
        if count < self.count {
            return;
        }
        self.count = count;
        let needed = usize::try_from(count).expect("node count fits memory") * NODE_SIZE_BYTES;
        if needed > self.records.len() {
            self.records.resize(needed, 0);
        }
        self.pad_to_block();
    }

    fn record_range(&self, index: NodeIndex) -> Result<std::ops::Range<usize>> {
        if u64::from(index.0) >= self.count {
            return Err(AmberError::OutOfRange("node index beyond node map"));
        }
        let start = usize::try_from(index.0).expect("u32 fits usize") * NODE_SIZE_BYTES;
        Ok(start..start + NODE_SIZE_BYTES)
    }

    pub fn raw(&self, index: NodeIndex) -> Result<&[u8]> {
        let range = self.record_range(index)?;
        Ok(&self.records[range])
    }

    /// Parse the record at `index` as a head inode.
    pub fn inode(&self, index: NodeIndex) -> Result<Inode> {
        Inode::parse(self.raw(index)?).map_err(|err| AmberError::Format(err.to_string()))
    }

    /// Parse the record at `index` as an extent container.
    pub fn container(&self, index: NodeIndex) -> Result<ExtentContainer> {
        ExtentContainer::parse(self.raw(index)?).map_err(|err| AmberError::Format(err.to_string()))
    }

    pub fn set_inode(&mut self, index: NodeIndex, inode: &Inode) -> Result<()> {
        let range = self.record_range(index)?;
        self.records[range].copy_from_slice(&inode.serialize());
        Ok(())
    }

    pub fn set_container(&mut self, index: NodeIndex, container: &ExtentContainer) -> Result<()> {
        let range = self.record_range(index)?;
        self.records[range].copy_from_slice(&container.serialize());
        Ok(())
    }

    /// Zero the record at `index`.
    pub fn clear(&mut self, index: NodeIndex) -> Result<()> {
        let range = self.record_range(index)?;
        self.records[range].fill(0);
        Ok(())
    }

    /// Whether the record at `index` carries the allocated flag.
    pub fn is_allocated(&self, index: NodeIndex) -> Result<bool> {
        let raw = self.raw(index)?;
        Ok(raw[0] & 1 != 0)
    }

    /// Snapshot of one node-map block (relative to the node map region).
    pub fn block_bytes(&self, rel_block: u64) -> Result<Vec<u8>> {
        let start = usize::try_from(rel_block)
            .ok()
            .and_then(|b| b.checked_mul(BLOCK_SIZE_BYTES))
            .ok_or(AmberError::OutOfRange("node map block overflow"))?;
        let end = start
            .checked_add(BLOCK_SIZE_BYTES)
            .ok_or(AmberError::OutOfRange("node map block overflow"))?;
        if end > self.records.len() {
            return Err(AmberError::OutOfRange("node map block beyond image"));
        }
        Ok(self.records[start..end].to_vec())
    }

    /// Node-map block (relative) that holds `index`.
    #[must_use]
    pub fn block_of(index: NodeIndex) -> u64 {
        u64::from(index.0) / NODES_PER_BLOCK
    }
}

// ── Reservations ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ReservationSet {
    /// Reserved block runs, keyed by start, value = length.
    block_runs: BTreeMap<u64, u64>,
    nodes: BTreeSet<u32>,
}

impl ReservationSet {
    fn overlaps(&self, start: u64, len: u64) -> bool {
        let end = start + len;
        // A run beginning before `end` may still cover `start`.
        self.block_runs
            .range(..end)
            .next_back()
            .is_some_and(|(&run_start, &run_len)| run_start + run_len > start)
    }

    /// Length of free space at `start` before the next reserved run, capped
    /// at `max`.
    fn free_span(&self, start: u64, max: u64) -> u64 {
        match self.block_runs.range(start..).next() {
            Some((&run_start, _)) => max.min(run_start - start),
            None => max,
        }
    }

    fn insert_run(&mut self, start: u64, len: u64) {
        debug_assert!(!self.overlaps(start, len));
        self.block_runs.insert(start, len);
    }

    fn remove_run(&mut self, start: u64, len: u64) {
        match self.block_runs.get(&start) {
            Some(&run_len) if run_len == len => {
                self.block_runs.remove(&start);
            }
            _ => debug_assert!(false, "releasing unknown reservation"),
        }
    }
}

/// Transient handle to reserved blocks, not yet committed to the bitmap.
///
/// Dropping the handle releases the reservation; committed blocks stay
/// allocated because the bitmap itself records them.
pub struct ReservedExtent {
    set: Arc<Mutex<ReservationSet>>,
    extent: Extent,
}

impl ReservedExtent {
    #[must_use]
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Shrink this reservation to its first `keep` blocks and return the
    /// remainder as a separate handle.
    ///
    /// Used when compression reduced the number of blocks the writer needs:
    /// the tail handle is simply dropped, returning its blocks unused.
    pub fn split_at(&mut self, keep: u16) -> Result<ReservedExtent> {
        let keep_len = u64::from(keep);
        if keep_len == 0 || keep_len >= self.extent.length() {
            return Err(AmberError::OutOfRange("split point outside extent"));
        }
        let tail_start = self.extent.start() + keep_len;
        let tail_len = self.extent.length() - keep_len;

        let head = Extent::new(self.extent.start(), keep)
            .map_err(|err| AmberError::Format(err.to_string()))?;
        let tail = Extent::new(tail_start, u16::try_from(tail_len).expect("tail fits u16"))
            .map_err(|err| AmberError::Format(err.to_string()))?;

        {
            let mut set = self.set.lock();
            set.remove_run(self.extent.start(), self.extent.length());
            set.insert_run(head.start(), head.length());
            set.insert_run(tail.start(), tail.length());
        }
        self.extent = head;
        Ok(ReservedExtent {
            set: Arc::clone(&self.set),
            extent: tail,
        })
    }
}

impl Drop for ReservedExtent {
    fn drop(&mut self) {
        self.set
            .lock()
            .remove_run(self.extent.start(), self.extent.length());
    }
}

impl std::fmt::Debug for ReservedExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedExtent")
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

/// Transient handle to a reserved node slot.
pub struct ReservedNode {
    set: Arc<Mutex<ReservationSet>>,
    index: NodeIndex,
}

impl ReservedNode {
    #[must_use]
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl Drop for ReservedNode {
    fn drop(&mut self) {
        self.set.lock().nodes.remove(&self.index.0);
    }
}

impl std::fmt::Debug for ReservedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedNode")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Owns the bitmap and node map plus the reservation ledger.
///
/// Two concurrent writers never collide: reservation searches exclude both
/// allocated bits and runs held by outstanding reservations.
pub struct Allocator {
    maps: Mutex<Maps>,
    reservations: Arc<Mutex<ReservationSet>>,
}

struct Maps {
    block_map: RawBitmap,
    node_map: NodeMap,
}

impl Allocator {
    #[must_use]
    pub fn new(block_map: RawBitmap, node_map: NodeMap) -> Self {
        Self {
            maps: Mutex::new(Maps {
                block_map,
                node_map,
            }),
            reservations: Arc::new(Mutex::new(ReservationSet::default())),
        }
    }

    /// Reserve `count` blocks as first-fit extents.
    ///
    /// Fails with `NoSpace` when free-and-unreserved space is insufficient;
    /// on failure nothing stays reserved.
    pub fn reserve_blocks(&self, count: u64) -> Result<Vec<ReservedExtent>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let maps = self.maps.lock();
        let mut set = self.reservations.lock();

        let mut picked: Vec<Extent> = Vec::new();
        let mut remaining = count;
        let mut cursor = 0_u64;
        while remaining > 0 {
            let Some(start) = Self::find_free_unreserved(&maps.block_map, &set, cursor) else {
                // Nothing staged yet; drop the picked list without touching
                // the ledger (runs are inserted below only on success).
                debug!(
                    target: "amber::alloc",
                    requested = count,
                    reserved = count - remaining,
                    "reserve_blocks out of space"
                );
                return Err(AmberError::NoSpace);
            };
            // Measure the free run: bounded by the bitmap end, the next
            // reserved run, the per-extent length cap, and what we need.
            let bound = set.free_span(start, remaining.min(u64::from(u16::MAX)));
            let mut span = 0_u64;
            while span < bound
                && start + span < maps.block_map.bit_count()
                && !maps.block_map.get(start + span)
            {
                span += 1;
            }
            if span == 0 {
                cursor = start + 1;
                continue;
            }
            let extent = Extent::new(start, u16::try_from(span).expect("span fits u16"))
                .map_err(|err| AmberError::Format(err.to_string()))?;
            picked.push(extent);
            remaining -= span;
            cursor = extent.end();
        }

        let handles = picked
            .into_iter()
            .map(|extent| {
                set.insert_run(extent.start(), extent.length());
                ReservedExtent {
                    set: Arc::clone(&self.reservations),
                    extent,
                }
            })
            .collect();
        trace!(target: "amber::alloc", blocks = count, "blocks_reserved");
        Ok(handles)
    }

    fn find_free_unreserved(map: &RawBitmap, set: &ReservationSet, from: u64) -> Option<u64> {
        let mut cursor = from;
        loop {
            let candidate = map.find_free(cursor)?;
            if set.overlaps(candidate, 1) {
                cursor = candidate + 1;
                continue;
            }
            return Some(candidate);
        }
    }

    /// Reserve `count` node slots.
    pub fn reserve_nodes(&self, count: usize) -> Result<Vec<ReservedNode>> {
        let maps = self.maps.lock();
        let mut set = self.reservations.lock();

        let mut picked = Vec::with_capacity(count);
        let mut cursor = 0_u32;
        while picked.len() < count {
            if u64::from(cursor) >= maps.node_map.node_count() {
                return Err(AmberError::NoSpace);
            }
            let index = NodeIndex(cursor);
            if !maps.node_map.is_allocated(index)? && !set.nodes.contains(&cursor) {
                picked.push(cursor);
            }
            cursor = cursor.checked_add(1).ok_or(AmberError::NoSpace)?;
        }

        let handles = picked
            .into_iter()
            .map(|index| {
                set.nodes.insert(index);
                ReservedNode {
                    set: Arc::clone(&self.reservations),
                    index: NodeIndex(index),
                }
            })
            .collect();
        trace!(target: "amber::alloc", nodes = count, "nodes_reserved");
        Ok(handles)
    }

    /// Commit a reserved extent to the bitmap.
    pub fn mark_blocks_allocated(&self, reserved: &ReservedExtent) {
        let extent = reserved.extent();
        let mut maps = self.maps.lock();
        debug_assert!(
            (extent.start()..extent.end()).all(|idx| !maps.block_map.get(idx)),
            "double commit of reserved extent"
        );
        maps.block_map.set_range(extent.start(), extent.end());
    }

    /// Commit a reserved node: set the allocated flag in its record.
    pub fn mark_inode_allocated(&self, reserved: &ReservedNode) -> Result<()> {
        let mut maps = self.maps.lock();
        let range = maps.node_map.record_range(reserved.index())?;
        maps.node_map.records[range.start] |= 1;
        Ok(())
    }

    /// Whether every block in `[start, end)` is allocated on the bitmap.
    #[must_use]
    pub fn check_blocks_allocated(&self, start: u64, end: u64) -> bool {
        self.maps.lock().block_map.all_set(start, end)
    }

    /// Clear an extent's bits.
    pub fn free_blocks(&self, extent: &Extent) {
        let mut maps = self.maps.lock();
        maps.block_map.clear_range(extent.start(), extent.end());
    }

    /// Zero a node record.
    pub fn free_node(&self, index: NodeIndex) -> Result<()> {
        self.maps.lock().node_map.clear(index)
    }

    /// Run `f` with the node map.
    pub fn with_node_map<T>(&self, f: impl FnOnce(&NodeMap) -> T) -> T {
        f(&self.maps.lock().node_map)
    }

    /// Run `f` with the node map mutably.
    pub fn with_node_map_mut<T>(&self, f: impl FnOnce(&mut NodeMap) -> T) -> T {
        f(&mut self.maps.lock().node_map)
    }

    /// Run `f` with the block bitmap.
    pub fn with_block_map<T>(&self, f: impl FnOnce(&RawBitmap) -> T) -> T {
        f(&self.maps.lock().block_map)
    }

    /// Grow the bitmap for an FVM data-region extension.
    pub fn grow_block_map(&self, bits: u64) {
        self.maps.lock().block_map.grow(bits);
    }

    /// Grow the node map for an FVM node-region extension.
    pub fn grow_node_map(&self, count: u64) {
        self.maps.lock().node_map.grow(count);
    }

    /// Replace both images from storage (mount and post-replay reload).
    pub fn reset_from_storage(&self, block_map: RawBitmap, node_map: NodeMap) {
        let mut maps = self.maps.lock();
        maps.block_map = block_map;
        maps.node_map = node_map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_format::NODE_FLAG_ALLOCATED;

    fn small_allocator(blocks: u64, nodes: u64) -> Allocator {
        Allocator::new(RawBitmap::new(blocks), NodeMap::new(nodes))
    }

    // ── Bitmap ──────────────────────────────────────────────────────────

    #[test]
    fn bitmap_set_get_clear() {
        let mut map = RawBitmap::new(100);
        assert!(!map.get(7));
        map.set(7);
        assert!(map.get(7));
        assert_eq!(map.as_bytes()[0], 0x80);
        map.clear(7);
        assert!(!map.get(7));

        map.set(8);
        assert_eq!(map.as_bytes()[1], 0x01);
    }

    #[test]
    fn bitmap_image_is_block_padded() {
        let map = RawBitmap::new(100);
        assert_eq!(map.as_bytes().len() % BLOCK_SIZE_BYTES, 0);
        assert_eq!(map.block_bytes(0).unwrap().len(), BLOCK_SIZE_BYTES);
        assert!(map.block_bytes(1).is_err());
    }

    #[test]
    fn bitmap_grow_shrink() {
        let mut map = RawBitmap::new(10);
        map.set_range(0, 10);
        map.grow(20);
        assert_eq!(map.bit_count(), 20);
        assert!(map.get(9));
        assert!(!map.get(15));

        map.set_range(15, 20);
        map.shrink(12);
        assert_eq!(map.bit_count(), 12);
        map.grow(20);
        // Bits cleared at shrink must come back free.
        assert!(!map.get(15));
    }

    #[test]
    fn bitmap_counts_and_ranges() {
        let mut map = RawBitmap::new(64);
        map.set_range(10, 20);
        assert_eq!(map.count_ones(), 10);
        assert!(map.all_set(10, 20));
        assert!(!map.all_set(9, 20));
        assert_eq!(map.find_free(10), Some(20));
    }

    // ── Node map ────────────────────────────────────────────────────────

    #[test]
    fn node_map_inode_round_trip() {
        let mut map = NodeMap::new(256);
        let mut inode = Inode::empty();
        inode.prelude.flags = NODE_FLAG_ALLOCATED;
        inode.blob_size = 999;
        map.set_inode(NodeIndex(3), &inode).unwrap();

        assert!(map.is_allocated(NodeIndex(3)).unwrap());
        assert_eq!(map.inode(NodeIndex(3)).unwrap().blob_size, 999);

        map.clear(NodeIndex(3)).unwrap();
        assert!(!map.is_allocated(NodeIndex(3)).unwrap());
    }

    #[test]
    fn node_map_bounds() {
        let map = NodeMap::new(4);
        assert!(map.inode(NodeIndex(4)).is_err());
        assert_eq!(NodeMap::block_of(NodeIndex(127)), 0);
        assert_eq!(NodeMap::block_of(NodeIndex(128)), 1);
    }

    // ── Reservation and commit ──────────────────────────────────────────

    #[test]
    fn reserve_commit_free_round_trip() {
        let alloc = small_allocator(64, 8);
        let extents = alloc.reserve_blocks(10).unwrap();
        assert_eq!(extents.iter().map(|e| e.extent().length()).sum::<u64>(), 10);

        for extent in &extents {
            alloc.mark_blocks_allocated(extent);
        }
        assert!(alloc.check_blocks_allocated(0, 10));
        drop(extents);

        // Committed blocks survive reservation release.
        assert!(alloc.check_blocks_allocated(0, 10));
        let extent = Extent::new(0, 10).unwrap();
        alloc.free_blocks(&extent);
        assert!(!alloc.check_blocks_allocated(0, 10));
    }

    #[test]
    fn dropped_reservation_returns_space() {
        let alloc = small_allocator(16, 4);
        let first = alloc.reserve_blocks(16).unwrap();
        assert!(matches!(
            alloc.reserve_blocks(1),
            Err(AmberError::NoSpace)
        ));
        drop(first);
        assert!(alloc.reserve_blocks(16).is_ok());
    }

    #[test]
    fn concurrent_reservations_do_not_collide() {
        let alloc = small_allocator(64, 4);
        let a = alloc.reserve_blocks(10).unwrap();
        let b = alloc.reserve_blocks(10).unwrap();

        let mut blocks: Vec<u64> = Vec::new();
        for handle in a.iter().chain(b.iter()) {
            let extent = handle.extent();
            blocks.extend(extent.start()..extent.end());
        }
        let unique: BTreeSet<u64> = blocks.iter().copied().collect();
        assert_eq!(unique.len(), blocks.len(), "overlapping reservations");
    }

    #[test]
    fn reservation_skips_allocated_runs() {
        let alloc = small_allocator(32, 4);
        let first = alloc.reserve_blocks(4).unwrap();
        for extent in &first {
            alloc.mark_blocks_allocated(extent);
        }
        drop(first);

        let next = alloc.reserve_blocks(4).unwrap();
        assert_eq!(next[0].extent().start(), 4);
    }

    #[test]
    fn split_at_releases_tail_on_drop() {
        let alloc = small_allocator(32, 4);
        let mut extents = alloc.reserve_blocks(8).unwrap();
        assert_eq!(extents.len(), 1);

        let tail = extents[0].split_at(3).unwrap();
        assert_eq!(extents[0].extent().length(), 3);
        assert_eq!(tail.extent().start(), 3);
        assert_eq!(tail.extent().length(), 5);
        drop(tail);

        // The tail's blocks are reservable again; the head's are not.
        let again = alloc.reserve_blocks(5).unwrap();
        assert_eq!(again[0].extent().start(), 3);
    }

    #[test]
    fn split_at_bounds() {
        let alloc = small_allocator(32, 4);
        let mut extents = alloc.reserve_blocks(4).unwrap();
        assert!(extents[0].split_at(0).is_err());
        assert!(extents[0].split_at(4).is_err());
    }

    #[test]
    fn node_reserve_commit() {
        let alloc = small_allocator(16, 8);
        let nodes = alloc.reserve_nodes(3).unwrap();
        assert_eq!(
            nodes.iter().map(|n| n.index().0).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        alloc.mark_inode_allocated(&nodes[1]).unwrap();
        drop(nodes);

        // Node 1 is now allocated; a new reservation skips it.
        let next = alloc.reserve_nodes(2).unwrap();
        assert_eq!(
            next.iter().map(|n| n.index().0).collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[test]
    fn node_exhaustion() {
        let alloc = small_allocator(16, 2);
        let _held = alloc.reserve_nodes(2).unwrap();
        assert!(matches!(alloc.reserve_nodes(1), Err(AmberError::NoSpace)));
    }

    #[test]
    fn extent_cap_respected_by_length_field() {
        // A reservation spanning more than u16::MAX blocks must split.
        let alloc = small_allocator(70_000 + 10, 2);
        let extents = alloc.reserve_blocks(70_000).unwrap();
        assert!(extents.len() >= 2);
        assert!(extents.iter().all(|e| e.extent().length() <= 65_535));
        assert_eq!(
            extents.iter().map(|e| e.extent().length()).sum::<u64>(),
            70_000
        );
    }
}
