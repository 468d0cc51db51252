#![forbid(unsafe_code)]
//! The amberfs engine.
//!
//! `Blobfs` owns the superblock image, the allocator, the vnode cache, and
//! the two write channels (journal pump and writeback queue). Clients hold
//! RAII `BlobHandle`s; dropping the last handle demotes a blob to the
//! closed cache or purges it if it was unlinked. All device I/O flows
//! through a single fifo-style block client.

pub mod cache;
pub mod fvm;
pub mod iterator;
pub mod journal;
pub mod metrics;
pub mod mkfs;
pub mod populator;
pub mod vnode;
pub mod writeback;

pub use cache::CachePolicy;
pub use fvm::{SliceRange, VolumeInfo, VolumeManager};
pub use metrics::Metrics;
pub use mkfs::{format, FormatOptions};
pub use vnode::{BlobData, BlobState, VnodeBlob};
pub use writeback::{WritebackQueue, WritebackWork};

use crate::cache::VnodeCache;
use crate::iterator::{AllocatedExtentIterator, ExtentIterator};
use crate::journal::Journal;
use amber_alloc::{Allocator, NodeMap, RawBitmap, ReservedExtent, ReservedNode};
use amber_block::{BlockClient, BlockDevice, FifoClient};
use amber_error::{AmberError, ErrorCode, Result};
use amber_format::{
    block_map_start_block, check_superblock, data_start_block, journal_start_block,
    node_map_blocks, node_map_start_block, Extent, Superblock,
};
use amber_journal::JournalRegion;
use amber_types::{BlockNumber, Digest, NodeIndex, BLOCK_BITS, BLOCK_SIZE, BLOCK_SIZE_BYTES,
    NODES_PER_BLOCK, NODE_SIZE};
use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Mount-time configuration.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Reject writes; no writeback or journal workers are started.
    pub readonly: bool,
    /// Journal metadata writes (default). When off, metadata goes straight
    /// to writeback and crash consistency is sacrificed.
    pub journal: bool,
    /// Record timing and volume counters.
    pub metrics: bool,
    /// What happens to blob buffers on last close.
    pub cache_policy: CachePolicy,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            journal: true,
            metrics: false,
            cache_policy: CachePolicy::NeverEvict,
        }
    }
}

/// Which channel a work item takes to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueType {
    /// Metadata: through the write-ahead journal when one exists.
    Journal,
    /// Blob payload: straight to the writeback queue.
    Data,
}

/// Opaque readdir position.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirCookie {
    index: u64,
}

/// Consistency report from [`Blobfs::fsck`].
#[derive(Debug, Clone, Default)]
pub struct FsckReport {
    pub blobs: u64,
    pub errors: Vec<String>,
}

impl FsckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A mounted amberfs instance.
pub struct Blobfs {
    self_ref: Weak<Blobfs>,
    device: Arc<dyn BlockDevice>,
    client: Arc<dyn BlockClient>,
    options: MountOptions,
    info: Mutex<Superblock>,
    allocator: Allocator,
    cache: VnodeCache,
    writeback: Option<Arc<WritebackQueue>>,
    journal: Option<Arc<Journal>>,
    volume: Option<Arc<dyn VolumeManager>>,
    metrics: Mutex<Metrics>,
}

impl Blobfs {
    /// Mount a formatted device: check the superblock, replay the journal,
    /// load the bitmaps and node table, build the closed cache, start the
    /// writeback and journal workers, and verify volume-manager
    /// consistency.
    pub fn mount(
        cx: &Cx,
        device: Arc<dyn BlockDevice>,
        options: MountOptions,
        volume: Option<Arc<dyn VolumeManager>>,
    ) -> Result<Arc<Self>> {
        let sb = read_superblock(cx, device.as_ref())?;
        if sb.is_fvm() && volume.is_none() {
            return Err(AmberError::Unavailable(
                "slice-backed image mounted without a volume manager".to_owned(),
            ));
        }

        // Replay must precede loading any metadata: committed entries may
        // rewrite the superblock, bitmaps, and node table.
        let replay = if options.readonly {
            None
        } else {
            let region = journal_region(&sb);
            Some(amber_journal::replay(cx, device.as_ref(), region)?)
        };

        // Re-read everything the replay may have touched.
        let sb = read_superblock(cx, device.as_ref())?;
        let block_map = load_block_map(cx, device.as_ref(), &sb)?;
        let node_map = load_node_map(cx, device.as_ref(), &sb)?;
        let allocator = Allocator::new(block_map, node_map);

        let client: Arc<dyn BlockClient> = Arc::new(FifoClient::new(Arc::clone(&device)));
        let writeback = if options.readonly {
            None
        } else {
            Some(WritebackQueue::new(
                Arc::clone(&client),
                WritebackQueue::default_capacity_blocks(),
            )?)
        };
        let journal = match (&writeback, options.journal, replay) {
            (Some(queue), true, Some(outcome)) => Some(Journal::new(
                Arc::clone(&device),
                Arc::clone(queue),
                journal_region(&sb),
                outcome.next_slot,
                outcome.next_sequence,
            )?),
            _ => None,
        };

        let fs = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            device,
            client,
            options,
            info: Mutex::new(sb),
            allocator,
            cache: VnodeCache::new(),
            writeback,
            journal,
            volume: volume.clone(),
            metrics: Mutex::new(Metrics::default()),
        });
        fs.initialize_vnodes()?;

        if let Some(volume) = &fs.volume {
            let sb = fs.info();
            fvm::check_fvm_consistency(&sb, volume.as_ref())?;
        }

        info!(
            target: "amber::fs",
            blobs = fs.info().alloc_inode_count,
            readonly = options.readonly,
            journaled = fs.journal.is_some(),
            "mounted"
        );
        Ok(fs)
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("filesystem alive")
    }

    /// Current superblock snapshot.
    #[must_use]
    pub fn info(&self) -> Superblock {
        self.info.lock().clone()
    }

    /// Metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.metrics.lock().clone()
    }

    pub(crate) fn record_metrics(&self, f: impl FnOnce(&mut Metrics)) {
        if self.options.metrics {
            f(&mut self.metrics.lock());
        }
    }

    pub(crate) fn client(&self) -> &Arc<dyn BlockClient> {
        &self.client
    }

    pub(crate) fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub(crate) fn data_start_block(&self) -> u64 {
        data_start_block(&self.info.lock())
    }

    pub(crate) fn writeback(&self) -> Result<Arc<WritebackQueue>> {
        self.writeback
            .clone()
            .ok_or(AmberError::BadState("filesystem is read-only"))
    }

    // ── Blob registry ───────────────────────────────────────────────────

    /// Create a handle for a blob that does not exist yet. The declared
    /// digest becomes the blob's name; writing content that does not hash
    /// to it fails the write.
    pub fn new_blob(&self, digest: Digest) -> Result<BlobHandle> {
        if self.options.readonly {
            return Err(AmberError::BadState("filesystem is read-only"));
        }
        if self.cache.lookup(&digest).is_some() {
            return Err(AmberError::AlreadyExists);
        }
        let fs = self.arc();
        let vnode = VnodeBlob::new_empty(&fs, digest);
        self.cache.insert_open(&vnode)?;
        vnode.inner.lock().open_count = 1;
        debug!(target: "amber::fs", digest = %digest, "blob_created");
        Ok(BlobHandle { vnode, fs })
    }

    /// Open an existing blob by digest.
    pub fn open_blob(&self, digest: Digest) -> Result<BlobHandle> {
        loop {
            let Some(vnode) = self.cache.lookup(&digest) else {
                return Err(AmberError::NotFound(digest.to_hex()));
            };
            {
                let mut inner = vnode.inner.lock();
                if inner.state == BlobState::Purged {
                    // Mid-purge entry; the map removal is imminent.
                    continue;
                }
                inner.open_count += 1;
            }
            self.record_metrics(|metrics| metrics.update_lookup(vnode.size_data()));
            return Ok(BlobHandle {
                vnode,
                fs: self.arc(),
            });
        }
    }

    /// Whether a blob with this digest exists.
    #[must_use]
    pub fn lookup_blob(&self, digest: &Digest) -> bool {
        self.cache.lookup(digest).is_some()
    }

    /// Queue a blob for deletion: it disappears from listings now and its
    /// storage is reclaimed when the last handle and clone drop.
    pub fn unlink_blob(&self, digest: &Digest) -> Result<()> {
        if self.options.readonly {
            return Err(AmberError::BadState("filesystem is read-only"));
        }
        let Some(vnode) = self.cache.lookup(digest) else {
            return Err(AmberError::NotFound(digest.to_hex()));
        };
        drop(vnode.queue_unlink());
        self.release_if_unreferenced(&vnode);
        Ok(())
    }

    pub(crate) fn close_blob(&self, vnode: &Arc<VnodeBlob>) {
        {
            let mut inner = vnode.inner.lock();
            inner.open_count = inner.open_count.saturating_sub(1);
        }
        self.release_if_unreferenced(vnode);
    }

    pub(crate) fn release_clone(&self, vnode: &Arc<VnodeBlob>) {
        {
            let mut inner = vnode.inner.lock();
            inner.clone_count = inner.clone_count.saturating_sub(1);
        }
        self.release_if_unreferenced(vnode);
    }

    fn release_if_unreferenced(&self, vnode: &Arc<VnodeBlob>) {
        enum Action {
            Keep,
            Demote,
            Purge,
        }
        let action = {
            let inner = vnode.inner.lock();
            if inner.open_count > 0 || inner.clone_count > 0 {
                Action::Keep
            } else {
                match inner.state {
                    BlobState::Readable if !inner.deletable => Action::Demote,
                    BlobState::Purged => Action::Keep,
                    _ => Action::Purge,
                }
            }
        };
        match action {
            Action::Keep => {}
            Action::Demote => {
                if self.options.cache_policy == CachePolicy::EvictImmediately {
                    vnode.tear_down(&self.arc());
                }
                self.cache.release_to_closed(Arc::clone(vnode));
            }
            Action::Purge => {
                if let Err(err) = self.purge_blob(vnode) {
                    error!(target: "amber::fs", digest = %vnode.digest(), error = %err, "purge_failed");
                }
            }
        }
    }

    /// Remove every trace of an unreferenced blob.
    fn purge_blob(&self, vnode: &Arc<VnodeBlob>) -> Result<()> {
        let (previous, map_index) = {
            let mut inner = vnode.inner.lock();
            if inner.open_count > 0 || inner.clone_count > 0 {
                return Ok(());
            }
            let previous = inner.state;
            inner.state = BlobState::Purged;
            (previous, inner.map_index)
        };

        match previous {
            BlobState::Empty | BlobState::DataWrite | BlobState::Error => {
                self.cache.remove(&vnode.digest());
                Ok(())
            }
            BlobState::Readable => {
                // The cache entry must go away even when staging the frees
                // fails; a stranded Purged entry would wedge lookups.
                let result = (|| {
                    let mut work = self.create_work()?;
                    self.free_inode(&mut work, map_index)?;
                    work.set_sync_complete();
                    self.enqueue_work(work, EnqueueType::Journal)
                })();
                self.cache.remove(&vnode.digest());
                debug!(target: "amber::fs", digest = %vnode.digest(), "blob_purged");
                result
            }
            BlobState::Purged => Ok(()),
        }
    }

    // ── Directory protocol ──────────────────────────────────────────────

    /// List up to `max` blob names (64-digit hex) from the cookie onward.
    ///
    /// One entry per allocated non-container inode, skipping blobs queued
    /// for deletion.
    pub fn readdir(&self, cookie: &mut DirCookie, max: usize) -> Result<Vec<String>> {
        let inode_count = self.info.lock().inode_count;
        let mut entries = Vec::new();
        let mut index = cookie.index;
        while index < inode_count && entries.len() < max {
            let node = NodeIndex(u32::try_from(index).map_err(|_| AmberError::NoMemory)?);
            let digest = self.allocator.with_node_map(|map| -> Result<Option<Digest>> {
                let raw = map.raw(node)?;
                let inode = amber_format::Inode::parse(raw)
                    .map_err(|err| AmberError::Format(err.to_string()))?;
                if inode.prelude.is_allocated() && !inode.prelude.is_extent_container() {
                    Ok(Some(inode.merkle_root_hash))
                } else {
                    Ok(None)
                }
            })?;
            if let Some(digest) = digest {
                if !self.cache.is_deletable(&digest) {
                    entries.push(digest.to_hex());
                }
            }
            index += 1;
        }
        cookie.index = index;
        Ok(entries)
    }

    // ── Write plumbing ──────────────────────────────────────────────────

    pub(crate) fn create_work(&self) -> Result<WritebackWork> {
        if self.writeback.is_none() {
            return Err(AmberError::BadState("filesystem is read-only"));
        }
        Ok(WritebackWork::new())
    }

    /// Route a work item: journal-type work falls through to writeback
    /// when journaling is off; data-type work fails on a read-only mount,
    /// resetting the work so callbacks fire.
    pub(crate) fn enqueue_work(&self, work: WritebackWork, kind: EnqueueType) -> Result<()> {
        if kind == EnqueueType::Journal {
            if let Some(journal) = &self.journal {
                return journal.enqueue(work);
            }
        }
        if let Some(writeback) = &self.writeback {
            return writeback.enqueue(work);
        }
        work.reset(Err(ErrorCode::BadState));
        Err(AmberError::BadState("filesystem is read-only"))
    }

    /// Commit reserved blocks and stage the bitmap and superblock writes.
    pub(crate) fn persist_blocks(&self, work: &mut WritebackWork, reserved: &ReservedExtent) {
        self.allocator.mark_blocks_allocated(reserved);
        let extent = reserved.extent();
        {
            let mut info = self.info.lock();
            info.alloc_block_count += extent.length();
        }
        self.write_bitmap(work, &extent);
        self.write_info(work);
    }

    /// Free an extent's blocks if (and only if) they are allocated.
    fn free_extent(&self, work: &mut WritebackWork, extent: &Extent) {
        if self.allocator.check_blocks_allocated(extent.start(), extent.end()) {
            self.allocator.free_blocks(extent);
            {
                let mut info = self.info.lock();
                info.alloc_block_count = info.alloc_block_count.saturating_sub(extent.length());
            }
            self.write_bitmap(work, extent);
            self.write_info(work);
        }
    }

    /// Stage a node record write. Only head inodes count toward
    /// `alloc_inode_count`; container nodes ride along uncounted.
    pub(crate) fn persist_node(&self, work: &mut WritebackWork, index: NodeIndex, is_head: bool) {
        if is_head {
            let mut info = self.info.lock();
            info.alloc_inode_count += 1;
        }
        self.write_node(work, index);
        self.write_info(work);
    }

    fn free_node_record(
        &self,
        work: &mut WritebackWork,
        index: NodeIndex,
        is_head: bool,
    ) -> Result<()> {
        self.allocator.free_node(index)?;
        if is_head {
            let mut info = self.info.lock();
            info.alloc_inode_count = info.alloc_inode_count.saturating_sub(1);
        }
        self.write_node(work, index);
        Ok(())
    }

    /// Free a blob's head inode, its container chain, and every extent.
    pub(crate) fn free_inode(&self, work: &mut WritebackWork, node_index: NodeIndex) -> Result<()> {
        let allocated = self.allocator.with_node_map(|map| map.is_allocated(node_index))?;
        if !allocated {
            return Ok(());
        }

        // Snapshot the chain before tearing it down.
        let mut iter = AllocatedExtentIterator::new(&self.allocator, node_index)?;
        self.free_node_record(work, node_index, true)?;
        let mut freed: HashSet<u32> = HashSet::from([node_index.0]);
        while let Some(extent) = iter.next_extent()? {
            let node = iter.node_index();
            if freed.insert(node.0) {
                self.free_node_record(work, node, false)?;
            }
            self.free_extent(work, &extent);
        }
        self.write_info(work);
        Ok(())
    }

    /// Stage the bitmap blocks covering `extent`.
    fn write_bitmap(&self, work: &mut WritebackWork, extent: &Extent) {
        let start_block = extent.start() / BLOCK_BITS;
        let end_block = (extent.end() - 1) / BLOCK_BITS;
        let map_start = block_map_start_block(&self.info.lock());
        for rel in start_block..=end_block {
            match self.allocator.with_block_map(|map| map.block_bytes(rel)) {
                Ok(bytes) => {
                    let _ = work.enqueue_bytes(map_start + rel, bytes);
                }
                Err(err) => {
                    error!(target: "amber::fs", error = %err, "bitmap block out of range");
                }
            }
        }
    }

    /// Stage the node-map block holding `index`.
    fn write_node(&self, work: &mut WritebackWork, index: NodeIndex) {
        let rel = NodeMap::block_of(index);
        let map_start = node_map_start_block(&self.info.lock());
        match self.allocator.with_node_map(|map| map.block_bytes(rel)) {
            Ok(bytes) => {
                let _ = work.enqueue_bytes(map_start + rel, bytes);
            }
            Err(err) => {
                error!(target: "amber::fs", error = %err, "node map block out of range");
            }
        }
    }

    /// Stage the superblock.
    fn write_info(&self, work: &mut WritebackWork) {
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        let info = self.info.lock();
        if info.serialize(&mut block).is_ok() {
            let _ = work.enqueue_bytes(0, block);
        }
    }

    // ── Reservation with volume growth ──────────────────────────────────

    pub(crate) fn reserve_blocks(&self, cx: &Cx, count: u64) -> Result<Vec<ReservedExtent>> {
        match self.allocator.reserve_blocks(count) {
            Err(AmberError::NoSpace) if self.can_grow() => {
                self.add_blocks(cx, count)?;
                self.allocator.reserve_blocks(count)
            }
            other => other,
        }
    }

    pub(crate) fn reserve_nodes(&self, cx: &Cx, count: usize) -> Result<Vec<ReservedNode>> {
        match self.allocator.reserve_nodes(count) {
            Err(AmberError::NoSpace) if self.can_grow() => {
                self.add_inodes(cx)?;
                self.allocator.reserve_nodes(count)
            }
            other => other,
        }
    }

    fn can_grow(&self) -> bool {
        self.volume.is_some() && self.info.lock().is_fvm() && !self.options.readonly
    }

    /// Extend the data region by enough slices for `nblocks` more blocks.
    fn add_blocks(&self, _cx: &Cx, nblocks: u64) -> Result<()> {
        let volume = self.volume.as_ref().ok_or(AmberError::NoSpace)?;
        let mut work = self.create_work()?;

        let (offset, length, new_blocks, old_abm_blocks, new_abm_blocks) = {
            let info = self.info.lock();
            if !info.is_fvm() {
                return Err(AmberError::NoSpace);
            }
            let bps = info.blocks_per_slice();
            let length = nblocks.div_ceil(bps);
            let offset = amber_format::FVM_DATA_START / bps + u64::from(info.dat_slices);
            let new_blocks = (u64::from(info.dat_slices) + length) * bps;
            let old_abm_blocks = info.data_block_count.div_ceil(BLOCK_BITS);
            let new_abm_blocks = new_blocks.div_ceil(BLOCK_BITS);
            if new_abm_blocks > u64::from(info.abm_slices) * bps {
                warn!(target: "amber::fs", "block bitmap region cannot hold grown data region");
                return Err(AmberError::NoSpace);
            }
            (offset, length, new_blocks, old_abm_blocks, new_abm_blocks)
        };

        volume.extend(offset, length).map_err(|_| AmberError::NoSpace)?;
        self.allocator.grow_block_map(new_blocks);
        {
            let mut info = self.info.lock();
            info.vslice_count += length;
            info.dat_slices += u32::try_from(length).map_err(|_| AmberError::NoSpace)?;
            info.data_block_count = new_blocks;
        }

        // Newly covered bitmap blocks start zeroed; persist them.
        let map_start = block_map_start_block(&self.info.lock());
        for rel in old_abm_blocks..new_abm_blocks {
            if let Ok(bytes) = self.allocator.with_block_map(|map| map.block_bytes(rel)) {
                let _ = work.enqueue_bytes(map_start + rel, bytes);
            }
        }
        self.write_info(&mut work);
        self.enqueue_work(work, EnqueueType::Journal)?;
        info!(target: "amber::fs", slices = length, blocks = new_blocks, "data_region_grown");
        Ok(())
    }

    /// Extend the node table by one slice.
    fn add_inodes(&self, _cx: &Cx) -> Result<()> {
        let volume = self.volume.as_ref().ok_or(AmberError::NoSpace)?;
        let mut work = self.create_work()?;

        let (offset, new_inodes, old_blocks, new_blocks) = {
            let info = self.info.lock();
            if !info.is_fvm() {
                return Err(AmberError::NoSpace);
            }
            let bps = info.blocks_per_slice();
            let offset = amber_format::FVM_NODE_MAP_START / bps + u64::from(info.ino_slices);
            let new_inodes = (u64::from(info.ino_slices) + 1) * (info.slice_size / NODE_SIZE);
            let old_blocks = info.inode_count.div_ceil(NODES_PER_BLOCK);
            let new_blocks = new_inodes.div_ceil(NODES_PER_BLOCK);
            (offset, new_inodes, old_blocks, new_blocks)
        };

        volume.extend(offset, 1).map_err(|_| AmberError::NoSpace)?;
        self.allocator.grow_node_map(new_inodes);
        {
            let mut info = self.info.lock();
            info.vslice_count += 1;
            info.ino_slices += 1;
            info.inode_count = new_inodes;
        }

        let map_start = node_map_start_block(&self.info.lock());
        for rel in old_blocks..new_blocks {
            if let Ok(bytes) = self.allocator.with_node_map(|map| map.block_bytes(rel)) {
                let _ = work.enqueue_bytes(map_start + rel, bytes);
            }
        }
        self.write_info(&mut work);
        self.enqueue_work(work, EnqueueType::Journal)?;
        info!(target: "amber::fs", inodes = new_inodes, "node_table_grown");
        Ok(())
    }

    // ── Mount support ───────────────────────────────────────────────────

    /// Build the closed cache from the node table.
    fn initialize_vnodes(&self) -> Result<()> {
        let fs = self.arc();
        let inode_count = self.info.lock().inode_count;
        for index in 0..inode_count {
            let node = NodeIndex(u32::try_from(index).map_err(|_| AmberError::NoMemory)?);
            let inode = self.allocator.with_node_map(|map| {
                amber_format::Inode::parse(map.raw(node)?)
                    .map_err(|err| AmberError::Format(err.to_string()))
            })?;
            if !inode.prelude.is_allocated() || inode.prelude.is_extent_container() {
                continue;
            }
            let digest = inode.merkle_root_hash;
            let vnode = VnodeBlob::new_readable(&fs, digest, node, inode);
            let size = inode.blob_size;
            if self.cache.insert_closed(vnode).is_err() {
                error!(
                    target: "amber::fs",
                    digest = %digest,
                    index,
                    "duplicate node for digest"
                );
                return Err(AmberError::Corruption {
                    block: index,
                    detail: format!("duplicate node for digest {digest}"),
                });
            }
            self.record_metrics(|metrics| metrics.update_lookup(size));
        }
        Ok(())
    }

    /// Verify one on-disk blob end to end without touching the cache.
    pub fn verify_blob(&self, cx: &Cx, node_index: NodeIndex) -> Result<()> {
        let fs = self.arc();
        let inode = self.allocator.with_node_map(|map| {
            amber_format::Inode::parse(map.raw(node_index)?)
                .map_err(|err| AmberError::Format(err.to_string()))
        })?;
        if !inode.prelude.is_allocated() || inode.prelude.is_extent_container() {
            return Err(AmberError::NotFound(format!("node {node_index}")));
        }
        let vnode = VnodeBlob::new_readable(&fs, inode.merkle_root_hash, node_index, inode);
        let mut inner = vnode.inner.lock();
        // Detached vnode: never enters the cache, reads straight from disk.
        vnode.init_vmos(cx, &fs, &mut inner)
    }

    // ── Sync and teardown ───────────────────────────────────────────────

    /// Block until everything enqueued so far is durable.
    pub fn sync(&self, _cx: &Cx) -> Result<()> {
        let mut work = self.create_work()?;
        work.set_sync_complete();
        let done = Arc::new((Mutex::new(None::<writeback::WorkStatus>), Condvar::new()));
        let signal = Arc::clone(&done);
        work.add_callback(move |status| {
            *signal.0.lock() = Some(status);
            signal.1.notify_all();
        });
        self.enqueue_work(work, EnqueueType::Journal)?;

        let mut guard = done.0.lock();
        while guard.is_none() {
            done.1.wait(&mut guard);
        }
        match guard.take().expect("status recorded") {
            Ok(()) => Ok(()),
            Err(code) => Err(AmberError::BadState(match code {
                ErrorCode::BadState => "sync failed: filesystem unavailable",
                _ => "sync failed",
            })),
        }
    }

    /// Unmount: drain both write channels, barrier-flush the device, and
    /// drop every cached vnode.
    pub fn shutdown(&self, cx: &Cx) -> Result<()> {
        if self.writeback.is_some() {
            // Outstanding work first, then stop the workers in dependency
            // order: the journal still forwards into writeback.
            let _ = self.sync(cx);
        }
        if let Some(journal) = &self.journal {
            journal.stop();
        }
        if let Some(writeback) = &self.writeback {
            writeback.stop();
        }
        self.device.sync(cx)?;
        let drained = self.cache.drain();
        drop(drained);
        info!(target: "amber::fs", "unmounted");
        Ok(())
    }

    // ── Consistency check ───────────────────────────────────────────────

    /// Cross-check the node table, extents, bitmap, and superblock
    /// counters.
    pub fn fsck(&self, _cx: &Cx) -> Result<FsckReport> {
        let info = self.info();
        let mut report = FsckReport::default();
        let mut expected = RawBitmap::new(info.data_block_count);
        let mut inode_total = 0_u64;

        for index in 0..info.inode_count {
            let node = NodeIndex(u32::try_from(index).map_err(|_| AmberError::NoMemory)?);
            let inode = self.allocator.with_node_map(|map| {
                amber_format::Inode::parse(map.raw(node)?)
                    .map_err(|err| AmberError::Format(err.to_string()))
            })?;
            if !inode.prelude.is_allocated() || inode.prelude.is_extent_container() {
                continue;
            }
            inode_total += 1;
            report.blobs += 1;

            let mut iter = AllocatedExtentIterator::new(&self.allocator, node)?;
            let mut total = 0_u64;
            while let Some(extent) = iter.next_extent()? {
                if extent.end() > info.data_block_count {
                    report
                        .errors
                        .push(format!("node {index}: extent beyond data region"));
                    continue;
                }
                for block in extent.start()..extent.end() {
                    if expected.get(block) {
                        report
                            .errors
                            .push(format!("node {index}: block {block} multiply claimed"));
                    }
                    expected.set(block);
                }
                total += extent.length();
            }
            if total != u64::from(inode.block_count) {
                report.errors.push(format!(
                    "node {index}: extents cover {total} blocks, inode claims {}",
                    inode.block_count
                ));
            }
        }

        let actual_ones = self.allocator.with_block_map(RawBitmap::count_ones);
        if actual_ones != expected.count_ones() {
            report.errors.push(format!(
                "bitmap has {actual_ones} bits set, extents claim {}",
                expected.count_ones()
            ));
        }
        if actual_ones != info.alloc_block_count {
            report.errors.push(format!(
                "superblock alloc_block_count {} != bitmap population {actual_ones}",
                info.alloc_block_count
            ));
        }
        if inode_total != info.alloc_inode_count {
            report.errors.push(format!(
                "superblock alloc_inode_count {} != head inode count {inode_total}",
                info.alloc_inode_count
            ));
        }
        Ok(report)
    }
}

impl Drop for Blobfs {
    fn drop(&mut self) {
        // Workers hold no reference back to the filesystem; stopping them
        // here guarantees they never outlive the allocator and caches.
        if let Some(journal) = &self.journal {
            journal.stop();
        }
        if let Some(writeback) = &self.writeback {
            writeback.stop();
        }
    }
}

// ── Client handle ───────────────────────────────────────────────────────────

/// RAII client handle to one blob. Dropping it closes the blob.
pub struct BlobHandle {
    vnode: Arc<VnodeBlob>,
    fs: Arc<Blobfs>,
}

impl BlobHandle {
    #[must_use]
    pub fn digest(&self) -> Digest {
        self.vnode.digest()
    }

    #[must_use]
    pub fn state(&self) -> BlobState {
        self.vnode.state()
    }

    /// Uncompressed size once readable.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.vnode.size_data()
    }

    /// Blocks the blob occupies on disk, merkle tree included.
    #[must_use]
    pub fn storage_blocks(&self) -> u64 {
        self.vnode.storage_blocks()
    }

    /// Whether the blob was stored compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.vnode.is_compressed()
    }

    /// Declare the blob's size and reserve its space.
    pub fn space_allocate(&self, cx: &Cx, size: u64) -> Result<()> {
        self.vnode.space_allocate(cx, size)
    }

    /// Stream the next run of content bytes.
    pub fn write(&self, cx: &Cx, data: &[u8]) -> Result<u64> {
        self.vnode.write_internal(cx, data)
    }

    /// Write the whole payload.
    pub fn write_all(&self, cx: &Cx, data: &[u8]) -> Result<()> {
        let mut written = 0_usize;
        while written < data.len() {
            let n = self.write(cx, &data[written..])?;
            if n == 0 {
                return Err(AmberError::BadState("write made no progress"));
            }
            written += usize::try_from(n).map_err(|_| AmberError::NoMemory)?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`.
    pub fn read_at(&self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<u64> {
        self.vnode.read_internal(cx, buf, offset)
    }

    /// A read-only data view that outlives this handle.
    pub fn clone_data(&self, cx: &Cx) -> Result<BlobData> {
        BlobData::new(cx, Arc::clone(&self.fs), Arc::clone(&self.vnode))
    }

    /// Queue this blob for deletion.
    pub fn queue_unlink(&self) -> Result<()> {
        self.fs.unlink_blob(&self.vnode.digest())
    }
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        self.fs.close_blob(&self.vnode);
    }
}

// ── Mount helpers ───────────────────────────────────────────────────────────

fn read_superblock(cx: &Cx, device: &dyn BlockDevice) -> Result<Superblock> {
    let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
    device.read_block(cx, BlockNumber(0), &mut block)?;
    let sb = Superblock::parse(&block).map_err(|err| AmberError::Corruption {
        block: 0,
        detail: format!("superblock rejected: {err}"),
    })?;
    check_superblock(&sb, device.block_count()).map_err(|err| AmberError::Corruption {
        block: 0,
        detail: format!("superblock rejected: {err}"),
    })?;
    Ok(sb)
}

fn journal_region(sb: &Superblock) -> JournalRegion {
    JournalRegion {
        start: BlockNumber(journal_start_block(sb)),
        blocks: sb.journal_block_count,
    }
}

fn load_block_map(cx: &Cx, device: &dyn BlockDevice, sb: &Superblock) -> Result<RawBitmap> {
    let blocks = amber_format::block_map_blocks(sb);
    let start = block_map_start_block(sb);
    let mut bytes = vec![0_u8; usize::try_from(blocks * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?];
    for rel in 0..blocks {
        let offset = usize::try_from(rel * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?;
        device.read_block(
            cx,
            BlockNumber(start + rel),
            &mut bytes[offset..offset + BLOCK_SIZE_BYTES],
        )?;
    }
    RawBitmap::from_bytes(bytes, sb.data_block_count)
}

fn load_node_map(cx: &Cx, device: &dyn BlockDevice, sb: &Superblock) -> Result<NodeMap> {
    let blocks = node_map_blocks(sb);
    let start = node_map_start_block(sb);
    let mut bytes = vec![0_u8; usize::try_from(blocks * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?];
    for rel in 0..blocks {
        let offset = usize::try_from(rel * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?;
        device.read_block(
            cx,
            BlockNumber(start + rel),
            &mut bytes[offset..offset + BLOCK_SIZE_BYTES],
        )?;
    }
    NodeMap::from_bytes(bytes, sb.inode_count)
}
