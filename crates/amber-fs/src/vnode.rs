//! Per-blob lifecycle.
//!
//! A vnode moves Empty → DataWrite → Readable, with Error as the terminal
//! state for any failed write and Purged once an unlinked blob's last
//! reference drops. The write path buffers the whole blob, builds the
//! Merkle tree, compares the computed root against the digest the client
//! declared, decides compression, streams data through the writeback ring
//! and commits metadata through the journal. The read path materializes
//! the backing buffer lazily and verifies the entire contents before any
//! byte is served.

use crate::iterator::{stream_blocks, AllocatedExtentIterator, BlockIterator, VectorExtentIterator};
use crate::populator::{node_count_for_extents, IterationCommand, NodePopulator};
use crate::writeback::{enqueue_paginated, WritebackWork};
use crate::{Blobfs, EnqueueType};
use amber_block::{BufferId, ReadTransaction, SharedBuffer};
use amber_compress::BlobCompressor;
use amber_error::{AmberError, Result};
use amber_format::{Inode, NODE_FLAG_COMPRESSED};
use amber_merkle as merkle;
use amber_types::{
    blocks_for_bytes, Digest, NodeIndex, BLOCK_SIZE, COMPRESSION_MIN_BYTES_SAVED,
    MAX_BLOB_EXTENTS,
};
use asupersync::Cx;
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, trace};

/// Lifecycle states. Transitions are documented on [`VnodeBlob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Empty,
    DataWrite,
    Readable,
    Error,
    Purged,
}

pub(crate) struct Mapping {
    pub buffer: SharedBuffer,
    pub id: BufferId,
}

pub(crate) struct WriteInfo {
    bytes_written: u64,
    extents: Vec<amber_alloc::ReservedExtent>,
    nodes: Vec<amber_alloc::ReservedNode>,
    compressor: Option<BlobCompressor>,
}

pub(crate) struct VnodeInner {
    pub state: BlobState,
    pub inode: Inode,
    pub map_index: NodeIndex,
    pub mapping: Option<Mapping>,
    write: Option<WriteInfo>,
    pub deletable: bool,
    pub open_count: u64,
    pub clone_count: u64,
}

/// In-memory handle to one blob.
pub struct VnodeBlob {
    digest: Digest,
    fs: Weak<Blobfs>,
    pub(crate) inner: Mutex<VnodeInner>,
}

impl VnodeBlob {
    /// A vnode for a blob that does not exist yet.
    pub(crate) fn new_empty(fs: &Arc<Blobfs>, digest: Digest) -> Arc<Self> {
        Arc::new(Self {
            digest,
            fs: Arc::downgrade(fs),
            inner: Mutex::new(VnodeInner {
                state: BlobState::Empty,
                inode: Inode::empty(),
                map_index: NodeIndex(0),
                mapping: None,
                write: None,
                deletable: false,
                open_count: 0,
                clone_count: 0,
            }),
        })
    }

    /// A vnode populated from an on-disk inode, immediately readable.
    pub(crate) fn new_readable(
        fs: &Arc<Blobfs>,
        digest: Digest,
        map_index: NodeIndex,
        inode: Inode,
    ) -> Arc<Self> {
        Arc::new(Self {
            digest,
            fs: Arc::downgrade(fs),
            inner: Mutex::new(VnodeInner {
                state: BlobState::Readable,
                inode,
                map_index,
                mapping: None,
                write: None,
                deletable: false,
                open_count: 0,
                clone_count: 0,
            }),
        })
    }

    #[must_use]
    pub fn digest(&self) -> Digest {
        self.digest
    }

    #[must_use]
    pub fn state(&self) -> BlobState {
        self.inner.lock().state
    }

    /// Uncompressed size, or zero while not readable.
    #[must_use]
    pub fn size_data(&self) -> u64 {
        let inner = self.inner.lock();
        if inner.state == BlobState::Readable {
            inner.inode.blob_size
        } else {
            0
        }
    }

    #[must_use]
    pub fn deletion_queued(&self) -> bool {
        self.inner.lock().deletable
    }

    /// Blocks the blob occupies on disk, merkle tree included.
    #[must_use]
    pub fn storage_blocks(&self) -> u64 {
        u64::from(self.inner.lock().inode.block_count)
    }

    /// Whether the data region holds compressed bytes.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.inner.lock().inode.prelude.is_compressed()
    }

    fn fs(&self) -> Result<Arc<Blobfs>> {
        self.fs
            .upgrade()
            .ok_or(AmberError::BadState("filesystem torn down"))
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Reserve space for a blob of `size` bytes. State must be Empty.
    ///
    /// The null blob skips the data phase entirely: its metadata is
    /// committed here and the vnode lands in Readable.
    pub fn space_allocate(&self, cx: &Cx, size: u64) -> Result<()> {
        let fs = self.fs()?;
        let started = Instant::now();
        let mut inner = self.inner.lock();
        if inner.state != BlobState::Empty {
            return Err(AmberError::BadState("allocate on non-empty blob"));
        }

        let merkle_blocks = merkle::tree_blocks(size);
        let data_blocks = blocks_for_bytes(size);
        let block_count = u32::try_from(merkle_blocks + data_blocks)
            .map_err(|_| AmberError::OutOfRange("blob exceeds block count limit"))?;
        inner.inode.blob_size = size;
        inner.inode.block_count = block_count;

        if size == 0 {
            // Null blob: one node, no extents, no buffer.
            let nodes = fs.reserve_nodes(cx, 1)?;
            inner.map_index = nodes[0].index();
            inner.write = Some(WriteInfo {
                bytes_written: 0,
                extents: Vec::new(),
                nodes,
                compressor: None,
            });
            let computed = merkle::leaf_digest(&[]);
            if computed != self.digest {
                inner.state = BlobState::Error;
                inner.write = None;
                return Err(AmberError::Corruption {
                    block: 0,
                    detail: "declared digest does not match the empty blob".to_owned(),
                });
            }
            inner.state = BlobState::DataWrite;
            return self.write_metadata(cx, &fs, &mut inner);
        }

        let extents = fs.reserve_blocks(cx, u64::from(block_count))?;
        if extents.len() > MAX_BLOB_EXTENTS {
            error!(
                target: "amber::fs",
                extents = extents.len(),
                max = MAX_BLOB_EXTENTS,
                "reservation too fragmented"
            );
            return Err(AmberError::BadState("blob requires too many extents"));
        }
        let nodes = fs.reserve_nodes(cx, node_count_for_extents(extents.len()))?;

        let compressor = if size >= COMPRESSION_MIN_BYTES_SAVED {
            Some(BlobCompressor::new(amber_compress::buffer_max(size))?)
        } else {
            None
        };

        let buffer = SharedBuffer::new(
            usize::try_from(u64::from(block_count) * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?,
        );
        let id = fs.client().attach_buffer(&buffer)?;

        inner.map_index = nodes[0].index();
        inner.mapping = Some(Mapping { buffer, id });
        inner.write = Some(WriteInfo {
            bytes_written: 0,
            extents,
            nodes,
            compressor,
        });
        inner.state = BlobState::DataWrite;
        drop(inner);

        fs.record_metrics(|metrics| metrics.update_allocation(size, started.elapsed()));
        Ok(())
    }

    /// Copy the next run of client bytes into the blob. On the final byte
    /// the blob is sealed: tree built, digest checked, layout chosen, data
    /// streamed, metadata journaled.
    pub fn write_internal(&self, cx: &Cx, data: &[u8]) -> Result<u64> {
        if data.is_empty() {
            return Ok(0);
        }
        let fs = self.fs()?;
        let mut inner = self.inner.lock();
        if inner.state != BlobState::DataWrite {
            return Err(AmberError::BadState("write outside data phase"));
        }

        let blob_size = inner.inode.blob_size;
        let merkle_bytes = merkle::tree_length(blob_size);
        let write = inner
            .write
            .as_mut()
            .ok_or(AmberError::BadState("write info missing"))?;
        let to_write = (u64::try_from(data.len()).unwrap_or(u64::MAX))
            .min(blob_size - write.bytes_written);
        let offset = usize::try_from(merkle_bytes + write.bytes_written)
            .map_err(|_| AmberError::NoMemory)?;
        let chunk = &data[..usize::try_from(to_write).map_err(|_| AmberError::NoMemory)?];

        inner
            .mapping
            .as_ref()
            .ok_or(AmberError::BadState("mapping missing during write"))?
            .buffer
            .copy_in(offset, chunk)?;
        let write = inner.write.as_mut().expect("write info present");
        write.bytes_written += to_write;

        if let Some(compressor) = write.compressor.as_mut() {
            compressor.update(chunk)?;
            Self::consider_compression_abort(write, blob_size);
        }

        if write.bytes_written < blob_size {
            return Ok(to_write);
        }

        // Final byte: seal the blob. Any failure is terminal.
        match self.finish_write(cx, &fs, &mut inner) {
            Ok(()) => Ok(to_write),
            Err(err) => {
                error!(target: "amber::fs", digest = %self.digest, error = %err, "write_failed");
                inner.state = BlobState::Error;
                inner.write = None;
                Err(err)
            }
        }
    }

    /// Abandon compression as soon as it cannot save the minimum.
    fn consider_compression_abort(write: &mut WriteInfo, blob_size: u64) {
        if let Some(compressor) = write.compressor.as_ref() {
            if blob_size.saturating_sub(COMPRESSION_MIN_BYTES_SAVED) < compressor.size() {
                trace!(target: "amber::compress", "compression_abandoned");
                write.compressor = None;
            }
        }
    }

    fn finish_write(&self, cx: &Cx, fs: &Arc<Blobfs>, inner: &mut VnodeInner) -> Result<()> {
        let blob_size = inner.inode.blob_size;
        let merkle_bytes = merkle::tree_length(blob_size);
        let merkle_blocks = merkle::tree_blocks(blob_size);
        let data_start = fs.data_start_block();

        if let Some(write) = inner.write.as_mut() {
            if let Some(compressor) = write.compressor.as_mut() {
                compressor.end()?;
                Self::consider_compression_abort(write, blob_size);
            }
        }

        // Build the tree into the buffer prefix and check the declared
        // digest. This is the only defense against a lying client.
        let generation_started = Instant::now();
        let mapping = inner
            .mapping
            .as_ref()
            .ok_or(AmberError::BadState("mapping missing during seal"))?;
        let computed = mapping.buffer.with_slice_mut(|buf| -> Result<Digest> {
            let merkle_len = usize::try_from(merkle_bytes).map_err(|_| AmberError::NoMemory)?;
            let size = usize::try_from(blob_size).map_err(|_| AmberError::NoMemory)?;
            let (tree, data) = buf.split_at_mut(merkle_len);
            if merkle_len == 0 {
                Ok(merkle::leaf_digest(&data[..size]))
            } else {
                merkle::build(&data[..size], tree)
            }
        })?;
        if computed != self.digest {
            return Err(AmberError::Corruption {
                block: 0,
                detail: format!(
                    "content digest {computed} does not match declared {}",
                    self.digest
                ),
            });
        }
        let generation_time = generation_started.elapsed();

        // Choose the on-disk layout.
        let write = inner.write.as_ref().expect("write info present");
        let compressed = write
            .compressor
            .as_ref()
            .map(|compressor| compressor.size())
            .filter(|&size| size + COMPRESSION_MIN_BYTES_SAVED <= blob_size)
            .is_some();

        let enqueue_started = Instant::now();
        let queue = fs.writeback()?;
        let mut work = fs.create_work()?;
        let source = mapping.buffer.snapshot(0, mapping.buffer.len())?;

        let write = inner.write.as_ref().expect("write info present");
        let extent_iter = VectorExtentIterator::new(&write.extents);
        let mut block_iter = BlockIterator::new(extent_iter);

        // Merkle blocks first; tree and data are co-allocated in order.
        stream_blocks(&mut block_iter, merkle_blocks, |vmo_offset, dev_offset, length| {
            enqueue_paginated(
                &queue,
                &mut work,
                &source,
                vmo_offset,
                data_start + dev_offset,
                length,
            )
        })?;

        if compressed {
            let compressor = write.compressor.as_ref().expect("compressor alive");
            let compressed_size = compressor.size();
            let comp_blocks = blocks_for_bytes(compressed_size);
            let mut padded = compressor.compressed()?.to_vec();
            padded.resize(
                usize::try_from(comp_blocks * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?,
                0,
            );
            debug_assert_eq!(block_iter.block_index(), merkle_blocks);
            stream_blocks(&mut block_iter, comp_blocks, |vmo_offset, dev_offset, length| {
                enqueue_paginated(
                    &queue,
                    &mut work,
                    &padded,
                    vmo_offset - merkle_blocks,
                    data_start + dev_offset,
                    length,
                )
            })?;

            let new_count = u32::try_from(merkle_blocks + comp_blocks)
                .map_err(|_| AmberError::OutOfRange("block count overflow"))?;
            debug_assert!(new_count < inner.inode.block_count);
            inner.inode.block_count = new_count;
            inner.inode.prelude.flags |= NODE_FLAG_COMPRESSED;
            debug!(
                target: "amber::fs",
                digest = %self.digest,
                compressed_size,
                blob_size,
                "blob_stored_compressed"
            );
        } else {
            let data_blocks = blocks_for_bytes(blob_size);
            stream_blocks(&mut block_iter, data_blocks, |vmo_offset, dev_offset, length| {
                enqueue_paginated(
                    &queue,
                    &mut work,
                    &source,
                    vmo_offset,
                    data_start + dev_offset,
                    length,
                )
            })?;
        }

        fs.enqueue_work(work, EnqueueType::Data)?;
        self.write_metadata(cx, fs, inner)?;

        fs.record_metrics(|metrics| {
            metrics.update_client_write(blob_size, merkle_bytes, enqueue_started.elapsed(), generation_time);
        });
        Ok(())
    }

    /// Commit the inode, bitmap, and superblock through the journal and
    /// transition to Readable.
    fn write_metadata(&self, _cx: &Cx, fs: &Arc<Blobfs>, inner: &mut VnodeInner) -> Result<()> {
        debug_assert_eq!(inner.state, BlobState::DataWrite);
        let work = fs.create_work()?;
        inner.inode.merkle_root_hash = self.digest;

        let write = inner
            .write
            .take()
            .ok_or(AmberError::BadState("write info missing at commit"))?;

        if inner.inode.block_count > 0 {
            let mut remaining = u64::from(inner.inode.block_count);
            let populator = NodePopulator::new(write.extents, write.nodes);
            debug_assert_eq!(populator.head_index()?, inner.map_index);

            let head_index = inner.map_index;
            let work_cell = RefCell::new(work);
            populator.walk(
                fs.allocator(),
                inner.inode,
                |reserved| {
                    let length = reserved.extent().length();
                    if remaining >= length {
                        remaining -= length;
                    } else {
                        // Compression used fewer blocks than reserved;
                        // keep only what the blob needs.
                        let keep = u16::try_from(remaining).expect("remainder fits extent");
                        let _tail = reserved.split_at(keep).expect("split within extent");
                        remaining = 0;
                    }
                    fs.persist_blocks(&mut work_cell.borrow_mut(), reserved);
                    if remaining == 0 {
                        IterationCommand::Stop
                    } else {
                        IterationCommand::Continue
                    }
                },
                |node| {
                    fs.persist_node(
                        &mut work_cell.borrow_mut(),
                        node.index(),
                        node.index() == head_index,
                    );
                },
            )?;
            let mut work = work_cell.into_inner();
            work.set_sync_complete();
            inner.state = BlobState::Readable;
            fs.enqueue_work(work, EnqueueType::Journal)?;
        } else {
            // Null blob: a bare allocated inode.
            let node = &write.nodes[0];
            fs.allocator().mark_inode_allocated(node)?;
            let mut inode = inner.inode;
            inode.prelude.flags |= amber_format::NODE_FLAG_ALLOCATED;
            fs.allocator()
                .with_node_map_mut(|map| map.set_inode(node.index(), &inode))?;
            inner.inode = inode;
            let mut work = work;
            fs.persist_node(&mut work, node.index(), true);
            work.set_sync_complete();
            inner.state = BlobState::Readable;
            fs.enqueue_work(work, EnqueueType::Journal)?;
        }
        Ok(())
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Copy out up to `buf.len()` bytes at `offset`. State must be
    /// Readable; the backing buffer is materialized and verified on first
    /// use.
    pub fn read_internal(&self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<u64> {
        let fs = self.fs()?;
        let mut inner = self.inner.lock();
        if inner.state != BlobState::Readable {
            return Err(AmberError::BadState("read on unreadable blob"));
        }
        let blob_size = inner.inode.blob_size;
        if blob_size == 0 || offset >= blob_size {
            return Ok(0);
        }

        self.init_vmos(cx, &fs, &mut inner)?;

        let len = (u64::try_from(buf.len()).unwrap_or(u64::MAX)).min(blob_size - offset);
        let merkle_bytes = merkle::tree_length(blob_size);
        let start = usize::try_from(merkle_bytes + offset).map_err(|_| AmberError::NoMemory)?;
        let out = &mut buf[..usize::try_from(len).map_err(|_| AmberError::NoMemory)?];
        inner
            .mapping
            .as_ref()
            .expect("mapping present after init")
            .buffer
            .copy_out(start, out)?;
        Ok(len)
    }

    /// Materialize and verify the backing buffer. Idempotent.
    pub(crate) fn init_vmos(&self, cx: &Cx, fs: &Arc<Blobfs>, inner: &mut VnodeInner) -> Result<()> {
        if inner.mapping.is_some() {
            return Ok(());
        }
        let blob_size = inner.inode.blob_size;
        let merkle_blocks = merkle::tree_blocks(blob_size);
        let data_blocks = blocks_for_bytes(blob_size);
        let num_blocks = merkle_blocks + data_blocks;
        if num_blocks == 0 {
            return Ok(());
        }

        let buffer = SharedBuffer::new(
            usize::try_from(num_blocks * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?,
        );
        let id = fs.client().attach_buffer(&buffer)?;

        let result = if inner.inode.prelude.is_compressed() {
            self.init_compressed(cx, fs, inner, &buffer, id)
        } else {
            self.init_uncompressed(cx, fs, inner, id)
        }
        .and_then(|()| self.verify(fs, &buffer, blob_size));

        match result {
            Ok(()) => {
                inner.mapping = Some(Mapping { buffer, id });
                Ok(())
            }
            Err(err) => {
                // Unwind the registration; the blob stays readable and a
                // later read restarts materialization from scratch.
                let _ = fs.client().detach_buffer(id);
                Err(err)
            }
        }
    }

    fn init_uncompressed(
        &self,
        cx: &Cx,
        fs: &Arc<Blobfs>,
        inner: &VnodeInner,
        id: BufferId,
    ) -> Result<()> {
        let started = Instant::now();
        let length = u64::from(inner.inode.block_count);
        let data_start = fs.data_start_block();

        let extent_iter = AllocatedExtentIterator::new(fs.allocator(), inner.map_index)?;
        let mut block_iter = BlockIterator::new(extent_iter);
        let mut txn = ReadTransaction::new(fs.client().as_ref());
        stream_blocks(&mut block_iter, length, |vmo_offset, dev_offset, run| {
            txn.enqueue(id, vmo_offset, data_start + dev_offset, run);
            Ok(())
        })?;
        txn.transact(cx)?;

        fs.record_metrics(|metrics| {
            metrics.update_disk_read(length * BLOCK_SIZE, started.elapsed());
        });
        Ok(())
    }

    fn init_compressed(
        &self,
        cx: &Cx,
        fs: &Arc<Blobfs>,
        inner: &VnodeInner,
        buffer: &SharedBuffer,
        id: BufferId,
    ) -> Result<()> {
        let read_started = Instant::now();
        let blob_size = inner.inode.blob_size;
        let merkle_blocks = merkle::tree_blocks(blob_size);
        let merkle_bytes = merkle::tree_length(blob_size);
        let compressed_blocks = u64::from(inner.inode.block_count) - merkle_blocks;
        let data_start = fs.data_start_block();

        let compressed = SharedBuffer::new(
            usize::try_from(compressed_blocks * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?,
        );
        let compressed_id = fs.client().attach_buffer(&compressed)?;

        let result = (|| -> Result<()> {
            let extent_iter = AllocatedExtentIterator::new(fs.allocator(), inner.map_index)?;
            let mut block_iter = BlockIterator::new(extent_iter);
            let mut txn = ReadTransaction::new(fs.client().as_ref());

            // Merkle blocks land in the main buffer's prefix.
            stream_blocks(&mut block_iter, merkle_blocks, |vmo_offset, dev_offset, run| {
                txn.enqueue(id, vmo_offset, data_start + dev_offset, run);
                Ok(())
            })?;
            debug_assert_eq!(block_iter.block_index(), merkle_blocks);
            // Compressed payload lands in the temporary buffer.
            stream_blocks(
                &mut block_iter,
                compressed_blocks,
                |vmo_offset, dev_offset, run| {
                    txn.enqueue(
                        compressed_id,
                        vmo_offset - merkle_blocks,
                        data_start + dev_offset,
                        run,
                    );
                    Ok(())
                },
            )?;
            txn.transact(cx)?;

            let read_time = read_started.elapsed();
            let decompress_started = Instant::now();
            let compressed_bytes = compressed.snapshot(0, compressed.len())?;
            let produced = buffer.with_slice_mut(|buf| -> Result<usize> {
                let merkle_len =
                    usize::try_from(merkle_bytes).map_err(|_| AmberError::NoMemory)?;
                let size = usize::try_from(blob_size).map_err(|_| AmberError::NoMemory)?;
                let (produced, _consumed) = amber_compress::decompress(
                    &mut buf[merkle_len..merkle_len + size],
                    &compressed_bytes,
                )?;
                Ok(produced)
            })?;
            if u64::try_from(produced).unwrap_or(0) != blob_size {
                return Err(AmberError::Corruption {
                    block: 0,
                    detail: format!(
                        "decompressed {produced} bytes, expected {blob_size}"
                    ),
                });
            }

            fs.record_metrics(|metrics| {
                metrics.update_decompress(
                    compressed_blocks * BLOCK_SIZE,
                    blob_size,
                    read_time,
                    decompress_started.elapsed(),
                );
            });
            Ok(())
        })();

        let _ = fs.client().detach_buffer(compressed_id);
        result
    }

    /// Verify the entire blob against its digest.
    fn verify(&self, fs: &Arc<Blobfs>, buffer: &SharedBuffer, blob_size: u64) -> Result<()> {
        let started = Instant::now();
        let merkle_bytes = merkle::tree_length(blob_size);
        let merkle_len = usize::try_from(merkle_bytes).map_err(|_| AmberError::NoMemory)?;
        let result = buffer.with_slice(|buf| {
            let (tree, data) = buf.split_at(merkle_len);
            merkle::verify(data, blob_size, tree, 0, blob_size, &self.digest)
        });
        fs.record_metrics(|metrics| {
            metrics.update_verify(blob_size, merkle_bytes, started.elapsed());
        });
        if let Err(err) = &result {
            error!(target: "amber::fs", digest = %self.digest, error = %err, "verify_failed");
        }
        result
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Mark for deletion. The purge itself runs when the last reference
    /// drops; the caller handles the no-references case.
    pub(crate) fn queue_unlink(&self) -> MutexGuard<'_, VnodeInner> {
        let mut inner = self.inner.lock();
        inner.deletable = true;
        inner
    }

    /// Drop the backing buffer (EvictImmediately policy). Skipped while
    /// clones still reference the memory.
    pub(crate) fn tear_down(&self, fs: &Arc<Blobfs>) {
        let mut inner = self.inner.lock();
        if inner.clone_count > 0 {
            return;
        }
        if let Some(mapping) = inner.mapping.take() {
            let _ = fs.client().detach_buffer(mapping.id);
        }
    }
}

impl Drop for VnodeBlob {
    fn drop(&mut self) {
        if let Some(fs) = self.fs.upgrade() {
            let mut inner = self.inner.lock();
            if let Some(mapping) = inner.mapping.take() {
                let _ = fs.client().detach_buffer(mapping.id);
            }
        }
    }
}

/// Read-only view of a blob's data, analogous to a copy-on-write child of
/// the backing memory object.
///
/// Holds a strong reference to the vnode, so an unlinked blob stays
/// readable until the last clone drops.
pub struct BlobData {
    vnode: Arc<VnodeBlob>,
    fs: Arc<Blobfs>,
    size: u64,
}

impl BlobData {
    pub(crate) fn new(cx: &Cx, fs: Arc<Blobfs>, vnode: Arc<VnodeBlob>) -> Result<Self> {
        let size = {
            let mut inner = vnode.inner.lock();
            if inner.state != BlobState::Readable || inner.inode.blob_size == 0 {
                return Err(AmberError::BadState("clone of unreadable or empty blob"));
            }
            vnode.init_vmos(cx, &fs, &mut inner)?;
            inner.clone_count += 1;
            inner.inode.blob_size
        };
        Ok(Self { vnode, fs, size })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy out up to `buf.len()` bytes at `offset` of the data portion.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<u64> {
        let inner = self.vnode.inner.lock();
        if offset >= self.size {
            return Ok(0);
        }
        let len = (u64::try_from(buf.len()).unwrap_or(u64::MAX)).min(self.size - offset);
        let merkle_bytes = merkle::tree_length(self.size);
        let start = usize::try_from(merkle_bytes + offset).map_err(|_| AmberError::NoMemory)?;
        inner
            .mapping
            .as_ref()
            .ok_or(AmberError::BadState("clone backing buffer gone"))?
            .buffer
            .copy_out(start, &mut buf[..usize::try_from(len).map_err(|_| AmberError::NoMemory)?])?;
        Ok(len)
    }
}

impl Drop for BlobData {
    fn drop(&mut self) {
        self.fs.release_clone(&self.vnode);
    }
}
