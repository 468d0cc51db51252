//! Asynchronous writeback pipeline.
//!
//! Data-region writes travel as `WritebackWork` items through a bounded
//! ring: enqueue captures the payload bytes and blocks while the ring is
//! full, a dedicated worker drains items FIFO and issues each as one block
//! transaction through the shared fifo client. Completion callbacks fire
//! with the transaction status; a failed transaction poisons the queue so
//! later work is rejected instead of silently reordered.

use amber_block::{BlockClient, BlockFifoRequest, BlockOp, SharedBuffer};
use amber_error::{AmberError, ErrorCode, Result};
use amber_types::{BLOCK_SIZE, BLOCK_SIZE_BYTES};
use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

/// Status delivered to work callbacks.
pub type WorkStatus = std::result::Result<(), ErrorCode>;

type Callback = Box<dyn FnOnce(WorkStatus) + Send + 'static>;

struct WriteOp {
    dev_offset: u64,
    bytes: Vec<u8>,
}

/// An ordered batch of block writes plus completion callbacks.
pub struct WritebackWork {
    ops: Vec<WriteOp>,
    callbacks: Vec<Callback>,
    sync_complete: bool,
}

impl Default for WritebackWork {
    fn default() -> Self {
        Self::new()
    }
}

impl WritebackWork {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            callbacks: Vec::new(),
            sync_complete: false,
        }
    }

    /// Append a copy-in operation. `bytes` must be a whole number of
    /// blocks; `dev_offset` is the absolute device block.
    pub fn enqueue_bytes(&mut self, dev_offset: u64, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() || bytes.len() % BLOCK_SIZE_BYTES != 0 {
            return Err(AmberError::Format(
                "writeback payload must be a whole number of blocks".to_owned(),
            ));
        }
        self.ops.push(WriteOp { dev_offset, bytes });
        Ok(())
    }

    /// Register a completion callback.
    pub fn add_callback(&mut self, callback: impl FnOnce(WorkStatus) + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Request a device flush after this item's writes land.
    pub fn set_sync_complete(&mut self) {
        self.sync_complete = true;
    }

    /// Total blocks this item will occupy in the ring.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| (op.bytes.len() / BLOCK_SIZE_BYTES) as u64)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.callbacks.is_empty() && !self.sync_complete
    }

    /// Fire callbacks with `status` without performing any I/O.
    pub fn reset(mut self, status: WorkStatus) {
        for callback in self.callbacks.drain(..) {
            callback(status);
        }
    }

    /// Snapshot of `(dev_offset, payload)` per block, for journaling.
    #[must_use]
    pub fn block_writes(&self) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        for op in &self.ops {
            for (i, chunk) in op.bytes.chunks(BLOCK_SIZE_BYTES).enumerate() {
                out.push((op.dev_offset + i as u64, chunk.to_vec()));
            }
        }
        out
    }
}

struct QueueState {
    queue: VecDeque<WritebackWork>,
    outstanding_blocks: u64,
    failed: bool,
    shutdown: bool,
}

/// Bounded FIFO of [`WritebackWork`] drained by a dedicated worker.
pub struct WritebackQueue {
    state: Mutex<QueueState>,
    space: Condvar,
    ready: Condvar,
    capacity_blocks: u64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WritebackQueue {
    /// Capacity derived from the configured write buffer size.
    #[must_use]
    pub fn default_capacity_blocks() -> u64 {
        amber_types::WRITE_BUFFER_BYTES / BLOCK_SIZE
    }

    /// Start the queue and its worker thread.
    pub fn new(client: Arc<dyn BlockClient>, capacity_blocks: u64) -> Result<Arc<Self>> {
        if capacity_blocks == 0 {
            return Err(AmberError::Format(
                "writeback capacity must be non-zero".to_owned(),
            ));
        }
        let staging = SharedBuffer::new(
            usize::try_from(capacity_blocks * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?,
        );
        let staging_id = client.attach_buffer(&staging)?;

        let queue = Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                outstanding_blocks: 0,
                failed: false,
                shutdown: false,
            }),
            space: Condvar::new(),
            ready: Condvar::new(),
            capacity_blocks,
            worker: Mutex::new(None),
        });

        let thread_queue = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("amber-writeback".to_owned())
            .spawn(move || thread_queue.worker_loop(&client, &staging, staging_id))
            .map_err(|_| AmberError::NoMemory)?;
        *queue.worker.lock() = Some(handle);
        Ok(queue)
    }

    /// Ring capacity in blocks.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity_blocks
    }

    /// Enqueue a work item, blocking while the ring is full.
    ///
    /// Items larger than the ring are rejected — callers split them with
    /// [`enqueue_paginated`]. On a poisoned or shut-down queue the work is
    /// reset so its callbacks fire.
    pub fn enqueue(&self, work: WritebackWork) -> Result<()> {
        let blocks = work.block_count();
        if blocks > self.capacity_blocks {
            work.reset(Err(ErrorCode::OutOfRange));
            return Err(AmberError::OutOfRange("work larger than writeback ring"));
        }

        let mut state = self.state.lock();
        loop {
            if state.failed || state.shutdown {
                drop(state);
                work.reset(Err(ErrorCode::BadState));
                return Err(AmberError::BadState("writeback queue unavailable"));
            }
            if state.outstanding_blocks + blocks <= self.capacity_blocks {
                break;
            }
            self.space.wait(&mut state);
        }
        state.outstanding_blocks += blocks;
        state.queue.push_back(work);
        trace!(
            target: "amber::writeback",
            blocks,
            outstanding = state.outstanding_blocks,
            "work_enqueued"
        );
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until every item enqueued before this call has completed.
    pub fn drain(&self) -> WorkStatus {
        let done = Arc::new((Mutex::new(None::<WorkStatus>), Condvar::new()));
        let signal = Arc::clone(&done);
        let mut work = WritebackWork::new();
        work.add_callback(move |status| {
            *signal.0.lock() = Some(status);
            signal.1.notify_all();
        });
        if let Err(err) = self.enqueue(work) {
            return Err(err.code());
        }
        let mut guard = done.0.lock();
        while guard.is_none() {
            done.1.wait(&mut guard);
        }
        guard.take().expect("status recorded")
    }

    /// Stop the worker after draining queued work.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
        }
        self.ready.notify_all();
        self.space.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self, client: &Arc<dyn BlockClient>, staging: &SharedBuffer, staging_id: amber_block::BufferId) {
        let cx = Cx::for_request();
        loop {
            let work = {
                let mut state = self.state.lock();
                loop {
                    if let Some(work) = state.queue.pop_front() {
                        break Some(work);
                    }
                    if state.shutdown {
                        break None;
                    }
                    self.ready.wait(&mut state);
                }
            };
            let Some(work) = work else {
                break;
            };
            let blocks = work.block_count();

            let failed = self.state.lock().failed;
            let status = if failed {
                Err(ErrorCode::BadState)
            } else {
                self.process(&cx, client, staging, staging_id, &work)
            };
            if let Err(code) = status {
                error!(target: "amber::writeback", code = ?code, "work_failed");
                self.state.lock().failed = true;
            }

            let WritebackWork { callbacks, .. } = work;
            for callback in callbacks {
                callback(status);
            }

            let mut state = self.state.lock();
            state.outstanding_blocks = state.outstanding_blocks.saturating_sub(blocks);
            drop(state);
            self.space.notify_all();
        }
        debug!(target: "amber::writeback", "worker_exited");
    }

    fn process(
        &self,
        cx: &Cx,
        client: &Arc<dyn BlockClient>,
        staging: &SharedBuffer,
        staging_id: amber_block::BufferId,
        work: &WritebackWork,
    ) -> WorkStatus {
        let mut requests: Vec<BlockFifoRequest> = Vec::with_capacity(work.ops.len() + 1);
        let mut staged_blocks = 0_u64;
        for op in &work.ops {
            let byte_offset = usize::try_from(staged_blocks * BLOCK_SIZE)
                .map_err(|_| ErrorCode::NoMemory)?;
            staging
                .copy_in(byte_offset, &op.bytes)
                .map_err(|err| err.code())?;
            let length = (op.bytes.len() / BLOCK_SIZE_BYTES) as u64;
            requests.push(BlockFifoRequest {
                buffer: staging_id,
                op: BlockOp::Write,
                buf_offset: staged_blocks,
                dev_offset: op.dev_offset,
                length,
            });
            staged_blocks += length;
        }
        if work.sync_complete {
            requests.push(BlockFifoRequest {
                buffer: staging_id,
                op: BlockOp::Flush,
                buf_offset: 0,
                dev_offset: 0,
                length: 0,
            });
        }
        if requests.is_empty() {
            return Ok(());
        }
        client.transaction(cx, &requests).map_err(|err| err.code())
    }
}

/// Split a write larger than 3/4 of the ring into chunks, flushing the
/// current work item between chunks so no single item can wedge the ring.
///
/// `source` is the full backing image; offsets are in blocks.
pub fn enqueue_paginated(
    queue: &WritebackQueue,
    work: &mut WritebackWork,
    source: &[u8],
    source_offset: u64,
    dev_offset: u64,
    nblocks: u64,
) -> Result<()> {
    let max_chunk_blocks = (3 * queue.capacity()) / 4;
    let mut source_block = source_offset;
    let mut device_block = dev_offset;
    let mut remaining = nblocks;
    let mut delta = remaining.min(max_chunk_blocks);
    while remaining > 0 {
        let start = usize::try_from(source_block * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?;
        let len = usize::try_from(delta * BLOCK_SIZE).map_err(|_| AmberError::NoMemory)?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= source.len())
            .ok_or(AmberError::OutOfRange("paginated source out of bounds"))?;
        work.enqueue_bytes(device_block, source[start..end].to_vec())?;

        source_block += delta;
        device_block += delta;
        remaining -= delta;
        delta = remaining.min(max_chunk_blocks);
        if remaining > 0 {
            queue.enqueue(std::mem::take(work))?;
        }
    }
    Ok(())
}
