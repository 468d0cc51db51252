//! Journal pump: ordered metadata commit through the write-ahead log.
//!
//! Metadata work items queue here instead of going straight to writeback.
//! A dedicated worker serializes each item: it first drains the writeback
//! queue and flushes the device (so every data block enqueued before this
//! commit is durable), appends the item's block writes as one journal
//! entry, flushes again, and only then forwards the item to the writeback
//! queue for its home-location writes.
//!
//! Ring space is reclaimed when a forwarded item's home writes complete;
//! the on-disk info block is advanced (and flushed) before any live entry
//! would be overwritten, so replay never loses a committed entry.

use crate::writeback::{WorkStatus, WritebackQueue, WritebackWork};
use amber_block::BlockDevice;
use amber_error::{AmberError, ErrorCode, Result};
use amber_journal::{entry_blocks, JournalInfo, JournalRegion, JournalWriter};
use amber_types::BlockNumber;
use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

struct Shared {
    queue: VecDeque<WritebackWork>,
    /// Highest sequence whose home-location writes are durable.
    reclaimed_seq: u64,
    shutdown: bool,
    failed: bool,
}

/// Entries appended to the ring whose slots are not yet reusable.
struct InRing {
    sequence: u64,
    blocks: u64,
}

/// The journal's dedicated writer task and its queue.
pub struct Journal {
    shared: Mutex<Shared>,
    ready: Condvar,
    space: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Start the journal pump. `next_slot`/`next_sequence` come from the
    /// replay performed at mount.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        writeback: Arc<WritebackQueue>,
        region: JournalRegion,
        next_slot: u64,
        next_sequence: u64,
    ) -> Result<Arc<Self>> {
        let journal = Arc::new(Self {
            shared: Mutex::new(Shared {
                queue: VecDeque::new(),
                reclaimed_seq: next_sequence.saturating_sub(1),
                shutdown: false,
                failed: false,
            }),
            ready: Condvar::new(),
            space: Condvar::new(),
            worker: Mutex::new(None),
        });

        let thread_journal = Arc::clone(&journal);
        let writer = JournalWriter::new(region, next_slot, next_sequence);
        let handle = std::thread::Builder::new()
            .name("amber-journal".to_owned())
            .spawn(move || Self::worker_loop(&thread_journal, &device, &writeback, writer))
            .map_err(|_| AmberError::NoMemory)?;
        *journal.worker.lock() = Some(handle);
        Ok(journal)
    }

    /// Enqueue a metadata work item for journaled commit.
    pub fn enqueue(&self, work: WritebackWork) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.failed || shared.shutdown {
            drop(shared);
            work.reset(Err(ErrorCode::BadState));
            return Err(AmberError::BadState("journal unavailable"));
        }
        shared.queue.push_back(work);
        drop(shared);
        self.ready.notify_one();
        Ok(())
    }

    /// Stop the worker after draining queued work.
    pub fn stop(&self) {
        {
            let mut shared = self.shared.lock();
            shared.shutdown = true;
        }
        self.ready.notify_all();
        self.space.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(
        journal: &Arc<Self>,
        device: &Arc<dyn BlockDevice>,
        writeback: &Arc<WritebackQueue>,
        mut writer: JournalWriter,
    ) {
        let cx = Cx::for_request();
        let region = writer.region();
        // Durable info block contents; entries at or past `durable.start`
        // may still be needed by replay.
        let mut durable = JournalInfo {
            start: writer.head(),
            sequence: writer.next_sequence(),
        };
        let mut in_ring: VecDeque<InRing> = VecDeque::new();

        loop {
            let work = {
                let mut shared = journal.shared.lock();
                loop {
                    if let Some(work) = shared.queue.pop_front() {
                        break Some(work);
                    }
                    if shared.shutdown {
                        break None;
                    }
                    journal.ready.wait(&mut shared);
                }
            };
            let Some(work) = work else {
                break;
            };

            if journal.shared.lock().failed {
                work.reset(Err(ErrorCode::BadState));
                continue;
            }

            if let Err(err) = Self::commit_one(
                journal,
                &cx,
                device,
                writeback,
                &mut writer,
                region,
                &mut durable,
                &mut in_ring,
                work,
            ) {
                error!(target: "amber::journal", error = %err, "commit_failed");
                journal.shared.lock().failed = true;
            }
        }
        debug!(target: "amber::journal", "worker_exited");
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_one(
        journal: &Arc<Self>,
        cx: &Cx,
        device: &Arc<dyn BlockDevice>,
        writeback: &Arc<WritebackQueue>,
        writer: &mut JournalWriter,
        region: JournalRegion,
        durable: &mut JournalInfo,
        in_ring: &mut VecDeque<InRing>,
        mut work: WritebackWork,
    ) -> Result<()> {
        // Barrier: every data block enqueued before this metadata commit
        // must be durable before the commit enters the journal.
        if writeback.drain().is_err() {
            work.reset(Err(ErrorCode::BadState));
            return Err(AmberError::BadState("writeback unavailable for barrier"));
        }
        device.sync(cx)?;

        // Coalesce repeated targets: a work item stages the superblock and
        // bitmap blocks once per operation, but the entry only needs each
        // block's final contents.
        let mut order: Vec<u64> = Vec::new();
        let mut latest: std::collections::HashMap<u64, Vec<u8>> = std::collections::HashMap::new();
        for (block, payload) in work.block_writes() {
            if latest.insert(block, payload).is_none() {
                order.push(block);
            }
        }
        let writes: Vec<(BlockNumber, Vec<u8>)> = order
            .into_iter()
            .map(|block| {
                let payload = latest.remove(&block).expect("payload staged");
                (BlockNumber(block), payload)
            })
            .collect();
        if !writes.is_empty() {
            let needed = entry_blocks(u64::try_from(writes.len()).expect("fits u64"));
            Self::wait_for_ring_space(journal, cx, device, region, durable, in_ring, needed)?;

            let sequence = writer.append(cx, device.as_ref(), &writes)?;
            device.sync(cx)?;
            in_ring.push_back(InRing {
                sequence,
                blocks: needed,
            });
            trace!(target: "amber::journal", sequence, targets = writes.len(), "entry_committed");

            // Reclaim ring space once the home-location writes are durable.
            let reclaim = Arc::clone(journal);
            work.add_callback(move |status: WorkStatus| {
                if status.is_ok() {
                    let mut shared = reclaim.shared.lock();
                    shared.reclaimed_seq = shared.reclaimed_seq.max(sequence);
                    drop(shared);
                    reclaim.space.notify_all();
                }
            });
            work.set_sync_complete();
        }

        writeback.enqueue(work)
    }

    fn wait_for_ring_space(
        journal: &Arc<Self>,
        cx: &Cx,
        device: &Arc<dyn BlockDevice>,
        region: JournalRegion,
        durable: &mut JournalInfo,
        in_ring: &mut VecDeque<InRing>,
        needed: u64,
    ) -> Result<()> {
        let ring = region.ring_blocks();
        if needed > ring {
            return Err(AmberError::NoSpace);
        }
        loop {
            let used: u64 = in_ring.iter().map(|entry| entry.blocks).sum();
            if used + needed <= ring {
                return Ok(());
            }

            // Advance the durable info past fully checkpointed entries.
            let reclaimed_seq = journal.shared.lock().reclaimed_seq;
            let mut advanced = false;
            while let Some(front) = in_ring.front() {
                if front.sequence > reclaimed_seq {
                    break;
                }
                durable.start = (durable.start + front.blocks) % ring;
                durable.sequence = front.sequence + 1;
                in_ring.pop_front();
                advanced = true;
            }
            if advanced {
                amber_journal::write_info(cx, device.as_ref(), region, *durable)?;
                device.sync(cx)?;
                continue;
            }

            // Nothing reclaimable yet: wait for a completion callback.
            let mut shared = journal.shared.lock();
            if shared.shutdown || shared.failed {
                return Err(AmberError::BadState("journal shutting down"));
            }
            if shared.reclaimed_seq == reclaimed_seq {
                journal.space.wait(&mut shared);
            }
        }
    }
}
