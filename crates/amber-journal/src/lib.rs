#![forbid(unsafe_code)]
//! Write-ahead metadata journal.
//!
//! The journal region is a circular log: an info block at the region start
//! records where the live portion of the ring begins and the next expected
//! sequence number; the remaining blocks hold entries. Each entry is a
//! header block (sequence, target device offsets, payload checksum), the
//! payload blocks, and a commit block repeating the sequence and checksum.
//!
//! Replay at mount walks the ring from the recorded start, applies every
//! entry whose header and commit both validate, and stops at the first
//! torn or stale entry. Uncommitted tails are discarded, never applied.

use asupersync::Cx;
use amber_block::BlockDevice;
use amber_error::{AmberError, Result};
use amber_types::{read_le_u32, read_le_u64, BlockNumber, BLOCK_SIZE_BYTES};
use tracing::{debug, info, warn};

const INFO_MAGIC: u64 = 0x616d_6272_6a6e_6c30; // "ambrjnl0"
const ENTRY_MAGIC: u64 = 0x616d_6272_6a45_4e54; // "ambrjENT"
const COMMIT_MAGIC: u64 = 0x616d_6272_6a43_4d54; // "ambrjCMT"

const INFO_CHECKSUM_OFFSET: usize = 0x18;
const HEADER_TARGETS_OFFSET: usize = 0x20;

/// Device offsets a single entry header can carry.
pub const MAX_ENTRY_TARGETS: usize = (BLOCK_SIZE_BYTES - HEADER_TARGETS_OFFSET) / 8;

/// Journal region expressed in block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRegion {
    pub start: BlockNumber,
    pub blocks: u64,
}

impl JournalRegion {
    /// Ring capacity in blocks (the info block is not part of the ring).
    #[must_use]
    pub fn ring_blocks(self) -> u64 {
        self.blocks.saturating_sub(1)
    }

    /// Physical block for ring slot `idx`.
    #[must_use]
    pub fn ring_slot(self, idx: u64) -> BlockNumber {
        debug_assert!(idx < self.ring_blocks());
        BlockNumber(self.start.0 + 1 + idx)
    }

    fn info_block(self) -> BlockNumber {
        self.start
    }
}

/// Blocks one entry with `payload_blocks` payload blocks consumes.
#[must_use]
pub fn entry_blocks(payload_blocks: u64) -> u64 {
    // Header + payload + commit.
    payload_blocks + 2
}

// ── Journal info block ──────────────────────────────────────────────────────

/// Persistent ring bookkeeping stored in the region's first block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalInfo {
    /// Ring slot of the oldest entry not yet checkpointed.
    pub start: u64,
    /// Sequence number the entry at `start` must carry.
    pub sequence: u64,
}

impl JournalInfo {
    fn parse(block: &[u8]) -> Result<Self> {
        let magic = read_le_u64(block, 0x00).map_err(|err| AmberError::Format(err.to_string()))?;
        if magic != INFO_MAGIC {
            return Err(AmberError::Corruption {
                block: 0,
                detail: "journal info magic mismatch".to_owned(),
            });
        }
        let start = read_le_u64(block, 0x08).map_err(|err| AmberError::Format(err.to_string()))?;
        let sequence =
            read_le_u64(block, 0x10).map_err(|err| AmberError::Format(err.to_string()))?;
        let stored = read_le_u32(block, INFO_CHECKSUM_OFFSET)
            .map_err(|err| AmberError::Format(err.to_string()))?;
        let computed = crc32c::crc32c(&block[..INFO_CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(AmberError::Corruption {
                block: 0,
                detail: "journal info checksum mismatch".to_owned(),
            });
        }
        Ok(Self { start, sequence })
    }

    fn serialize(self) -> Vec<u8> {
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        block[0x00..0x08].copy_from_slice(&INFO_MAGIC.to_le_bytes());
        block[0x08..0x10].copy_from_slice(&self.start.to_le_bytes());
        block[0x10..0x18].copy_from_slice(&self.sequence.to_le_bytes());
        let checksum = crc32c::crc32c(&block[..INFO_CHECKSUM_OFFSET]);
        block[INFO_CHECKSUM_OFFSET..INFO_CHECKSUM_OFFSET + 4]
            .copy_from_slice(&checksum.to_le_bytes());
        block
    }
}

/// Write a fresh info block marking the ring empty. Used by mkfs and after
/// a successful replay.
pub fn write_info(
    cx: &Cx,
    dev: &dyn BlockDevice,
    region: JournalRegion,
    info: JournalInfo,
) -> Result<()> {
    dev.write_block(cx, region.info_block(), &info.serialize())
}

/// Read and validate the info block.
pub fn read_info(cx: &Cx, dev: &dyn BlockDevice, region: JournalRegion) -> Result<JournalInfo> {
    let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
    dev.read_block(cx, region.info_block(), &mut block)?;
    JournalInfo::parse(&block)
}

// ── Entry encoding ──────────────────────────────────────────────────────────

struct EntryHeader {
    sequence: u64,
    targets: Vec<u64>,
    payload_checksum: u32,
}

impl EntryHeader {
    fn parse(block: &[u8]) -> Option<Self> {
        let magic = read_le_u64(block, 0x00).ok()?;
        if magic != ENTRY_MAGIC {
            return None;
        }
        let sequence = read_le_u64(block, 0x08).ok()?;
        let target_count = read_le_u64(block, 0x10).ok()?;
        let payload_checksum = read_le_u32(block, 0x18).ok()?;
        let count = usize::try_from(target_count).ok()?;
        if count > MAX_ENTRY_TARGETS {
            return None;
        }
        let mut targets = Vec::with_capacity(count);
        for i in 0..count {
            targets.push(read_le_u64(block, HEADER_TARGETS_OFFSET + i * 8).ok()?);
        }
        Some(Self {
            sequence,
            targets,
            payload_checksum,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        block[0x00..0x08].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
        block[0x08..0x10].copy_from_slice(&self.sequence.to_le_bytes());
        let count = u64::try_from(self.targets.len()).expect("target count fits u64");
        block[0x10..0x18].copy_from_slice(&count.to_le_bytes());
        block[0x18..0x1C].copy_from_slice(&self.payload_checksum.to_le_bytes());
        for (i, target) in self.targets.iter().enumerate() {
            let off = HEADER_TARGETS_OFFSET + i * 8;
            block[off..off + 8].copy_from_slice(&target.to_le_bytes());
        }
        block
    }
}

fn parse_commit(block: &[u8]) -> Option<(u64, u32)> {
    let magic = read_le_u64(block, 0x00).ok()?;
    if magic != COMMIT_MAGIC {
        return None;
    }
    let sequence = read_le_u64(block, 0x08).ok()?;
    let checksum = read_le_u32(block, 0x10).ok()?;
    Some((sequence, checksum))
}

fn serialize_commit(sequence: u64, checksum: u32) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
    block[0x00..0x08].copy_from_slice(&COMMIT_MAGIC.to_le_bytes());
    block[0x08..0x10].copy_from_slice(&sequence.to_le_bytes());
    block[0x10..0x14].copy_from_slice(&checksum.to_le_bytes());
    block
}

fn payload_checksum(payloads: &[(BlockNumber, Vec<u8>)]) -> u32 {
    let mut crc = 0_u32;
    for (_, payload) in payloads {
        crc = crc32c::crc32c_append(crc, payload);
    }
    crc
}

// ── Writer ──────────────────────────────────────────────────────────────────

/// Appends entries to the ring. The caller tracks free space (entries are
/// reclaimed once their home-location writes are durable) and persists the
/// info block when the ring start advances.
#[derive(Debug)]
pub struct JournalWriter {
    region: JournalRegion,
    head: u64,
    sequence: u64,
}

impl JournalWriter {
    /// Resume writing after replay: `head` is the ring slot one past the
    /// last valid entry, `sequence` the next sequence to assign.
    #[must_use]
    pub fn new(region: JournalRegion, head: u64, sequence: u64) -> Self {
        Self {
            region,
            head,
            sequence,
        }
    }

    #[must_use]
    pub fn region(&self) -> JournalRegion {
        self.region
    }

    /// Ring slot the next entry will start at.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.head
    }

    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    /// Append one entry. `writes` pairs home-location device blocks with
    /// their block-sized payloads. Returns the assigned sequence.
    ///
    /// The caller must have verified the entry fits the ring's free space;
    /// the writer only enforces the hard geometry cap.
    pub fn append(
        &mut self,
        cx: &Cx,
        dev: &dyn BlockDevice,
        writes: &[(BlockNumber, Vec<u8>)],
    ) -> Result<u64> {
        if writes.len() > MAX_ENTRY_TARGETS {
            return Err(AmberError::OutOfRange("journal entry has too many targets"));
        }
        let needed = entry_blocks(u64::try_from(writes.len()).expect("len fits u64"));
        if needed > self.region.ring_blocks() {
            return Err(AmberError::NoSpace);
        }
        for (_, payload) in writes {
            if payload.len() != BLOCK_SIZE_BYTES {
                return Err(AmberError::Format(
                    "journal payload must be block-sized".to_owned(),
                ));
            }
        }

        let sequence = self.sequence;
        let checksum = payload_checksum(writes);
        let header = EntryHeader {
            sequence,
            targets: writes.iter().map(|(block, _)| block.0).collect(),
            payload_checksum: checksum,
        };

        self.write_ring_block(cx, dev, &header.serialize())?;
        for (_, payload) in writes {
            self.write_ring_block(cx, dev, payload)?;
        }
        self.write_ring_block(cx, dev, &serialize_commit(sequence, checksum))?;

        self.sequence += 1;
        debug!(
            target: "amber::journal",
            sequence,
            targets = writes.len(),
            head = self.head,
            "entry_appended"
        );
        Ok(sequence)
    }

    fn write_ring_block(&mut self, cx: &Cx, dev: &dyn BlockDevice, data: &[u8]) -> Result<()> {
        let slot = self.region.ring_slot(self.head);
        dev.write_block(cx, slot, data)?;
        self.head = (self.head + 1) % self.region.ring_blocks();
        Ok(())
    }
}

// ── Replay ──────────────────────────────────────────────────────────────────

/// Aggregate counters from a replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayStats {
    pub entries_applied: u64,
    pub blocks_replayed: u64,
    pub torn_entries_discarded: u64,
}

/// Result of replaying the ring: stats plus the resume position for the
/// writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub stats: ReplayStats,
    pub next_slot: u64,
    pub next_sequence: u64,
}

/// Replay committed entries onto their home locations.
///
/// Walks the ring from the recorded start applying entries with matching
/// header/commit sequence and checksum; stops at the first invalid entry.
/// On return the info block has been rewritten to mark the ring empty and
/// the device flushed.
pub fn replay(cx: &Cx, dev: &dyn BlockDevice, region: JournalRegion) -> Result<ReplayOutcome> {
    if region.ring_blocks() < 3 {
        return Err(AmberError::Format(
            "journal region too small for any entry".to_owned(),
        ));
    }
    let journal_info = read_info(cx, dev, region)?;
    if journal_info.start >= region.ring_blocks() {
        return Err(AmberError::Corruption {
            block: region.start.0,
            detail: "journal info start beyond ring".to_owned(),
        });
    }

    let ring = region.ring_blocks();
    let mut stats = ReplayStats::default();
    let mut slot = journal_info.start;
    let mut sequence = journal_info.sequence;
    let mut scanned = 0_u64;
    let mut block = vec![0_u8; BLOCK_SIZE_BYTES];

    loop {
        if scanned >= ring {
            break;
        }
        dev.read_block(cx, region.ring_slot(slot), &mut block)?;
        let Some(header) = EntryHeader::parse(&block) else {
            break;
        };
        if header.sequence != sequence {
            // Stale entry from a previous ring generation.
            break;
        }
        let payload_blocks = u64::try_from(header.targets.len()).expect("len fits u64");
        if entry_blocks(payload_blocks) > ring - scanned {
            warn!(target: "amber::journal", sequence, "entry overruns ring; discarding");
            stats.torn_entries_discarded += 1;
            break;
        }

        // Stage payload blocks.
        let mut payloads: Vec<(BlockNumber, Vec<u8>)> = Vec::with_capacity(header.targets.len());
        let mut cursor = (slot + 1) % ring;
        for &target in &header.targets {
            let mut payload = vec![0_u8; BLOCK_SIZE_BYTES];
            dev.read_block(cx, region.ring_slot(cursor), &mut payload)?;
            payloads.push((BlockNumber(target), payload));
            cursor = (cursor + 1) % ring;
        }

        // Validate the commit marker.
        dev.read_block(cx, region.ring_slot(cursor), &mut block)?;
        let valid = match parse_commit(&block) {
            Some((commit_seq, commit_sum)) => {
                commit_seq == sequence
                    && commit_sum == header.payload_checksum
                    && payload_checksum(&payloads) == header.payload_checksum
            }
            None => false,
        };
        if !valid {
            stats.torn_entries_discarded += 1;
            debug!(target: "amber::journal", sequence, "torn entry discarded");
            break;
        }

        for (target, payload) in &payloads {
            dev.write_block(cx, *target, payload)?;
            stats.blocks_replayed += 1;
        }
        stats.entries_applied += 1;
        sequence += 1;
        scanned += entry_blocks(payload_blocks);
        slot = (cursor + 1) % ring;
    }

    // Everything committed is applied; restart the ring empty.
    dev.sync(cx)?;
    write_info(
        cx,
        dev,
        region,
        JournalInfo {
            start: slot,
            sequence,
        },
    )?;
    dev.sync(cx)?;

    info!(
        target: "amber::journal",
        applied = stats.entries_applied,
        blocks = stats.blocks_replayed,
        "replay_complete"
    );
    Ok(ReplayOutcome {
        stats,
        next_slot: slot,
        next_sequence: sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemBlockDevice {
        blocks: Mutex<HashMap<u64, Vec<u8>>>,
        count: u64,
    }

    impl MemBlockDevice {
        fn new(count: u64) -> Self {
            Self {
                blocks: Mutex::new(HashMap::new()),
                count,
            }
        }
    }

    impl BlockDevice for MemBlockDevice {
        fn read_block(&self, _cx: &Cx, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
            match self.blocks.lock().get(&block.0) {
                Some(data) => buf.copy_from_slice(data),
                None => buf.fill(0),
            }
            Ok(())
        }

        fn write_block(&self, _cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
            self.blocks.lock().insert(block.0, data.to_vec());
            Ok(())
        }

        fn block_count(&self) -> u64 {
            self.count
        }

        fn sync(&self, _cx: &Cx) -> Result<()> {
            Ok(())
        }
    }

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn region() -> JournalRegion {
        JournalRegion {
            start: BlockNumber(100),
            blocks: 17,
        }
    }

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE_BYTES]
    }

    #[test]
    fn info_round_trip() {
        let cx = test_cx();
        let dev = MemBlockDevice::new(200);
        let info = JournalInfo {
            start: 3,
            sequence: 9,
        };
        write_info(&cx, &dev, region(), info).unwrap();
        assert_eq!(read_info(&cx, &dev, region()).unwrap(), info);
    }

    #[test]
    fn corrupt_info_is_rejected() {
        let cx = test_cx();
        let dev = MemBlockDevice::new(200);
        write_info(
            &cx,
            &dev,
            region(),
            JournalInfo {
                start: 0,
                sequence: 1,
            },
        )
        .unwrap();
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        dev.read_block(&cx, BlockNumber(100), &mut block).unwrap();
        block[9] ^= 0x40;
        dev.write_block(&cx, BlockNumber(100), &block).unwrap();
        assert!(read_info(&cx, &dev, region()).is_err());
    }

    #[test]
    fn append_then_replay_applies_writes() {
        let cx = test_cx();
        let dev = MemBlockDevice::new(200);
        let region = region();
        write_info(
            &cx,
            &dev,
            region,
            JournalInfo {
                start: 0,
                sequence: 1,
            },
        )
        .unwrap();

        let mut writer = JournalWriter::new(region, 0, 1);
        writer
            .append(
                &cx,
                &dev,
                &[
                    (BlockNumber(5), block_of(0xAA)),
                    (BlockNumber(7), block_of(0xBB)),
                ],
            )
            .unwrap();
        writer
            .append(&cx, &dev, &[(BlockNumber(9), block_of(0xCC))])
            .unwrap();

        let outcome = replay(&cx, &dev, region).unwrap();
        assert_eq!(outcome.stats.entries_applied, 2);
        assert_eq!(outcome.stats.blocks_replayed, 3);
        assert_eq!(outcome.next_sequence, 3);

        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        dev.read_block(&cx, BlockNumber(5), &mut block).unwrap();
        assert_eq!(block, block_of(0xAA));
        dev.read_block(&cx, BlockNumber(7), &mut block).unwrap();
        assert_eq!(block, block_of(0xBB));
        dev.read_block(&cx, BlockNumber(9), &mut block).unwrap();
        assert_eq!(block, block_of(0xCC));

        // A second replay finds an empty ring.
        let outcome = replay(&cx, &dev, region).unwrap();
        assert_eq!(outcome.stats.entries_applied, 0);
    }

    #[test]
    fn torn_entry_is_discarded() {
        let cx = test_cx();
        let dev = MemBlockDevice::new(200);
        let region = region();
        write_info(
            &cx,
            &dev,
            region,
            JournalInfo {
                start: 0,
                sequence: 1,
            },
        )
        .unwrap();

        let mut writer = JournalWriter::new(region, 0, 1);
        writer
            .append(&cx, &dev, &[(BlockNumber(5), block_of(0xAA))])
            .unwrap();
        let committed_head = writer.head();
        writer
            .append(&cx, &dev, &[(BlockNumber(6), block_of(0xBB))])
            .unwrap();

        // Tear the second entry by zeroing its commit block.
        let commit_slot = region.ring_slot((committed_head + 2) % region.ring_blocks());
        dev.write_block(&cx, commit_slot, &block_of(0)).unwrap();

        let outcome = replay(&cx, &dev, region).unwrap();
        assert_eq!(outcome.stats.entries_applied, 1);
        assert_eq!(outcome.stats.torn_entries_discarded, 1);

        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        dev.read_block(&cx, BlockNumber(5), &mut block).unwrap();
        assert_eq!(block, block_of(0xAA));
        // The torn entry's target must remain untouched.
        dev.read_block(&cx, BlockNumber(6), &mut block).unwrap();
        assert_eq!(block, block_of(0));
    }

    #[test]
    fn payload_corruption_is_discarded() {
        let cx = test_cx();
        let dev = MemBlockDevice::new(200);
        let region = region();
        write_info(
            &cx,
            &dev,
            region,
            JournalInfo {
                start: 0,
                sequence: 1,
            },
        )
        .unwrap();

        let mut writer = JournalWriter::new(region, 0, 1);
        writer
            .append(&cx, &dev, &[(BlockNumber(5), block_of(0xAA))])
            .unwrap();

        // Flip a payload byte in the ring (slot 1 holds the payload).
        let mut payload = block_of(0xAA);
        payload[100] ^= 1;
        dev.write_block(&cx, region.ring_slot(1), &payload).unwrap();

        let outcome = replay(&cx, &dev, region).unwrap();
        assert_eq!(outcome.stats.entries_applied, 0);
        assert_eq!(outcome.stats.torn_entries_discarded, 1);
    }

    #[test]
    fn ring_wraps_across_the_end() {
        let cx = test_cx();
        let dev = MemBlockDevice::new(200);
        let region = region(); // ring of 16 blocks
        write_info(
            &cx,
            &dev,
            region,
            JournalInfo {
                start: 0,
                sequence: 1,
            },
        )
        .unwrap();

        // Fill most of the ring, replay, then append an entry that wraps.
        let mut writer = JournalWriter::new(region, 0, 1);
        for i in 0..4_u64 {
            writer
                .append(&cx, &dev, &[(BlockNumber(30 + i), block_of(0x10))])
                .unwrap();
        }
        let outcome = replay(&cx, &dev, region).unwrap();
        assert_eq!(outcome.stats.entries_applied, 4);
        assert_eq!(outcome.next_slot, 12);

        let mut writer = JournalWriter::new(region, outcome.next_slot, outcome.next_sequence);
        writer
            .append(
                &cx,
                &dev,
                &[
                    (BlockNumber(40), block_of(0x77)),
                    (BlockNumber(41), block_of(0x78)),
                    (BlockNumber(42), block_of(0x79)),
                ],
            )
            .unwrap();
        assert_eq!(writer.head(), 1, "entry wrapped around the ring");

        let outcome = replay(&cx, &dev, region).unwrap();
        assert_eq!(outcome.stats.entries_applied, 1);
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        dev.read_block(&cx, BlockNumber(42), &mut block).unwrap();
        assert_eq!(block, block_of(0x79));
    }

    #[test]
    fn oversized_entry_rejected() {
        let cx = test_cx();
        let dev = MemBlockDevice::new(200);
        let mut writer = JournalWriter::new(region(), 0, 1);
        let writes: Vec<(BlockNumber, Vec<u8>)> = (0..15_u64)
            .map(|i| (BlockNumber(50 + i), block_of(1)))
            .collect();
        assert!(matches!(
            writer.append(&cx, &dev, &writes),
            Err(AmberError::NoSpace)
        ));
    }
}
