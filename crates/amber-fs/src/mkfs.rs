//! Filesystem formatting.

use amber_block::BlockDevice;
use amber_error::{AmberError, Result};
use amber_format::{
    block_map_blocks, block_map_start_block, data_start_block, journal_start_block,
    node_map_blocks, node_map_start_block, total_blocks, Superblock,
};
use amber_journal::{JournalInfo, JournalRegion};
use amber_types::{BlockNumber, BLOCK_SIZE_BYTES, NODES_PER_BLOCK};
use asupersync::Cx;
use tracing::info;

/// Geometry knobs for a fresh filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// Node table capacity; rounded up to a whole node-map block.
    pub inode_count: u64,
    /// Journal region size, including its info block.
    pub journal_blocks: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            inode_count: 512,
            journal_blocks: 128,
        }
    }
}

/// Write a fresh fixed-geometry filesystem covering the whole device.
///
/// The data region receives every block the metadata regions do not need.
pub fn format(cx: &Cx, device: &dyn BlockDevice, options: FormatOptions) -> Result<Superblock> {
    let device_blocks = device.block_count();
    let inode_count = options.inode_count.max(1).div_ceil(NODES_PER_BLOCK) * NODES_PER_BLOCK;
    if options.journal_blocks < 4 {
        return Err(AmberError::Format(
            "journal must have at least four blocks".to_owned(),
        ));
    }

    // The bitmap size depends on the data size; iterate to a fixed point.
    let mut data_blocks = device_blocks;
    for _ in 0..4 {
        let sb = Superblock::new_fixed(data_blocks, options.journal_blocks, inode_count);
        let overhead = data_start_block(&sb);
        let available = device_blocks
            .checked_sub(overhead)
            .ok_or(AmberError::NoSpace)?;
        if available == 0 {
            return Err(AmberError::NoSpace);
        }
        if available == data_blocks {
            break;
        }
        data_blocks = available;
    }

    let sb = Superblock::new_fixed(data_blocks, options.journal_blocks, inode_count);
    if total_blocks(&sb) > device_blocks {
        return Err(AmberError::NoSpace);
    }

    // Zero the metadata regions.
    let zero = vec![0_u8; BLOCK_SIZE_BYTES];
    let bitmap_start = block_map_start_block(&sb);
    for rel in 0..block_map_blocks(&sb) {
        device.write_block(cx, BlockNumber(bitmap_start + rel), &zero)?;
    }
    let node_start = node_map_start_block(&sb);
    for rel in 0..node_map_blocks(&sb) {
        device.write_block(cx, BlockNumber(node_start + rel), &zero)?;
    }

    // Journal: fresh info block marking the ring empty.
    let region = JournalRegion {
        start: BlockNumber(journal_start_block(&sb)),
        blocks: sb.journal_block_count,
    };
    amber_journal::write_info(
        cx,
        device,
        region,
        JournalInfo {
            start: 0,
            sequence: 1,
        },
    )?;

    // Superblock last, then flush everything.
    let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
    sb.serialize(&mut block)
        .map_err(|err| AmberError::Format(err.to_string()))?;
    device.write_block(cx, BlockNumber(0), &block)?;
    device.sync(cx)?;

    info!(
        target: "amber::fs",
        data_blocks = sb.data_block_count,
        inodes = sb.inode_count,
        journal_blocks = sb.journal_block_count,
        "formatted"
    );
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_block::{ByteBlockDevice, FileByteDevice};
    use amber_format::check_superblock;
    use std::io::Write;

    fn temp_device(blocks: usize) -> (tempfile::NamedTempFile, ByteBlockDevice<FileByteDevice>) {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&vec![0_u8; blocks * BLOCK_SIZE_BYTES])
            .expect("fill");
        file.flush().expect("flush");
        let dev = FileByteDevice::open(file.path()).expect("open");
        (file, ByteBlockDevice::new(dev).expect("block device"))
    }

    #[test]
    fn format_produces_checkable_superblock() {
        let cx = Cx::for_testing();
        let (_file, device) = temp_device(1500);
        let sb = format(&cx, &device, FormatOptions::default()).unwrap();
        check_superblock(&sb, device.block_count()).unwrap();
        assert!(sb.data_block_count > 0);
        assert_eq!(sb.alloc_block_count, 0);
        assert_eq!(sb.alloc_inode_count, 0);
        assert_eq!(total_blocks(&sb), device.block_count());

        // The image parses back.
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        device
            .read_block(&cx, BlockNumber(0), &mut block)
            .unwrap();
        let parsed = Superblock::parse(&block).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn format_rejects_tiny_device() {
        let cx = Cx::for_testing();
        let (_file, device) = temp_device(8);
        assert!(format(&cx, &device, FormatOptions::default()).is_err());
    }
}
