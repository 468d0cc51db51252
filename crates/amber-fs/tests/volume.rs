#![forbid(unsafe_code)]
//! Slice-backed (volume-manager) mounts: consistency checking and
//! on-demand growth of the data region and node table.

use amber_block::BlockDevice;
use amber_error::{AmberError, Result};
use amber_format::{
    journal_start_block, Superblock, FLAG_FVM, FVM_NODE_MAP_START,
};
use amber_fs::{Blobfs, MountOptions, SliceRange, VolumeInfo, VolumeManager};
use amber_journal::{JournalInfo, JournalRegion};
use amber_types::{BlockNumber, Digest, BLOCK_SIZE, BLOCK_SIZE_BYTES, NODE_SIZE};
use asupersync::Cx;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

fn test_cx() -> Cx {
    Cx::for_testing()
}

/// Sparse in-memory device; slice-backed layouts put regions at large
/// fixed offsets, so a dense file image would be wasteful here.
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

/// Volume manager tracking per-region slice runs.
struct FakeVolume {
    info: VolumeInfo,
    regions: Mutex<Vec<(u64, u64)>>,
    fail_extend: Mutex<bool>,
}

impl FakeVolume {
    fn new(sb: &Superblock) -> Self {
        let bps = sb.blocks_per_slice();
        let starts = [
            amber_format::FVM_BLOCK_MAP_START / bps,
            FVM_NODE_MAP_START / bps,
            amber_format::FVM_JOURNAL_START / bps,
            amber_format::FVM_DATA_START / bps,
        ];
        let counts = [
            u64::from(sb.abm_slices),
            u64::from(sb.ino_slices),
            u64::from(sb.journal_slices),
            u64::from(sb.dat_slices),
        ];
        Self {
            info: VolumeInfo {
                slice_size: sb.slice_size,
                vslice_count: sb.vslice_count,
            },
            regions: Mutex::new(starts.iter().copied().zip(counts).collect()),
            fail_extend: Mutex::new(false),
        }
    }
}

impl VolumeManager for FakeVolume {
    fn query(&self) -> Result<VolumeInfo> {
        Ok(self.info)
    }

    fn vslice_query(&self, starts: &[u64]) -> Result<Vec<SliceRange>> {
        let regions = self.regions.lock();
        Ok(starts
            .iter()
            .map(|start| {
                regions
                    .iter()
                    .find(|(region_start, _)| region_start == start)
                    .map_or(
                        SliceRange {
                            allocated: false,
                            count: 0,
                        },
                        |&(_, count)| SliceRange {
                            allocated: count > 0,
                            count,
                        },
                    )
            })
            .collect())
    }

    fn extend(&self, offset_slices: u64, length_slices: u64) -> Result<()> {
        if *self.fail_extend.lock() {
            return Err(AmberError::NoSpace);
        }
        let mut regions = self.regions.lock();
        for (start, count) in regions.iter_mut() {
            if *start + *count == offset_slices {
                *count += length_slices;
                return Ok(());
            }
        }
        Err(AmberError::OutOfRange("extend outside any region"))
    }

    fn shrink(&self, offset_slices: u64, length_slices: u64) -> Result<()> {
        let mut regions = self.regions.lock();
        for (start, count) in regions.iter_mut() {
            if offset_slices > *start && offset_slices + length_slices == *start + *count {
                *count -= length_slices;
                return Ok(());
            }
        }
        Err(AmberError::OutOfRange("shrink outside any region"))
    }
}

/// Write a slice-backed filesystem with one block per slice: a single
/// node slice (128 inodes) and a small data region that growth tests can
/// exhaust quickly.
fn format_fvm(cx: &Cx, device: &dyn BlockDevice, dat_slices: u32) -> Superblock {
    let mut sb = Superblock::new_fixed(u64::from(dat_slices), 8, BLOCK_SIZE / NODE_SIZE);
    sb.flags |= FLAG_FVM;
    sb.slice_size = BLOCK_SIZE;
    sb.abm_slices = 1;
    sb.ino_slices = 1;
    sb.journal_slices = 8;
    sb.dat_slices = dat_slices;
    sb.vslice_count = u64::from(1 + 1 + 8 + dat_slices);

    let zero = vec![0_u8; BLOCK_SIZE_BYTES];
    device
        .write_block(cx, BlockNumber(amber_format::FVM_BLOCK_MAP_START), &zero)
        .expect("zero bitmap");
    device
        .write_block(cx, BlockNumber(FVM_NODE_MAP_START), &zero)
        .expect("zero node map");
    amber_journal::write_info(
        cx,
        device,
        JournalRegion {
            start: BlockNumber(journal_start_block(&sb)),
            blocks: sb.journal_block_count,
        },
        JournalInfo {
            start: 0,
            sequence: 1,
        },
    )
    .expect("journal info");

    let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
    sb.serialize(&mut block).expect("serialize");
    device.write_block(cx, BlockNumber(0), &block).expect("superblock");
    sb
}

fn digest_of(payload: &[u8]) -> Digest {
    amber_merkle::root_digest(payload).expect("digest")
}

#[test]
fn mount_checks_volume_consistency() {
    let cx = test_cx();
    let device = Arc::new(MemBlockDevice::new(1 << 20));
    let sb = format_fvm(&cx, device.as_ref(), 8);
    let volume = Arc::new(FakeVolume::new(&sb));

    let fs = Blobfs::mount(
        &cx,
        Arc::clone(&device) as Arc<dyn BlockDevice>,
        MountOptions::default(),
        Some(volume),
    )
    .expect("mount");
    assert!(fs.info().is_fvm());
    fs.shutdown(&cx).expect("shutdown");

    // Without a volume manager the mount is refused outright.
    assert!(Blobfs::mount(
        &cx,
        device as Arc<dyn BlockDevice>,
        MountOptions::default(),
        None,
    )
    .is_err());
}

#[test]
fn data_region_grows_on_demand() {
    let cx = test_cx();
    let device = Arc::new(MemBlockDevice::new(1 << 20));
    let sb = format_fvm(&cx, device.as_ref(), 4);
    let volume = Arc::new(FakeVolume::new(&sb));

    let fs = Blobfs::mount(
        &cx,
        Arc::clone(&device) as Arc<dyn BlockDevice>,
        MountOptions::default(),
        Some(Arc::clone(&volume) as Arc<dyn VolumeManager>),
    )
    .expect("mount");

    // 6 data blocks + 1 merkle block exceed the provisioned 4 slices.
    let payload: Vec<u8> = (0..6 * BLOCK_SIZE_BYTES).map(|i| (i % 239) as u8).collect();
    let digest = digest_of(&payload);
    let blob = fs.new_blob(digest).expect("new blob");
    blob.space_allocate(&cx, payload.len() as u64).expect("grown allocate");
    blob.write_all(&cx, &payload).expect("write");
    drop(blob);
    fs.sync(&cx).expect("sync");

    let info = fs.info();
    assert!(info.dat_slices > 4, "data region must have grown");
    assert!(info.data_block_count >= 7);

    let blob = fs.open_blob(digest).expect("open");
    let mut out = vec![0_u8; payload.len()];
    blob.read_at(&cx, &mut out, 0).expect("read");
    assert_eq!(out, payload);
    drop(blob);
    assert!(fs.fsck(&cx).expect("fsck").is_clean());
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn failed_growth_reports_no_space_and_leaves_state_intact() {
    let cx = test_cx();
    let device = Arc::new(MemBlockDevice::new(1 << 20));
    let sb = format_fvm(&cx, device.as_ref(), 4);
    let volume = Arc::new(FakeVolume::new(&sb));
    *volume.fail_extend.lock() = true;

    let fs = Blobfs::mount(
        &cx,
        Arc::clone(&device) as Arc<dyn BlockDevice>,
        MountOptions::default(),
        Some(Arc::clone(&volume) as Arc<dyn VolumeManager>),
    )
    .expect("mount");

    let before = fs.info();
    let payload = vec![0x13_u8; 6 * BLOCK_SIZE_BYTES];
    let blob = fs.new_blob(digest_of(&payload)).expect("new blob");
    let err = blob
        .space_allocate(&cx, payload.len() as u64)
        .expect_err("growth must fail");
    assert!(matches!(err, AmberError::NoSpace));
    drop(blob);

    let after = fs.info();
    assert_eq!(after.dat_slices, before.dat_slices);
    assert_eq!(after.alloc_block_count, before.alloc_block_count);

    // A blob that fits the existing region still works.
    let small = vec![0x14_u8; BLOCK_SIZE_BYTES];
    let blob = fs.new_blob(digest_of(&small)).expect("new blob");
    blob.space_allocate(&cx, small.len() as u64).expect("allocate");
    blob.write_all(&cx, &small).expect("write");
    drop(blob);
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn node_table_grows_when_inodes_run_out() {
    let cx = test_cx();
    let device = Arc::new(MemBlockDevice::new(1 << 20));
    // Plenty of data slices; the node table (128 inodes) is the limit.
    let sb = format_fvm(&cx, device.as_ref(), 256);
    let volume = Arc::new(FakeVolume::new(&sb));

    let fs = Blobfs::mount(
        &cx,
        Arc::clone(&device) as Arc<dyn BlockDevice>,
        MountOptions::default(),
        Some(Arc::clone(&volume) as Arc<dyn VolumeManager>),
    )
    .expect("mount");
    assert_eq!(fs.info().inode_count, 128);

    for i in 0..130_u32 {
        let mut payload = vec![0_u8; 64];
        payload[..4].copy_from_slice(&i.to_le_bytes());
        let digest = digest_of(&payload);
        let blob = fs.new_blob(digest).expect("new blob");
        blob.space_allocate(&cx, payload.len() as u64).expect("allocate");
        blob.write_all(&cx, &payload).expect("write");
        drop(blob);
    }

    let info = fs.info();
    assert!(info.inode_count > 128, "node table must have grown");
    assert_eq!(info.alloc_inode_count, 130);
    assert!(fs.fsck(&cx).expect("fsck").is_clean());
    fs.shutdown(&cx).expect("shutdown");
}
