#![forbid(unsafe_code)]
//! End-to-end blob lifecycle: write, read, unlink, clone, cache policy.

use amber_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use amber_fs::{Blobfs, BlobState, CachePolicy, DirCookie, FormatOptions, MountOptions};
use amber_types::Digest;
use asupersync::Cx;
use std::io::Write;
use std::sync::Arc;

fn test_cx() -> Cx {
    Cx::for_testing()
}

struct Fixture {
    _file: tempfile::NamedTempFile,
    path: std::path::PathBuf,
}

impl Fixture {
    /// A formatted image with roughly 10 MiB of data region.
    fn new() -> Self {
        Self::with_blocks(1500)
    }

    fn with_blocks(blocks: usize) -> Self {
        let cx = test_cx();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&vec![0_u8; blocks * amber_types::BLOCK_SIZE_BYTES])
            .expect("fill");
        file.flush().expect("flush");
        let path = file.path().to_path_buf();

        let device = open_device(&path);
        amber_fs::format(&cx, device.as_ref(), FormatOptions::default()).expect("mkfs");
        Self { _file: file, path }
    }

    fn mount(&self, options: MountOptions) -> Arc<Blobfs> {
        let device = open_device(&self.path);
        Blobfs::mount(&test_cx(), device, options, None).expect("mount")
    }
}

fn open_device(path: &std::path::Path) -> Arc<dyn BlockDevice> {
    let file = FileByteDevice::open(path).expect("open image");
    Arc::new(ByteBlockDevice::new(file).expect("block device"))
}

fn digest_of(payload: &[u8]) -> Digest {
    amber_merkle::root_digest(payload).expect("digest")
}

fn write_blob(fs: &Arc<Blobfs>, payload: &[u8]) -> Digest {
    let cx = test_cx();
    let digest = digest_of(payload);
    let blob = fs.new_blob(digest).expect("new blob");
    blob.space_allocate(&cx, payload.len() as u64)
        .expect("allocate");
    blob.write_all(&cx, payload).expect("write");
    assert_eq!(blob.state(), BlobState::Readable);
    digest
}

fn list_all(fs: &Arc<Blobfs>) -> Vec<String> {
    let mut cookie = DirCookie::default();
    let mut out = Vec::new();
    loop {
        let entries = fs.readdir(&mut cookie, 32).expect("readdir");
        if entries.is_empty() {
            break;
        }
        out.extend(entries);
    }
    out
}

#[test]
fn write_then_read_round_trip() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions::default());

    let payload = vec![0x61_u8; 20_000];
    let digest = write_blob(&fs, &payload);

    // Reopen by digest and read everything back.
    let blob = fs.open_blob(digest).expect("open");
    assert_eq!(blob.size(), 20_000);
    let mut out = vec![0_u8; 20_000];
    let read = blob.read_at(&cx, &mut out, 0).expect("read");
    assert_eq!(read, 20_000);
    assert_eq!(out, payload);

    // Partial read at an offset.
    let mut tail = vec![0_u8; 100];
    let read = blob.read_at(&cx, &mut tail, 19_950).expect("read tail");
    assert_eq!(read, 50);
    assert_eq!(&tail[..50], &payload[19_950..]);

    assert_eq!(list_all(&fs), vec![digest.to_hex()]);
    assert!(fs.fsck(&cx).expect("fsck").is_clean());

    drop(blob);
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn contents_survive_remount() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let payload: Vec<u8> = (0..50_000_u32).map(|i| (i % 251) as u8).collect();

    let digest = {
        let fs = fixture.mount(MountOptions::default());
        let digest = write_blob(&fs, &payload);
        fs.shutdown(&cx).expect("shutdown");
        digest
    };

    let fs = fixture.mount(MountOptions::default());
    let blob = fs.open_blob(digest).expect("open after remount");
    let mut out = vec![0_u8; payload.len()];
    blob.read_at(&cx, &mut out, 0).expect("read");
    assert_eq!(out, payload);
    drop(blob);
    assert!(fs.fsck(&cx).expect("fsck").is_clean());
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn digest_mismatch_is_rejected_and_name_is_reusable() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions::default());

    let good = vec![0x61_u8; 20_000];
    let digest = digest_of(&good);

    let blob = fs.new_blob(digest).expect("new blob");
    blob.space_allocate(&cx, 20_000).expect("allocate");
    let bogus = vec![0x62_u8; 20_000];
    let err = blob.write_all(&cx, &bogus).expect_err("lying client");
    assert!(matches!(err, amber_error::AmberError::Corruption { .. }));
    assert_eq!(blob.state(), BlobState::Error);
    drop(blob);

    // The failed vnode is purged on close; the name is free again.
    let blob = fs.new_blob(digest).expect("name reusable");
    blob.space_allocate(&cx, 20_000).expect("allocate");
    blob.write_all(&cx, &good).expect("write good bytes");
    drop(blob);

    assert!(fs.fsck(&cx).expect("fsck").is_clean());
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn null_blob_is_readable_immediately() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions::default());

    let digest = digest_of(&[]);
    let blob = fs.new_blob(digest).expect("new blob");
    blob.space_allocate(&cx, 0).expect("allocate null");
    assert_eq!(blob.state(), BlobState::Readable);
    assert_eq!(blob.storage_blocks(), 0);

    let mut buf = [0_u8; 8];
    assert_eq!(blob.read_at(&cx, &mut buf, 0).expect("read"), 0);
    drop(blob);

    // One node, zero extents.
    let info = fs.info();
    assert_eq!(info.alloc_inode_count, 1);
    assert_eq!(info.alloc_block_count, 0);
    assert_eq!(list_all(&fs), vec![digest.to_hex()]);
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn one_block_blob_stores_no_tree() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions::default());

    let payload = vec![0xAB_u8; amber_types::BLOCK_SIZE_BYTES];
    let digest = write_blob(&fs, &payload);

    let blob = fs.open_blob(digest).expect("open");
    assert_eq!(blob.storage_blocks(), 1, "no merkle block stored");
    let mut out = vec![0_u8; payload.len()];
    blob.read_at(&cx, &mut out, 0).expect("read");
    assert_eq!(out, payload);
    drop(blob);
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn unlink_then_close_releases_storage() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions::default());

    let before = fs.info();
    let payload = vec![0x33_u8; 100_000];
    let digest = write_blob(&fs, &payload);
    assert!(fs.info().alloc_block_count > before.alloc_block_count);

    fs.unlink_blob(&digest).expect("unlink");
    fs.sync(&cx).expect("sync");

    assert!(list_all(&fs).is_empty());
    let after = fs.info();
    assert_eq!(after.alloc_block_count, before.alloc_block_count);
    assert_eq!(after.alloc_inode_count, before.alloc_inode_count);
    assert!(fs.fsck(&cx).expect("fsck").is_clean());

    // The digest is free for a fresh write.
    let blob = fs.new_blob(digest).expect("recreate");
    blob.space_allocate(&cx, payload.len() as u64).expect("allocate");
    blob.write_all(&cx, &payload).expect("write");
    drop(blob);
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn clone_keeps_unlinked_blob_readable() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions::default());

    let baseline = fs.info();
    let payload: Vec<u8> = (0..60_000_u32).map(|i| (i * 7 % 256) as u8).collect();
    let digest = write_blob(&fs, &payload);

    let blob = fs.open_blob(digest).expect("open");
    let clone = blob.clone_data(&cx).expect("clone");
    blob.queue_unlink().expect("unlink");

    // Unlinked: gone from listings, but the clone still reads correctly.
    assert!(list_all(&fs).is_empty());
    let mut out = vec![0_u8; payload.len()];
    clone.read_at(&mut out, 0).expect("clone read");
    assert_eq!(out, payload);

    // Close the handle; the clone alone keeps the blob alive.
    drop(blob);
    let mut window = vec![0_u8; 1000];
    clone.read_at(&mut window, 30_000).expect("clone read after close");
    assert_eq!(&window[..], &payload[30_000..31_000]);

    // Dropping the last clone runs the purge; storage returns.
    drop(clone);
    fs.sync(&cx).expect("sync");
    let after = fs.info();
    assert_eq!(after.alloc_block_count, baseline.alloc_block_count);
    assert_eq!(after.alloc_inode_count, baseline.alloc_inode_count);
    assert!(fs.fsck(&cx).expect("fsck").is_clean());
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn readonly_mount_serves_reads_and_rejects_writes() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let payload = vec![0x47_u8; 30_000];

    let digest = {
        let fs = fixture.mount(MountOptions::default());
        let digest = write_blob(&fs, &payload);
        fs.shutdown(&cx).expect("shutdown");
        digest
    };

    let fs = fixture.mount(MountOptions {
        readonly: true,
        ..MountOptions::default()
    });

    let err = fs.new_blob(digest_of(b"something new")).expect_err("write denied");
    assert!(matches!(err, amber_error::AmberError::BadState(_)));
    assert!(fs.unlink_blob(&digest).is_err());

    let blob = fs.open_blob(digest).expect("reads still work");
    let mut out = vec![0_u8; payload.len()];
    blob.read_at(&cx, &mut out, 0).expect("read");
    assert_eq!(out, payload);
    drop(blob);
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn evict_immediately_rebuilds_buffer_on_reopen() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions {
        cache_policy: CachePolicy::EvictImmediately,
        ..MountOptions::default()
    });

    let payload: Vec<u8> = (0..40_000_u32).map(|i| (i % 253) as u8).collect();
    let digest = write_blob(&fs, &payload);
    fs.sync(&cx).expect("sync");

    // Closing the last handle drops the mapping; reopening re-reads from
    // disk and re-verifies.
    let blob = fs.open_blob(digest).expect("reopen");
    let mut out = vec![0_u8; payload.len()];
    blob.read_at(&cx, &mut out, 0).expect("read after evict");
    assert_eq!(out, payload);
    drop(blob);
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn duplicate_create_is_rejected() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions::default());

    let payload = vec![9_u8; 10_000];
    let digest = write_blob(&fs, &payload);
    assert!(matches!(
        fs.new_blob(digest),
        Err(amber_error::AmberError::AlreadyExists)
    ));

    // Also while a write is merely in flight.
    let other = digest_of(b"pending");
    let pending = fs.new_blob(other).expect("first create");
    assert!(matches!(
        fs.new_blob(other),
        Err(amber_error::AmberError::AlreadyExists)
    ));
    drop(pending);
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn offline_verify_checks_a_blob_end_to_end() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions::default());

    let payload: Vec<u8> = (0..25_000_u32).map(|i| (i % 199) as u8).collect();
    write_blob(&fs, &payload);
    fs.sync(&cx).expect("sync");

    // The first blob occupies the first node slot.
    fs.verify_blob(&cx, amber_types::NodeIndex(0))
        .expect("offline verify");
    assert!(matches!(
        fs.verify_blob(&cx, amber_types::NodeIndex(1)),
        Err(amber_error::AmberError::NotFound(_))
    ));
    fs.shutdown(&cx).expect("shutdown");
}

#[test]
fn metrics_record_write_and_verify() {
    let cx = test_cx();
    let fixture = Fixture::new();
    let fs = fixture.mount(MountOptions {
        metrics: true,
        ..MountOptions::default()
    });

    let payload = vec![0x11_u8; 30_000];
    let digest = write_blob(&fs, &payload);

    // Force a cold read through a remount-free path: evict nothing, the
    // write path already verified, so reopen and read.
    let blob = fs.open_blob(digest).expect("open");
    let mut out = vec![0_u8; 100];
    blob.read_at(&cx, &mut out, 0).expect("read");
    drop(blob);

    let metrics = fs.metrics();
    assert_eq!(metrics.blobs_created, 1);
    assert!(metrics.data_bytes_written >= 30_000);
    assert!(metrics.blobs_opened >= 1);
    fs.shutdown(&cx).expect("shutdown");
}
