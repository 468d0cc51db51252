#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits with `&Cx` capability
//! context for cooperative cancellation, a file-backed device using
//! pread/pwrite semantics, and the fifo-style `BlockClient` through which
//! the filesystem registers shared buffers and submits batched block
//! transactions.

use asupersync::Cx;
use amber_error::{AmberError, Result};
use amber_types::{BlockNumber, BLOCK_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| AmberError::Cancelled)
}

// ── Byte-addressed devices ──────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let len = u64::try_from(buf.len())
            .map_err(|_| AmberError::Format("read length overflows u64".to_owned()))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| AmberError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(AmberError::OutOfRange("read beyond end of device"));
        }
        self.file.read_exact_at(buf, offset)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if !self.writable {
            return Err(AmberError::BadState("device opened read-only"));
        }
        let len = u64::try_from(buf.len())
            .map_err(|_| AmberError::Format("write length overflows u64".to_owned()))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| AmberError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(AmberError::OutOfRange("write beyond end of device"));
        }
        self.file.write_all_at(buf, offset)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_all()?;
        cx_checkpoint(cx)?;
        Ok(())
    }
}

// ── Block-addressed devices ─────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number into `buf`. `buf.len()` MUST equal [`BLOCK_SIZE`].
    fn read_block(&self, cx: &Cx, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write a block by number. `data.len()` MUST equal [`BLOCK_SIZE`].
    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

/// Adapter exposing a [`ByteDevice`] at block granularity.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D) -> Result<Self> {
        let len = inner.len_bytes();
        if len % BLOCK_SIZE != 0 {
            return Err(AmberError::Format(format!(
                "image length {len} is not a multiple of the block size"
            )));
        }
        let block_count = len / BLOCK_SIZE;
        Ok(Self { inner, block_count })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, cx: &Cx, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        if block.0 >= self.block_count {
            return Err(AmberError::OutOfRange("block beyond end of device"));
        }
        let offset = block
            .to_byte_offset()
            .ok_or(AmberError::OutOfRange("block offset overflow"))?;
        self.inner.read_exact_at(cx, offset, buf)
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() as u64 != BLOCK_SIZE {
            return Err(AmberError::Format(format!(
                "write_block data size mismatch: got {}",
                data.len()
            )));
        }
        if block.0 >= self.block_count {
            return Err(AmberError::OutOfRange("block beyond end of device"));
        }
        let offset = block
            .to_byte_offset()
            .ok_or(AmberError::OutOfRange("block offset overflow"))?;
        self.inner.write_all_at(cx, offset, data)
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}

// ── Shared buffers ──────────────────────────────────────────────────────────

/// Page-granular shared memory buffer registered with the block client.
///
/// The in-process stand-in for a host memory object shared with the block
/// device: the owner maps it, the client reads and writes it during
/// transactions, and read-only snapshots can be taken for clone handles.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl SharedBuffer {
    /// Allocate a zero-filled buffer of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0_u8; len])),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn copy_in(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut guard = self.bytes.write();
        let end = offset
            .checked_add(data.len())
            .ok_or(AmberError::OutOfRange("buffer offset overflow"))?;
        if end > guard.len() {
            return Err(AmberError::OutOfRange("copy_in beyond buffer end"));
        }
        guard[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes out of the buffer at `offset` into `out`.
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let guard = self.bytes.read();
        let end = offset
            .checked_add(out.len())
            .ok_or(AmberError::OutOfRange("buffer offset overflow"))?;
        if end > guard.len() {
            return Err(AmberError::OutOfRange("copy_out beyond buffer end"));
        }
        out.copy_from_slice(&guard[offset..end]);
        Ok(())
    }

    /// Owned snapshot of `[offset, offset + len)`.
    pub fn snapshot(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0_u8; len];
        self.copy_out(offset, &mut out)?;
        Ok(out)
    }

    /// Run `f` over the full buffer contents without copying.
    pub fn with_slice<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.bytes.read())
    }

    /// Run `f` over the full buffer contents mutably.
    pub fn with_slice_mut<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> T {
        f(&mut self.bytes.write())
    }
}

// ── Fifo-style block client ─────────────────────────────────────────────────

/// Handle to a buffer registered with a [`BlockClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u16);

/// Block transaction opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
    CloseBuffer,
}

/// One request in a block transaction. Offsets and lengths are in blocks.
#[derive(Debug, Clone, Copy)]
pub struct BlockFifoRequest {
    pub buffer: BufferId,
    pub op: BlockOp,
    pub buf_offset: u64,
    pub dev_offset: u64,
    pub length: u64,
}

/// Transport between the filesystem and the block device.
///
/// Buffers are registered up front; transactions then move whole blocks
/// between registered buffers and the device. Each transaction is atomic
/// from the caller's perspective: on error the caller treats the whole
/// batch as failed.
pub trait BlockClient: Send + Sync {
    fn attach_buffer(&self, buffer: &SharedBuffer) -> Result<BufferId>;

    fn detach_buffer(&self, id: BufferId) -> Result<()>;

    fn transaction(&self, cx: &Cx, requests: &[BlockFifoRequest]) -> Result<()>;

    fn block_count(&self) -> u64;
}

/// In-process [`BlockClient`] over any [`BlockDevice`].
pub struct FifoClient {
    device: Arc<dyn BlockDevice>,
    buffers: Mutex<BufferTable>,
}

#[derive(Default)]
struct BufferTable {
    next_id: u16,
    map: HashMap<u16, SharedBuffer>,
}

impl FifoClient {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            buffers: Mutex::new(BufferTable::default()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    fn buffer(&self, id: BufferId) -> Result<SharedBuffer> {
        self.buffers
            .lock()
            .map
            .get(&id.0)
            .cloned()
            .ok_or(AmberError::BadState("buffer not attached"))
    }

    fn run_copy(&self, cx: &Cx, req: &BlockFifoRequest) -> Result<()> {
        let buffer = self.buffer(req.buffer)?;
        let buf_byte = req
            .buf_offset
            .checked_mul(BLOCK_SIZE)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or(AmberError::OutOfRange("buffer offset overflow"))?;
        let mut block = vec![0_u8; amber_types::BLOCK_SIZE_BYTES];
        for i in 0..req.length {
            cx_checkpoint(cx)?;
            let dev_block = BlockNumber(
                req.dev_offset
                    .checked_add(i)
                    .ok_or(AmberError::OutOfRange("device offset overflow"))?,
            );
            let byte = buf_byte + usize::try_from(i * BLOCK_SIZE).map_err(|_| {
                AmberError::OutOfRange("buffer offset overflow")
            })?;
            match req.op {
                BlockOp::Read => {
                    self.device.read_block(cx, dev_block, &mut block)?;
                    buffer.copy_in(byte, &block)?;
                }
                BlockOp::Write => {
                    buffer.copy_out(byte, &mut block)?;
                    self.device.write_block(cx, dev_block, &block)?;
                }
                BlockOp::Flush | BlockOp::CloseBuffer => unreachable!(),
            }
        }
        Ok(())
    }
}

impl BlockClient for FifoClient {
    fn attach_buffer(&self, buffer: &SharedBuffer) -> Result<BufferId> {
        let mut table = self.buffers.lock();
        let id = table.next_id;
        table.next_id = table
            .next_id
            .checked_add(1)
            .ok_or(AmberError::NoMemory)?;
        table.map.insert(id, buffer.clone());
        trace!(target: "amber::block", id, "buffer_attached");
        Ok(BufferId(id))
    }

    fn detach_buffer(&self, id: BufferId) -> Result<()> {
        let removed = self.buffers.lock().map.remove(&id.0);
        if removed.is_none() {
            return Err(AmberError::BadState("buffer not attached"));
        }
        trace!(target: "amber::block", id = id.0, "buffer_detached");
        Ok(())
    }

    fn transaction(&self, cx: &Cx, requests: &[BlockFifoRequest]) -> Result<()> {
        cx_checkpoint(cx)?;
        debug!(
            target: "amber::block",
            requests = requests.len(),
            "transaction"
        );
        for req in requests {
            match req.op {
                BlockOp::Flush => self.device.sync(cx)?,
                BlockOp::CloseBuffer => self.detach_buffer(req.buffer)?,
                BlockOp::Read | BlockOp::Write => self.run_copy(cx, req)?,
            }
        }
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.device.block_count()
    }
}

/// Accumulates read requests and issues them as one transaction.
///
/// Mirrors the write side's batching for the lazy-materialization path: the
/// caller streams contiguous runs into the transaction and commits once.
pub struct ReadTransaction<'a> {
    client: &'a dyn BlockClient,
    requests: Vec<BlockFifoRequest>,
}

impl<'a> ReadTransaction<'a> {
    #[must_use]
    pub fn new(client: &'a dyn BlockClient) -> Self {
        Self {
            client,
            requests: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, buffer: BufferId, buf_offset: u64, dev_offset: u64, length: u64) {
        self.requests.push(BlockFifoRequest {
            buffer,
            op: BlockOp::Read,
            buf_offset,
            dev_offset,
            length,
        });
    }

    pub fn transact(self, cx: &Cx) -> Result<()> {
        if self.requests.is_empty() {
            return Ok(());
        }
        self.client.transaction(cx, &self.requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_types::BLOCK_SIZE_BYTES;
    use std::io::Write;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn temp_device(blocks: usize) -> (tempfile::NamedTempFile, FileByteDevice) {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&vec![0_u8; blocks * BLOCK_SIZE_BYTES])
            .expect("fill");
        file.flush().expect("flush");
        let dev = FileByteDevice::open(file.path()).expect("open");
        (file, dev)
    }

    #[test]
    fn file_device_round_trip() {
        let cx = test_cx();
        let (_file, dev) = temp_device(4);
        assert_eq!(dev.len_bytes(), 4 * BLOCK_SIZE);

        let payload = vec![0x5A_u8; 100];
        dev.write_all_at(&cx, 300, &payload).unwrap();
        let mut out = vec![0_u8; 100];
        dev.read_exact_at(&cx, 300, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn file_device_rejects_out_of_bounds() {
        let cx = test_cx();
        let (_file, dev) = temp_device(1);
        let mut buf = vec![0_u8; 16];
        assert!(dev.read_exact_at(&cx, BLOCK_SIZE, &mut buf).is_err());
        assert!(dev.write_all_at(&cx, BLOCK_SIZE - 8, &buf).is_err());
    }

    #[test]
    fn block_device_adapter() {
        let cx = test_cx();
        let (_file, dev) = temp_device(4);
        let blocks = ByteBlockDevice::new(dev).unwrap();
        assert_eq!(blocks.block_count(), 4);

        let data = vec![0xAB_u8; BLOCK_SIZE_BYTES];
        blocks.write_block(&cx, BlockNumber(2), &data).unwrap();
        let mut out = vec![0_u8; BLOCK_SIZE_BYTES];
        blocks.read_block(&cx, BlockNumber(2), &mut out).unwrap();
        assert_eq!(out, data);

        assert!(blocks.write_block(&cx, BlockNumber(4), &data).is_err());
        assert!(blocks.write_block(&cx, BlockNumber(0), &data[..10]).is_err());
    }

    #[test]
    fn shared_buffer_bounds() {
        let buf = SharedBuffer::new(64);
        assert!(buf.copy_in(60, &[0_u8; 8]).is_err());
        buf.copy_in(60, &[7_u8; 4]).unwrap();
        assert_eq!(buf.snapshot(60, 4).unwrap(), vec![7_u8; 4]);
    }

    #[test]
    fn fifo_client_read_write_flush() {
        let cx = test_cx();
        let (_file, dev) = temp_device(8);
        let device: Arc<dyn BlockDevice> = Arc::new(ByteBlockDevice::new(dev).unwrap());
        let client = FifoClient::new(device);

        let buffer = SharedBuffer::new(2 * BLOCK_SIZE_BYTES);
        buffer.copy_in(0, &vec![0x11_u8; BLOCK_SIZE_BYTES]).unwrap();
        buffer
            .copy_in(BLOCK_SIZE_BYTES, &vec![0x22_u8; BLOCK_SIZE_BYTES])
            .unwrap();
        let id = client.attach_buffer(&buffer).unwrap();

        client
            .transaction(
                &cx,
                &[
                    BlockFifoRequest {
                        buffer: id,
                        op: BlockOp::Write,
                        buf_offset: 0,
                        dev_offset: 3,
                        length: 2,
                    },
                    BlockFifoRequest {
                        buffer: id,
                        op: BlockOp::Flush,
                        buf_offset: 0,
                        dev_offset: 0,
                        length: 0,
                    },
                ],
            )
            .unwrap();

        let readback = SharedBuffer::new(2 * BLOCK_SIZE_BYTES);
        let rb_id = client.attach_buffer(&readback).unwrap();
        client
            .transaction(
                &cx,
                &[BlockFifoRequest {
                    buffer: rb_id,
                    op: BlockOp::Read,
                    buf_offset: 0,
                    dev_offset: 3,
                    length: 2,
                }],
            )
            .unwrap();
        assert_eq!(
            readback.snapshot(0, BLOCK_SIZE_BYTES).unwrap(),
            vec![0x11_u8; BLOCK_SIZE_BYTES]
        );
        assert_eq!(
            readback
                .snapshot(BLOCK_SIZE_BYTES, BLOCK_SIZE_BYTES)
                .unwrap(),
            vec![0x22_u8; BLOCK_SIZE_BYTES]
        );
    }

    #[test]
    fn detached_buffer_rejected() {
        let cx = test_cx();
        let (_file, dev) = temp_device(2);
        let device: Arc<dyn BlockDevice> = Arc::new(ByteBlockDevice::new(dev).unwrap());
        let client = FifoClient::new(device);

        let buffer = SharedBuffer::new(BLOCK_SIZE_BYTES);
        let id = client.attach_buffer(&buffer).unwrap();
        client.detach_buffer(id).unwrap();
        assert!(client.detach_buffer(id).is_err());

        let err = client.transaction(
            &cx,
            &[BlockFifoRequest {
                buffer: id,
                op: BlockOp::Read,
                buf_offset: 0,
                dev_offset: 0,
                length: 1,
            }],
        );
        assert!(err.is_err());
    }
}
