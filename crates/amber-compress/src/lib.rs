#![forbid(unsafe_code)]
//! Streaming compression for blob payloads.
//!
//! Wraps a zstd streaming encoder behind the narrow contract the write path
//! relies on: initialize with a capacity bound, feed bytes as the client
//! streams them, finish, and read back the framed size. The write path
//! abandons compression whenever the encoder stops paying for itself; the
//! decoder fails cleanly on truncated or corrupt input.

use amber_error::{AmberError, Result};
use std::io::{Read, Write};
use tracing::trace;

/// Compression level used for blob payloads.
const LEVEL: i32 = 3;

/// Worst-case encoder output for `len` input bytes.
#[must_use]
pub fn buffer_max(len: u64) -> u64 {
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    u64::try_from(zstd::zstd_safe::compress_bound(len)).unwrap_or(u64::MAX)
}

/// Streaming encoder producing a self-framed compressed image.
///
/// `None` encoder means compression has been abandoned for this blob;
/// all further updates are no-ops.
pub struct BlobCompressor {
    encoder: Option<zstd::stream::write::Encoder<'static, Vec<u8>>>,
    finished: Option<Vec<u8>>,
}

impl BlobCompressor {
    /// Start an encoder expecting at most `capacity` bytes of output.
    pub fn new(capacity: u64) -> Result<Self> {
        let capacity = usize::try_from(capacity).map_err(|_| AmberError::NoMemory)?;
        let encoder = zstd::stream::write::Encoder::new(Vec::with_capacity(capacity), LEVEL)
            .map_err(|err| AmberError::Format(format!("encoder init: {err}")))?;
        Ok(Self {
            encoder: Some(encoder),
            finished: None,
        })
    }

    /// Whether the encoder is still live.
    #[must_use]
    pub fn compressing(&self) -> bool {
        self.encoder.is_some() || self.finished.is_some()
    }

    /// Feed the next run of input bytes.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(AmberError::BadState("compressor not active"));
        };
        encoder
            .write_all(data)
            .map_err(|err| AmberError::Format(format!("compress update: {err}")))?;
        Ok(())
    }

    /// Finish the stream, sealing the framed output.
    pub fn end(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.take() else {
            return Err(AmberError::BadState("compressor not active"));
        };
        let out = encoder
            .finish()
            .map_err(|err| AmberError::Format(format!("compress finish: {err}")))?;
        trace!(target: "amber::compress", compressed = out.len(), "stream_sealed");
        self.finished = Some(out);
        Ok(())
    }

    /// Compressed bytes produced so far.
    ///
    /// Before `end` this is a lower bound (the encoder buffers internally);
    /// after `end` it is exact.
    #[must_use]
    pub fn size(&self) -> u64 {
        let len = match (&self.finished, &self.encoder) {
            (Some(out), _) => out.len(),
            (None, Some(encoder)) => encoder.get_ref().len(),
            (None, None) => 0,
        };
        u64::try_from(len).unwrap_or(u64::MAX)
    }

    /// Abandon compression and drop any buffered output.
    pub fn reset(&mut self) {
        self.encoder = None;
        self.finished = None;
    }

    /// Take the sealed output. Valid only after `end`.
    pub fn into_compressed(self) -> Result<Vec<u8>> {
        self.finished
            .ok_or(AmberError::BadState("compressor stream not sealed"))
    }

    /// Borrow the sealed output. Valid only after `end`.
    pub fn compressed(&self) -> Result<&[u8]> {
        self.finished
            .as_deref()
            .ok_or(AmberError::BadState("compressor stream not sealed"))
    }
}

/// Decompress a framed image into `dst`.
///
/// The frame is self-delimiting: trailing bytes after it (block padding)
/// are ignored. Returns `(produced, consumed)` byte counts. Fails with a
/// corruption error on truncated or malformed input, or when the decoded
/// output does not fit `dst`.
pub fn decompress(dst: &mut [u8], src: &[u8]) -> Result<(usize, usize)> {
    let corrupt = |err: std::io::Error| AmberError::Corruption {
        block: 0,
        detail: format!("decompress failed: {err}"),
    };
    let mut decoder = zstd::stream::read::Decoder::with_buffer(src)
        .map_err(corrupt)?
        .single_frame();

    let mut produced = 0_usize;
    while produced < dst.len() {
        match decoder.read(&mut dst[produced..]).map_err(corrupt)? {
            0 => break,
            n => produced += n,
        }
    }
    // Any further decoded byte means the frame was larger than advertised.
    let mut overflow = [0_u8; 1];
    if decoder.read(&mut overflow).map_err(corrupt)? != 0 {
        return Err(AmberError::Corruption {
            block: 0,
            detail: "decompressed output exceeds destination".to_owned(),
        });
    }
    Ok((produced, src.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress_all(data: &[u8]) -> Vec<u8> {
        let mut compressor = BlobCompressor::new(buffer_max(data.len() as u64)).unwrap();
        for chunk in data.chunks(1000) {
            compressor.update(chunk).unwrap();
        }
        compressor.end().unwrap();
        compressor.into_compressed().unwrap()
    }

    #[test]
    fn round_trip() {
        let data = vec![0_u8; 100_000];
        let compressed = compress_all(&data);
        assert!(compressed.len() < data.len());

        let mut out = vec![0xFF_u8; data.len()];
        let (produced, consumed) = decompress(&mut out, &compressed).unwrap();
        assert_eq!(produced, data.len());
        assert_eq!(consumed, compressed.len());
        assert_eq!(out, data);
    }

    #[test]
    fn size_is_exact_after_end() {
        let data = vec![7_u8; 50_000];
        let mut compressor = BlobCompressor::new(buffer_max(50_000)).unwrap();
        compressor.update(&data).unwrap();
        compressor.end().unwrap();
        let size = compressor.size();
        assert_eq!(size, compressor.into_compressed().unwrap().len() as u64);
    }

    #[test]
    fn block_padding_after_frame_is_ignored() {
        let data = vec![0x42_u8; 60_000];
        let mut padded = compress_all(&data);
        let frame_len = padded.len();
        padded.resize(frame_len + 8192 - (frame_len % 8192), 0);

        let mut out = vec![0_u8; data.len()];
        let (produced, _) = decompress(&mut out, &padded).unwrap();
        assert_eq!(produced, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn truncated_input_fails_cleanly() {
        let compressed = compress_all(&vec![3_u8; 100_000]);
        let mut out = vec![0_u8; 100_000];
        assert!(decompress(&mut out, &compressed[..compressed.len() / 2]).is_err());
        assert!(decompress(&mut out, &[0xDE, 0xAD, 0xBE, 0xEF]).is_err());
    }

    #[test]
    fn reset_abandons_stream() {
        let mut compressor = BlobCompressor::new(1024).unwrap();
        compressor.update(b"some bytes").unwrap();
        compressor.reset();
        assert!(!compressor.compressing());
        assert!(compressor.update(b"more").is_err());
        assert_eq!(compressor.size(), 0);
    }

    #[test]
    fn incompressible_data_grows_within_bound() {
        // Pseudo-random bytes barely compress; output must stay within
        // the advertised bound.
        let mut state = 0x1234_5678_u32;
        let data: Vec<u8> = (0..65_536)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        let compressed = compress_all(&data);
        assert!((compressed.len() as u64) <= buffer_max(data.len() as u64));

        let mut out = vec![0_u8; data.len()];
        let (produced, _) = decompress(&mut out, &compressed).unwrap();
        assert_eq!(produced, data.len());
        assert_eq!(out, data);
    }
}
