//! Timing and volume counters, recorded when the `metrics` mount option is
//! set.

use std::time::Duration;

/// Monotonic counters for the mount's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub blobs_created: u64,
    pub blobs_created_total_size: u64,
    pub blobs_opened: u64,
    pub blobs_opened_total_size: u64,
    pub blobs_verified: u64,
    pub blobs_verified_total_size_data: u64,
    pub blobs_verified_total_size_merkle: u64,
    pub data_bytes_written: u64,
    pub merkle_bytes_written: u64,
    pub bytes_read_from_disk: u64,
    pub bytes_compressed_read_from_disk: u64,
    pub bytes_decompressed_from_disk: u64,
    pub total_allocation_time: Duration,
    pub total_write_enqueue_time: Duration,
    pub total_merkle_generation_time: Duration,
    pub total_read_from_disk_time: Duration,
    pub total_read_compressed_time: Duration,
    pub total_decompress_time: Duration,
    pub total_verification_time: Duration,
}

impl Metrics {
    pub fn update_allocation(&mut self, size: u64, duration: Duration) {
        self.blobs_created += 1;
        self.blobs_created_total_size += size;
        self.total_allocation_time += duration;
    }

    pub fn update_lookup(&mut self, size: u64) {
        self.blobs_opened += 1;
        self.blobs_opened_total_size += size;
    }

    pub fn update_client_write(
        &mut self,
        data_size: u64,
        merkle_size: u64,
        enqueue: Duration,
        generation: Duration,
    ) {
        self.data_bytes_written += data_size;
        self.merkle_bytes_written += merkle_size;
        self.total_write_enqueue_time += enqueue;
        self.total_merkle_generation_time += generation;
    }

    pub fn update_disk_read(&mut self, size: u64, duration: Duration) {
        self.bytes_read_from_disk += size;
        self.total_read_from_disk_time += duration;
    }

    pub fn update_decompress(
        &mut self,
        compressed_size: u64,
        uncompressed_size: u64,
        read: Duration,
        decompress: Duration,
    ) {
        self.bytes_compressed_read_from_disk += compressed_size;
        self.bytes_decompressed_from_disk += uncompressed_size;
        self.total_read_compressed_time += read;
        self.total_decompress_time += decompress;
    }

    pub fn update_verify(&mut self, data_size: u64, merkle_size: u64, duration: Duration) {
        self.blobs_verified += 1;
        self.blobs_verified_total_size_data += data_size;
        self.blobs_verified_total_size_merkle += merkle_size;
        self.total_verification_time += duration;
    }
}
