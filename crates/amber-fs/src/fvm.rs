//! Volume-manager integration.
//!
//! On a slice-backed layout each metadata region occupies a run of
//! virtual slices that the volume manager can grow on demand. The mount
//! consistency check compares the manager's view of each region with the
//! superblock's slice counts: missing slices are fatal, excess slices are
//! shrunk back to the filesystem's expectation.

use amber_error::{AmberError, Result};
use amber_format::{
    Superblock, FVM_BLOCK_MAP_START, FVM_DATA_START, FVM_JOURNAL_START, FVM_NODE_MAP_START,
};
use tracing::{error, warn};

/// Volume geometry reported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub slice_size: u64,
    pub vslice_count: u64,
}

/// Allocation state of one queried virtual-slice run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub allocated: bool,
    pub count: u64,
}

/// The volume-manager collaborator.
pub trait VolumeManager: Send + Sync {
    fn query(&self) -> Result<VolumeInfo>;

    /// For each start slice, the allocation state of the run beginning
    /// there.
    fn vslice_query(&self, starts: &[u64]) -> Result<Vec<SliceRange>>;

    fn extend(&self, offset_slices: u64, length_slices: u64) -> Result<()>;

    fn shrink(&self, offset_slices: u64, length_slices: u64) -> Result<()>;
}

/// Region start slices in superblock order: block map, node map, journal,
/// data.
#[must_use]
pub fn region_start_slices(sb: &Superblock) -> [u64; 4] {
    let bps = sb.blocks_per_slice().max(1);
    [
        FVM_BLOCK_MAP_START / bps,
        FVM_NODE_MAP_START / bps,
        FVM_JOURNAL_START / bps,
        FVM_DATA_START / bps,
    ]
}

/// Verify the volume manager agrees with the superblock's slice counts.
///
/// Any region the filesystem expects that is not fully allocated is fatal;
/// any region with excess slices is shrunk back.
pub fn check_fvm_consistency(sb: &Superblock, volume: &dyn VolumeManager) -> Result<()> {
    if !sb.is_fvm() {
        return Ok(());
    }

    let info = volume
        .query()
        .map_err(|err| AmberError::Unavailable(format!("volume query failed: {err}")))?;
    if info.slice_size != sb.slice_size {
        return Err(AmberError::BadState("volume slice size mismatch"));
    }

    let expected = [
        u64::from(sb.abm_slices),
        u64::from(sb.ino_slices),
        u64::from(sb.journal_slices),
        u64::from(sb.dat_slices),
    ];
    let starts = region_start_slices(sb);
    let ranges = volume
        .vslice_query(&starts)
        .map_err(|err| AmberError::Unavailable(format!("slice query failed: {err}")))?;
    if ranges.len() != starts.len() {
        return Err(AmberError::BadState("volume returned wrong range count"));
    }

    for (i, range) in ranges.iter().enumerate() {
        if !range.allocated || range.count < expected[i] {
            error!(
                target: "amber::fs",
                region = i,
                expected = expected[i],
                actual = range.count,
                "slice range missing"
            );
            return Err(AmberError::Corruption {
                block: starts[i],
                detail: "volume slice range smaller than superblock expects".to_owned(),
            });
        }
        if range.count > expected[i] {
            // Excess slices were provisioned but never recorded; give them
            // back so the superblock stays authoritative.
            warn!(
                target: "amber::fs",
                region = i,
                excess = range.count - expected[i],
                "shrinking excess slices"
            );
            volume
                .shrink(starts[i] + expected[i], range.count - expected[i])
                .map_err(|_| AmberError::Corruption {
                    block: starts[i],
                    detail: "failed to shrink excess slices".to_owned(),
                })?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory volume manager tracking per-region slice counts.
    pub struct FakeVolume {
        pub info: VolumeInfo,
        pub regions: Mutex<Vec<(u64, u64)>>,
        pub fail_extend: Mutex<bool>,
    }

    impl FakeVolume {
        pub fn new(sb: &Superblock) -> Self {
            let starts = region_start_slices(sb);
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
}
