//! Extent and block iterators.
//!
//! Three layers walk a blob's storage: extent iterators yield whole
//! extents (from the committed node chain or from in-flight reservations),
//! the block iterator flattens them into a logical block cursor, and
//! `stream_blocks` drives the cursor forward emitting maximal contiguous
//! runs to a sink.

use amber_alloc::{Allocator, ReservedExtent};
use amber_error::{AmberError, Result};
use amber_format::Extent;
use amber_types::NodeIndex;

/// Yields a blob's extents in order.
pub trait ExtentIterator {
    /// The next extent, or `None` when the blob's extents are exhausted.
    fn next_extent(&mut self) -> Result<Option<Extent>>;

    /// Node holding the extent most recently yielded.
    fn node_index(&self) -> NodeIndex;
}

// ── Allocated extents ───────────────────────────────────────────────────────

/// Walks the extents of a committed blob: head inode first, then the
/// container chain via `next_node`, until the head's extent count is
/// exhausted.
pub struct AllocatedExtentIterator {
    entries: Vec<(NodeIndex, Extent)>,
    cursor: usize,
    current_node: NodeIndex,
}

impl AllocatedExtentIterator {
    /// Snapshot the extent chain rooted at `head`.
    ///
    /// Fails with a corruption error when the chain is malformed: a
    /// non-container linked where a container is required, or a chain
    /// shorter than the head's extent count claims.
    pub fn new(allocator: &Allocator, head: NodeIndex) -> Result<Self> {
        let entries = allocator.with_node_map(|nodes| -> Result<Vec<(NodeIndex, Extent)>> {
            let inode = nodes.inode(head)?;
            if !inode.prelude.is_allocated() || inode.prelude.is_extent_container() {
                return Err(AmberError::Corruption {
                    block: u64::from(head.0),
                    detail: "extent chain head is not an allocated inode".to_owned(),
                });
            }
            let total = usize::from(inode.extent_count);
            let mut entries = Vec::with_capacity(total);
            if total > 0 {
                entries.push((head, inode.inline_extent));
            }

            let mut next = inode.prelude.next_node;
            while entries.len() < total {
                let node = NodeIndex(next);
                let container = nodes.container(node).map_err(|_| AmberError::Corruption {
                    block: u64::from(next),
                    detail: "extent chain links a non-container node".to_owned(),
                })?;
                if !container.prelude.is_allocated() {
                    return Err(AmberError::Corruption {
                        block: u64::from(next),
                        detail: "extent chain links an unallocated node".to_owned(),
                    });
                }
                let in_container = usize::from(container.extent_count);
                if in_container == 0 || in_container > container.extents.len() {
                    return Err(AmberError::Corruption {
                        block: u64::from(next),
                        detail: "container extent count out of range".to_owned(),
                    });
                }
                for extent in &container.extents[..in_container.min(total - entries.len())] {
                    entries.push((node, *extent));
                }
                next = container.prelude.next_node;
            }
            Ok(entries)
        })?;

        Ok(Self {
            entries,
            cursor: 0,
            current_node: head,
        })
    }
}

impl ExtentIterator for AllocatedExtentIterator {
    fn next_extent(&mut self) -> Result<Option<Extent>> {
        let Some(&(node, extent)) = self.entries.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        self.current_node = node;
        Ok(Some(extent))
    }

    fn node_index(&self) -> NodeIndex {
        self.current_node
    }
}

// ── Reserved extents ────────────────────────────────────────────────────────

/// Same shape over not-yet-committed reservations, used during the initial
/// write before the node chain exists.
pub struct VectorExtentIterator<'a> {
    extents: &'a [ReservedExtent],
    cursor: usize,
}

impl<'a> VectorExtentIterator<'a> {
    #[must_use]
    pub fn new(extents: &'a [ReservedExtent]) -> Self {
        Self { extents, cursor: 0 }
    }
}

impl ExtentIterator for VectorExtentIterator<'_> {
    fn next_extent(&mut self) -> Result<Option<Extent>> {
        let Some(reserved) = self.extents.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(reserved.extent()))
    }

    fn node_index(&self) -> NodeIndex {
        NodeIndex(0)
    }
}

// ── Block iterator ──────────────────────────────────────────────────────────

/// Flattens extent runs into a logical block cursor.
pub struct BlockIterator<I: ExtentIterator> {
    iter: I,
    /// Extent currently being consumed and how much of it has been.
    current: Option<(Extent, u64)>,
    block_index: u64,
}

impl<I: ExtentIterator> BlockIterator<I> {
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            current: None,
            block_index: 0,
        }
    }

    /// Logical block index of the cursor (blocks consumed so far).
    #[must_use]
    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    /// Advance up to `max` blocks, returning the contiguous run consumed:
    /// `(logical_offset, device_offset_in_data_region, length)`.
    ///
    /// Returns `None` when the extents are exhausted.
    pub fn next_run(&mut self, max: u64) -> Result<Option<(u64, u64, u64)>> {
        if max == 0 {
            return Ok(None);
        }
        loop {
            match self.current {
                Some((extent, consumed)) if consumed < extent.length() => {
                    let run = (extent.length() - consumed).min(max);
                    let logical = self.block_index;
                    let device = extent.start() + consumed;
                    self.current = Some((extent, consumed + run));
                    self.block_index += run;
                    return Ok(Some((logical, device, run)));
                }
                _ => match self.iter.next_extent()? {
                    Some(extent) => self.current = Some((extent, 0)),
                    None => return Ok(None),
                },
            }
        }
    }
}

/// Drive `iter` forward by exactly `count` logical blocks, invoking
/// `sink(logical_offset, device_offset, length)` for each maximal
/// contiguous run. Errors from the sink propagate.
pub fn stream_blocks<I: ExtentIterator>(
    iter: &mut BlockIterator<I>,
    count: u64,
    mut sink: impl FnMut(u64, u64, u64) -> Result<()>,
) -> Result<()> {
    let mut remaining = count;
    while remaining > 0 {
        match iter.next_run(remaining)? {
            Some((logical, device, length)) => {
                sink(logical, device, length)?;
                remaining -= length;
            }
            None => {
                return Err(AmberError::Corruption {
                    block: 0,
                    detail: format!("extent chain ends {remaining} blocks early"),
                });
            }
        }
    }
    Ok(())
}
