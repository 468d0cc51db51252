//! Node populator: commit reserved extents and nodes into the persistent
//! inode and container chain.
//!
//! The writer reserves blocks and nodes speculatively; once the blob's
//! final shape is known, the populator walks the reservations head-first,
//! wires `next_node` links, writes the records into the node map, and
//! invokes callbacks so the caller can enqueue the durable writes. The
//! extent callback may stop early when compression shrank the blob, and
//! the populator finalizes extent counts and trailing links accordingly.

use amber_alloc::{Allocator, ReservedExtent, ReservedNode};
use amber_error::{AmberError, Result};
use amber_format::{ExtentContainer, Inode, NODE_FLAG_ALLOCATED};
use amber_types::{NodeIndex, CONTAINER_MAX_EXTENTS, INLINE_MAX_EXTENTS};

/// Decision returned by the extent callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationCommand {
    Continue,
    Stop,
}

/// Nodes needed to hold `extent_count` extents: one head inode plus
/// containers for the overflow.
#[must_use]
pub fn node_count_for_extents(extent_count: usize) -> usize {
    let overflow = extent_count.saturating_sub(INLINE_MAX_EXTENTS);
    1 + overflow.div_ceil(CONTAINER_MAX_EXTENTS)
}

/// Commits a blob's reservations into the node map.
pub struct NodePopulator {
    extents: Vec<ReservedExtent>,
    nodes: Vec<ReservedNode>,
}

impl NodePopulator {
    #[must_use]
    pub fn new(extents: Vec<ReservedExtent>, nodes: Vec<ReservedNode>) -> Self {
        Self { extents, nodes }
    }

    /// Walk reservations, writing the head inode and container chain.
    ///
    /// `head_inode` must already carry the blob's size, digest, flags, and
    /// block count; the populator fills in the extent fields and links.
    /// `on_extent` is invoked for each reserved extent (it may call
    /// `split_at` on the handle and return [`IterationCommand::Stop`] to
    /// finalize early); `on_node` is invoked for every node actually used,
    /// after its record is complete.
    pub fn walk(
        mut self,
        allocator: &Allocator,
        head_inode: Inode,
        mut on_extent: impl FnMut(&mut ReservedExtent) -> IterationCommand,
        mut on_node: impl FnMut(&ReservedNode),
    ) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(AmberError::BadState("populator requires a head node"));
        }

        // Consume extents until the callback stops us.
        let mut used: Vec<amber_format::Extent> = Vec::new();
        for reserved in &mut self.extents {
            let command = on_extent(reserved);
            used.push(reserved.extent());
            if command == IterationCommand::Stop {
                break;
            }
        }

        let node_count = node_count_for_extents(used.len());
        if node_count > self.nodes.len() {
            return Err(AmberError::BadState("reserved nodes cannot hold extents"));
        }
        let nodes = &self.nodes[..node_count];

        // Head inode: inline extent plus the final count and first link.
        let head = &nodes[0];
        let mut inode = head_inode;
        inode.prelude.flags |= NODE_FLAG_ALLOCATED;
        inode.extent_count =
            u16::try_from(used.len()).map_err(|_| AmberError::BadState("extent count overflow"))?;
        if let Some(extent) = used.first() {
            inode.inline_extent = *extent;
        }
        inode.prelude.next_node = if used.len() > INLINE_MAX_EXTENTS {
            nodes[1].index().0
        } else {
            0
        };

        allocator.mark_inode_allocated(head)?;
        allocator.with_node_map_mut(|map| map.set_inode(head.index(), &inode))?;
        on_node(head);

        // Container chain for the overflow.
        let overflow = &used[used.len().min(INLINE_MAX_EXTENTS)..];
        let mut previous = head.index();
        for (ci, chunk) in overflow.chunks(CONTAINER_MAX_EXTENTS).enumerate() {
            let node = &nodes[1 + ci];
            let mut container = ExtentContainer::empty();
            container.previous_node = previous.0;
            container.extent_count = u16::try_from(chunk.len())
                .map_err(|_| AmberError::BadState("container extent count overflow"))?;
            for (slot, extent) in chunk.iter().enumerate() {
                container.extents[slot] = *extent;
            }
            let last = (1 + ci + 1) == node_count;
            container.prelude.next_node = if last { 0 } else { nodes[1 + ci + 1].index().0 };

            allocator.mark_inode_allocated(node)?;
            allocator.with_node_map_mut(|map| map.set_container(node.index(), &container))?;
            on_node(node);
            previous = node.index();
        }

        // Unused trailing reservations release on drop.
        Ok(())
    }

    /// Head node index the blob will live at.
    pub fn head_index(&self) -> Result<NodeIndex> {
        self.nodes
            .first()
            .map(ReservedNode::index)
            .ok_or(AmberError::BadState("populator requires a head node"))
    }
}
