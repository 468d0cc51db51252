//! Open/closed vnode cache.
//!
//! One map keyed by digest, one lock. An entry is either `Open` — at least
//! one live handle, held weakly so the registry never keeps a blob alive —
//! or `Closed` — no handles, held strongly so a reopen skips disk. A
//! digest appears in at most one state; every transition happens under the
//! single lock, which is never held across I/O.

use crate::vnode::VnodeBlob;
use amber_error::{AmberError, Result};
use amber_types::Digest;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// What happens to a blob's backing buffer when its last handle closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Tear down the mapped buffer at close; reopen re-reads and
    /// re-verifies from disk.
    EvictImmediately,
    /// Retain the buffer for fast reopen.
    #[default]
    NeverEvict,
}

enum CacheEntry {
    Open(Weak<VnodeBlob>),
    Closed(Arc<VnodeBlob>),
}

/// Registry of every known vnode, open or cached-closed.
pub struct VnodeCache {
    entries: Mutex<HashMap<Digest, CacheEntry>>,
}

impl VnodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a freshly created vnode as open.
    ///
    /// Fails with `AlreadyExists` when a live entry holds the digest.
    pub fn insert_open(&self, vnode: &Arc<VnodeBlob>) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get(&vnode.digest()) {
            Some(CacheEntry::Closed(_)) => return Err(AmberError::AlreadyExists),
            Some(CacheEntry::Open(weak)) if weak.upgrade().is_some() => {
                return Err(AmberError::AlreadyExists)
            }
            _ => {}
        }
        entries.insert(vnode.digest(), CacheEntry::Open(Arc::downgrade(vnode)));
        Ok(())
    }

    /// Register a vnode discovered in the node table at mount as closed.
    pub fn insert_closed(&self, vnode: Arc<VnodeBlob>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&vnode.digest()) {
            return Err(AmberError::AlreadyExists);
        }
        entries.insert(vnode.digest(), CacheEntry::Closed(vnode));
        Ok(())
    }

    /// Find a vnode by digest.
    ///
    /// Closed entries stay closed — the strong reference remains with the
    /// cache until the entry is purged. A dead weak entry (all handles
    /// gone, release not yet run) is treated as absent and swept from the
    /// map.
    pub fn lookup(&self, digest: &Digest) -> Option<Arc<VnodeBlob>> {
        let mut entries = self.entries.lock();
        match entries.get(digest) {
            Some(CacheEntry::Open(weak)) => match weak.upgrade() {
                Some(vnode) => Some(vnode),
                None => {
                    entries.remove(digest);
                    None
                }
            },
            Some(CacheEntry::Closed(vnode)) => {
                trace!(target: "amber::fs", digest = %digest, "vnode_reopened");
                Some(Arc::clone(vnode))
            }
            None => None,
        }
    }

    /// Demote an open vnode whose last handle closed to the closed cache.
    pub fn release_to_closed(&self, vnode: Arc<VnodeBlob>) {
        let mut entries = self.entries.lock();
        entries.insert(vnode.digest(), CacheEntry::Closed(vnode));
    }

    /// Drop a digest from the cache entirely (purge and error paths).
    pub fn remove(&self, digest: &Digest) {
        self.entries.lock().remove(digest);
    }

    /// Every live vnode currently in the cache.
    #[must_use]
    pub fn live_vnodes(&self) -> Vec<Arc<VnodeBlob>> {
        self.entries
            .lock()
            .values()
            .filter_map(|entry| match entry {
                CacheEntry::Open(weak) => weak.upgrade(),
                CacheEntry::Closed(vnode) => Some(Arc::clone(vnode)),
            })
            .collect()
    }

    /// Whether the digest maps to a vnode queued for deletion.
    #[must_use]
    pub fn is_deletable(&self, digest: &Digest) -> bool {
        let entries = self.entries.lock();
        match entries.get(digest) {
            Some(CacheEntry::Open(weak)) => weak
                .upgrade()
                .is_some_and(|vnode| vnode.deletion_queued()),
            Some(CacheEntry::Closed(vnode)) => vnode.deletion_queued(),
            None => false,
        }
    }

    /// Empty the cache, returning the vnodes that were resident.
    pub fn drain(&self) -> Vec<Arc<VnodeBlob>> {
        let mut entries = self.entries.lock();
        let drained = entries
            .drain()
            .filter_map(|(_, entry)| match entry {
                CacheEntry::Open(weak) => weak.upgrade(),
                CacheEntry::Closed(vnode) => Some(vnode),
            })
            .collect();
        drained
    }
}

impl Default for VnodeCache {
    fn default() -> Self {
        Self::new()
    }
}
