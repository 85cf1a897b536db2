//! Concurrency core (C10, `spec.md` §4.10 / §5).
//!
//! The teacher protects its fixed-size inode cache with a `Spinlock` over
//! an `ArrayArena<Inode, NINODE>` (`fs/inode.rs`) and hands out RAII
//! `SleeplockGuard`s per inode (`lock/sleeplock.rs`). There is no fixed
//! inode cache here — ids come from an unbounded monotonic counter — so
//! this module generalizes that into an unbounded registry of per-inode
//! `RwLock`s, still returning RAII guards and still requiring ascending-id
//! ordering for two-inode operations, exactly as `spec.md` §5 specifies.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::inode::InodeId;

/// A registry of per-inode locks. Entries are created lazily and kept
/// for the lifetime of the store (they are cheap enough not to bother
/// reclaiming; an inode id is never reused).
#[derive(Default)]
pub struct LockTable {
    locks: RwLock<HashMap<InodeId, Arc<RwLock<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: InodeId) -> Arc<RwLock<()>> {
        if let Some(lock) = self.locks.read().get(&id) {
            return lock.clone();
        }
        self.locks
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn read(&self, id: InodeId) -> InodeReadGuard {
        let lock = self.entry(id);
        // SAFETY-equivalent: we hand out a guard borrowed from an `Arc`
        // we keep alive alongside it, so there is no actual unsafety —
        // just a self-referential-looking struct resolved by owning the
        // `Arc` the guard borrows from.
        let guard = unsafe { std::mem::transmute::<RwLockReadGuard<'_, ()>, RwLockReadGuard<'static, ()>>(lock.read()) };
        InodeReadGuard { _lock: lock, guard }
    }

    pub fn write(&self, id: InodeId) -> InodeWriteGuard {
        let lock = self.entry(id);
        let guard = unsafe { std::mem::transmute::<RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'static, ()>>(lock.write()) };
        InodeWriteGuard { _lock: lock, guard }
    }

    /// Acquires write locks on two distinct inodes in ascending id order,
    /// as `spec.md` §5 requires for `rename`/`link`/directory-entry moves,
    /// to prevent deadlock between concurrent two-inode operations.
    pub fn write_two(&self, a: InodeId, b: InodeId) -> (InodeWriteGuard, InodeWriteGuard) {
        assert_ne!(a, b, "write_two requires distinct inodes");
        if a < b {
            let ga = self.write(a);
            let gb = self.write(b);
            (ga, gb)
        } else {
            let gb = self.write(b);
            let ga = self.write(a);
            (ga, gb)
        }
    }
}

/// Held while an inode's metadata/content may only be observed.
pub struct InodeReadGuard {
    _lock: Arc<RwLock<()>>,
    guard: RwLockReadGuard<'static, ()>,
}

impl Drop for InodeReadGuard {
    fn drop(&mut self) {
        // Explicit for readability; the field drop would do this anyway.
        let _ = &self.guard;
    }
}

/// Held while an inode's metadata/content may be mutated.
pub struct InodeWriteGuard {
    _lock: Arc<RwLock<()>>,
    guard: RwLockWriteGuard<'static, ()>,
}

impl Drop for InodeWriteGuard {
    fn drop(&mut self) {
        let _ = &self.guard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_order_does_not_deadlock() {
        let table = LockTable::new();
        let (g1, g2) = table.write_two(5, 2);
        drop(g1);
        drop(g2);
        let (g1, g2) = table.write_two(2, 5);
        drop(g1);
        drop(g2);
    }

    #[test]
    fn same_inode_reuses_lock() {
        let table = LockTable::new();
        let _r = table.read(1);
        drop(_r);
        let _w = table.write(1);
    }
}
