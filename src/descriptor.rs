//! Descriptor table (C7, `spec.md` §4.7).
//!
//! Structurally the teacher's per-process `File` table (`file.rs`) and
//! its dense fd allocation in `Proc::fdalloc`, generalized from a
//! fixed-size array to a growable dense table since this spec puts no
//! upper bound on open descriptors beyond the configured
//! `DEFAULT_MAX_OPEN_FILES` (`spec.md` §6 mentions no hard cap; we give
//! embedders a knob instead of a fixed `NOFILE`).

use std::collections::HashMap;

use crate::error::{err, Error, ErrorKind, Result};
use crate::flags::{AccessMode, OpenFlags};
use crate::inode::InodeId;

pub type Fd = u32;

/// An open file description (`spec.md` §4.7): one per `open`/`creat`
/// call, independent of any other description on the same inode.
#[derive(Clone, Debug)]
pub struct OpenFileDescription {
    pub inode: InodeId,
    pub access_mode: AccessMode,
    pub flags: OpenFlags,
    pub position: u64,
}

impl OpenFileDescription {
    pub fn new(inode: InodeId, access_mode: AccessMode, flags: OpenFlags) -> Self {
        Self {
            inode,
            access_mode,
            flags,
            position: 0,
        }
    }

    pub fn require_read(&self) -> Result<()> {
        if self.access_mode.can_read() {
            Ok(())
        } else {
            err(ErrorKind::BadDescriptor)
        }
    }

    pub fn require_write(&self) -> Result<()> {
        if self.access_mode.can_write() {
            Ok(())
        } else {
            err(ErrorKind::BadDescriptor)
        }
    }
}

/// Per-`Efs`-instance table of open descriptions, identified by a small
/// densely-allocated integer (`spec.md` §4.7). Chroot sub-views get
/// their own table (`spec.md` §4.11), never sharing fd numbers with
/// their parent.
#[derive(Default)]
pub struct DescriptorTable {
    entries: HashMap<Fd, OpenFileDescription>,
    next: Fd,
    max_open: usize,
}

impl DescriptorTable {
    pub fn new(max_open: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next: 0,
            max_open,
        }
    }

    pub fn open_count(&self) -> usize {
        self.entries.len()
    }

    /// Allocates the lowest-numbered fd not currently in use, per the
    /// teacher's `fdalloc` scan-from-zero policy.
    pub fn insert(&mut self, ofd: OpenFileDescription) -> Result<Fd> {
        if self.entries.len() >= self.max_open {
            return err(ErrorKind::TooManyOpenFiles);
        }
        let mut candidate = 0;
        while self.entries.contains_key(&candidate) {
            candidate += 1;
        }
        self.entries.insert(candidate, ofd);
        self.next = self.next.max(candidate + 1);
        Ok(candidate)
    }

    pub fn get(&self, fd: Fd) -> Result<&OpenFileDescription> {
        self.entries.get(&fd).ok_or_else(|| Error::new(ErrorKind::BadDescriptor))
    }

    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFileDescription> {
        self.entries
            .get_mut(&fd)
            .ok_or_else(|| Error::new(ErrorKind::BadDescriptor))
    }

    /// Removes and returns the descriptor, per `spec.md` §4.7 `close`
    /// semantics (caller decides whether to drop the backing inode).
    pub fn remove(&mut self, fd: Fd) -> Result<OpenFileDescription> {
        self.entries
            .remove(&fd)
            .ok_or_else(|| Error::new(ErrorKind::BadDescriptor))
    }

    /// All inode ids with at least one live descriptor, used to decide
    /// whether a zero-`nlink` inode can be dropped yet.
    pub fn is_open(&self, inode: InodeId) -> bool {
        self.entries.values().any(|e| e.inode == inode)
    }

    /// Drains every descriptor, returning the set of inodes that were
    /// open (used when tearing down a chroot sub-view, `spec.md` §4.11:
    /// stopping a sub-view releases only its own descriptors).
    pub fn drain(&mut self) -> Vec<OpenFileDescription> {
        self.entries.drain().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_fd() {
        let mut table = DescriptorTable::new(8);
        let a = table
            .insert(OpenFileDescription::new(1, AccessMode::Read, OpenFlags::empty()))
            .unwrap();
        let b = table
            .insert(OpenFileDescription::new(2, AccessMode::Read, OpenFlags::empty()))
            .unwrap();
        assert_eq!((a, b), (0, 1));
        table.remove(a).unwrap();
        let c = table
            .insert(OpenFileDescription::new(3, AccessMode::Read, OpenFlags::empty()))
            .unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn too_many_open_files() {
        let mut table = DescriptorTable::new(1);
        table
            .insert(OpenFileDescription::new(1, AccessMode::Read, OpenFlags::empty()))
            .unwrap();
        let err = table
            .insert(OpenFileDescription::new(2, AccessMode::Read, OpenFlags::empty()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TooManyOpenFiles);
    }

    #[test]
    fn bad_fd_is_ebadf() {
        let table = DescriptorTable::new(8);
        assert_eq!(table.get(0).unwrap_err().kind, ErrorKind::BadDescriptor);
    }
}
