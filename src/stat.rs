//! The `Stat` record returned by `stat`/`lstat`/`fstat`.
//!
//! Mirrors the teacher's `stat.rs`, extended with the POSIX fields this
//! spec actually needs (ownership, mode, timestamps) instead of the
//! teacher's minimal xv6-era `{dev, ino, typ, nlink, size}`.

use crate::inode::InodeType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub ino: u64,
    pub kind: InodeType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub birthtime_ms: i64,
}
