//! `efs`: an encrypted POSIX-style virtual filesystem over an ordered
//! key-value store.
//!
//! Every byte that leaves the process is ciphertext; every byte read is
//! transparently decrypted and authenticated (`spec.md` §1). The crate
//! is organized leaf-first, one module per component of `spec.md` §2:
//!
//! - [`crypto`] — C1, the AEAD layer.
//! - [`kv`] — C2, the ordered-KV boundary and its encrypted wrapper.
//! - [`inode`] — C3, the inode/dirent/block record store.
//! - [`block`] — C4, byte-range block I/O.
//! - [`path`] — C5, the path resolver.
//! - [`perm`] — C6, the POSIX permission model.
//! - [`descriptor`] — C7, the open-file-description table.
//! - [`ops`] — C8, the public [`Efs`] facade.
//! - [`stream`] — C9, pull-based read/write stream adapters.
//! - [`lock`] — C10, the per-inode concurrency core.
//! - [`chroot`] — sub-view lifecycle tracking for §4.11.
//!
//! plus the ambient [`error`], [`param`], [`flags`], and [`stat`] modules
//! that the rest lean on. See `DESIGN.md` for how each module grounds in
//! the teacher crate and the rest of the retrieval pack.

#![deny(unused_must_use)]

pub mod block;
pub mod chroot;
pub mod crypto;
pub mod descriptor;
pub mod error;
pub mod flags;
pub mod inode;
pub mod kv;
pub mod lock;
pub mod ops;
pub mod param;
pub mod path;
pub mod perm;
pub mod stat;
pub mod stream;

pub use crypto::{Aead, Aes256GcmAead, KeyMaterial};
pub use descriptor::Fd;
pub use error::{Error, ErrorKind, Result};
pub use flags::{AccessBits, OpenFlags, Whence};
pub use kv::{KvStore, MemKv};
pub use ops::{DirEntry, Efs, MountOptions};
pub use perm::Credentials;
pub use stat::Stat;
