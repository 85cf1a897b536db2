//! Build-time constants.
//!
//! Mirrors the teacher's `param.rs`: one place for the numbers that shape
//! the rest of the crate, so a reviewer can find every magic number here
//! instead of scattered through the modules that use it.

/// Size of a data block, and the unit of AEAD framing for file content.
///
/// `spec.md` requires 4096 unless otherwise stated.
pub const BLOCK_SIZE: usize = 4096;

/// Root inode id. Created by `format` on an empty store and never freed
/// while the store is live.
pub const ROOT_INODE: u64 = 1;

/// Symlink-follow limit before resolution fails with `ELOOP`.
pub const MAX_SYMLINK_HOPS: u32 = 40;

/// Maximum depth of a single path's components (defends against
/// pathological inputs during resolution; not part of the spec's testable
/// properties but a sane operational bound).
pub const MAX_PATH_COMPONENTS: usize = 4096;

/// Default cap on live descriptors per `Efs`/chroot view, surfaced as
/// `EMFILE` once exceeded. `None` in `MountOptions` disables the cap.
pub const DEFAULT_MAX_OPEN_FILES: usize = 1024;

/// Default high-water mark for stream adapters, in bytes.
pub const DEFAULT_STREAM_HIGH_WATER_MARK: usize = 64 * 1024;

/// AEAD key length required by the crypto layer (C1) and KV adapter (C2).
pub const KEY_LEN: usize = 32;

static_assertions::const_assert!(BLOCK_SIZE > 0);
static_assertions::const_assert!(BLOCK_SIZE % 2 == 0);
