//! Filesystem ops (C8, `spec.md` §4.8) and the public `Efs` facade.
//!
//! This is the component the teacher's `fs/file.rs` + `sysfile.rs`
//! would occupy — the syscall-facing layer built on top of the inode
//! store, block I/O, path resolver, permission model, and descriptor
//! table — generalized from xv6's fixed syscall set to the Node-`fs`-
//! shaped surface `spec.md` §6.1 specifies. Every mutating operation
//! follows the same shape the spec calls out in §4.8: validate, resolve,
//! authorize, lock, mutate in one batch, release, return.

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::block::{self, BlockCache};
use crate::chroot::{StoppableView, ViewRegistry};
use crate::crypto::Aead;
use crate::descriptor::{DescriptorTable, Fd, OpenFileDescription};
use crate::error::{err, Error, ErrorKind, Result};
use crate::flags::{mode, AccessBits, OpenFlags, Whence};
use crate::inode::{validate_name, InodeId, InodeMeta, InodeStore, InodeType};
use crate::kv::{Batch, KvStore};
use crate::lock::LockTable;
use crate::param::{BLOCK_SIZE, DEFAULT_MAX_OPEN_FILES, DEFAULT_STREAM_HIGH_WATER_MARK, ROOT_INODE};
use crate::path::{self, ResolveFlags};
use crate::perm::{apply_umask, authorize_chmod, authorize_chown, check_access, Credentials};
use crate::stat::Stat;
use crate::stream::{ReadStream, WriteStream};

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_millis() as i64
}

/// Per-mount configuration (`spec.md` §4.6 umask, §4.7 descriptor cap,
/// `SPEC_FULL.md`'s optional block cache).
#[derive(Clone, Copy, Debug)]
pub struct MountOptions {
    pub max_open_files: usize,
    pub umask: u32,
    /// Capacity of the optional decrypted-block cache; `0` disables it.
    pub block_cache_capacity: usize,
    pub stream_high_water_mark: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            umask: 0o022,
            block_cache_capacity: 256,
            stream_high_water_mark: DEFAULT_STREAM_HIGH_WATER_MARK,
        }
    }
}

/// Renders a raw path for a log line; names aren't guaranteed UTF-8, so
/// this is lossy and only ever used for diagnostics, never for lookups.
fn p(path: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(path)
}

fn meta_to_stat(id: InodeId, meta: &InodeMeta) -> Stat {
    Stat {
        ino: id,
        kind: meta.kind,
        mode: meta.mode,
        uid: meta.uid,
        gid: meta.gid,
        nlink: meta.nlink,
        size: meta.size,
        blocks: meta.blocks,
        atime_ms: meta.atime_ms,
        mtime_ms: meta.mtime_ms,
        ctime_ms: meta.ctime_ms,
        birthtime_ms: meta.birthtime_ms,
    }
}

/// Whether `dst` sits strictly inside the subtree rooted at `src`, by
/// literal path-component comparison (`spec.md` §4.8 `rename`: "renaming
/// a path that is a strict prefix of its destination fails with
/// `EINVAL`").
fn is_strict_prefix(src: &[u8], dst: &[u8]) -> bool {
    fn comps(p: &[u8]) -> Vec<&[u8]> {
        p.split(|&b| b == b'/').filter(|s| !s.is_empty() && *s != b".").collect()
    }
    let src_c = comps(src);
    let dst_c = comps(dst);
    src_c.len() < dst_c.len() && dst_c[..src_c.len()] == src_c[..]
}

/// An entry returned by [`Efs::readdir`].
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: InodeId,
    pub kind: InodeType,
}

/// A mounted encrypted filesystem, or a chroot sub-view of one
/// (`spec.md` §4.11). Cloneable cheaply via `Arc` sharing; every clone
/// of a *view* (not a fresh `chroot()`) sees the same descriptor table.
pub struct Efs<K: KvStore> {
    inodes: Arc<InodeStore<K>>,
    locks: Arc<LockTable>,
    cache: Option<Arc<BlockCache>>,
    registry: Arc<ViewRegistry>,
    is_root: bool,
    root: InodeId,
    cwd: Mutex<(Vec<InodeId>, Vec<Vec<u8>>)>,
    descriptors: Mutex<DescriptorTable>,
    credentials: Mutex<Credentials>,
    umask: Mutex<u32>,
    high_water_mark: usize,
    max_open_files: usize,
}

impl<K: KvStore + 'static> StoppableView for Efs<K> {
    fn stop_local(&self) {
        self.descriptors.lock().drain();
    }
}

impl<K: KvStore + 'static> Efs<K> {
    /// Mounts a fresh or existing store, formatting it if empty
    /// (`spec.md` §3 "Root").
    pub fn mount(kv: K, aead: Arc<dyn Aead>, options: MountOptions) -> Result<Arc<Self>> {
        let inodes = Arc::new(InodeStore::new(kv, aead));
        if inodes.is_formatted()? {
            inodes.check_key_at_mount()?;
            debug!("mount: existing store, key verified");
        } else {
            inodes.format(now_ms())?;
            debug!("mount: formatted fresh store, root inode {}", ROOT_INODE);
        }
        let cache = BlockCache::new(options.block_cache_capacity);
        let efs = Arc::new(Self {
            inodes,
            locks: Arc::new(LockTable::new()),
            cache,
            registry: ViewRegistry::new(),
            is_root: true,
            root: ROOT_INODE,
            cwd: Mutex::new((vec![ROOT_INODE], Vec::new())),
            descriptors: Mutex::new(DescriptorTable::new(options.max_open_files)),
            credentials: Mutex::new(Credentials::root()),
            umask: Mutex::new(options.umask),
            high_water_mark: options.stream_high_water_mark,
            max_open_files: options.max_open_files,
        });
        efs.registry
            .register(Arc::downgrade(&efs) as std::sync::Weak<dyn StoppableView>);
        Ok(efs)
    }

    /// Stops this view. For the originally mounted root this also stops
    /// every live chroot sub-view descending from it (`spec.md` §4.11).
    pub fn stop(&self) {
        if self.is_root {
            self.registry.stop_all();
        } else {
            self.stop_local();
        }
    }

    pub fn set_credentials(&self, creds: Credentials) {
        *self.credentials.lock() = creds;
    }

    pub fn credentials(&self) -> Credentials {
        *self.credentials.lock()
    }

    pub fn set_umask(&self, umask: u32) {
        *self.umask.lock() = umask & mode::PERMISSION_BITS;
    }

    fn umask(&self) -> u32 {
        *self.umask.lock()
    }

    fn cwd_stack(&self) -> Vec<InodeId> {
        self.cwd.lock().0.clone()
    }

    fn cwd_names(&self) -> Vec<Vec<u8>> {
        self.cwd.lock().1.clone()
    }

    fn resolve(&self, path: &[u8], flags: ResolveFlags) -> Result<InodeId> {
        path::resolve(&self.inodes, self.root, &self.cwd_stack(), path, flags, &self.credentials())
    }

    fn resolve_parent(&self, path: &[u8]) -> Result<(InodeId, Vec<u8>)> {
        path::resolve_parent(&self.inodes, self.root, &self.cwd_stack(), path, &self.credentials())
    }

    // ---- path-resolution based metadata ops -----------------------

    pub fn stat(&self, path: &[u8]) -> Result<Stat> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        let _g = self.locks.read(id);
        let meta = self.inodes.read_meta(id)?;
        Ok(meta_to_stat(id, &meta))
    }

    pub fn lstat(&self, path: &[u8]) -> Result<Stat> {
        let id = self.resolve(path, ResolveFlags::no_follow())?;
        let _g = self.locks.read(id);
        let meta = self.inodes.read_meta(id)?;
        Ok(meta_to_stat(id, &meta))
    }

    pub fn fstat(&self, fd: Fd) -> Result<Stat> {
        let id = self.descriptors.lock().get(fd)?.inode;
        let _g = self.locks.read(id);
        let meta = self.inodes.read_meta(id)?;
        Ok(meta_to_stat(id, &meta))
    }

    pub fn access(&self, path: &[u8], bits: AccessBits) -> Result<()> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        let meta = self.inodes.read_meta(id)?;
        if bits == AccessBits::F_OK {
            return Ok(());
        }
        check_access(&meta, &self.credentials(), bits)
    }

    pub fn exists(&self, path: &[u8]) -> bool {
        self.resolve(path, ResolveFlags::lookup()).is_ok()
    }

    pub fn readlink(&self, path: &[u8]) -> Result<Vec<u8>> {
        let id = self.resolve(path, ResolveFlags::no_follow())?;
        let meta = self.inodes.read_meta(id)?;
        if meta.kind != InodeType::Symlink {
            return err(ErrorKind::InvalidArgument);
        }
        Ok(meta.target.unwrap_or_default())
    }

    pub fn realpath(&self, path: &[u8]) -> Result<Vec<u8>> {
        let (_id, _stack, names) = path::resolve_with_stack(
            &self.inodes,
            self.root,
            &self.cwd_stack(),
            &self.cwd_names(),
            path,
            ResolveFlags::lookup(),
            &self.credentials(),
        )?;
        let mut out = Vec::new();
        for name in names {
            out.push(b'/');
            out.extend_from_slice(&name);
        }
        if out.is_empty() {
            out.push(b'/');
        }
        Ok(out)
    }

    // ---- permissions / ownership / times ---------------------------

    pub fn chmod(&self, path: &[u8], new_mode: u32) -> Result<()> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        self.chmod_inode(id, new_mode)
    }

    pub fn lchmod(&self, path: &[u8], new_mode: u32) -> Result<()> {
        let id = self.resolve(path, ResolveFlags::no_follow())?;
        self.chmod_inode(id, new_mode)
    }

    pub fn fchmod(&self, fd: Fd, new_mode: u32) -> Result<()> {
        let id = self.descriptors.lock().get(fd)?.inode;
        self.chmod_inode(id, new_mode)
    }

    fn chmod_inode(&self, id: InodeId, new_mode: u32) -> Result<()> {
        let _g = self.locks.write(id);
        let mut meta = self.inodes.read_meta(id)?;
        authorize_chmod(&meta, &self.credentials())?;
        meta.mode = new_mode & mode::PERMISSION_BITS;
        meta.ctime_ms = now_ms();
        self.inodes.write_meta(id, &meta)?;
        trace!("chmod inode {} -> {:o}", id, meta.mode);
        Ok(())
    }

    pub fn chown(&self, path: &[u8], uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        self.chown_inode(id, uid, gid)
    }

    pub fn lchown(&self, path: &[u8], uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let id = self.resolve(path, ResolveFlags::no_follow())?;
        self.chown_inode(id, uid, gid)
    }

    pub fn fchown(&self, fd: Fd, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let id = self.descriptors.lock().get(fd)?.inode;
        self.chown_inode(id, uid, gid)
    }

    fn chown_inode(&self, id: InodeId, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let _g = self.locks.write(id);
        let mut meta = self.inodes.read_meta(id)?;
        authorize_chown(&meta, &self.credentials(), uid, gid)?;
        if let Some(uid) = uid {
            meta.uid = uid;
        }
        if let Some(gid) = gid {
            meta.gid = gid;
        }
        meta.ctime_ms = now_ms();
        self.inodes.write_meta(id, &meta)?;
        trace!("chown inode {} -> uid={} gid={}", id, meta.uid, meta.gid);
        Ok(())
    }

    /// Recursively applies `chown` to `path` and everything beneath it.
    /// Not a single atomic batch (each inode still updates atomically
    /// with itself) — a crash midway leaves a prefix of the tree
    /// rechowned, consistent with `spec.md`'s "durability beyond what
    /// the KV provides" non-goal.
    pub fn chownr(&self, path: &[u8], uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        self.chownr_inode(id, uid, gid)
    }

    fn chownr_inode(&self, id: InodeId, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.chown_inode(id, uid, gid)?;
        let meta = self.inodes.read_meta(id)?;
        if meta.kind == InodeType::Directory {
            for (_, child) in self.inodes.iter_entries(id)? {
                self.chownr_inode(child, uid, gid)?;
            }
        }
        Ok(())
    }

    pub fn utimes(&self, path: &[u8], atime_ms: Option<i64>, mtime_ms: Option<i64>) -> Result<()> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        self.utimes_inode(id, atime_ms, mtime_ms)
    }

    pub fn futimes(&self, fd: Fd, atime_ms: Option<i64>, mtime_ms: Option<i64>) -> Result<()> {
        let id = self.descriptors.lock().get(fd)?.inode;
        self.utimes_inode(id, atime_ms, mtime_ms)
    }

    fn utimes_inode(&self, id: InodeId, atime_ms: Option<i64>, mtime_ms: Option<i64>) -> Result<()> {
        let _g = self.locks.write(id);
        let mut meta = self.inodes.read_meta(id)?;
        let creds = self.credentials();
        if !creds.is_root() && creds.uid != meta.uid {
            return err(ErrorKind::NotPermitted);
        }
        if let Some(a) = atime_ms {
            meta.atime_ms = a;
        }
        if let Some(m) = mtime_ms {
            meta.mtime_ms = m;
        }
        meta.ctime_ms = now_ms();
        self.inodes.write_meta(id, &meta)?;
        trace!("utimes inode {} -> atime={} mtime={}", id, meta.atime_ms, meta.mtime_ms);
        Ok(())
    }

    // ---- creation / removal ----------------------------------------

    pub fn mkdir(&self, path: &[u8], requested_mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        validate_name(&name)?;
        let now = now_ms();
        let _g = self.locks.write(parent);
        let parent_meta = self.inodes.read_meta(parent)?;
        check_access(&parent_meta, &self.credentials(), AccessBits::W_OK | AccessBits::X_OK)?;
        if self.inodes.lookup_entry(parent, &name)?.is_some() {
            return err(ErrorKind::AlreadyExists);
        }
        let creds = self.credentials();
        let mode = apply_umask(requested_mode, self.umask());
        let id = self
            .inodes
            .alloc_inode(InodeType::Directory, mode, creds.uid, creds.gid, now)?;
        // nlink already starts at 2 for a fresh directory (`InodeMeta::new_now`);
        // linking it into its parent is its first and only name, so the child's
        // nlink is not bumped again here.
        self.inodes.link_entry(parent, &name, id, false, now)?;
        debug!("mkdir {} -> inode {}", p(path), id);
        Ok(())
    }

    /// Creates a directory whose name is `prefix` with a random suffix
    /// appended, retrying on a name collision, and returns the path
    /// actually created (mirrors `mkstemp`'s directory cousin).
    pub fn mkdtemp(&self, prefix: &[u8]) -> Result<Vec<u8>> {
        use rand::Rng;
        const SUFFIX_LEN: usize = 6;
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ012345678";
        for _ in 0..32 {
            let mut candidate = prefix.to_vec();
            let mut rng = rand::thread_rng();
            for _ in 0..SUFFIX_LEN {
                candidate.push(ALPHABET[rng.gen_range(0..ALPHABET.len())]);
            }
            match self.mkdir(&candidate, 0o700) {
                Ok(()) => return Ok(candidate),
                Err(Error { kind: ErrorKind::AlreadyExists, .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        err(ErrorKind::AlreadyExists)
    }

    pub fn rmdir(&self, path: &[u8], recursive: bool) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        if name == b"." || name == b".." {
            return err(ErrorKind::InvalidArgument);
        }
        let now = now_ms();
        let _pg = self.locks.write(parent);
        let parent_meta = self.inodes.read_meta(parent)?;
        check_access(&parent_meta, &self.credentials(), AccessBits::W_OK | AccessBits::X_OK)?;
        let child = self
            .inodes
            .lookup_entry(parent, &name)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;

        let _cg = self.locks.write(child);
        let child_meta = self.inodes.read_meta(child)?;
        if child_meta.kind != InodeType::Directory {
            return err(ErrorKind::NotADirectory);
        }
        if child_meta.size != 0 {
            if recursive {
                check_access(&child_meta, &self.credentials(), AccessBits::W_OK | AccessBits::X_OK)?;
                for (entry_name, entry_id) in self.inodes.iter_entries(child)? {
                    let entry_meta = self.inodes.read_meta(entry_id)?;
                    if entry_meta.kind == InodeType::Directory {
                        self.rmdir_locked(child, &entry_name, true)?;
                    } else {
                        self.unlink_locked(child, &entry_name)?;
                    }
                }
            } else {
                return err(ErrorKind::NotEmpty);
            }
        }
        self.inodes.unlink_entry(parent, &name, now)?;
        debug!("rmdir {} (inode {}, recursive={})", p(path), child, recursive);
        self.maybe_drop(child)
    }

    /// `rmdir` on an already-write-locked parent, used by the recursive
    /// walk in [`Self::rmdir`] so it never tries to relock its own
    /// ancestor.
    fn rmdir_locked(&self, parent: InodeId, name: &[u8], recursive: bool) -> Result<()> {
        let now = now_ms();
        let child = self
            .inodes
            .lookup_entry(parent, name)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let _cg = self.locks.write(child);
        let child_meta = self.inodes.read_meta(child)?;
        if child_meta.size != 0 && recursive {
            check_access(&child_meta, &self.credentials(), AccessBits::W_OK | AccessBits::X_OK)?;
            for (entry_name, entry_id) in self.inodes.iter_entries(child)? {
                let entry_meta = self.inodes.read_meta(entry_id)?;
                if entry_meta.kind == InodeType::Directory {
                    self.rmdir_locked(child, &entry_name, true)?;
                } else {
                    self.unlink_locked(child, &entry_name)?;
                }
            }
        } else if child_meta.size != 0 {
            return err(ErrorKind::NotEmpty);
        }
        self.inodes.unlink_entry(parent, name, now)?;
        self.maybe_drop(child)
    }

    fn unlink_locked(&self, parent: InodeId, name: &[u8]) -> Result<()> {
        let now = now_ms();
        let child = self
            .inodes
            .lookup_entry(parent, name)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let _cg = self.locks.write(child);
        let meta = self.inodes.unlink_entry(parent, name, now)?;
        let _ = meta;
        self.maybe_drop(child)
    }

    pub fn unlink(&self, path: &[u8]) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        if name == b"." || name == b".." {
            return err(ErrorKind::InvalidArgument);
        }
        let now = now_ms();
        let _pg = self.locks.write(parent);
        let parent_meta = self.inodes.read_meta(parent)?;
        check_access(&parent_meta, &self.credentials(), AccessBits::W_OK | AccessBits::X_OK)?;
        let child = self
            .inodes
            .lookup_entry(parent, &name)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let _cg = self.locks.write(child);
        let child_meta = self.inodes.read_meta(child)?;
        if child_meta.kind == InodeType::Directory {
            return err(ErrorKind::IsADirectory);
        }
        self.inodes.unlink_entry(parent, &name, now)?;
        debug!("unlink {} (inode {})", p(path), child);
        self.maybe_drop(child)
    }

    /// Drops `id`'s blocks and metadata if its `nlink` has reached zero
    /// and no descriptor still references it (`spec.md` §3 Lifecycle).
    fn maybe_drop(&self, id: InodeId) -> Result<()> {
        let meta = self.inodes.read_meta(id)?;
        if meta.nlink == 0 && !self.descriptors.lock().is_open(id) {
            trace!("dropping inode {} (nlink=0, no open descriptors)", id);
            block::invalidate_from(self.cache.as_deref(), id, 0);
            self.inodes.drop_inode(id, &meta, BLOCK_SIZE as u64)?;
        }
        Ok(())
    }

    pub fn link(&self, src: &[u8], dst: &[u8]) -> Result<()> {
        let src_id = self.resolve(src, ResolveFlags::no_follow())?;
        let (dst_parent, dst_name) = self.resolve_parent(dst)?;
        validate_name(&dst_name)?;
        let now = now_ms();

        let (_g1, _g2) = self.locks.write_two(src_id, dst_parent);
        let src_meta = self.inodes.read_meta(src_id)?;
        if src_meta.kind == InodeType::Directory {
            return err(ErrorKind::NotPermitted);
        }
        let dst_parent_meta = self.inodes.read_meta(dst_parent)?;
        check_access(&dst_parent_meta, &self.credentials(), AccessBits::W_OK | AccessBits::X_OK)?;
        self.inodes.link_entry(dst_parent, &dst_name, src_id, true, now)?;
        debug!("link {} -> {} (inode {})", p(src), p(dst), src_id);
        Ok(())
    }

    pub fn symlink(&self, target: &[u8], link_path: &[u8]) -> Result<()> {
        let (parent, name) = self.resolve_parent(link_path)?;
        validate_name(&name)?;
        let now = now_ms();
        let _g = self.locks.write(parent);
        let parent_meta = self.inodes.read_meta(parent)?;
        check_access(&parent_meta, &self.credentials(), AccessBits::W_OK | AccessBits::X_OK)?;
        if self.inodes.lookup_entry(parent, &name)?.is_some() {
            return err(ErrorKind::AlreadyExists);
        }
        let creds = self.credentials();
        let id = self
            .inodes
            .alloc_inode(InodeType::Symlink, 0o777, creds.uid, creds.gid, now)?;
        let mut meta = self.inodes.read_meta(id)?;
        meta.target = Some(target.to_vec());
        meta.size = target.len() as u64;
        self.inodes.write_meta(id, &meta)?;
        self.inodes.link_entry(parent, &name, id, false, now)?;
        debug!("symlink {} -> {} (inode {})", p(link_path), p(target), id);
        Ok(())
    }

    /// `mknod`: this spec narrows every requested type down to a
    /// zero-length regular inode-equivalent entry (`spec.md` §1 and §9
    /// "Open questions from source behavior").
    pub fn mknod(&self, path: &[u8], requested_mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        validate_name(&name)?;
        let now = now_ms();
        let _g = self.locks.write(parent);
        let parent_meta = self.inodes.read_meta(parent)?;
        check_access(&parent_meta, &self.credentials(), AccessBits::W_OK | AccessBits::X_OK)?;
        if self.inodes.lookup_entry(parent, &name)?.is_some() {
            return err(ErrorKind::AlreadyExists);
        }
        let creds = self.credentials();
        let mode = apply_umask(requested_mode, self.umask());
        let id = self
            .inodes
            .alloc_inode(InodeType::Regular, mode, creds.uid, creds.gid, now)?;
        self.inodes.link_entry(parent, &name, id, false, now)?;
        debug!("mknod {} -> inode {}", p(path), id);
        Ok(())
    }

    pub fn rename(&self, src: &[u8], dst: &[u8]) -> Result<()> {
        let creds = self.credentials();
        let (src_parent, src_name) = self.resolve_parent(src)?;
        if src_name == b"." || src_name == b".." {
            return err(ErrorKind::Busy);
        }
        let (dst_parent, dst_name) = self.resolve_parent(dst)?;
        if dst_name == b"." || dst_name == b".." {
            return err(ErrorKind::Busy);
        }
        if is_strict_prefix(src, dst) {
            return err(ErrorKind::InvalidArgument);
        }
        let now = now_ms();

        let _locks = if src_parent == dst_parent {
            (self.locks.write(src_parent), None)
        } else {
            let (a, b) = self.locks.write_two(src_parent, dst_parent);
            (a, Some(b))
        };

        let src_parent_meta = self.inodes.read_meta(src_parent)?;
        check_access(&src_parent_meta, &creds, AccessBits::W_OK | AccessBits::X_OK)?;
        if src_parent != dst_parent {
            let dst_parent_meta = self.inodes.read_meta(dst_parent)?;
            check_access(&dst_parent_meta, &creds, AccessBits::W_OK | AccessBits::X_OK)?;
        }

        let src_id = self
            .inodes
            .lookup_entry(src_parent, &src_name)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let src_meta = self.inodes.read_meta(src_id)?;
        if let Some(existing) = self.inodes.lookup_entry(dst_parent, &dst_name)? {
            let existing_meta = self.inodes.read_meta(existing)?;
            match (src_meta.kind, existing_meta.kind) {
                (InodeType::Directory, InodeType::Directory) => {
                    if existing_meta.size != 0 {
                        return err(ErrorKind::NotEmpty);
                    }
                }
                (InodeType::Directory, _) => return err(ErrorKind::NotADirectory),
                (_, InodeType::Directory) => return err(ErrorKind::IsADirectory),
                _ => {}
            }
        }

        self.inodes
            .rename_entry(src_parent, &src_name, dst_parent, &dst_name, now, BLOCK_SIZE as u64)?;
        debug!("rename {} -> {} (inode {})", p(src), p(dst), src_id);
        Ok(())
    }

    pub fn readdir(&self, path: &[u8]) -> Result<Vec<DirEntry>> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        let _g = self.locks.read(id);
        let meta = self.inodes.read_meta(id)?;
        if meta.kind != InodeType::Directory {
            return err(ErrorKind::NotADirectory);
        }
        check_access(&meta, &self.credentials(), AccessBits::R_OK)?;
        let mut out = Vec::new();
        for (name, child) in self.inodes.iter_entries(id)? {
            let child_meta = self.inodes.read_meta(child)?;
            out.push(DirEntry { name, ino: child, kind: child_meta.kind });
        }
        Ok(out)
    }

    // ---- current directory / chroot ---------------------------------

    pub fn cwd(&self) -> Vec<u8> {
        let names = self.cwd_names();
        let mut out = Vec::new();
        for name in &names {
            out.push(b'/');
            out.extend_from_slice(name);
        }
        if out.is_empty() {
            out.push(b'/');
        }
        out
    }

    pub fn chdir(&self, path: &[u8]) -> Result<()> {
        let creds = self.credentials();
        let (cwd_ids, cwd_names) = {
            let guard = self.cwd.lock();
            (guard.0.clone(), guard.1.clone())
        };
        let (id, stack, names) = path::resolve_with_stack(
            &self.inodes,
            self.root,
            &cwd_ids,
            &cwd_names,
            path,
            ResolveFlags {
                follow_final_symlink: true,
                must_be_directory: true,
            },
            &creds,
        )?;
        let meta = self.inodes.read_meta(id)?;
        check_access(&meta, &creds, AccessBits::X_OK)?;
        *self.cwd.lock() = (stack, names);
        trace!("chdir {} (inode {})", p(path), id);
        Ok(())
    }

    pub fn chroot(self: &Arc<Self>, path: &[u8]) -> Result<Arc<Self>> {
        let creds = self.credentials();
        let id = self.resolve(
            path,
            ResolveFlags {
                follow_final_symlink: true,
                must_be_directory: true,
            },
        )?;
        let meta = self.inodes.read_meta(id)?;
        check_access(&meta, &creds, AccessBits::X_OK)?;

        let sub = Arc::new(Self {
            inodes: self.inodes.clone(),
            locks: self.locks.clone(),
            cache: self.cache.clone(),
            registry: self.registry.clone(),
            is_root: false,
            root: id,
            cwd: Mutex::new((vec![id], Vec::new())),
            descriptors: Mutex::new(DescriptorTable::new(self.max_open_files)),
            credentials: Mutex::new(creds),
            umask: Mutex::new(self.umask()),
            high_water_mark: self.high_water_mark,
            max_open_files: self.max_open_files,
        });
        self.registry
            .register(Arc::downgrade(&sub) as std::sync::Weak<dyn StoppableView>);
        debug!("chroot {} (inode {})", p(path), id);
        Ok(sub)
    }

    // ---- descriptors --------------------------------------------------

    pub fn open(&self, path: &[u8], flags: OpenFlags, requested_mode: u32) -> Result<Fd> {
        let creds = self.credentials();
        let resolve_flags = ResolveFlags {
            follow_final_symlink: !flags.contains(OpenFlags::O_NOFOLLOW),
            must_be_directory: flags.contains(OpenFlags::O_DIRECTORY),
        };
        let access_mode = flags.access_mode();

        let id = match self.resolve(path, resolve_flags) {
            Ok(id) => {
                if flags.contains(OpenFlags::O_CREAT) && flags.contains(OpenFlags::O_EXCL) {
                    return err(ErrorKind::AlreadyExists);
                }
                id
            }
            Err(Error { kind: ErrorKind::NotFound, .. }) if flags.contains(OpenFlags::O_CREAT) => {
                let (parent, name) = self.resolve_parent(path)?;
                validate_name(&name)?;
                let now = now_ms();
                let _g = self.locks.write(parent);
                let parent_meta = self.inodes.read_meta(parent)?;
                check_access(&parent_meta, &creds, AccessBits::W_OK | AccessBits::X_OK)?;
                if self.inodes.lookup_entry(parent, &name)?.is_some() {
                    return err(ErrorKind::AlreadyExists);
                }
                let mode = apply_umask(requested_mode, self.umask());
                let id = self
                    .inodes
                    .alloc_inode(InodeType::Regular, mode, creds.uid, creds.gid, now)?;
                self.inodes.link_entry(parent, &name, id, false, now)?;
                id
            }
            Err(e) => return Err(e),
        };

        let meta = self.inodes.read_meta(id)?;
        if meta.kind == InodeType::Directory && access_mode.can_write() {
            return err(ErrorKind::IsADirectory);
        }
        let mut want = AccessBits::empty();
        if access_mode.can_read() {
            want |= AccessBits::R_OK;
        }
        if access_mode.can_write() {
            want |= AccessBits::W_OK;
        }
        check_access(&meta, &creds, want)?;

        if flags.contains(OpenFlags::O_TRUNC) && access_mode.can_write() && meta.kind == InodeType::Regular {
            let _g = self.locks.write(id);
            let mut meta = self.inodes.read_meta(id)?;
            let mut batch = Batch::new();
            block::truncate(&self.inodes, self.cache.as_deref(), &mut batch, id, &mut meta, 0, now_ms())?;
            self.inodes.commit(batch)?;
            block::invalidate_from(self.cache.as_deref(), id, 0);
        }

        let fd = self
            .descriptors
            .lock()
            .insert(OpenFileDescription::new(id, access_mode, flags))?;
        trace!("open {} -> fd {} (inode {})", p(path), fd, id);
        Ok(fd)
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        let ofd = self.descriptors.lock().remove(fd)?;
        trace!("close fd {} (inode {})", fd, ofd.inode);
        self.maybe_drop(ofd.inode)
    }

    pub fn read(&self, fd: Fd, len: usize) -> Result<Vec<u8>> {
        let (id, pos) = {
            let table = self.descriptors.lock();
            let ofd = table.get(fd)?;
            ofd.require_read()?;
            (ofd.inode, ofd.position)
        };
        let data = self.pread(id, pos, len)?;
        self.descriptors.lock().get_mut(fd)?.position += data.len() as u64;
        Ok(data)
    }

    pub fn pread_fd(&self, fd: Fd, pos: u64, len: usize) -> Result<Vec<u8>> {
        let id = {
            let table = self.descriptors.lock();
            let ofd = table.get(fd)?;
            ofd.require_read()?;
            ofd.inode
        };
        self.pread(id, pos, len)
    }

    fn pread(&self, id: InodeId, pos: u64, len: usize) -> Result<Vec<u8>> {
        let _g = self.locks.read(id);
        let meta = self.inodes.read_meta(id)?;
        block::read_range(&self.inodes, self.cache.as_deref(), id, &meta, pos, len)
    }

    /// Writes `data` at `pos` (or, if `append`, at the current end of
    /// file), under the inode's write lock, in one batch.
    fn write_chunk(&self, id: InodeId, pos: u64, append: bool, data: &[u8]) -> Result<u64> {
        let _g = self.locks.write(id);
        let mut meta = self.inodes.read_meta(id)?;
        let actual_pos = if append { meta.size } else { pos };
        let mut batch = Batch::new();
        block::write_range(&self.inodes, self.cache.as_deref(), &mut batch, id, &mut meta, actual_pos, data, now_ms())?;
        self.inodes.commit(batch)?;
        trace!("write inode {} at {} ({} bytes)", id, actual_pos, data.len());
        Ok(actual_pos)
    }

    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        let (id, append, pos) = {
            let table = self.descriptors.lock();
            let ofd = table.get(fd)?;
            ofd.require_write()?;
            (ofd.inode, ofd.flags.contains(OpenFlags::O_APPEND), ofd.position)
        };
        let actual_pos = self.write_chunk(id, pos, append, data)?;
        self.descriptors.lock().get_mut(fd)?.position = actual_pos + data.len() as u64;
        Ok(data.len())
    }

    pub fn pwrite_fd(&self, fd: Fd, pos: u64, data: &[u8]) -> Result<usize> {
        let id = {
            let table = self.descriptors.lock();
            let ofd = table.get(fd)?;
            ofd.require_write()?;
            ofd.inode
        };
        self.write_chunk(id, pos, false, data)?;
        Ok(data.len())
    }

    pub fn lseek(&self, fd: Fd, offset: i64, whence: Whence) -> Result<u64> {
        let mut table = self.descriptors.lock();
        let ofd = table.get_mut(fd)?;
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => ofd.position as i64,
            Whence::End => {
                drop(table);
                let id = self.descriptors.lock().get(fd)?.inode;
                let meta = self.inodes.read_meta(id)?;
                table = self.descriptors.lock();
                meta.size as i64
            }
        };
        let new_pos = base
            .checked_add(offset)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument))?;
        if new_pos < 0 {
            return err(ErrorKind::InvalidArgument);
        }
        let ofd = table.get_mut(fd)?;
        ofd.position = new_pos as u64;
        Ok(ofd.position)
    }

    pub fn ftruncate(&self, fd: Fd, new_size: u64) -> Result<()> {
        let id = {
            let table = self.descriptors.lock();
            let ofd = table.get(fd)?;
            ofd.require_write()?;
            ofd.inode
        };
        self.truncate_inode(id, new_size)
    }

    pub fn truncate(&self, path: &[u8], new_size: u64) -> Result<()> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        let meta = self.inodes.read_meta(id)?;
        check_access(&meta, &self.credentials(), AccessBits::W_OK)?;
        self.truncate_inode(id, new_size)
    }

    fn truncate_inode(&self, id: InodeId, new_size: u64) -> Result<()> {
        let _g = self.locks.write(id);
        let mut meta = self.inodes.read_meta(id)?;
        let mut batch = Batch::new();
        block::truncate(&self.inodes, self.cache.as_deref(), &mut batch, id, &mut meta, new_size, now_ms())?;
        self.inodes.commit(batch)?;
        if new_size < meta.size {
            block::invalidate_from(self.cache.as_deref(), id, new_size / BLOCK_SIZE as u64 + 1);
        }
        debug!("truncate inode {} -> {} bytes", id, new_size);
        Ok(())
    }

    pub fn fallocate(&self, fd: Fd, offset: u64, len: u64) -> Result<()> {
        let id = {
            let table = self.descriptors.lock();
            let ofd = table.get(fd)?;
            ofd.require_write()?;
            ofd.inode
        };
        let _g = self.locks.write(id);
        let mut meta = self.inodes.read_meta(id)?;
        let mut batch = Batch::new();
        block::fallocate(&self.inodes, &mut batch, id, &mut meta, offset, len, now_ms())?;
        self.inodes.commit(batch)?;
        debug!("fallocate inode {} offset={} len={}", id, offset, len);
        Ok(())
    }

    /// No-op: every batch already commits durably to the KV engine
    /// before the mutating call returns (`spec.md` §1 non-goal
    /// "durability beyond what the KV provides" — there is nothing left
    /// for `fsync` to flush).
    pub fn fsync(&self, _fd: Fd) -> Result<()> {
        Ok(())
    }

    pub fn fdatasync(&self, _fd: Fd) -> Result<()> {
        Ok(())
    }

    // ---- whole-file convenience ops ---------------------------------

    pub fn read_file(&self, path: &[u8]) -> Result<Vec<u8>> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        let _g = self.locks.read(id);
        let meta = self.inodes.read_meta(id)?;
        if meta.kind != InodeType::Regular {
            return err(ErrorKind::IsADirectory);
        }
        check_access(&meta, &self.credentials(), AccessBits::R_OK)?;
        block::read_range(&self.inodes, self.cache.as_deref(), id, &meta, 0, meta.size as usize)
    }

    pub fn write_file(&self, path: &[u8], data: &[u8]) -> Result<()> {
        let fd = self.open(
            path,
            OpenFlags::O_WRONLY | OpenFlags::O_CREAT | OpenFlags::O_TRUNC,
            0o644,
        )?;
        let result = self.write(fd, data).map(|_| ());
        self.close(fd)?;
        result
    }

    pub fn append_file(&self, path: &[u8], data: &[u8]) -> Result<()> {
        let fd = self.open(path, OpenFlags::O_WRONLY | OpenFlags::O_CREAT | OpenFlags::O_APPEND, 0o644)?;
        let result = self.write(fd, data).map(|_| ());
        self.close(fd)?;
        result
    }

    pub fn copy_file(&self, src: &[u8], dst: &[u8]) -> Result<()> {
        let data = self.read_file(src)?;
        self.write_file(dst, &data)
    }

    // ---- streams -----------------------------------------------------

    /// A pull-based read stream over `path` (`spec.md` §4.9), bounded to
    /// `[start, end)` when given. Validated through the same permission
    /// check `open` applies, but does not hold a live descriptor for the
    /// stream's lifetime — there is nothing an fd would track here that
    /// the stream's own `pos` does not already.
    pub fn create_read_stream<'a>(
        self: &'a Arc<Self>,
        path: &[u8],
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<ReadStream<impl FnMut(u64, usize) -> Result<Vec<u8>> + 'a>> {
        let id = self.resolve(path, ResolveFlags::lookup())?;
        let meta = self.inodes.read_meta(id)?;
        if meta.kind != InodeType::Regular {
            return err(ErrorKind::IsADirectory);
        }
        check_access(&meta, &self.credentials(), AccessBits::R_OK)?;
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(meta.size);
        let efs = self.clone();
        let read_at = move |pos: u64, len: usize| -> Result<Vec<u8>> { efs.pread(id, pos, len) };
        Ok(ReadStream::new(read_at, start, end, self.high_water_mark))
    }

    /// A back-pressured write stream over `path` (`spec.md` §4.9).
    /// Creates the file if missing, same as `open(O_CREAT)`; runs the
    /// same permission checks but, like `create_read_stream`, keeps no
    /// descriptor open for the stream's lifetime.
    pub fn create_write_stream<'a>(
        self: &'a Arc<Self>,
        path: &[u8],
        flags: OpenFlags,
    ) -> Result<WriteStream<impl FnMut(u64, &[u8]) -> Result<usize> + 'a>> {
        let flags = flags | OpenFlags::O_CREAT;
        let fd = self.open(path, flags, 0o644)?;
        let id = self.descriptors.lock().get(fd)?.inode;
        self.close(fd)?;
        let append = flags.contains(OpenFlags::O_APPEND);
        let efs = self.clone();
        let write_at = move |pos: u64, chunk: &[u8]| -> Result<usize> {
            efs.write_chunk(id, pos, append, chunk)?;
            Ok(chunk.len())
        };
        Ok(WriteStream::new(write_at, 0, self.high_water_mark))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Aes256GcmAead, KeyMaterial};
    use crate::kv::MemKv;

    fn mount() -> Arc<Efs<Arc<MemKv>>> {
        let kv = MemKv::new();
        let aead: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([6; 32])));
        Efs::mount(kv, aead, MountOptions::default()).unwrap()
    }

    #[test]
    fn s1_create_write_truncate_read() {
        let efs = mount();
        efs.write_file(b"/f", b"abcdef").unwrap();
        efs.truncate(b"/f", 3).unwrap();
        assert_eq!(efs.read_file(b"/f").unwrap(), b"abc");
    }

    #[test]
    fn s2_sparse_write() {
        let efs = mount();
        let fd = efs
            .open(b"/g", OpenFlags::O_RDWR | OpenFlags::O_CREAT, 0o644)
            .unwrap();
        efs.write(fd, b"abc").unwrap();
        efs.lseek(fd, 1, Whence::End).unwrap();
        efs.write(fd, b"d").unwrap();
        efs.close(fd).unwrap();
        assert_eq!(efs.read_file(b"/g").unwrap(), vec![b'a', b'b', b'c', 0, b'd']);
    }

    #[test]
    fn s3_rename_over_file() {
        let efs = mount();
        efs.write_file(b"/a", b"A").unwrap();
        efs.write_file(b"/b", b"B").unwrap();
        efs.rename(b"/a", b"/b").unwrap();
        assert_eq!(efs.read_file(b"/b").unwrap(), b"A");
        assert_eq!(efs.stat(b"/a").unwrap_err().kind, ErrorKind::NotFound);
    }

    #[test]
    fn s4_hard_link_then_unlink() {
        let efs = mount();
        efs.write_file(b"/f", b"hello").unwrap();
        efs.link(b"/f", b"/g").unwrap();
        efs.unlink(b"/f").unwrap();
        assert_eq!(efs.read_file(b"/g").unwrap(), b"hello");
        assert_eq!(efs.stat(b"/g").unwrap().nlink, 1);
    }

    #[test]
    fn s5_symlink_loop() {
        let efs = mount();
        efs.symlink(b"/t", b"/t").unwrap();
        let err = efs.read_file(b"/t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SymlinkLoop);
    }

    #[test]
    fn s6_chroot_confinement() {
        let efs = mount();
        efs.mkdir(b"/d", 0o755).unwrap();
        efs.write_file(b"/outside", b"X").unwrap();
        let sub = efs.chroot(b"/d").unwrap();
        let err = sub.read_file(b"/../../outside").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn s7_permissions() {
        let efs = mount();
        efs.write_file(b"/f", b"hi").unwrap();
        efs.chmod(b"/f", 0o400).unwrap();
        efs.set_credentials(Credentials::new(1000, 1000));
        let err = efs
            .open(b"/f", OpenFlags::O_WRONLY, 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessDenied);
        assert_eq!(efs.read_file(b"/f").unwrap(), b"hi");
    }

    #[test]
    fn rmdir_recursive_removes_tree() {
        let efs = mount();
        efs.mkdir(b"/d", 0o755).unwrap();
        let d_ino = efs.stat(b"/d").unwrap().ino;
        efs.mkdir(b"/d/sub", 0o755).unwrap();
        let sub_ino = efs.stat(b"/d/sub").unwrap().ino;
        efs.write_file(b"/d/sub/f", b"x").unwrap();
        efs.rmdir(b"/d", true).unwrap();
        assert_eq!(efs.stat(b"/d").unwrap_err().kind, ErrorKind::NotFound);

        // A removed directory must drop its own inode record, not just
        // its dirent: its nlink goes from 2 (self + parent's entry) to 0
        // when the entry disappears, since an empty directory has no
        // other name.
        assert_eq!(efs.inodes.read_meta(d_ino).unwrap_err().kind, ErrorKind::NotFound);
        assert_eq!(efs.inodes.read_meta(sub_ino).unwrap_err().kind, ErrorKind::NotFound);
    }

    #[test]
    fn rmdir_non_recursive_drops_empty_directory_inode() {
        let efs = mount();
        efs.mkdir(b"/d", 0o755).unwrap();
        let d_ino = efs.stat(b"/d").unwrap().ino;
        efs.rmdir(b"/d", false).unwrap();
        assert_eq!(efs.inodes.read_meta(d_ino).unwrap_err().kind, ErrorKind::NotFound);
    }

    #[test]
    fn readdir_lists_entries_without_dot_entries() {
        let efs = mount();
        efs.mkdir(b"/d", 0o755).unwrap();
        efs.write_file(b"/d/a", b"1").unwrap();
        efs.write_file(b"/d/b", b"2").unwrap();
        let mut names: Vec<Vec<u8>> = efs.readdir(b"/d").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
