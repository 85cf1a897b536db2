//! Inode store (C3, `spec.md` §3 / §4.3).
//!
//! Persists inode records, the monotonic id counter, and directory
//! entries. Mirrors the shape of the teacher's `fs/inode.rs` — allocation,
//! directory lookup/link, and a disk-record layout distinct from the
//! in-memory copy — but trades the teacher's fixed inode-number disk
//! layout and `Dinode`/`Dirent` `repr(C)` structs (sized for a real block
//! device) for hand-packed little-endian records over the KV adapter,
//! since there is no fixed inode table here: ids are allocated from a
//! monotonic counter and every inode gets its own key (`spec.md` §6.4).

use std::sync::Arc;

use crate::crypto::Aead;
use crate::error::{err, Error, ErrorKind, Result};
use crate::kv::{domain_key, Batch, Encoding, EncryptedStore, KvStore};
use crate::param::ROOT_INODE;

/// A stable, non-reusable inode id drawn from the monotonic counter.
pub type InodeId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Regular,
    Directory,
    Symlink,
}

impl InodeType {
    fn tag(self) -> u8 {
        match self {
            InodeType::Regular => 0,
            InodeType::Directory => 1,
            InodeType::Symlink => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(InodeType::Regular),
            1 => Ok(InodeType::Directory),
            2 => Ok(InodeType::Symlink),
            _ => Err(Error::new(ErrorKind::Corruption)),
        }
    }
}

/// The persisted inode record (`spec.md` §3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeMeta {
    pub kind: InodeType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub nlink: u32,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub birthtime_ms: i64,
    /// Symlink target, only populated for `InodeType::Symlink`.
    pub target: Option<Vec<u8>>,
}

impl InodeMeta {
    pub fn new_now(kind: InodeType, mode: u32, uid: u32, gid: u32, now_ms: i64) -> Self {
        let nlink = if kind == InodeType::Directory { 2 } else { 1 };
        Self {
            kind,
            mode,
            uid,
            gid,
            size: 0,
            blocks: 0,
            nlink,
            atime_ms: now_ms,
            mtime_ms: now_ms,
            ctime_ms: now_ms,
            birthtime_ms: now_ms,
            target: None,
        }
    }

    pub fn block_count(&self, block_size: u64) -> u64 {
        self.size.div_ceil(block_size)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.kind.tag());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.blocks.to_le_bytes());
        out.extend_from_slice(&self.nlink.to_le_bytes());
        out.extend_from_slice(&self.atime_ms.to_le_bytes());
        out.extend_from_slice(&self.mtime_ms.to_le_bytes());
        out.extend_from_slice(&self.ctime_ms.to_le_bytes());
        out.extend_from_slice(&self.birthtime_ms.to_le_bytes());
        let target = self.target.as_deref().unwrap_or(&[]);
        out.extend_from_slice(&(target.len() as u32).to_le_bytes());
        out.extend_from_slice(target);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        const HEADER_LEN: usize = 1 + 4 + 4 + 4 + 8 + 8 + 4 + 8 + 8 + 8 + 8 + 4;
        if bytes.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::Corruption));
        }
        let mut off = 0;
        macro_rules! take {
            ($n:expr) => {{
                let slice = &bytes[off..off + $n];
                off += $n;
                slice
            }};
        }
        let kind = InodeType::from_tag(take!(1)[0])?;
        let mode = u32::from_le_bytes(take!(4).try_into().unwrap());
        let uid = u32::from_le_bytes(take!(4).try_into().unwrap());
        let gid = u32::from_le_bytes(take!(4).try_into().unwrap());
        let size = u64::from_le_bytes(take!(8).try_into().unwrap());
        let blocks = u64::from_le_bytes(take!(8).try_into().unwrap());
        let nlink = u32::from_le_bytes(take!(4).try_into().unwrap());
        let atime_ms = i64::from_le_bytes(take!(8).try_into().unwrap());
        let mtime_ms = i64::from_le_bytes(take!(8).try_into().unwrap());
        let ctime_ms = i64::from_le_bytes(take!(8).try_into().unwrap());
        let birthtime_ms = i64::from_le_bytes(take!(8).try_into().unwrap());
        let target_len = u32::from_le_bytes(take!(4).try_into().unwrap()) as usize;
        if bytes.len() != off + target_len {
            return Err(Error::new(ErrorKind::Corruption));
        }
        let target = if target_len == 0 {
            None
        } else {
            Some(bytes[off..off + target_len].to_vec())
        };
        Ok(Self {
            kind,
            mode,
            uid,
            gid,
            size,
            blocks,
            nlink,
            atime_ms,
            mtime_ms,
            ctime_ms,
            birthtime_ms,
            target,
        })
    }
}

fn counter_key() -> Vec<u8> {
    domain_key(&[b"meta"], b"counter")
}

fn inode_meta_key(id: InodeId) -> Vec<u8> {
    domain_key(&[b"inode", id.to_string().as_bytes()], b"meta")
}

pub fn inode_block_key(id: InodeId, block_index: u64) -> Vec<u8> {
    domain_key(
        &[b"inode", id.to_string().as_bytes(), b"block"],
        block_index.to_string().as_bytes(),
    )
}

fn dirent_key(parent: InodeId, name: &[u8]) -> Vec<u8> {
    domain_key(&[b"inode", parent.to_string().as_bytes(), b"dirent"], name)
}

fn dirent_prefix(parent: InodeId) -> Vec<u8> {
    domain_key(&[b"inode", parent.to_string().as_bytes(), b"dirent"], b"")
}

/// The exclusive upper bound of the key range covering every key with
/// `prefix` as a prefix: the lexicographically next key after the last
/// possible one under it. Found by incrementing the last byte that isn't
/// `0xff`, dropping any trailing `0xff` bytes first (`spec.md` §3 allows
/// any raw byte except `/` and `0x00` in a name, so a name starting with
/// `0xff` must not be excluded by a naive `prefix + [0xff]` bound).
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xff {
            out.pop();
        } else {
            *out.last_mut().unwrap() += 1;
            return out;
        }
    }
    // Every byte in `prefix` was `0xff`; no finite byte string is both
    // greater than all keys under it and distinguishable from them
    // except by length, so extend instead of incrementing.
    let mut out = prefix.to_vec();
    out.push(0xff);
    out
}

/// Validates a raw directory-entry name per `spec.md` §3: `/` and the
/// all-zero byte are forbidden, and `.`/`..` are never stored.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name == b"." || name == b".." {
        return err(ErrorKind::InvalidArgument);
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return err(ErrorKind::InvalidArgument);
    }
    Ok(())
}

/// The inode store (C3): allocation, metadata access, and directory
/// entries, all behind the encrypted KV adapter (C2).
pub struct InodeStore<K: KvStore> {
    store: EncryptedStore<K>,
}

impl<K: KvStore> InodeStore<K> {
    pub fn new(kv: K, aead: Arc<dyn Aead>) -> Self {
        Self {
            store: EncryptedStore::new(kv, aead),
        }
    }

    /// Returns `true` if the store already holds a counter record, i.e.
    /// `format` has already run.
    pub fn is_formatted(&self) -> Result<bool> {
        Ok(self.store.get_at_mount(&counter_key())?.is_some())
    }

    /// Checks the root key against whatever is already on disk, per
    /// `spec.md` §4.1: the first authentication failure at mount time is
    /// reported as `KeyMismatch`, not the generic `Corruption`.
    pub fn check_key_at_mount(&self) -> Result<()> {
        self.store.get_at_mount(&counter_key())?;
        Ok(())
    }

    /// Initializes an empty store: writes the counter and the root
    /// directory inode (`spec.md` §3 "Root").
    pub fn format(&self, now_ms: i64) -> Result<()> {
        let mut batch = Batch::new();
        // Next id to allocate after the root.
        self.store
            .put_encrypted(&mut batch, counter_key(), &(ROOT_INODE + 1).to_le_bytes());
        let root_meta = InodeMeta::new_now(InodeType::Directory, 0o755, 0, 0, now_ms);
        self.store.put_encrypted(
            &mut batch,
            inode_meta_key(ROOT_INODE),
            &root_meta.to_bytes(),
        );
        self.store.apply_batch(batch)
    }

    fn next_counter(&self) -> Result<u64> {
        let raw = self
            .store
            .get(&counter_key(), Encoding::Encrypted)?
            .ok_or_else(|| Error::new(ErrorKind::Corruption))?;
        Ok(u64::from_le_bytes(raw.try_into().map_err(|_| {
            Error::new(ErrorKind::Corruption)
        })?))
    }

    /// Allocates a fresh inode id, persisting the bumped counter and the
    /// new inode's metadata atomically.
    pub fn alloc_inode(
        &self,
        kind: InodeType,
        mode: u32,
        uid: u32,
        gid: u32,
        now_ms: i64,
    ) -> Result<InodeId> {
        let id = self.next_counter()?;
        let meta = InodeMeta::new_now(kind, mode, uid, gid, now_ms);
        let mut batch = Batch::new();
        self.store
            .put_encrypted(&mut batch, counter_key(), &(id + 1).to_le_bytes());
        self.store
            .put_encrypted(&mut batch, inode_meta_key(id), &meta.to_bytes());
        self.store.apply_batch(batch)?;
        Ok(id)
    }

    pub fn read_meta(&self, id: InodeId) -> Result<InodeMeta> {
        let raw = self
            .store
            .get(&inode_meta_key(id), Encoding::Encrypted)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        InodeMeta::from_bytes(&raw)
    }

    pub fn queue_write_meta(&self, batch: &mut Batch, id: InodeId, meta: &InodeMeta) {
        self.store
            .put_encrypted(batch, inode_meta_key(id), &meta.to_bytes());
    }

    pub fn write_meta(&self, id: InodeId, meta: &InodeMeta) -> Result<()> {
        let mut batch = Batch::new();
        self.queue_write_meta(&mut batch, id, meta);
        self.commit(batch)
    }

    pub fn commit(&self, batch: Batch) -> Result<()> {
        self.store.apply_batch(batch)
    }

    /// Looks up `name` within `parent`'s directory entries.
    pub fn lookup_entry(&self, parent: InodeId, name: &[u8]) -> Result<Option<InodeId>> {
        let key = dirent_key(parent, name);
        match self.store.get(&key, Encoding::Encrypted)? {
            Some(raw) => Ok(Some(u64::from_le_bytes(raw.try_into().map_err(|_| {
                Error::new(ErrorKind::Corruption)
            })?))),
            None => Ok(None),
        }
    }

    /// Ordered iteration over a directory's entries, as raw `(name,
    /// child id)` pairs; `.`/`..` are synthesized by callers, never
    /// stored (`spec.md` §3).
    pub fn iter_entries(&self, parent: InodeId) -> Result<Vec<(Vec<u8>, InodeId)>> {
        let prefix = dirent_prefix(parent);
        let hi = prefix_upper_bound(&prefix);
        let rows = self.store.range_decrypt(&prefix, &hi)?;
        itertools::process_results(
            rows.into_iter().map(|(k, v)| {
                let name = k[prefix.len()..].to_vec();
                let id = u64::from_le_bytes(
                    v.try_into()
                        .map_err(|_| Error::new(ErrorKind::Corruption))?,
                );
                Ok::<_, Error>((name, id))
            }),
            |iter| iter.collect(),
        )
    }

    /// Creates a directory entry `(parent, name) -> child`, bumping
    /// parent `size`/`mtime`/`ctime` and the child's `ctime`/`nlink`
    /// together, in one batch. Fails with `EEXIST` if `name` already
    /// exists.
    #[allow(clippy::too_many_arguments)]
    pub fn link_entry(
        &self,
        parent: InodeId,
        name: &[u8],
        child: InodeId,
        bump_child_nlink: bool,
        now_ms: i64,
    ) -> Result<()> {
        validate_name(name)?;
        if self.lookup_entry(parent, name)?.is_some() {
            return err(ErrorKind::AlreadyExists);
        }
        let mut parent_meta = self.read_meta(parent)?;
        let mut child_meta = self.read_meta(child)?;

        parent_meta.size += 1;
        parent_meta.mtime_ms = now_ms;
        parent_meta.ctime_ms = now_ms;
        child_meta.ctime_ms = now_ms;
        if bump_child_nlink {
            child_meta.nlink += 1;
        }
        if child_meta.kind == InodeType::Directory {
            parent_meta.nlink += 1;
        }

        let mut batch = Batch::new();
        self.store.put_encrypted(
            &mut batch,
            dirent_key(parent, name),
            &child.to_le_bytes(),
        );
        self.queue_write_meta(&mut batch, parent, &parent_meta);
        self.queue_write_meta(&mut batch, child, &child_meta);
        self.commit(batch)
    }

    /// Removes a directory entry, decrementing the child's `nlink`
    /// (caller decides whether to drop the inode once it reaches zero
    /// with no open descriptor).
    ///
    /// A directory entry always names the directory's *only* name
    /// (`rmdir`/`rmdir_locked` are the only callers that ever pass a
    /// directory as `child` — `link`/`rename` forbid aliasing directories
    /// entirely), so removing it also retires the child's own "."
    /// self-reference: `nlink` drops by 2 (the entry plus the self-link
    /// `InodeMeta::new_now` started at), not 1.
    pub fn unlink_entry(&self, parent: InodeId, name: &[u8], now_ms: i64) -> Result<InodeMeta> {
        let child = self
            .lookup_entry(parent, name)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let mut parent_meta = self.read_meta(parent)?;
        let mut child_meta = self.read_meta(child)?;

        parent_meta.size = parent_meta.size.saturating_sub(1);
        parent_meta.mtime_ms = now_ms;
        parent_meta.ctime_ms = now_ms;
        child_meta.ctime_ms = now_ms;
        if child_meta.kind == InodeType::Directory {
            child_meta.nlink = child_meta.nlink.saturating_sub(2);
            parent_meta.nlink = parent_meta.nlink.saturating_sub(1);
        } else {
            child_meta.nlink = child_meta.nlink.saturating_sub(1);
        }

        let mut batch = Batch::new();
        batch.delete(dirent_key(parent, name));
        self.queue_write_meta(&mut batch, parent, &parent_meta);
        self.queue_write_meta(&mut batch, child, &child_meta);
        self.commit(batch)?;
        Ok(child_meta)
    }

    /// Removes an inode's metadata, all block records, and (for a
    /// directory) nothing else, since its dirents are already gone by
    /// the time `nlink` can reach zero. Caller must have verified
    /// `nlink == 0` and no live descriptor.
    pub fn drop_inode(&self, id: InodeId, meta: &InodeMeta, block_size: u64) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(inode_meta_key(id));
        for idx in 0..meta.block_count(block_size) {
            batch.delete(inode_block_key(id, idx));
        }
        self.commit(batch)
    }

    /// Atomically moves a directory entry from `(src_parent, src_name)` to
    /// `(dst_parent, dst_name)`, replacing whatever already sat at the
    /// destination (`spec.md` §4.8 `rename`). Caller has already checked
    /// the type-compatibility and non-empty-directory preconditions;
    /// this only performs the bookkeeping, so it can be called while
    /// holding the locks covering both parents.
    pub fn rename_entry(
        &self,
        src_parent: InodeId,
        src_name: &[u8],
        dst_parent: InodeId,
        dst_name: &[u8],
        now_ms: i64,
        block_size: u64,
    ) -> Result<()> {
        validate_name(dst_name)?;
        let src_child = self
            .lookup_entry(src_parent, src_name)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        if src_parent == dst_parent && src_name == dst_name {
            return Ok(());
        }
        let existing = self.lookup_entry(dst_parent, dst_name)?;

        let mut src_child_meta = self.read_meta(src_child)?;
        let mut src_parent_meta = self.read_meta(src_parent)?;
        let mut dst_parent_meta = if src_parent == dst_parent {
            src_parent_meta.clone()
        } else {
            self.read_meta(dst_parent)?
        };

        let mut batch = Batch::new();

        match existing {
            Some(existing_id) if existing_id != src_child => {
                let mut existing_meta = self.read_meta(existing_id)?;
                existing_meta.ctime_ms = now_ms;
                if existing_meta.kind == InodeType::Directory {
                    // The replaced directory is verified empty by the
                    // caller, so this removes its only name and its own
                    // "." together, same as `unlink_entry` on a directory.
                    existing_meta.nlink = existing_meta.nlink.saturating_sub(2);
                    dst_parent_meta.nlink = dst_parent_meta.nlink.saturating_sub(1);
                } else {
                    existing_meta.nlink = existing_meta.nlink.saturating_sub(1);
                }
                // `dst_parent`'s child-subdirectory count loses the
                // replaced directory (above) and gains the incoming one
                // if it's also a directory, independent of whether a
                // directory replaced a directory or a file.
                if src_child_meta.kind == InodeType::Directory {
                    dst_parent_meta.nlink += 1;
                }
                if existing_meta.nlink == 0 {
                    batch.delete(inode_meta_key(existing_id));
                    for idx in 0..existing_meta.block_count(block_size) {
                        batch.delete(inode_block_key(existing_id, idx));
                    }
                } else {
                    self.queue_write_meta(&mut batch, existing_id, &existing_meta);
                }
            }
            Some(_) => {
                // Replacing an alias of the same inode under a new name:
                // the entry moves, nlink is unaffected.
            }
            None => {
                dst_parent_meta.size += 1;
                if src_child_meta.kind == InodeType::Directory {
                    dst_parent_meta.nlink += 1;
                }
            }
        }

        if src_parent != dst_parent {
            src_parent_meta.size = src_parent_meta.size.saturating_sub(1);
            if src_child_meta.kind == InodeType::Directory {
                src_parent_meta.nlink = src_parent_meta.nlink.saturating_sub(1);
            }
        }

        src_parent_meta.mtime_ms = now_ms;
        src_parent_meta.ctime_ms = now_ms;
        dst_parent_meta.mtime_ms = now_ms;
        dst_parent_meta.ctime_ms = now_ms;
        src_child_meta.ctime_ms = now_ms;

        batch.delete(dirent_key(src_parent, src_name));
        self.store
            .put_encrypted(&mut batch, dirent_key(dst_parent, dst_name), &src_child.to_le_bytes());
        self.queue_write_meta(&mut batch, src_child, &src_child_meta);
        self.queue_write_meta(&mut batch, src_parent, &src_parent_meta);
        if src_parent != dst_parent {
            self.queue_write_meta(&mut batch, dst_parent, &dst_parent_meta);
        }
        self.commit(batch)
    }

    pub fn kv(&self) -> &EncryptedStore<K> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Aes256GcmAead, KeyMaterial};
    use crate::kv::MemKv;

    fn store() -> InodeStore<Arc<MemKv>> {
        let kv = MemKv::new();
        let aead: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([3; 32])));
        let store = InodeStore::new(kv, aead);
        store.format(1000).unwrap();
        store
    }

    #[test]
    fn format_creates_root() {
        let s = store();
        let meta = s.read_meta(ROOT_INODE).unwrap();
        assert_eq!(meta.kind, InodeType::Directory);
        assert_eq!(meta.nlink, 2);
    }

    #[test]
    fn alloc_link_lookup_unlink() {
        let s = store();
        let file = s
            .alloc_inode(InodeType::Regular, 0o644, 1000, 1000, 2000)
            .unwrap();
        s.link_entry(ROOT_INODE, b"a.txt", file, false, 2000)
            .unwrap();
        assert_eq!(s.lookup_entry(ROOT_INODE, b"a.txt").unwrap(), Some(file));

        let entries = s.iter_entries(ROOT_INODE).unwrap();
        assert_eq!(entries, vec![(b"a.txt".to_vec(), file)]);

        let meta = s.unlink_entry(ROOT_INODE, b"a.txt", 3000).unwrap();
        assert_eq!(meta.nlink, 0);
        assert_eq!(s.lookup_entry(ROOT_INODE, b"a.txt").unwrap(), None);
    }

    #[test]
    fn duplicate_link_is_eexist() {
        let s = store();
        let f1 = s
            .alloc_inode(InodeType::Regular, 0o644, 0, 0, 2000)
            .unwrap();
        let f2 = s
            .alloc_inode(InodeType::Regular, 0o644, 0, 0, 2000)
            .unwrap();
        s.link_entry(ROOT_INODE, b"dup", f1, false, 2000).unwrap();
        let err = s.link_entry(ROOT_INODE, b"dup", f2, false, 2000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn invalid_names_rejected() {
        let s = store();
        let f = s
            .alloc_inode(InodeType::Regular, 0o644, 0, 0, 2000)
            .unwrap();
        assert!(s.link_entry(ROOT_INODE, b".", f, false, 2000).is_err());
        assert!(s.link_entry(ROOT_INODE, b"a/b", f, false, 2000).is_err());
    }

    #[test]
    fn unlinking_a_directory_entry_drops_its_nlink_to_zero() {
        let s = store();
        let dir = s
            .alloc_inode(InodeType::Directory, 0o755, 0, 0, 2000)
            .unwrap();
        assert_eq!(s.read_meta(dir).unwrap().nlink, 2);
        s.link_entry(ROOT_INODE, b"sub", dir, false, 2000).unwrap();
        assert_eq!(s.read_meta(dir).unwrap().nlink, 2);

        let meta = s.unlink_entry(ROOT_INODE, b"sub", 3000).unwrap();
        assert_eq!(meta.nlink, 0, "an empty directory's self-link must go with its entry");
    }

    #[test]
    fn iter_entries_includes_names_starting_with_0xff() {
        let s = store();
        let f = s
            .alloc_inode(InodeType::Regular, 0o644, 0, 0, 2000)
            .unwrap();
        let name = [0xff, b'z'];
        s.link_entry(ROOT_INODE, &name, f, false, 2000).unwrap();
        let entries = s.iter_entries(ROOT_INODE).unwrap();
        assert_eq!(entries, vec![(name.to_vec(), f)]);
    }

    #[test]
    fn prefix_upper_bound_excludes_only_keys_outside_the_prefix() {
        assert_eq!(prefix_upper_bound(b"a\x00"), b"a\x01");
        assert_eq!(prefix_upper_bound(b"a\xff"), b"a\xff\xff".to_vec());
        assert_eq!(prefix_upper_bound(b"\xff\xff"), b"\xff\xff\xff".to_vec());
    }

    #[test]
    fn rename_directory_over_empty_directory_keeps_parent_nlink_balanced() {
        let s = store();
        let src = s
            .alloc_inode(InodeType::Directory, 0o755, 0, 0, 2000)
            .unwrap();
        s.link_entry(ROOT_INODE, b"src", src, false, 2000).unwrap();
        let dst = s
            .alloc_inode(InodeType::Directory, 0o755, 0, 0, 2000)
            .unwrap();
        s.link_entry(ROOT_INODE, b"dst", dst, false, 2000).unwrap();
        let parent_nlink_before = s.read_meta(ROOT_INODE).unwrap().nlink;

        s.rename_entry(ROOT_INODE, b"src", ROOT_INODE, b"dst", 3000, 4096)
            .unwrap();

        let parent_meta = s.read_meta(ROOT_INODE).unwrap();
        assert_eq!(
            parent_meta.nlink, parent_nlink_before,
            "swapping one child directory for another must not change the parent's subdirectory count"
        );
        let dropped = s.read_meta(dst).unwrap_err();
        assert_eq!(dropped.kind, ErrorKind::NotFound, "the replaced empty directory must be fully dropped");
        assert_eq!(s.lookup_entry(ROOT_INODE, b"dst").unwrap(), Some(src));
    }
}
