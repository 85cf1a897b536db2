//! Path resolver (C5, `spec.md` §4.5).
//!
//! The teacher's resolver (`fs/path.rs` + `Itable::namex` in
//! `fs/inode.rs`) walks a `Path` of borrowed byte slices against a
//! process's `cwd` inode, with `..` realized as an actual on-disk dirent.
//! This spec forbids storing `..` (`spec.md` §9, "Cyclic ownership") —
//! only `name -> id` edges are stored — so this resolver instead walks
//! with an explicit *position stack* of ancestor inode ids (root or
//! chroot-root first, current directory last) and resolves `..` by
//! popping that stack, exactly as the spec's design note prescribes.
//! Symlink targets are owned byte buffers spliced into the remaining
//! component queue, since (unlike the teacher' borrowed `Path` chain)
//! a target does not live inside the original path string.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{err, Error, ErrorKind, Result};
use crate::inode::{InodeId, InodeStore, InodeType};
use crate::kv::KvStore;
use crate::param::MAX_SYMLINK_HOPS;
use crate::perm::{check_access, Credentials};
use crate::flags::AccessBits;

/// Resolution mode, selected per-call by the caller (`spec.md` §4.5).
#[derive(Clone, Copy, Debug)]
pub struct ResolveFlags {
    /// Follow a symlink at the final path component. Unset for `lstat`,
    /// `symlink`, `unlink`, `rename`, and when `O_NOFOLLOW` is set on
    /// `open`.
    pub follow_final_symlink: bool,
    /// The resolved target must be a directory.
    pub must_be_directory: bool,
}

impl ResolveFlags {
    pub fn lookup() -> Self {
        Self {
            follow_final_symlink: true,
            must_be_directory: false,
        }
    }

    pub fn no_follow() -> Self {
        Self {
            follow_final_symlink: false,
            must_be_directory: false,
        }
    }
}

fn split_components(path: &[u8]) -> Result<(bool, bool, VecDeque<Vec<u8>>)> {
    if path.is_empty() {
        return err(ErrorKind::InvalidArgument);
    }
    let absolute = path[0] == b'/';
    let trailing_slash = path.len() > 1 && *path.last().unwrap() == b'/';
    let mut out = VecDeque::new();
    for raw in path.split(|&b| b == b'/') {
        if raw.is_empty() || raw == b"." {
            continue;
        }
        out.push_back(raw.to_vec());
    }
    Ok((absolute, trailing_slash, out))
}

/// Walks `components` starting from `stack` (last element is "here"),
/// splicing symlink targets in as encountered. On success, returns the
/// resolved inode id with `stack` left pointing at its containing
/// ancestry (useful to callers that want the final directory as well).
#[allow(clippy::too_many_arguments)]
fn walk<K: KvStore>(
    inodes: &InodeStore<K>,
    root: InodeId,
    stack: &mut Vec<InodeId>,
    mut components: VecDeque<Vec<u8>>,
    mut trailing_slash: bool,
    flags: ResolveFlags,
    creds: &Credentials,
    mut names: Option<&mut Vec<Vec<u8>>>,
) -> Result<InodeId> {
    let mut hops: u32 = 0;

    if components.is_empty() {
        return Ok(*stack.last().unwrap());
    }

    loop {
        let name = match components.pop_front() {
            Some(n) => n,
            None => return Ok(*stack.last().unwrap()),
        };
        let is_last = components.is_empty();

        if name == b".." {
            if stack.len() > 1 {
                stack.pop();
                if let Some(names) = names.as_deref_mut() {
                    names.pop();
                }
            }
            if is_last {
                if trailing_slash || flags.must_be_directory {
                    // ".." always resolves to a directory, nothing to check.
                }
                return Ok(*stack.last().unwrap());
            }
            continue;
        }

        let dir_id = *stack.last().unwrap();
        let dir_meta = inodes.read_meta(dir_id)?;
        if dir_meta.kind != InodeType::Directory {
            return err(ErrorKind::NotADirectory);
        }
        check_access(&dir_meta, creds, AccessBits::X_OK).map_err(|e| {
            // Missing `x` on an intermediate directory masks ENOENT for
            // its children (`spec.md` §7): we never attempt the lookup.
            e
        })?;

        let child_id = match inodes.lookup_entry(dir_id, &name)? {
            Some(id) => id,
            None => return err(ErrorKind::NotFound),
        };
        let child_meta = inodes.read_meta(child_id)?;

        let should_follow = child_meta.kind == InodeType::Symlink
            && (!is_last || flags.follow_final_symlink || trailing_slash);
        if should_follow {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return err(ErrorKind::SymlinkLoop);
            }
            let target = child_meta.target.clone().unwrap_or_default();
            let (target_absolute, target_trailing, target_components) =
                split_components(&target).unwrap_or((false, false, VecDeque::new()));
            if target_absolute {
                stack.clear();
                stack.push(root);
                if let Some(names) = names.as_deref_mut() {
                    names.clear();
                }
            }
            for c in target_components.into_iter().rev() {
                components.push_front(c);
            }
            if is_last {
                trailing_slash = trailing_slash || target_trailing;
            }
            continue;
        }

        if !is_last {
            if child_meta.kind != InodeType::Directory {
                return err(ErrorKind::NotADirectory);
            }
            stack.push(child_id);
            if let Some(names) = names.as_deref_mut() {
                names.push(name);
            }
            continue;
        }

        if (trailing_slash || flags.must_be_directory) && child_meta.kind != InodeType::Directory {
            return err(ErrorKind::NotADirectory);
        }
        stack.push(child_id);
        if let Some(names) = names.as_deref_mut() {
            names.push(name);
        }
        return Ok(child_id);
    }
}

/// Resolves `path` starting at `cwd_stack` (or `root` for absolute
/// paths), returning the final inode id.
pub fn resolve<K: KvStore>(
    inodes: &InodeStore<K>,
    root: InodeId,
    cwd_stack: &[InodeId],
    path: &[u8],
    flags: ResolveFlags,
    creds: &Credentials,
) -> Result<InodeId> {
    let (absolute, trailing_slash, components) = split_components(path)?;
    let mut stack = if absolute {
        vec![root]
    } else {
        cwd_stack.to_vec()
    };
    walk(inodes, root, &mut stack, components, trailing_slash, flags, creds, None)
}

/// Like [`resolve`], but also returns the full ancestor id stack and the
/// canonical chain of component names from the root (or chroot root)
/// down to the resolved inode. Used by `chdir` (which needs the id
/// stack to keep resolving `..` correctly afterward) and by `realpath`
/// (which only needs the names, to rebuild an absolute path after
/// following every symlink — `spec.md` §6.1). `cwd_names` must be the
/// name chain matching `cwd_stack` (empty for the root itself), kept by
/// the caller in lockstep (see `Efs::chdir`).
#[allow(clippy::too_many_arguments)]
pub fn resolve_with_stack<K: KvStore>(
    inodes: &InodeStore<K>,
    root: InodeId,
    cwd_stack: &[InodeId],
    cwd_names: &[Vec<u8>],
    path: &[u8],
    flags: ResolveFlags,
    creds: &Credentials,
) -> Result<(InodeId, Vec<InodeId>, Vec<Vec<u8>>)> {
    let (absolute, trailing_slash, components) = split_components(path)?;
    let mut stack = if absolute {
        vec![root]
    } else {
        cwd_stack.to_vec()
    };
    let mut names = if absolute {
        Vec::new()
    } else {
        cwd_names.to_vec()
    };
    let id = walk(
        inodes,
        root,
        &mut stack,
        components,
        trailing_slash,
        flags,
        creds,
        Some(&mut names),
    )?;
    Ok((id, stack, names))
}

/// Resolves the parent directory of `path`'s final component, stopping
/// one level early (mirrors the teacher's `nameiparent`). Returns the
/// parent inode id and the raw final path component (which may itself be
/// `.`/`..`; callers apply their own operation-specific rule for that).
pub fn resolve_parent<K: KvStore>(
    inodes: &InodeStore<K>,
    root: InodeId,
    cwd_stack: &[InodeId],
    path: &[u8],
    creds: &Credentials,
) -> Result<(InodeId, Vec<u8>)> {
    if path.is_empty() {
        return err(ErrorKind::InvalidArgument);
    }
    let absolute = path[0] == b'/';
    let trimmed: &[u8] = if path.len() > 1 && *path.last().unwrap() == b'/' {
        &path[..path.len() - 1]
    } else {
        path
    };
    let mut segments: Vec<&[u8]> = trimmed.split(|&b| b == b'/').filter(|s| !s.is_empty()).collect();
    let leaf = segments.pop().ok_or_else(|| Error::new(ErrorKind::InvalidArgument))?;

    let mut stack = if absolute { vec![root] } else { cwd_stack.to_vec() };
    let mut components: VecDeque<Vec<u8>> = VecDeque::new();
    for s in segments {
        if s == b"." {
            continue;
        }
        components.push_back(s.to_vec());
    }
    let parent = walk(
        inodes,
        root,
        &mut stack,
        components,
        false,
        ResolveFlags {
            follow_final_symlink: true,
            must_be_directory: true,
        },
        creds,
        None,
    )?;
    Ok((parent, leaf.to_vec()))
}

/// A convenience handle bundling resolver inputs that rarely change
/// across a single filesystem op (see `ops.rs`).
pub struct ResolveContext<'a, K: KvStore> {
    pub inodes: &'a InodeStore<K>,
    pub root: InodeId,
}

impl<'a, K: KvStore> ResolveContext<'a, K> {
    pub fn new(inodes: &'a InodeStore<K>, root: InodeId) -> Self {
        Self { inodes, root }
    }
}

pub type SharedInodeStore<K> = Arc<InodeStore<K>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Aead, Aes256GcmAead, KeyMaterial};
    use crate::inode::InodeType;
    use crate::kv::MemKv;
    use crate::param::ROOT_INODE;
    use crate::perm::Credentials;

    fn fresh() -> InodeStore<Arc<MemKv>> {
        let kv = MemKv::new();
        let aead: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([4; 32])));
        let s = InodeStore::new(kv, aead);
        s.format(1000).unwrap();
        s
    }

    #[test]
    fn resolves_nested_directories() {
        let s = fresh();
        let root_creds = Credentials::root();
        let a = s
            .alloc_inode(InodeType::Directory, 0o755, 0, 0, 2000)
            .unwrap();
        s.link_entry(ROOT_INODE, b"a", a, true, 2000).unwrap();
        let b = s
            .alloc_inode(InodeType::Regular, 0o644, 0, 0, 2000)
            .unwrap();
        s.link_entry(a, b"b", b, false, 2000).unwrap();

        let found = resolve(
            &s,
            ROOT_INODE,
            &[ROOT_INODE],
            b"/a/b",
            ResolveFlags::lookup(),
            &root_creds,
        )
        .unwrap();
        assert_eq!(found, b);
    }

    #[test]
    fn dotdot_pops_stack() {
        let s = fresh();
        let creds = Credentials::root();
        let a = s
            .alloc_inode(InodeType::Directory, 0o755, 0, 0, 2000)
            .unwrap();
        s.link_entry(ROOT_INODE, b"a", a, true, 2000).unwrap();

        let found = resolve(
            &s,
            ROOT_INODE,
            &[ROOT_INODE, a],
            b"../a",
            ResolveFlags::lookup(),
            &creds,
        )
        .unwrap();
        assert_eq!(found, a);
    }

    #[test]
    fn root_parent_is_itself() {
        let s = fresh();
        let creds = Credentials::root();
        let found = resolve(
            &s,
            ROOT_INODE,
            &[ROOT_INODE],
            b"../../..",
            ResolveFlags::lookup(),
            &creds,
        )
        .unwrap();
        assert_eq!(found, ROOT_INODE);
    }

    #[test]
    fn symlink_loop_is_eloop() {
        let s = fresh();
        let creds = Credentials::root();
        let link = s
            .alloc_inode(InodeType::Symlink, 0o777, 0, 0, 2000)
            .unwrap();
        let mut meta = s.read_meta(link).unwrap();
        meta.target = Some(b"/t".to_vec());
        s.write_meta(link, &meta).unwrap();
        s.link_entry(ROOT_INODE, b"t", link, false, 2000).unwrap();

        let err = resolve(
            &s,
            ROOT_INODE,
            &[ROOT_INODE],
            b"/t",
            ResolveFlags::lookup(),
            &creds,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SymlinkLoop);
    }
}
