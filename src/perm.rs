//! Permission model (C6, `spec.md` §4.6).
//!
//! The teacher checks `ip->mode` bits nowhere explicitly — xv6 has no
//! user/group model at all. This module is grounded instead on the
//! POSIX triad semantics `spec.md` §4.6 spells out directly: owner,
//! group, other, checked in that fixed order, with root (`uid == 0`)
//! bypassing every check except an explicit `X_OK` probe via `access`.

use crate::error::{err, ErrorKind, Result};
use crate::flags::{mode, AccessBits};
use crate::inode::InodeMeta;

/// The identity an operation runs as. A single-group model: `spec.md`
/// §4.6 only ever mentions one owning group per check, so there is no
/// supplementary group list to consult.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Computes the permission triad (owner/group/other) that applies to
/// `creds` against `meta`, as three bits in `AccessBits` order.
fn effective_bits(meta: &InodeMeta, creds: &Credentials) -> u32 {
    let perm = meta.mode & mode::PERMISSION_BITS;
    if creds.uid == meta.uid {
        (perm >> 6) & 0o7
    } else if creds.gid == meta.gid {
        (perm >> 3) & 0o7
    } else {
        perm & 0o7
    }
}

/// Checks `requested` access against `meta` for `creds`, per `spec.md`
/// §4.6: root bypasses every check except an explicit `X_OK` request,
/// which still requires at least one `x` bit set for *someone* (owner,
/// group, or other) — root may not execute a file nobody is allowed to
/// execute.
pub fn check_access(meta: &InodeMeta, creds: &Credentials, requested: AccessBits) -> Result<()> {
    if creds.is_root() {
        if requested.contains(AccessBits::X_OK) {
            let perm = meta.mode & mode::PERMISSION_BITS;
            let any_x = perm & 0o111 != 0;
            if !any_x {
                return err(ErrorKind::AccessDenied);
            }
        }
        return Ok(());
    }

    let bits = effective_bits(meta, creds);
    let granted = AccessBits::from_bits_truncate(bits);
    if granted.contains(requested) {
        Ok(())
    } else {
        err(ErrorKind::AccessDenied)
    }
}

/// Authorizes `chmod`/`fchmod`/`lchmod`: only the owner or root may
/// change an inode's mode bits.
pub fn authorize_chmod(meta: &InodeMeta, creds: &Credentials) -> Result<()> {
    if creds.is_root() || creds.uid == meta.uid {
        Ok(())
    } else {
        err(ErrorKind::NotPermitted)
    }
}

/// Authorizes `chown`/`fchown`/`lchown`. Only root may change the
/// owning uid to anything other than the caller, or change the owning
/// gid to a group the caller does not belong to; the unprivileged
/// "change my own file's group to my own group" case is allowed.
pub fn authorize_chown(
    meta: &InodeMeta,
    creds: &Credentials,
    new_uid: Option<u32>,
    new_gid: Option<u32>,
) -> Result<()> {
    if creds.is_root() {
        return Ok(());
    }
    if creds.uid != meta.uid {
        return err(ErrorKind::NotPermitted);
    }
    if let Some(uid) = new_uid {
        if uid != creds.uid {
            return err(ErrorKind::NotPermitted);
        }
    }
    if let Some(gid) = new_gid {
        if gid != creds.gid {
            return err(ErrorKind::NotPermitted);
        }
    }
    Ok(())
}

/// Applies a umask to a requested creation mode, as `spec.md` §4.6
/// describes for `mkdir`/`open(O_CREAT)`/`mknod`/`symlink`.
pub fn apply_umask(requested_mode: u32, umask: u32) -> u32 {
    requested_mode & !umask & mode::PERMISSION_BITS
}
