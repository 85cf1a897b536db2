//! Flag and mode bit constants (`spec.md` §6.1), mirroring the teacher's
//! `fcntl.rs` but generalized from a single `O_RDWR`-style word into the
//! full POSIX-lite set this spec asks for.

use bitflags::bitflags;

bitflags! {
    /// `open` flags. Bit-or-able, as in `spec.md` §6.1.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct OpenFlags: u32 {
        const O_RDONLY   = 0;
        const O_WRONLY   = 0x0001;
        const O_RDWR     = 0x0002;
        const O_CREAT    = 0x0040;
        const O_EXCL     = 0x0080;
        const O_TRUNC    = 0x0200;
        const O_APPEND   = 0x0400;
        const O_DIRECTORY = 0x0800;
        const O_NOFOLLOW = 0x1000;
        const O_SYNC     = 0x2000;
    }
}

impl OpenFlags {
    const ACCESS_MASK: u32 = Self::O_WRONLY.bits() | Self::O_RDWR.bits();

    pub fn access_mode(self) -> AccessMode {
        match self.bits() & Self::ACCESS_MASK {
            0 => AccessMode::Read,
            x if x == Self::O_WRONLY.bits() => AccessMode::Write,
            _ => AccessMode::ReadWrite,
        }
    }
}

/// The access mode an open file description was created with.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

bitflags! {
    /// Access-check bits for `access(2)`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AccessBits: u32 {
        const F_OK = 0;
        const R_OK = 0b100;
        const W_OK = 0b010;
        const X_OK = 0b001;
    }
}

/// `lseek` whence values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Standard 12-bit POSIX permission bits, plus the type bits `spec.md` §6.1
/// calls out explicitly.
pub mod mode {
    pub const S_IRWXU: u32 = 0o700;
    pub const S_IRUSR: u32 = 0o400;
    pub const S_IWUSR: u32 = 0o200;
    pub const S_IXUSR: u32 = 0o100;
    pub const S_IRWXG: u32 = 0o070;
    pub const S_IRGRP: u32 = 0o040;
    pub const S_IWGRP: u32 = 0o020;
    pub const S_IXGRP: u32 = 0o010;
    pub const S_IRWXO: u32 = 0o007;
    pub const S_IROTH: u32 = 0o004;
    pub const S_IWOTH: u32 = 0o002;
    pub const S_IXOTH: u32 = 0o001;
    pub const S_ISUID: u32 = 0o4000;
    pub const S_ISGID: u32 = 0o2000;
    pub const S_ISVTX: u32 = 0o1000;

    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFLNK: u32 = 0o120000;

    pub const PERMISSION_BITS: u32 = 0o7777;
}
