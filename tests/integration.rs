//! Top-level integration suite driving the quantified invariants and
//! literal end-to-end scenarios of `spec.md` §8, plus a persistence
//! check against a file-backed `KvStore` to exercise the trait boundary
//! with something other than the in-memory reference implementation.
//!
//! The literal scenarios S1-S7 are also exercised as unit tests
//! colocated in `src/ops.rs`, in the teacher's own style; this suite
//! covers the same ground from outside the crate plus the quantified
//! properties that don't fit naturally as a single short unit test.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use efs::crypto::{Aead, Aes256GcmAead, KeyMaterial};
use efs::error::ErrorKind;
use efs::flags::{AccessBits, OpenFlags, Whence};
use efs::kv::{domain_key, Batch, BatchOp, KvStore, MemKv};
use efs::ops::{Efs, MountOptions};
use efs::perm::Credentials;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn mount() -> Arc<Efs<Arc<MemKv>>> {
    init();
    let kv = MemKv::new();
    let aead: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([7; 32])));
    Efs::mount(kv, aead, MountOptions::default()).unwrap()
}

// ---- quantified invariants (spec.md §8) --------------------------------

#[test]
fn property_round_trip() {
    let efs = mount();
    efs.write_file(b"/roundtrip", b"the quick brown fox").unwrap();
    assert_eq!(efs.read_file(b"/roundtrip").unwrap(), b"the quick brown fox");
}

#[test]
fn property_block_independence() {
    let efs = mount();
    let fd = efs.open(b"/blocks", OpenFlags::O_RDWR | OpenFlags::O_CREAT, 0o644).unwrap();
    // Two writes at offsets in different 4096-byte blocks, issued in
    // reverse order, must not disturb one another.
    efs.pwrite_fd(fd, 9000, b"SECOND").unwrap();
    efs.pwrite_fd(fd, 10, b"FIRST").unwrap();
    efs.close(fd).unwrap();
    let data = efs.read_file(b"/blocks").unwrap();
    assert_eq!(&data[10..15], b"FIRST");
    assert_eq!(&data[9000..9006], b"SECOND");
}

#[test]
fn property_append_size_monotonicity() {
    let efs = mount();
    efs.write_file(b"/a", b"0123456789").unwrap();
    let before = efs.stat(b"/a").unwrap().size;
    efs.append_file(b"/a", b"abcde").unwrap();
    let after = efs.stat(b"/a").unwrap().size;
    assert_eq!(after, before + 5);
    assert_eq!(efs.read_file(b"/a").unwrap(), b"0123456789abcde");
}

#[test]
fn property_sparse_zeros_via_seek_end() {
    let efs = mount();
    let fd = efs.open(b"/sparse", OpenFlags::O_RDWR | OpenFlags::O_CREAT, 0o644).unwrap();
    efs.write(fd, b"hello").unwrap();
    let n = efs.stat(b"/sparse").unwrap().size;
    efs.lseek(fd, 4, Whence::End).unwrap();
    efs.write(fd, b"!").unwrap();
    efs.close(fd).unwrap();
    let data = efs.read_file(b"/sparse").unwrap();
    assert_eq!(data.len(), (n + 4 + 1) as usize);
    assert_eq!(&data[n as usize..(n + 4) as usize], &[0, 0, 0, 0]);
    assert_eq!(data[(n + 4) as usize], b'!');
}

#[test]
fn property_hard_link_equivalence() {
    let efs = mount();
    efs.write_file(b"/f", b"hello").unwrap();
    efs.link(b"/f", b"/g").unwrap();
    assert_eq!(efs.read_file(b"/f").unwrap(), efs.read_file(b"/g").unwrap());
    assert_eq!(efs.stat(b"/f").unwrap().ino, efs.stat(b"/g").unwrap().ino);

    // An open descriptor keeps the inode alive across unlink, and the
    // data remains intact through it.
    let fd = efs.open(b"/g", OpenFlags::O_RDONLY, 0).unwrap();
    efs.unlink(b"/f").unwrap();
    efs.unlink(b"/g").unwrap();
    assert_eq!(efs.pread_fd(fd, 0, 5).unwrap(), b"hello");
    efs.close(fd).unwrap();
}

#[test]
fn property_symlink_idempotence() {
    let efs = mount();
    efs.write_file(b"/target", b"payload").unwrap();
    efs.symlink(b"/target", b"/link1").unwrap();
    efs.symlink(b"/link1", b"/link2").unwrap();
    assert_eq!(efs.realpath(b"/link2").unwrap(), efs.realpath(b"/target").unwrap());
    assert_eq!(efs.read_file(b"/link2").unwrap(), b"payload");
}

#[test]
fn property_symlink_loop_exceeds_limit() {
    let efs = mount();
    // A 41-hop chain that never cycles still exceeds the 40-hop budget.
    efs.write_file(b"/real", b"x").unwrap();
    let mut prev: Vec<u8> = b"/real".to_vec();
    for i in 0..41 {
        let name = format!("/hop{i}").into_bytes();
        efs.symlink(&prev, &name).unwrap();
        prev = name;
    }
    let err = efs.read_file(&prev).unwrap_err();
    assert_eq!(err.kind, ErrorKind::SymlinkLoop);
}

#[test]
fn property_permission_triads_deny_in_order() {
    let efs = mount();
    efs.write_file(b"/owned", b"secret").unwrap();
    efs.chown(b"/owned", Some(1), Some(1)).unwrap();
    efs.chmod(b"/owned", 0o070).unwrap(); // owner: ---, group: rwx, other: ---

    // Same uid as owner but the owner triad denies read even though the
    // (inapplicable) group triad would allow it.
    efs.set_credentials(Credentials::new(1, 2));
    let err = efs.open(b"/owned", OpenFlags::O_RDONLY, 0).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AccessDenied);

    // Matching group succeeds.
    efs.set_credentials(Credentials::new(2, 1));
    let fd = efs.open(b"/owned", OpenFlags::O_RDONLY, 0).unwrap();
    efs.close(fd).unwrap();
}

#[test]
fn property_recursive_rmdir_requires_permission_on_every_level() {
    let efs = mount();
    efs.mkdir(b"/tree", 0o777).unwrap();
    efs.mkdir(b"/tree/sub", 0o755).unwrap();
    efs.write_file(b"/tree/sub/leaf", b"x").unwrap();
    efs.chown(b"/tree/sub", Some(1000), Some(1000)).unwrap();
    efs.chmod(b"/tree/sub", 0o500).unwrap(); // no write bit: caller can't unlink leaf

    efs.set_credentials(Credentials::new(1000, 1000));
    let err = efs.rmdir(b"/tree", true).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AccessDenied);

    efs.set_credentials(Credentials::root());
    efs.rmdir(b"/tree", true).unwrap();
    assert_eq!(efs.stat(b"/tree").unwrap_err().kind, ErrorKind::NotFound);
}

#[test]
fn property_rename_atomicity_dst_never_transiently_missing_both() {
    let efs = mount();
    efs.write_file(b"/src", b"payload").unwrap();
    efs.write_file(b"/dst", b"old").unwrap();
    let dst_ino_before = efs.stat(b"/dst").unwrap().ino;
    efs.rename(b"/src", b"/dst").unwrap();
    assert_eq!(efs.stat(b"/src").unwrap_err().kind, ErrorKind::NotFound);
    let dst_ino_after = efs.stat(b"/dst").unwrap().ino;
    assert_ne!(dst_ino_before, dst_ino_after);
    assert_eq!(efs.read_file(b"/dst").unwrap(), b"payload");
}

#[test]
fn property_integrity_corruption_is_isolated() {
    let efs_kv = MemKv::new();
    let aead: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([9; 32])));
    let efs = Efs::mount(efs_kv.clone(), aead, MountOptions::default()).unwrap();

    efs.write_file(b"/keep", b"still readable").unwrap();
    efs.write_file(b"/broken", b"will be corrupted").unwrap();
    let broken_ino = efs.stat(b"/broken").unwrap().ino;

    // Flip a bit of the victim's on-disk block record directly at the
    // KV level, bypassing the crypto layer the way a bit-rot event
    // would, then confirm only that record's read fails.
    let key = domain_key(&[b"inode", broken_ino.to_string().as_bytes(), b"block"], b"0");
    let mut ciphertext = efs_kv.get(&key).unwrap().expect("block record exists");
    ciphertext[0] ^= 0x01;
    efs_kv.put(key, ciphertext).unwrap();

    let err = efs.read_file(b"/broken").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Corruption);
    assert_eq!(efs.read_file(b"/keep").unwrap(), b"still readable");
}

// ---- literal end-to-end scenarios (spec.md §8) -------------------------

#[test]
fn scenario_chroot_confinement_blocks_escape() {
    let efs = mount();
    efs.mkdir(b"/jail", 0o755).unwrap();
    efs.write_file(b"/outside", b"X").unwrap();
    let sub = efs.chroot(b"/jail").unwrap();
    let err = sub.read_file(b"/../../outside").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    // A file created inside the chroot is visible from the parent view
    // at its real path — same inode store, different resolver root.
    sub.write_file(b"/inside", b"Y").unwrap();
    assert_eq!(efs.read_file(b"/jail/inside").unwrap(), b"Y");
}

#[test]
fn scenario_stopping_root_stops_subviews_descriptors() {
    let efs = mount();
    efs.mkdir(b"/d", 0o755).unwrap();
    efs.write_file(b"/d/f", b"z").unwrap();
    let sub = efs.chroot(b"/d").unwrap();
    let fd = sub.open(b"/f", OpenFlags::O_RDONLY, 0).unwrap();
    efs.stop();
    // The sub-view's descriptor table was drained by the stop.
    assert_eq!(sub.fstat(fd).unwrap_err().kind, ErrorKind::BadDescriptor);
}

#[test]
fn scenario_access_bits_probe_without_opening() {
    let efs = mount();
    efs.write_file(b"/f", b"hi").unwrap();
    efs.chmod(b"/f", 0o400).unwrap();
    assert!(efs.access(b"/f", AccessBits::F_OK).is_ok());
    assert!(efs.access(b"/f", AccessBits::R_OK).is_ok());

    efs.set_credentials(Credentials::new(1000, 1000));
    assert_eq!(
        efs.access(b"/f", AccessBits::W_OK).unwrap_err().kind,
        ErrorKind::AccessDenied
    );
}

// ---- plugging in a non-memory KvStore ----------------------------------

/// A minimal file-backed [`KvStore`]: every key maps to one file inside
/// a directory, named by the key's hex encoding so that directory
/// listing order matches byte-lexicographic key order. Exists only to
/// demonstrate that the crate's KV boundary (`spec.md` §1/§6.2) is not
/// tied to [`MemKv`] — a real embedder plugs in whatever ordered store
/// they have, as `songzhi-ext2-rs` plugs in a block device behind its
/// own storage trait.
struct DirKv {
    dir: PathBuf,
}

impl DirKv {
    fn open(dir: PathBuf) -> Self {
        fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        let mut name = String::with_capacity(key.len() * 2);
        for b in key {
            name.push_str(&format!("{b:02x}"));
        }
        self.dir.join(name)
    }

    fn key_from_hex(name: &str) -> Vec<u8> {
        (0..name.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&name[i..i + 2], 16).unwrap())
            .collect()
    }
}

impl KvStore for DirKv {
    fn get(&self, key: &[u8]) -> efs::error::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(_) => Err(efs::error::Error::new(ErrorKind::NoSpace)),
        }
    }

    fn range(&self, lo: &[u8], hi: &[u8]) -> efs::error::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for entry in fs::read_dir(&self.dir).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().into_string().unwrap();
            let key = Self::key_from_hex(&name);
            if key.as_slice() >= lo && key.as_slice() < hi {
                out.insert(key, fs::read(entry.path()).unwrap());
            }
        }
        Ok(out.into_iter().collect())
    }

    fn apply_batch(&self, batch: Batch) -> efs::error::Result<()> {
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => fs::write(self.path_for(&k), v).unwrap(),
                BatchOp::Delete(k) => {
                    let _ = fs::remove_file(self.path_for(&k));
                }
            }
        }
        Ok(())
    }
}

#[test]
fn file_backed_kv_store_persists_across_remount() {
    init();
    let tmp = tempfile::tempdir().unwrap();
    let aead: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([3; 32])));

    {
        let kv = DirKv::open(tmp.path().to_path_buf());
        let efs = Efs::mount(kv, aead.clone(), MountOptions::default()).unwrap();
        efs.mkdir(b"/persisted", 0o755).unwrap();
        efs.write_file(b"/persisted/data", b"durable bytes").unwrap();
    }

    // Fresh `DirKv` over the same directory, fresh `Efs`: the store was
    // already formatted, so `mount` must recognize it rather than
    // reformatting over the existing root.
    let kv2 = DirKv::open(tmp.path().to_path_buf());
    let efs2 = Efs::mount(kv2, aead, MountOptions::default()).unwrap();
    assert_eq!(efs2.read_file(b"/persisted/data").unwrap(), b"durable bytes");
}

#[test]
fn file_backed_kv_store_wrong_key_is_key_mismatch() {
    init();
    let tmp = tempfile::tempdir().unwrap();
    let aead_a: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([1; 32])));
    let aead_b: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([2; 32])));

    {
        let kv = DirKv::open(tmp.path().to_path_buf());
        let efs = Efs::mount(kv, aead_a, MountOptions::default()).unwrap();
        efs.write_file(b"/f", b"x").unwrap();
    }

    let kv2 = DirKv::open(tmp.path().to_path_buf());
    let err = Efs::mount(kv2, aead_b, MountOptions::default()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::KeyMismatch);
}
