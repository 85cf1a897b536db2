//! KV adapter (C2, `spec.md` §4.2 / §6.2 / §6.4).
//!
//! Defines the ordered-KV boundary the core consumes but does not itself
//! implement (`spec.md` §1), the way `songzhi-ext2-rs` decouples its
//! filesystem logic from a concrete block device through the `genfs`
//! trait crate. [`MemKv`] is the reference backend used by tests and
//! simple embeddings; production callers plug in their own ordered store
//! behind [`KvStore`].
//!
//! [`EncryptedStore`] wraps any [`KvStore`] with the crypto layer (C1) so
//! that every value round-trips through AEAD transparently, per §4.2.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::Aead;
use crate::error::{Error, ErrorKind, Result};

const SEP: u8 = 0x00;

/// A byte-string key, built from a domain (key-prefix namespace) and a
/// local key, separated by the reserved byte `0x00` (`spec.md` §6.4).
pub fn domain_key(domain: &[&[u8]], local: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in domain {
        out.extend_from_slice(part);
        out.push(SEP);
    }
    out.extend_from_slice(local);
    out
}

/// A single mutation queued into a [`Batch`].
#[derive(Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An atomic group of KV mutations. A reader observes either all of a
/// committed batch or none of it (`spec.md` §4.2).
#[derive(Clone, Default)]
pub struct Batch {
    pub ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The ordered KV contract required of the backing store (`spec.md`
/// §6.2): byte-lexicographic ordering, atomic multi-key batches, a range
/// iterator, and single-writer-or-equivalent semantics. The core never
/// issues concurrent writes to the same key outside its own locks (C10).
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ordered, inclusive-lo/exclusive-hi range scan.
    fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn apply_batch(&self, batch: Batch) -> Result<()>;

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let mut batch = Batch::new();
        batch.put(key, value);
        self.apply_batch(batch)
    }

    fn delete(&self, key: Vec<u8>) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.apply_batch(batch)
    }
}

/// Reference in-memory implementation of [`KvStore`], backed by a
/// `BTreeMap` for byte-lexicographic order. Good enough for tests and
/// for embedding this crate without an external KV engine; not durable
/// across process restarts, which is consistent with the spec treating
/// durability as the KV engine's concern, not the core's.
#[derive(Default)]
pub struct MemKv {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl KvStore for MemKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.lock();
        Ok(map
            .range(lo.to_vec()..hi.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply_batch(&self, batch: Batch) -> Result<()> {
        let mut map = self.map.lock();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        (**self).range(lo, hi)
    }

    fn apply_batch(&self, batch: Batch) -> Result<()> {
        (**self).apply_batch(batch)
    }
}

/// Whether a value round-trips through C1 or is stored as raw bytes.
/// Only the counter record is ever stored raw, and the spec recommends
/// encrypting it too "for uniformity" — so [`EncryptedStore`] always
/// encrypts; `Encoding::Raw` is kept only so a caller migrating an
/// existing plaintext counter can read it once during upgrade.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Encrypted,
    Raw,
}

/// Wraps a [`KvStore`] so every value passes through an [`Aead`] before
/// it touches the backing store, and every read is authenticated before
/// it reaches the caller (`spec.md` §4.2).
pub struct EncryptedStore<K: KvStore> {
    kv: K,
    aead: Arc<dyn Aead>,
}

impl<K: KvStore> EncryptedStore<K> {
    pub fn new(kv: K, aead: Arc<dyn Aead>) -> Self {
        Self { kv, aead }
    }

    pub fn get(&self, key: &[u8], encoding: Encoding) -> Result<Option<Vec<u8>>> {
        let Some(raw) = self.kv.get(key)? else {
            return Ok(None);
        };
        match encoding {
            Encoding::Raw => Ok(Some(raw)),
            Encoding::Encrypted => Ok(Some(self.aead.decrypt(&raw)?)),
        }
    }

    /// Like [`Self::get`], but a decryption failure on this specific key
    /// is reported as [`ErrorKind::KeyMismatch`] instead of
    /// [`ErrorKind::Corruption`] — used only at mount time, per
    /// `spec.md` §4.1 ("a mismatched key at mount surfaces as the first
    /// failed authentication on any record").
    pub fn get_at_mount(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(raw) = self.kv.get(key)? else {
            return Ok(None);
        };
        match self.aead.decrypt(&raw) {
            Ok(plain) => Ok(Some(plain)),
            Err(_) => {
                log::error!("kv: first authenticated read at mount failed, reporting key mismatch");
                Err(Error::new(ErrorKind::KeyMismatch))
            }
        }
    }

    pub fn range_decrypt(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.kv
            .range(lo, hi)?
            .into_iter()
            .map(|(k, v)| Ok((k, self.aead.decrypt(&v)?)))
            .collect()
    }

    pub fn put_encrypted(&self, batch: &mut Batch, key: Vec<u8>, plaintext: &[u8]) {
        batch.put(key, self.aead.encrypt(plaintext));
    }

    pub fn apply_batch(&self, batch: Batch) -> Result<()> {
        let len = batch.ops.len();
        self.kv.apply_batch(batch).map_err(|e| {
            log::error!("kv: batch of {} op(s) failed to commit: {}", len, e);
            e
        })
    }

    pub fn inner(&self) -> &K {
        &self.kv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Aes256GcmAead, KeyMaterial};

    fn store() -> EncryptedStore<Arc<MemKv>> {
        let kv = MemKv::new();
        let aead: Arc<dyn Aead> = Arc::new(Aes256GcmAead::new(&KeyMaterial::from_bytes([1; 32])));
        EncryptedStore::new(kv, aead)
    }

    #[test]
    fn round_trips_through_encryption() {
        let s = store();
        let mut batch = Batch::new();
        s.put_encrypted(&mut batch, b"k".to_vec(), b"value");
        s.apply_batch(batch).unwrap();
        assert_eq!(
            s.get(b"k", Encoding::Encrypted).unwrap().unwrap(),
            b"value"
        );
    }

    #[test]
    fn domain_key_uses_separator() {
        let k1 = domain_key(&[b"inode", b"1"], b"meta");
        let k2 = domain_key(&[b"inode", b"11"], b"meta");
        assert_ne!(k1, k2);
    }
}
