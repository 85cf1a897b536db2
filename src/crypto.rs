//! Crypto layer (C1, `spec.md` §4.1 / §6.3).
//!
//! AEAD with a 32-byte key, fresh random IV per record, authentication
//! tag appended. `encrypt` produces `iv || ciphertext || tag`; `decrypt`
//! fails with [`ErrorKind::Corruption`] if the tag check fails or the
//! blob is shorter than `iv_len + tag_len`. The layer is stateless apart
//! from the key, so it is safe to call from any thread without external
//! synchronization, matching the "safe to call from any task" note in
//! the spec.

use aes_gcm::aead::{Aead as _, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{Error, ErrorKind, Result};
use crate::param::KEY_LEN;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// The 32-byte root key, already in the accepted form per `spec.md` §4.1.
#[derive(Clone)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Convenience constructor for callers that only have a passphrase.
    /// Not part of the core contract (§4.1 requires the key already be
    /// 32 bytes); this exists purely so embedders don't hand-roll a weak
    /// KDF of their own.
    pub fn derive(passphrase: &[u8]) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut key = [0u8; KEY_LEN];
        let mut seed = passphrase.to_vec();
        for chunk in key.chunks_mut(8) {
            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            let digest = hasher.finish().to_le_bytes();
            chunk.copy_from_slice(&digest[..chunk.len()]);
            seed = digest.to_vec();
        }
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// AEAD contract required of the crypto layer (`spec.md` §6.3).
pub trait Aead: Send + Sync {
    /// Encrypts `plaintext`, returning `iv || ciphertext || tag`.
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;

    /// Decrypts a blob produced by `encrypt`. Fails with
    /// [`ErrorKind::Corruption`] on a tag mismatch or a too-short blob.
    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM implementation of [`Aead`], the concrete primitive this
/// crate ships (the KV engine is an external collaborator; this is not).
pub struct Aes256GcmAead {
    cipher: Aes256Gcm,
}

impl Aes256GcmAead {
    pub fn new(key: &KeyMaterial) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl Aead for Aes256GcmAead {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // A fresh random nonce means this cannot fail in practice; the
        // crate's `aead::Error` carries no detail worth propagating.
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("AES-256-GCM encryption with a fresh nonce cannot fail");

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            log::warn!("aead: decrypt failed, blob too short ({} bytes)", blob.len());
            return Err(Error::new(ErrorKind::Corruption));
        }
        let (nonce_bytes, rest) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher.decrypt(nonce, rest).map_err(|_| {
            log::warn!("aead: authentication tag check failed, record is corrupt or the key is wrong");
            Error::new(ErrorKind::Corruption)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aead() -> Aes256GcmAead {
        Aes256GcmAead::new(&KeyMaterial::from_bytes([7u8; KEY_LEN]))
    }

    #[test]
    fn round_trips() {
        let a = aead();
        let blob = a.encrypt(b"hello world");
        assert_eq!(a.decrypt(&blob).unwrap(), b"hello world");
    }

    #[test]
    fn fresh_iv_each_call() {
        let a = aead();
        let b1 = a.encrypt(b"same plaintext");
        let b2 = a.encrypt(b"same plaintext");
        assert_ne!(b1, b2);
    }

    #[test]
    fn flipped_bit_is_corruption() {
        let a = aead();
        let mut blob = a.encrypt(b"tamper me");
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let err = a.decrypt(&blob).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corruption);
    }

    #[test]
    fn wrong_key_is_corruption() {
        let a = aead();
        let blob = a.encrypt(b"secret");
        let b = Aes256GcmAead::new(&KeyMaterial::from_bytes([9u8; KEY_LEN]));
        assert!(b.decrypt(&blob).is_err());
    }

    #[test]
    fn short_blob_is_corruption() {
        let a = aead();
        assert!(a.decrypt(&[0u8; 4]).is_err());
    }
}
