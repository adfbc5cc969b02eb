//! Object encryption and the secret-provider seam.
//!
//! Objects are sealed with AES-256-GCM before erasure coding. The wire shape
//! is `nonce || ciphertext+tag` with a fresh 96-bit nonce per object, so the
//! read path can strip the nonce without any side channel.
//!
//! Key material never reaches the catalog: metadata stores only an opaque
//! `key_ref` minted by a [`KeyProvider`]. The shipped provider derives
//! per-object keys from a process master key with HKDF-SHA256; a real
//! KMS/Vault client plugs in behind the same trait.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::common::{Error, Result};

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of a GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Ciphertext length for a given plaintext length
pub const fn sealed_len(plaintext_len: usize) -> usize {
    plaintext_len + NONCE_SIZE + TAG_SIZE
}

/// SHA-256 of `data`, hex-encoded
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Encrypt `plaintext`, producing `nonce || ciphertext+tag`
pub fn seal(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::KeyProvider(format!("invalid key: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Internal(format!("encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext+tag`. An authentication-tag mismatch is
/// surfaced as [`Error::IntegrityFailure`].
pub fn open(data: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::IntegrityFailure(format!(
            "ciphertext too short: {} bytes",
            data.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::KeyProvider(format!("invalid key: {}", e)))?;

    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|_| Error::IntegrityFailure("AES-GCM authentication tag mismatch".into()))
}

/// The secret-provider contract.
///
/// `generate_key` is called once per object on the write path; `unwrap_key`
/// on every read. Only the returned `key_ref` may be persisted.
pub trait KeyProvider: Send + Sync {
    /// Mint a fresh object key for `scope`, returning an opaque reference
    /// plus the key material.
    fn generate_key(&self, scope: &str) -> Result<(String, [u8; KEY_SIZE])>;

    /// Recover key material from a reference previously minted by
    /// `generate_key`.
    fn unwrap_key(&self, key_ref: &str) -> Result<[u8; KEY_SIZE]>;
}

const KEY_REF_PREFIX: &str = "hkdf-v1";
const SALT_SIZE: usize = 16;

/// Key provider deriving per-object keys from a master key via HKDF-SHA256.
///
/// `key_ref` format: `hkdf-v1:<hex salt>:<scope>`. The salt is random per
/// object so identical scopes never share a key.
pub struct DerivedKeyProvider {
    master_key: Vec<u8>,
}

impl DerivedKeyProvider {
    /// Build from a base64-encoded master key of at least 32 bytes.
    pub fn new(master_key_b64: &str) -> Result<Self> {
        let master_key = BASE64
            .decode(master_key_b64)
            .map_err(|e| Error::KeyProvider(format!("invalid base64 master key: {}", e)))?;

        if master_key.len() < KEY_SIZE {
            return Err(Error::KeyProvider(format!(
                "master key too short: {} bytes, minimum {}",
                master_key.len(),
                KEY_SIZE
            )));
        }

        Ok(Self { master_key })
    }

    /// Generate a random master key (for initial setup)
    pub fn generate_master_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    fn derive(&self, salt: &[u8], scope: &str) -> Result<[u8; KEY_SIZE]> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &self.master_key);
        let mut okm = [0u8; KEY_SIZE];
        hkdf.expand(scope.as_bytes(), &mut okm)
            .map_err(|e| Error::KeyProvider(format!("key derivation failed: {}", e)))?;
        Ok(okm)
    }
}

impl KeyProvider for DerivedKeyProvider {
    fn generate_key(&self, scope: &str) -> Result<(String, [u8; KEY_SIZE])> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let key = self.derive(&salt, scope)?;
        let key_ref = format!("{}:{}:{}", KEY_REF_PREFIX, hex::encode(salt), scope);
        Ok((key_ref, key))
    }

    fn unwrap_key(&self, key_ref: &str) -> Result<[u8; KEY_SIZE]> {
        let mut parts = key_ref.splitn(3, ':');
        let prefix = parts.next().unwrap_or_default();
        let salt_hex = parts.next().unwrap_or_default();
        let scope = parts.next().unwrap_or_default();

        if prefix != KEY_REF_PREFIX || scope.is_empty() {
            return Err(Error::KeyProvider(format!(
                "unrecognized key reference: {}",
                key_ref
            )));
        }

        let salt = hex::decode(salt_hex)
            .map_err(|e| Error::KeyProvider(format!("invalid key reference salt: {}", e)))?;

        self.derive(&salt, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> DerivedKeyProvider {
        DerivedKeyProvider::new(&DerivedKeyProvider::generate_master_key()).unwrap()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (_, key) = provider().generate_key("b1/hello.txt").unwrap();

        let plaintext = b"hello world";
        let sealed = seal(plaintext, &key).unwrap();

        assert_eq!(sealed.len(), sealed_len(plaintext.len()));
        assert_eq!(open(&sealed, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_tamper_detected() {
        let (_, key) = provider().generate_key("b1/hello.txt").unwrap();

        let mut sealed = seal(b"hello world", &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            open(&sealed, &key),
            Err(Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let (_, key) = provider().generate_key("b1/x").unwrap();
        assert!(matches!(
            open(&[0u8; 8], &key),
            Err(Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_key_ref_roundtrip() {
        let p = provider();
        let (key_ref, key) = p.generate_key("b1/path/with:colons").unwrap();

        let unwrapped = p.unwrap_key(&key_ref).unwrap();
        assert_eq!(key, unwrapped);
    }

    #[test]
    fn test_key_refs_are_unique_per_object() {
        let p = provider();
        let (ref1, key1) = p.generate_key("b1/same").unwrap();
        let (ref2, key2) = p.generate_key("b1/same").unwrap();

        assert_ne!(ref1, ref2);
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_unknown_key_ref_rejected() {
        let p = provider();
        assert!(p.unwrap_key("vault-v2:abcd:b1/x").is_err());
        assert!(p.unwrap_key("garbage").is_err());
    }

    #[test]
    fn test_master_key_too_short() {
        let short = BASE64.encode(b"too short");
        assert!(DerivedKeyProvider::new(&short).is_err());
    }

    #[test]
    fn test_nonces_differ_across_seals() {
        let (_, key) = provider().generate_key("b1/x").unwrap();
        let a = seal(b"same plaintext", &key).unwrap();
        let b = seal(b"same plaintext", &key).unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }
}
