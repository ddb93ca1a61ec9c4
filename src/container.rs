//! Authenticated-encryption container format
//!
//! The container is the only form in which a compiled module is allowed to
//! persist. Wire layout (stable across versions):
//!
//! ```text
//! [version: 1 byte]
//! [key-id: 16 bytes]
//! [nonce: 12 bytes]
//! [ciphertext length: 4 bytes, big-endian]
//! [ciphertext + tag: variable]
//! ```
//!
//! AES-256-GCM with a fresh random nonce per encryption. Decryption fails
//! closed: a bad tag, an unknown version, and a malformed buffer all
//! collapse to the same opaque [`SealError::Decryption`] so the error kind
//! leaks nothing about why a container was rejected.

use crate::keys::{KeyId, KeyMaterial, KEY_ID_SIZE};
use crate::{SealError, SealResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use byteorder::{BigEndian, ByteOrder};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use zeroize::Zeroizing;

// ============================================================================
// Constants
// ============================================================================

/// Current container format version
pub const FORMAT_VERSION: u8 = 1;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Fixed header size: version + key-id + nonce + ciphertext length
pub const HEADER_SIZE: usize = 1 + KEY_ID_SIZE + NONCE_SIZE + 4;

// ============================================================================
// Container
// ============================================================================

/// A persisted encrypted module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContainer {
    version: u8,
    key_id: KeyId,
    nonce: [u8; NONCE_SIZE],
    /// Ciphertext with the authentication tag appended
    ciphertext: Vec<u8>,
}

impl EncryptionContainer {
    /// Identifier of the key this container was encrypted with
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Nonce used for this container
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Ciphertext (including tag) length in bytes
    pub fn ciphertext_len(&self) -> usize {
        self.ciphertext.len()
    }

    /// Content digest used by the loader to recognize repeated loads of the
    /// same container
    pub fn fingerprint(&self) -> [u8; 32] {
        *blake3::hash(&self.to_bytes()).as_bytes()
    }

    /// Serialize to the wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        bytes.push(self.version);
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(&self.nonce);
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, self.ciphertext.len() as u32);
        bytes.extend_from_slice(&len);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse the wire layout.
    ///
    /// Truncation, trailing garbage, an impossible length field, and an
    /// unknown version byte are all [`SealError::Decryption`].
    pub fn from_bytes(bytes: &[u8]) -> SealResult<Self> {
        if bytes.len() < HEADER_SIZE + TAG_SIZE {
            return Err(SealError::Decryption);
        }

        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(SealError::Decryption);
        }

        let mut key_id = [0u8; KEY_ID_SIZE];
        key_id.copy_from_slice(&bytes[1..1 + KEY_ID_SIZE]);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[1 + KEY_ID_SIZE..1 + KEY_ID_SIZE + NONCE_SIZE]);

        let len = BigEndian::read_u32(&bytes[1 + KEY_ID_SIZE + NONCE_SIZE..HEADER_SIZE]) as usize;
        if len < TAG_SIZE || bytes.len() != HEADER_SIZE + len {
            return Err(SealError::Decryption);
        }

        Ok(Self {
            version,
            key_id: KeyId::from_bytes(key_id),
            nonce,
            ciphertext: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    /// Write the container to a file
    pub fn write_file(&self, path: &Path) -> SealResult<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Read a container from a file
    pub fn read_file(path: &Path) -> SealResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

// ============================================================================
// Encrypt / Decrypt
// ============================================================================

/// Encrypt a compiled artifact's bytes into a container.
///
/// A fresh nonce is drawn from the OS randomness source on every call, so
/// encrypting the same bytes twice under the same key yields two distinct
/// containers.
pub fn encrypt(plaintext: &[u8], key: &KeyMaterial) -> SealResult<EncryptionContainer> {
    let cipher = Aes256Gcm::new_from_slice(key.bytes())
        .map_err(|e| SealError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| SealError::Encryption(e.to_string()))?;

    Ok(EncryptionContainer {
        version: FORMAT_VERSION,
        key_id: key.id(),
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a container back into the original artifact bytes.
///
/// Returns a zeroize-on-drop buffer; the plaintext never outlives its use
/// silently. Fails closed with the opaque [`SealError::Decryption`] on any
/// verification failure; no partial plaintext is ever returned.
pub fn decrypt(container: &EncryptionContainer, key: &KeyMaterial) -> SealResult<Zeroizing<Vec<u8>>> {
    if container.version != FORMAT_VERSION || container.key_id != key.id() {
        return Err(SealError::Decryption);
    }

    let cipher = Aes256Gcm::new_from_slice(key.bytes()).map_err(|_| SealError::Decryption)?;
    let nonce = Nonce::from_slice(&container.nonce);

    let plaintext = cipher
        .decrypt(nonce, container.ciphertext.as_slice())
        .map_err(|_| SealError::Decryption)?;

    Ok(Zeroizing::new(plaintext))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyId;

    fn test_key(label: &str) -> KeyMaterial {
        KeyMaterial::generate(KeyId::from_label(label))
    }

    #[test]
    fn test_roundtrip() {
        let key = test_key("k1");
        let plaintext = b"native module bytes \x7fELF...";

        let container = encrypt(plaintext, &key).unwrap();
        assert_eq!(container.key_id(), key.id());
        assert_eq!(container.nonce().len(), NONCE_SIZE);

        let decrypted = decrypt(&container, &key).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn test_serialization_roundtrip_byte_exact() {
        let key = test_key("k1");
        let container = encrypt(b"payload", &key).unwrap();

        let bytes = container.to_bytes();
        let parsed = EncryptionContainer::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, container);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = test_key("k1");
        let container = encrypt(b"secret", &key1).unwrap();

        // Different key under the same identifier: tag verification fails.
        let key2 = KeyMaterial::generate(key1.id());
        assert!(matches!(
            decrypt(&container, &key2),
            Err(SealError::Decryption)
        ));
    }

    #[test]
    fn test_key_id_mismatch_fails() {
        let key1 = test_key("k1");
        let container = encrypt(b"secret", &key1).unwrap();

        let key2 = test_key("k2");
        assert!(matches!(
            decrypt(&container, &key2),
            Err(SealError::Decryption)
        ));
    }

    #[test]
    fn test_single_bit_flips_are_rejected() {
        let key = test_key("k1");
        let container = encrypt(b"tamper detection payload", &key).unwrap();
        let bytes = container.to_bytes();

        // Flip one bit at a time through the ciphertext and tag region.
        for offset in HEADER_SIZE..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[offset] ^= 0x01;
            let parsed = EncryptionContainer::from_bytes(&tampered).unwrap();
            assert!(
                matches!(decrypt(&parsed, &key), Err(SealError::Decryption)),
                "flip at offset {} was not rejected",
                offset
            );
        }
    }

    #[test]
    fn test_nonce_tampering_rejected() {
        let key = test_key("k1");
        let container = encrypt(b"payload", &key).unwrap();
        let mut bytes = container.to_bytes();
        bytes[1 + KEY_ID_SIZE] ^= 0x80;
        let parsed = EncryptionContainer::from_bytes(&bytes).unwrap();
        assert!(matches!(decrypt(&parsed, &key), Err(SealError::Decryption)));
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = test_key("k1");
        let first = encrypt(b"same input", &key).unwrap();
        let second = encrypt(b"same input", &key).unwrap();

        assert_ne!(first.nonce(), second.nonce());
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let key = test_key("k1");
        let mut bytes = encrypt(b"payload", &key).unwrap().to_bytes();
        bytes[0] = 9;
        assert!(matches!(
            EncryptionContainer::from_bytes(&bytes),
            Err(SealError::Decryption)
        ));
    }

    #[test]
    fn test_truncated_container_rejected() {
        let key = test_key("k1");
        let bytes = encrypt(b"payload", &key).unwrap().to_bytes();

        for len in [0, 1, HEADER_SIZE, HEADER_SIZE + TAG_SIZE - 1, bytes.len() - 1] {
            assert!(
                matches!(
                    EncryptionContainer::from_bytes(&bytes[..len]),
                    Err(SealError::Decryption)
                ),
                "truncation to {} bytes was not rejected",
                len
            );
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let key = test_key("k1");
        let mut bytes = encrypt(b"payload", &key).unwrap().to_bytes();
        bytes.push(0);
        assert!(matches!(
            EncryptionContainer::from_bytes(&bytes),
            Err(SealError::Decryption)
        ));
    }

    #[test]
    fn test_fingerprint_distinguishes_containers() {
        let key = test_key("k1");
        let first = encrypt(b"payload", &key).unwrap();
        let second = encrypt(b"payload", &key).unwrap();

        assert_eq!(first.fingerprint(), first.fingerprint());
        // Fresh nonce per call means a fresh fingerprint per call.
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.sealed");

        let key = test_key("k1");
        let container = encrypt(b"payload", &key).unwrap();
        container.write_file(&path).unwrap();

        let loaded = EncryptionContainer::read_file(&path).unwrap();
        assert_eq!(loaded, container);
    }
}
