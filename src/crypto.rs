use crate::error::{Error, Result};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chacha20poly1305::ChaCha20Poly1305;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Authenticated cipher for raw operation bodies in the archive
/// collection. Main/searchable collections never see this path — they
/// only ever store redacted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveCipher {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl ArchiveCipher {
    pub fn from_config(name: &str) -> Result<Self> {
        match name {
            "aes-256-gcm" => Ok(ArchiveCipher::Aes256Gcm),
            "chacha20-poly1305" => Ok(ArchiveCipher::ChaCha20Poly1305),
            other => Err(Error::invalid_argument(format!(
                "unknown archive_encryption {other:?} (expected aes-256-gcm or chacha20-poly1305)"
            ))),
        }
    }
}

pub struct ArchiveCrypter {
    cipher: ArchiveCipher,
    key: [u8; 32],
}

impl ArchiveCrypter {
    /// Per-owner crypter: the owner key is derived from the process master
    /// key and the owner id, so archives of different owners never share
    /// key material.
    pub fn for_owner(cipher_name: &str, owner: &str) -> Result<Self> {
        let cipher = ArchiveCipher::from_config(cipher_name)?;
        let master = load_or_create_master_key(&crate::paths::data_dir().join("archive.key"))?;
        Ok(Self::with_key(cipher, derive_owner_key(&master, owner)))
    }

    pub fn with_key(cipher: ArchiveCipher, key: [u8; 32]) -> Self {
        Self { cipher, key }
    }

    /// Encrypt. Wire form: base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let sealed = match self.cipher {
            ArchiveCipher::Aes256Gcm => {
                let cipher = Aes256Gcm::new((&self.key).into());
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let ct = cipher
                    .encrypt(&nonce, plaintext)
                    .map_err(|e| Error::internal(format!("archive encrypt: {e}")))?;
                [nonce.as_slice(), &ct].concat()
            }
            ArchiveCipher::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new((&self.key).into());
                let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
                let ct = cipher
                    .encrypt(&nonce, plaintext)
                    .map_err(|e| Error::internal(format!("archive encrypt: {e}")))?;
                [nonce.as_slice(), &ct].concat()
            }
        };
        Ok(B64.encode(sealed))
    }

    /// Decrypt the wire form. Authentication failure (wrong owner, wrong
    /// key, tampering) is an internal error, never a partial plaintext.
    #[allow(dead_code)]
    pub fn open(&self, encoded: &str) -> Result<Vec<u8>> {
        let raw = B64
            .decode(encoded)
            .map_err(|e| Error::internal(format!("archive decode: {e}")))?;
        if raw.len() < 12 {
            return Err(Error::internal("archive payload too short"));
        }
        let (nonce, ct) = raw.split_at(12);
        match self.cipher {
            ArchiveCipher::Aes256Gcm => {
                let cipher = Aes256Gcm::new((&self.key).into());
                cipher
                    .decrypt(aes_gcm::Nonce::from_slice(nonce), ct)
                    .map_err(|e| Error::internal(format!("archive decrypt: {e}")))
            }
            ArchiveCipher::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new((&self.key).into());
                cipher
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ct)
                    .map_err(|e| Error::internal(format!("archive decrypt: {e}")))
            }
        }
    }
}

fn derive_owner_key(master: &[u8; 32], owner: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master);
    hasher.update(owner.as_bytes());
    hasher.finalize().into()
}

fn load_or_create_master_key(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let raw = std::fs::read(path)
            .map_err(|e| Error::internal(format!("read master key: {e}")))?;
        let key: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::internal("master key file is not 32 bytes"))?;
        return Ok(key);
    }
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::internal(format!("create data dir: {e}")))?;
    }
    std::fs::write(path, key).map_err(|e| Error::internal(format!("write master key: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_aes() {
        let c = ArchiveCrypter::with_key(ArchiveCipher::Aes256Gcm, [7u8; 32]);
        let sealed = c.seal(b"operation log body").unwrap();
        assert_eq!(c.open(&sealed).unwrap(), b"operation log body");
    }

    #[test]
    fn test_roundtrip_chacha() {
        let c = ArchiveCrypter::with_key(ArchiveCipher::ChaCha20Poly1305, [9u8; 32]);
        let sealed = c.seal(b"raw body").unwrap();
        assert_eq!(c.open(&sealed).unwrap(), b"raw body");
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let a = ArchiveCrypter::with_key(ArchiveCipher::Aes256Gcm, [1u8; 32]);
        let b = ArchiveCrypter::with_key(ArchiveCipher::Aes256Gcm, [2u8; 32]);
        let sealed = a.seal(b"secret log").unwrap();
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn test_tampering_detected() {
        let c = ArchiveCrypter::with_key(ArchiveCipher::Aes256Gcm, [3u8; 32]);
        let sealed = c.seal(b"payload").unwrap();
        let mut raw = B64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(c.open(&B64.encode(raw)).is_err());
    }

    #[test]
    fn test_owner_keys_differ() {
        let master = [5u8; 32];
        assert_ne!(
            derive_owner_key(&master, "owner-a"),
            derive_owner_key(&master, "owner-b")
        );
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        assert!(ArchiveCipher::from_config("rot13").is_err());
    }
}
