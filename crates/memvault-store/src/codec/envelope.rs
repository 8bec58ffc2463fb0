//! Byte-level wrappers applied around encoded payloads: gzip compression and
//! passphrase-based AES-256-GCM encryption.
//!
//! Sealing order is compress, then encrypt. Opening reverses it: decrypt,
//! then decompress.
//!
//! Encrypted layout: `MVENC1` magic, 16-byte Argon2 salt, 12-byte GCM nonce,
//! ciphertext (with tag).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::transfer::EncryptionOptions;
use rand::RngCore;
use std::io::{Read, Write};
use zeroize::Zeroizing;

const ENCRYPTED_MAGIC: &[u8] = b"MVENC1";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Gzip-compress bytes.
pub fn gzip(bytes: &[u8]) -> MemoryResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress gzip bytes.
pub fn gunzip(bytes: &[u8]) -> MemoryResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| MemoryError::Format(format!("gzip decode failed: {e}")))?;
    Ok(out)
}

/// Whether the bytes start with the gzip magic number.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Whether the bytes carry the encrypted-payload header.
pub fn is_encrypted(bytes: &[u8]) -> bool {
    bytes.starts_with(ENCRYPTED_MAGIC)
}

/// Derive a 256-bit key from a passphrase and salt with Argon2id.
fn derive_key(passphrase: &str, salt: &[u8]) -> MemoryResult<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| MemoryError::Internal(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Encrypt bytes under a passphrase.
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> MemoryResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| MemoryError::Internal(format!("invalid key length: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| MemoryError::Internal("encryption failed".into()))?;

    let mut out =
        Vec::with_capacity(ENCRYPTED_MAGIC.len() + SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ENCRYPTED_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt bytes produced by [`encrypt`].
pub fn decrypt(sealed: &[u8], passphrase: &str) -> MemoryResult<Vec<u8>> {
    let header = ENCRYPTED_MAGIC.len() + SALT_LEN + NONCE_LEN;
    if !is_encrypted(sealed) || sealed.len() < header {
        return Err(MemoryError::Format("payload is not encrypted".into()));
    }
    let salt = &sealed[ENCRYPTED_MAGIC.len()..ENCRYPTED_MAGIC.len() + SALT_LEN];
    let nonce = &sealed[ENCRYPTED_MAGIC.len() + SALT_LEN..header];

    let key = derive_key(passphrase, salt)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| MemoryError::Internal(format!("invalid key length: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), &sealed[header..])
        .map_err(|_| MemoryError::Format("decryption failed (wrong key or corrupted payload)".into()))
}

/// Resolve the passphrase of an encryption option, if encryption is on.
pub fn passphrase(encryption: Option<&EncryptionOptions>) -> MemoryResult<Option<&str>> {
    match encryption {
        Some(enc) if enc.enabled => match enc.key.as_deref() {
            Some(key) if !key.is_empty() => Ok(Some(key)),
            _ => Err(MemoryError::Validation(
                "encryption is enabled but no key was supplied".into(),
            )),
        },
        _ => Ok(None),
    }
}

/// Wrap encoded bytes: optional gzip, then optional encryption.
pub fn seal(encoded: Vec<u8>, compress: bool, passphrase: Option<&str>) -> MemoryResult<Vec<u8>> {
    let bytes = if compress { gzip(&encoded)? } else { encoded };
    match passphrase {
        Some(key) => encrypt(&bytes, key),
        None => Ok(bytes),
    }
}

/// Unwrap a payload: decrypt when encrypted, then gunzip when compressed.
///
/// Both layers are detected from their headers, so a caller only needs to
/// supply the passphrase.
pub fn open(raw: Vec<u8>, passphrase: Option<&str>) -> MemoryResult<Vec<u8>> {
    let bytes = if is_encrypted(&raw) {
        let key = passphrase.ok_or_else(|| {
            MemoryError::Format("payload is encrypted but no key was supplied".into())
        })?;
        decrypt(&raw, key)?
    } else {
        raw
    };
    if is_gzip(&bytes) {
        gunzip(&bytes)
    } else {
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"hello hello hello hello hello".repeat(20);
        let packed = gzip(&data).unwrap();
        assert!(is_gzip(&packed));
        assert!(packed.len() < data.len());
        assert_eq!(gunzip(&packed).unwrap(), data);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let err = gunzip(&[0x1f, 0x8b, 0, 1, 2]).unwrap_err();
        assert!(matches!(err, MemoryError::Format(_)));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let sealed = encrypt(b"secret payload", "pass").unwrap();
        assert!(is_encrypted(&sealed));
        assert_eq!(decrypt(&sealed, "pass").unwrap(), b"secret payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(b"secret payload", "pass").unwrap();
        let err = decrypt(&sealed, "other").unwrap_err();
        assert!(matches!(err, MemoryError::Format(_)));
    }

    #[test]
    fn test_seal_open_order() {
        let body = b"[{\"key\":\"a\"}]".repeat(10);
        let sealed = seal(body.clone(), true, Some("k")).unwrap();
        assert!(is_encrypted(&sealed));
        assert_eq!(open(sealed, Some("k")).unwrap(), body);
    }

    #[test]
    fn test_open_encrypted_without_key() {
        let sealed = seal(b"x".to_vec(), false, Some("k")).unwrap();
        assert!(matches!(open(sealed, None), Err(MemoryError::Format(_))));
    }

    #[test]
    fn test_passphrase_requires_key() {
        let enc = EncryptionOptions {
            enabled: true,
            key: None,
        };
        assert!(passphrase(Some(&enc)).unwrap_err().is_validation());
        let off = EncryptionOptions::default();
        assert_eq!(passphrase(Some(&off)).unwrap(), None);
        assert_eq!(passphrase(None).unwrap(), None);
    }
}
