//! Image bytes at rest.
//!
//! An encrypted image blob is laid out as
//!
//! ```text
//! [format: 1 byte = 0x01][nonce: 12 bytes][AES-256-GCM ciphertext + 16-byte tag]
//! ```
//!
//! The image reference is authenticated alongside the ciphertext, so a blob
//! copied under another image's key does not open.

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;

use crate::models::image::ImageRef;

const BLOB_FORMAT_V1: u8 = 0x01;
const NONCE_BYTES: usize = 12;
const TAG_BYTES: usize = 16;
const HEADER_BYTES: usize = 1 + NONCE_BYTES;

/// Seals uploads before they reach the blob store and opens them for workers.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// `key` is the base64 form of a 256-bit key, as found in `ENCRYPTION_KEY`.
    pub fn new(key: &str) -> Result<Self, EncryptionError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(key.trim())
            .map_err(|_| EncryptionError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&raw).map_err(|_| EncryptionError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, image_ref: &ImageRef, image: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let payload = Payload {
            msg: image,
            aad: image_ref.as_str().as_bytes(),
        };
        let ciphertext = self
            .cipher
            .encrypt(&nonce, payload)
            .map_err(|_| EncryptionError::Seal)?;

        let mut blob = Vec::with_capacity(HEADER_BYTES + ciphertext.len());
        blob.push(BLOB_FORMAT_V1);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, image_ref: &ImageRef, blob: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let (&format, rest) = blob.split_first().ok_or(EncryptionError::Truncated)?;
        if format != BLOB_FORMAT_V1 {
            return Err(EncryptionError::UnknownFormat(format));
        }
        if rest.len() < NONCE_BYTES + TAG_BYTES {
            return Err(EncryptionError::Truncated);
        }

        let (nonce, ciphertext) = rest.split_at(NONCE_BYTES);
        let payload = Payload {
            msg: ciphertext,
            aad: image_ref.as_str().as_bytes(),
        };
        self.cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| EncryptionError::Tampered)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("ENCRYPTION_KEY must be 32 bytes, base64-encoded")]
    InvalidKey,

    #[error("could not encrypt image")]
    Seal,

    #[error("encrypted image blob is truncated")]
    Truncated,

    #[error("unknown encrypted blob format {0:#04x}")]
    UnknownFormat(u8),

    #[error("encrypted image failed authentication")]
    Tampered,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        EncryptionService::new(&key).unwrap()
    }

    #[test]
    fn blob_carries_format_byte_and_fresh_nonce() {
        let service = service();
        let image_ref = ImageRef::from("leaf-1");
        let first = service.seal(&image_ref, b"aphid on leaf").unwrap();
        let second = service.seal(&image_ref, b"aphid on leaf").unwrap();

        assert_eq!(first[0], BLOB_FORMAT_V1);
        assert_eq!(first.len(), HEADER_BYTES + b"aphid on leaf".len() + TAG_BYTES);
        assert_ne!(first, second);
        assert_eq!(service.open(&image_ref, &first).unwrap(), b"aphid on leaf");
    }

    #[test]
    fn blob_only_opens_under_its_own_image_ref() {
        let service = service();
        let sealed = service.seal(&ImageRef::from("leaf-1"), b"blight").unwrap();

        assert!(matches!(
            service.open(&ImageRef::from("leaf-2"), &sealed),
            Err(EncryptionError::Tampered)
        ));
    }

    #[test]
    fn damaged_blobs_are_rejected() {
        let service = service();
        let image_ref = ImageRef::from("leaf-1");
        let mut sealed = service.seal(&image_ref, b"blight").unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(service.open(&image_ref, &sealed), Err(EncryptionError::Tampered)));

        sealed[0] = 0x02;
        assert!(matches!(
            service.open(&image_ref, &sealed),
            Err(EncryptionError::UnknownFormat(0x02))
        ));
        assert!(matches!(service.open(&image_ref, &[]), Err(EncryptionError::Truncated)));
        assert!(matches!(
            service.open(&image_ref, &[BLOB_FORMAT_V1; 8]),
            Err(EncryptionError::Truncated)
        ));
    }

    #[test]
    fn rejects_short_keys() {
        let key = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(EncryptionService::new(&key), Err(EncryptionError::InvalidKey)));
    }
}
