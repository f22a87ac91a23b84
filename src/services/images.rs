use std::sync::Arc;
use std::time::Duration;

use crate::clock::{to_delta, Clock};
use crate::models::image::{ImageRef, StoredImage};
use crate::services::encryption::{EncryptionError, EncryptionService};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::storage::{BlobStore, StorageError};

/// Formats the vision models accept.
const ACCEPTED_FORMATS: [image::ImageFormat; 4] = [
    image::ImageFormat::Jpeg,
    image::ImageFormat::Png,
    image::ImageFormat::WebP,
    image::ImageFormat::Bmp,
];

/// Stores uploaded images and hands their bytes back to workers.
pub struct ImageService {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    encryption: Option<Arc<EncryptionService>>,
    clock: Arc<dyn Clock>,
    max_bytes: u64,
    ttl: Duration,
}

/// Decrypted image bytes ready for inference.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub fn blob_key(image_ref: &ImageRef) -> String {
    format!("images/{image_ref}")
}

impl ImageService {
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        encryption: Option<Arc<EncryptionService>>,
        clock: Arc<dyn Clock>,
        max_bytes: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            encryption,
            clock,
            max_bytes,
            ttl,
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Validate, optionally encrypt and persist an upload.
    pub async fn store(&self, bytes: &[u8]) -> Result<StoredImage, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        let size_bytes = bytes.len() as u64;
        if size_bytes > self.max_bytes {
            return Err(ImageError::TooLarge {
                size_bytes,
                max_bytes: self.max_bytes,
            });
        }

        let format = image::guess_format(bytes).map_err(|_| ImageError::UnsupportedFormat)?;
        if !ACCEPTED_FORMATS.contains(&format) {
            return Err(ImageError::UnsupportedFormat);
        }
        let mime_type = format.to_mime_type().to_string();

        let image_ref = ImageRef::generate();
        let key = blob_key(&image_ref);
        let sealed = match &self.encryption {
            Some(encryption) => encryption.seal(&image_ref, bytes)?,
            None => bytes.to_vec(),
        };
        self.blobs.put(&key, &sealed, &mime_type).await?;

        let now = self.clock.now();
        let image = StoredImage {
            image_ref,
            bytes_ref: key,
            mime_type,
            size_bytes,
            encrypted: self.encryption.is_some(),
            stored_at: now,
            expires_at: now + to_delta(self.ttl),
            ref_count: 0,
        };

        if let Err(e) = self.store.insert_image(image.clone()).await {
            if let Err(cleanup) = self.blobs.delete(&image.bytes_ref).await {
                tracing::warn!(
                    image_ref = %image.image_ref,
                    error = %cleanup,
                    "Failed to remove blob after metadata insert failed"
                );
            }
            return Err(e.into());
        }

        tracing::info!(
            image_ref = %image.image_ref,
            size_bytes,
            mime_type = %image.mime_type,
            "Image stored"
        );
        metrics::counter!("images_stored_total").increment(1);
        Ok(image)
    }

    /// Fetch and decrypt the bytes behind `image_ref`.
    pub async fn load(&self, image_ref: &ImageRef) -> Result<LoadedImage, ImageError> {
        let image = self
            .store
            .get_image(image_ref)
            .await?
            .ok_or_else(|| ImageError::NotFound(image_ref.clone()))?;

        let data = match self.blobs.get(&image.bytes_ref).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => return Err(ImageError::NotFound(image_ref.clone())),
            Err(e) => return Err(e.into()),
        };

        let bytes = if image.encrypted {
            let encryption = self
                .encryption
                .as_ref()
                .ok_or(ImageError::Decrypt(EncryptionError::InvalidKey))?;
            encryption.open(image_ref, &data)?
        } else {
            data
        };

        Ok(LoadedImage {
            bytes,
            mime_type: image.mime_type,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image is empty")]
    Empty,

    #[error("image is {size_bytes} bytes, limit is {max_bytes}")]
    TooLarge { size_bytes: u64, max_bytes: u64 },

    #[error("unsupported image format, expected jpeg, png, webp or bmp")]
    UnsupportedFormat,

    #[error("image not found: {0}")]
    NotFound(ImageRef),

    #[error("image could not be decrypted: {0}")]
    Decrypt(#[from] EncryptionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::job_store::InMemoryJobStore;
    use crate::services::storage::InMemoryBlobStore;
    use base64::Engine;

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn service(encryption: Option<Arc<EncryptionService>>) -> (ImageService, Arc<InMemoryBlobStore>) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let service = ImageService::new(
            Arc::new(InMemoryJobStore::new()),
            blobs.clone(),
            encryption,
            Arc::new(ManualClock::default()),
            1024,
            Duration::from_secs(60),
        );
        (service, blobs)
    }

    #[tokio::test]
    async fn stores_and_loads_png() {
        let (service, _) = service(None);
        let stored = service.store(PNG_HEADER).await.unwrap();

        assert_eq!(stored.mime_type, "image/png");
        assert_eq!(stored.ref_count, 0);
        assert_eq!(stored.expires_at - stored.stored_at, chrono::Duration::seconds(60));

        let loaded = service.load(&stored.image_ref).await.unwrap();
        assert_eq!(loaded.bytes, PNG_HEADER);
    }

    #[tokio::test]
    async fn encrypts_at_rest() {
        let key = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        let encryption = Arc::new(EncryptionService::new(&key).unwrap());
        let (service, blobs) = service(Some(encryption));

        let stored = service.store(PNG_HEADER).await.unwrap();
        assert!(stored.encrypted);
        assert_ne!(blobs.get(&stored.bytes_ref).await.unwrap(), PNG_HEADER);
        assert_eq!(service.load(&stored.image_ref).await.unwrap().bytes, PNG_HEADER);
    }

    #[tokio::test]
    async fn rejects_oversized_and_unknown_uploads() {
        let (service, blobs) = service(None);

        assert!(matches!(service.store(&[0u8; 2048]).await, Err(ImageError::TooLarge { .. })));
        assert!(matches!(
            service.store(b"plain text, not an image").await,
            Err(ImageError::UnsupportedFormat)
        ));
        assert!(matches!(service.store(&[]).await, Err(ImageError::Empty)));
        assert!(blobs.is_empty());
    }
}
