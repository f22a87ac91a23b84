use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Handle of an uploaded image. Jobs carry this instead of the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ImageRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ImageRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for an image held in the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    pub image_ref: ImageRef,
    /// Key of the blob holding the (possibly encrypted) bytes.
    pub bytes_ref: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub encrypted: bool,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Jobs that still need the image.
    pub ref_count: u32,
}

impl StoredImage {
    /// Deletion is only allowed once nothing references the image and it has expired.
    pub fn is_deletable(&self, now: DateTime<Utc>) -> bool {
        self.ref_count == 0 && now > self.expires_at
    }
}
