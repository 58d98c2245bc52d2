use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque upstream address of a file's bytes.
///
/// Only the [`Session`](crate::Session) implementation that produced it knows
/// how to interpret it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(Arc<str>);

impl Location {
    pub fn new(location: impl AsRef<str>) -> Self {
        Location(Arc::from(location.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Location").field(&&*self.0).finish()
    }
}

/// Identity and shape of one remote file.
///
/// A `size` of zero marks a single-shot object (an inline image, for example)
/// that is fetched whole and never served with range headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: i64,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
    pub location: Location,
}

impl FileDescriptor {
    /// Whether this descriptor is the zero-size, non-rangeable sentinel.
    pub fn is_single_shot(&self) -> bool {
        self.size == 0
    }

    /// MIME type to advertise: the descriptor's own, then a guess from the
    /// file name, then `application/octet-stream`.
    pub fn content_type(&self) -> String {
        if !self.mime_type.is_empty() {
            return self.mime_type.clone();
        }
        mime_guess::from_path(&self.name)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("file {0} not found")]
    NotFound(i64),

    #[error("lookup failed: {0}")]
    Failed(String),
}

/// Resolves a public file id into its descriptor.
#[async_trait]
pub trait FileLookup: Send + Sync + 'static {
    async fn lookup(&self, id: i64) -> Result<FileDescriptor, LookupError>;
}

#[async_trait]
impl<L: FileLookup + ?Sized> FileLookup for Arc<L> {
    async fn lookup(&self, id: i64) -> Result<FileDescriptor, LookupError> {
        (**self).lookup(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, mime_type: &str) -> FileDescriptor {
        FileDescriptor {
            id: 1,
            name: name.to_string(),
            size: 10,
            mime_type: mime_type.to_string(),
            location: Location::new("loc"),
        }
    }

    #[test]
    fn test_content_type_prefers_descriptor() {
        assert_eq!("video/webm", descriptor("clip.mp4", "video/webm").content_type());
    }

    #[test]
    fn test_content_type_guessed_from_name() {
        assert_eq!("video/mp4", descriptor("clip.mp4", "").content_type());
    }

    #[test]
    fn test_content_type_fallback() {
        assert_eq!("application/octet-stream", descriptor("blob", "").content_type());
    }

    #[test]
    fn test_descriptor_json_shape() {
        let json = r#"{"id":42,"name":"a.mp4","size":1000000,"mime_type":"video/mp4","location":"files/42"}"#;
        let file: FileDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(42, file.id);
        assert_eq!(Location::new("files/42"), file.location);
        assert!(!file.is_single_shot());
    }

    #[test]
    fn test_location_serializes_as_string() {
        let file = descriptor("a.mp4", "video/mp4");
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(file.location.as_str(), json["location"]);
    }
}
