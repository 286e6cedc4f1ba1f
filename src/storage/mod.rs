//! Object storage abstraction for indexed source data.
//!
//! Source datasets are line-delimited JSON objects stored under a key prefix.
//! The index build streams whole objects; queries read exact byte ranges.
//!
//! # Implementations
//!
//! - [`LocalStorage`] - a local directory treated as a bucket
//! - [`S3Storage`] - an S3 bucket (`s3` feature)
//! - [`RetryingStore`] - wraps any backend with bounded exponential backoff
//!
//! # Example
//!
//! ```no_run
//! use bioindexr::storage::{LocalStorage, ObjectStore, RetryPolicy, RetryingStore};
//! use std::path::PathBuf;
//!
//! let storage = RetryingStore::new(
//!     LocalStorage::new(PathBuf::from("./data")),
//!     RetryPolicy::default(),
//! );
//! ```

mod local;
mod retry;
#[cfg(feature = "s3")]
mod s3;

pub use local::LocalStorage;
pub use retry::{RetryPolicy, RetryingStore};
#[cfg(feature = "s3")]
pub use s3::S3Storage;

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::pin::Pin;
use tokio::io::AsyncBufRead;

/// A span of bytes within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u32,
}

impl ByteRange {
    /// HTTP `Range` header value (inclusive end).
    pub fn header_value(&self) -> String {
        let last = self.offset + u64::from(self.length.max(1)) - 1;
        format!("bytes={}-{}", self.offset, last)
    }
}

/// Metadata about a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Buffered stream over the contents of an object.
pub type ObjectReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// Object store backend trait
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List data objects under a prefix, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Open an object for sequential reading.
    async fn open(&self, key: &str) -> Result<ObjectReader> {
        self.open_at(key, 0).await
    }

    /// Open an object for sequential reading from byte `offset` onwards.
    async fn open_at(&self, key: &str, offset: u64) -> Result<ObjectReader>;

    /// Read exactly `range.length` bytes starting at `range.offset`.
    async fn read_range(&self, key: &str, range: ByteRange) -> Result<Bytes>;
}

/// Whether a listed key holds data rather than a directory placeholder or a
/// job marker such as `_SUCCESS`.
pub fn is_data_key(key: &str) -> bool {
    if key.is_empty() || key.ends_with('/') {
        return false;
    }
    let name = key.rsplit('/').next().unwrap_or(key);
    !(name.starts_with('_') || name.starts_with('.'))
}

/// Error for a failure while streaming an object body. Dropped connections
/// and timeouts are [`Error::Transient`]; the read can resume at `offset`.
pub fn read_error(key: &str, offset: u64, err: std::io::Error) -> Error {
    let message = format!("{key}: read failed at offset {offset}: {err}");
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::TimedOut
        | ErrorKind::Interrupted => Error::Transient(message),
        _ => Error::ObjectStore(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header_is_inclusive() {
        let range = ByteRange {
            offset: 100,
            length: 50,
        };
        assert_eq!(range.header_value(), "bytes=100-149");
    }

    #[test]
    fn test_is_data_key() {
        assert!(is_data_key("genes/part-00000.json"));
        assert!(!is_data_key("genes/"));
        assert!(!is_data_key("genes/_SUCCESS"));
        assert!(!is_data_key("genes/.part-00000.json.crc"));
        assert!(!is_data_key(""));
    }

    #[test]
    fn test_read_error_classification() {
        let reset = std::io::Error::from(ErrorKind::ConnectionReset);
        let err = read_error("genes/part-00000.json", 20, reset);
        assert!(err.is_transient());
        assert!(err.to_string().contains("offset 20"), "{err}");

        let timeout = std::io::Error::from(ErrorKind::TimedOut);
        assert!(read_error("k", 0, timeout).is_transient());

        let denied = std::io::Error::from(ErrorKind::PermissionDenied);
        assert!(matches!(read_error("k", 0, denied), Error::ObjectStore(_)));
    }
}
