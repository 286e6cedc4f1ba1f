//! S3 object store backend.
//!
//! - Lists data objects under a prefix with `ListObjectsV2`
//! - Streams objects for index builds, resuming mid-object with `Range: bytes=N-`
//! - Reads records with ranged `GetObject` requests
//! - Supports custom S3 endpoints (MinIO, LocalStack, etc.)
//!
//! Throttling, 5xx responses, timeouts and dispatch failures are reported as
//! [`Error::Transient`] so [`super::RetryingStore`] can back off and retry.

use super::{ByteRange, ObjectInfo, ObjectReader, ObjectStore, is_data_key};
use crate::{Error, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use bytes::Bytes;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

/// S3 storage backend for indexed datasets.
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Create a new S3Storage instance.
    ///
    /// # Arguments
    ///
    /// * `bucket` - S3 bucket name
    /// * `region` - Optional AWS region (uses SDK defaults if not specified)
    /// * `endpoint` - Optional custom endpoint URL (for S3-compatible services)
    pub async fn new(bucket: String, region: Option<String>, endpoint: Option<String>) -> Self {
        let mut config_loader = aws_config::from_env();

        if let Some(region) = region {
            config_loader = config_loader.region(aws_config::Region::new(region));
        }

        let sdk_config = config_loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config.build()),
            bucket,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify(&format!("list s3://{}/{}", self.bucket, prefix), e))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if is_data_key(key) {
                    objects.push(ObjectInfo {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn open_at(&self, key: &str, offset: u64) -> Result<ObjectReader> {
        let range = (offset > 0).then(|| format!("bytes={offset}-"));
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .send()
            .await
        {
            Ok(response) => response,
            // Resuming exactly at the end of the object.
            Err(SdkError::ServiceError(e)) if offset > 0 && e.raw().status().as_u16() == 416 => {
                return Ok(Box::pin(tokio::io::empty()));
            }
            Err(e) => return Err(classify(key, e)),
        };

        Ok(Box::pin(BodyReader {
            inner: Box::pin(response.body.into_async_read()),
        }))
    }

    async fn read_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
        if range.length == 0 {
            return Ok(Bytes::new());
        }

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range.header_value())
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| Error::Transient(format!("{key}: S3 read failed: {e}")))?
            .into_bytes();

        if body.len() != range.length as usize {
            return Err(Error::ObjectStore(format!(
                "{key}: expected {} bytes at offset {}, got {}",
                range.length,
                range.offset,
                body.len()
            )));
        }

        Ok(body)
    }
}

/// Response body whose stream failures surface as connection resets, so a
/// build can reopen the object where it stopped.
struct BodyReader {
    inner: ObjectReader,
}

impl AsyncRead for BodyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf).map_err(body_error)
    }
}

impl AsyncBufRead for BodyReader {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        self.get_mut().inner.as_mut().poll_fill_buf(cx).map_err(body_error)
    }

    fn consume(mut self: Pin<&mut Self>, amt: usize) {
        self.inner.as_mut().consume(amt);
    }
}

fn body_error(err: io::Error) -> io::Error {
    match err.kind() {
        ErrorKind::Other => io::Error::new(ErrorKind::ConnectionReset, err),
        _ => err,
    }
}

fn classify<E>(context: &str, err: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{context}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Error::Transient(message)
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code();
            if status == 404 || matches!(code, Some("NoSuchKey" | "NoSuchBucket")) {
                Error::ObjectNotFound(message)
            } else if is_transient_status(status) || code.is_some_and(is_throttling_code) {
                Error::Transient(message)
            } else {
                Error::ObjectStore(message)
            }
        }
        _ => Error::ObjectStore(message),
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

fn is_throttling_code(code: &str) -> bool {
    matches!(
        code,
        "SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout" | "InternalError"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_transient_status(status), "{status}");
        }
        for status in [400, 403, 404, 416] {
            assert!(!is_transient_status(status), "{status}");
        }
    }

    #[test]
    fn test_body_errors_become_resets() {
        let err = body_error(io::Error::new(ErrorKind::Other, "connection closed"));
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert!(crate::storage::read_error("k", 3, err).is_transient());

        let err = body_error(io::Error::from(ErrorKind::InvalidData));
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_throttling_codes() {
        assert!(is_throttling_code("SlowDown"));
        assert!(is_throttling_code("RequestTimeout"));
        assert!(!is_throttling_code("AccessDenied"));
    }
}
