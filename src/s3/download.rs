//! Read-only stream over one GET response body
//!
//! The stream owns the response, so the connection stays checked out of
//! the pool exactly as long as the stream lives. Dropping the stream
//! drops the body and returns (or tears down) the connection.

use bytes::Bytes;
use futures::Stream;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::CONTENT_LENGTH;
use hyper::Response;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

use crate::s3::error::{Result, StorageError};
use crate::s3::types::ObjectMetadata;

/// Lazily-consumed byte source for one object
pub struct ObjectReadStream {
    head: hyper::http::response::Parts,
    body: Incoming,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ObjectReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReadStream")
            .field("head", &self.head)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl ObjectReadStream {
    pub(crate) fn new(response: Response<Incoming>, cancel: CancellationToken) -> Self {
        let (head, body) = response.into_parts();
        Self { head, body, cancel }
    }

    /// Object size as reported by the response, if reported.
    pub fn content_length(&self) -> Option<u64> {
        self.head
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Object attributes carried on the GET response headers.
    pub fn metadata(&self) -> ObjectMetadata {
        ObjectMetadata::from_headers(&self.head.headers)
    }

    /// Read the next chunk of the body; `None` at end of object.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
                frame = self.body.frame() => frame,
            };
            match frame {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(frame)) => {
                    // data frames only; trailers are skipped
                    if let Ok(data) = frame.into_data() {
                        return Ok(Some(data));
                    }
                }
            }
        }
    }

    /// Drain the remaining body into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = match self.content_length() {
            Some(len) => Vec::with_capacity(len as usize),
            None => Vec::new(),
        };
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl Stream for ObjectReadStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        return Poll::Ready(Some(Ok(data)));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
