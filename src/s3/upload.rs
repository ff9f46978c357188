//! Write-only multipart upload stream
//!
//! Bytes are copied into a fixed-capacity part buffer; each time the
//! buffer reaches the part boundary the part is uploaded and the buffer
//! rotates. Parts go out strictly sequentially, one in flight at a time;
//! the protocol itself would allow concurrent part uploads, at the cost
//! of a more involved session bookkeeping.

use bytes::Bytes;
use hyper::header::ETAG;
use hyper::Method;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::s3::client::{url_encode_into, ObjectClient, PayloadSigning};
use crate::s3::error::{Result, StorageError};

/// Part boundary: 5 MiB, the S3 minimum for non-final parts
pub const PART_SIZE: usize = 5 * 1024 * 1024;

const XML_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// A write-only, non-seekable byte sink feeding one multipart upload
///
/// The stream owns its upload session exclusively: the upload id, the
/// current part buffer and the map of completed part entity tags. The
/// object does not exist on the store until [`finish`](Self::finish)
/// completes; dropping the stream without finishing performs no network
/// I/O and leaves the multipart session open on the store.
pub struct MultipartUploadStream {
    client: ObjectClient,
    key: String,
    upload_id: String,
    part_size: usize,
    /// Current part buffer; capacity is the part size, length the fill
    buf: Vec<u8>,
    /// 1-based, monotonically increasing
    next_part_number: u32,
    /// Part number -> entity tag, populated in ascending order
    completed_parts: BTreeMap<u32, String>,
    finished: bool,
}

impl std::fmt::Debug for MultipartUploadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUploadStream")
            .field("key", &self.key)
            .field("upload_id", &self.upload_id)
            .field("part_size", &self.part_size)
            .field("next_part_number", &self.next_part_number)
            .field("completed_parts", &self.completed_parts)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl MultipartUploadStream {
    pub(crate) fn new(client: ObjectClient, key: String, upload_id: String) -> Self {
        let part_size = client.part_size();
        Self {
            client,
            key,
            upload_id,
            part_size,
            buf: Vec::with_capacity(part_size),
            next_part_number: 1,
            completed_parts: BTreeMap::new(),
            finished: false,
        }
    }

    /// Upload identifier issued by the store at initiation.
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Number of bytes accepted so far.
    pub fn position(&self) -> u64 {
        (self.next_part_number as u64 - 1) * self.part_size as u64 + self.buf.len() as u64
    }

    /// Append bytes to the stream.
    ///
    /// A single call may trigger several part uploads when `data` spans
    /// more than the remaining buffer capacity. Only full parts are
    /// uploaded here; the final partial part is flushed by `finish`.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(StorageError::StreamClosed);
        }

        let mut offset = 0;
        while offset < data.len() {
            let take = (self.part_size - self.buf.len()).min(data.len() - offset);
            self.buf.extend_from_slice(&data[offset..offset + take]);
            offset += take;

            if self.buf.len() == self.part_size {
                self.upload_current_part().await?;
            }
        }
        Ok(())
    }

    /// Flush the final partial part and finalize the object.
    ///
    /// Explicit and fallible: callers must invoke it and observe its
    /// result. A second call after success performs no network calls.
    /// After a failure the stream stays open so the caller can retry;
    /// no abort is sent either way, so an abandoned session must be
    /// cleaned up out of band.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        // A zero-length final part is skipped, not uploaded: the store
        // rejects empty parts.
        self.upload_current_part().await?;

        let mut url = self.client.object_url(&self.key);
        url.push_str("?uploadId=");
        url_encode_into(&mut url, &self.upload_id);

        let xml = complete_multipart_xml(&self.completed_parts);
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/xml".to_string());
        headers.insert("content-length".to_string(), xml.len().to_string());

        let (status, _, body) = self
            .client
            .send_collected(
                Method::POST,
                &url,
                headers,
                Bytes::from(xml),
                PayloadSigning::Hashed,
            )
            .await?;
        if !status.is_success() {
            return Err(StorageError::api(status, &body));
        }

        tracing::debug!(
            key = %self.key,
            upload_id = %self.upload_id,
            parts = self.completed_parts.len(),
            "multipart upload completed"
        );
        self.finished = true;
        Ok(())
    }

    /// Upload the buffered part, record its entity tag and rotate the
    /// buffer. No-op when the buffer is empty.
    async fn upload_current_part(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let part_number = self.next_part_number;
        // Take ownership of exactly the bytes being sent; the digest can
        // never see leftovers from a previous part.
        let body = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(self.part_size),
        ));
        let digest = md5::compute(&body);
        let content_md5 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest.0);

        let mut url = self.client.object_url(&self.key);
        url.push_str("?partNumber=");
        let _ = write!(url, "{part_number}");
        url.push_str("&uploadId=");
        url_encode_into(&mut url, &self.upload_id);

        let mut headers = BTreeMap::new();
        headers.insert("content-md5".to_string(), content_md5);
        headers.insert("content-length".to_string(), body.len().to_string());

        let part_len = body.len();
        let (status, resp_headers, resp_body) = self
            .client
            .send_collected(Method::PUT, &url, headers, body, PayloadSigning::Unsigned)
            .await?;
        if !status.is_success() {
            return Err(StorageError::api(status, &resp_body));
        }

        // The store is contractually required to tag every part.
        let etag = resp_headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| {
                StorageError::Protocol("part upload response carries no ETag header".to_string())
            })?;

        tracing::debug!(
            key = %self.key,
            part = part_number,
            bytes = part_len,
            "part uploaded"
        );
        self.completed_parts.insert(part_number, etag);
        self.next_part_number += 1;
        Ok(())
    }
}

impl Drop for MultipartUploadStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                "upload stream dropped without finish; multipart session left open on the store"
            );
        }
    }
}

/// Build the CompleteMultipartUpload document: every part ascending by
/// part number, entity tags verbatim as the store returned them.
fn complete_multipart_xml(parts: &BTreeMap<u32, String>) -> String {
    let mut xml = String::with_capacity(parts.len() * 96 + 128);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    xml.push_str("<CompleteMultipartUpload xmlns=\"");
    xml.push_str(XML_NAMESPACE);
    xml.push_str("\">");
    for (part_number, etag) in parts {
        xml.push_str("<Part><PartNumber>");
        let _ = write!(xml, "{part_number}");
        xml.push_str("</PartNumber><ETag>");
        xml_escape_into(&mut xml, etag);
        xml.push_str("</ETag></Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Escape XML text content. Quotes stay literal so entity tags survive
/// byte-for-byte.
fn xml_escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            _ => buf.push(ch),
        }
    }
}
