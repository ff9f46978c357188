//! Object client: open-for-write, open-for-read, head, delete
//!
//! Transport setup follows the same recipe as the rest of the stack:
//! - HTTP/1.1 only, tuned idle pool, TCP_NODELAY, keepalive
//! - native-tls for TLS
//! - zero-copy `Bytes` bodies
//! - UNSIGNED-PAYLOAD signing for part uploads
//!
//! No operation here retries: every failure surfaces at the call that
//! produced it.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::config::Profile;
use crate::s3::download::ObjectReadStream;
use crate::s3::error::{Result, StorageError};
use crate::s3::signer::RequestSigner;
use crate::s3::types::{ObjectMetadata, StorageClass};
use crate::s3::upload::{MultipartUploadStream, PART_SIZE};

/// Hex lookup table for URI encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// How the request payload participates in the signature
#[derive(Clone, Copy)]
pub(crate) enum PayloadSigning {
    /// Hash the payload into `x-amz-content-sha256` (small/empty bodies)
    Hashed,
    /// `UNSIGNED-PAYLOAD`; integrity is carried by `Content-MD5` instead
    Unsigned,
}

/// Client for single-object operations against an S3-compatible store
///
/// Clone is cheap: clones share the underlying HTTP connection pool, so
/// read and write streams opened from the same client reuse connections.
#[derive(Clone)]
pub struct ObjectClient {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    signer: RequestSigner,
    endpoint: String,
    bucket: String,
    part_size: usize,
    cancel: CancellationToken,
}

impl ObjectClient {
    /// Create a client for one endpoint/bucket pair.
    ///
    /// Set `S3STREAM_INSECURE_TLS=1` to skip certificate verification
    /// against stores with self-signed certificates.
    pub fn new(
        endpoint: impl Into<String>,
        region: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: &str,
        bucket: impl Into<String>,
    ) -> Self {
        let insecure_tls = std::env::var("S3STREAM_INSECURE_TLS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("certificate verification is disabled");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .expect("failed to build TLS connector")
        } else {
            TlsConnector::new().expect("failed to build TLS connector")
        };
        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .set_host(true)
            .build(https);

        Self {
            client,
            signer: RequestSigner::new(access_key, secret_key, region),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            part_size: PART_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a client from a configuration profile.
    pub fn from_profile(profile: &Profile) -> Self {
        Self::new(
            profile.endpoint.as_str(),
            profile.region.as_str(),
            profile.access_key.as_str(),
            &profile.secret_key,
            profile.bucket.clone().unwrap_or_default(),
        )
    }

    /// Override the multipart part size.
    ///
    /// S3 rejects non-final parts below 5 MiB; smaller values are only
    /// useful against test stores.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// Attach a cancellation token observed by every request this client
    /// (and streams opened from it) issues. Triggering the token aborts
    /// in-flight calls with [`StorageError::Cancelled`]; it never runs the
    /// finalize or abort protocol.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub(crate) fn part_size(&self) -> usize {
        self.part_size
    }

    /// Begin a multipart upload and return the write stream bound to it.
    ///
    /// The object only becomes visible once the stream's `finish` call
    /// completes.
    pub async fn open_for_writing(
        &self,
        key: &str,
        content_type: &str,
        content_encodings: &[&str],
        storage_class: StorageClass,
    ) -> Result<MultipartUploadStream> {
        let url = format!("{}?uploads", self.object_url(key));

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        if !content_encodings.is_empty() {
            headers.insert("content-encoding".to_string(), content_encodings.join(", "));
        }
        headers.insert(
            "x-amz-storage-class".to_string(),
            storage_class.as_wire().to_string(),
        );

        let (status, _, body) = self
            .send_collected(Method::POST, &url, headers, Bytes::new(), PayloadSigning::Hashed)
            .await?;
        if !status.is_success() {
            return Err(StorageError::api(status, &body));
        }

        let upload_id = parse_initiate_response(&body)?;
        tracing::debug!(key, upload_id = %upload_id, "multipart upload initiated");
        Ok(MultipartUploadStream::new(self.clone(), key.to_string(), upload_id))
    }

    /// Open an object for reading.
    ///
    /// Only the response headers are awaited; the body is drained at the
    /// caller's pace through the returned stream, which keeps the
    /// response (and its connection) alive until dropped.
    pub async fn open_for_reading(&self, key: &str) -> Result<ObjectReadStream> {
        let url = self.object_url(key);
        let request = self.build_request(
            Method::GET,
            &url,
            BTreeMap::new(),
            Bytes::new(),
            PayloadSigning::Hashed,
        )?;

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
            result = self.client.request(request) => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(StorageError::api(status, &body));
        }
        Ok(ObjectReadStream::new(response, self.cancel.clone()))
    }

    /// Fetch object metadata via HEAD.
    ///
    /// Returns `None` for a missing object (404); every other non-success
    /// status is an error. Probing existence therefore never needs error
    /// handling.
    pub async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let url = self.object_url(key);
        let (status, headers, body) = self
            .send_collected(Method::HEAD, &url, BTreeMap::new(), Bytes::new(), PayloadSigning::Hashed)
            .await?;

        if status.is_success() {
            Ok(Some(ObjectMetadata::from_headers(&headers)))
        } else if status == StatusCode::NOT_FOUND {
            Ok(None)
        } else {
            Err(StorageError::api(status, &body))
        }
    }

    /// Delete an object. Returns true iff the store answered 204.
    ///
    /// Other statuses yield false rather than an error, so
    /// delete-then-check idioms stay exception-free.
    pub async fn delete_object(&self, key: &str) -> Result<bool> {
        let url = self.object_url(key);
        let (status, _, _) = self
            .send_collected(Method::DELETE, &url, BTreeMap::new(), Bytes::new(), PayloadSigning::Hashed)
            .await?;
        Ok(status == StatusCode::NO_CONTENT)
    }

    /// Stream the whole of `reader` into a new object and finalize it.
    ///
    /// Scoped-acquisition helper over [`Self::open_for_writing`]: the
    /// finalize always runs on the success path and its failure is the
    /// caller's result. A mid-copy failure is returned without
    /// finalizing, leaving the multipart session open on the store.
    pub async fn put_object<R>(
        &self,
        key: &str,
        content_type: &str,
        content_encodings: &[&str],
        storage_class: StorageClass,
        mut reader: R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut stream = self
            .open_for_writing(key, content_type, content_encodings, storage_class)
            .await?;

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write(&buf[..n]).await?;
        }
        stream.finish().await
    }

    /// Sign and send a request, racing the cancellation token, and
    /// collect the full response body.
    pub(crate) async fn send_collected(
        &self,
        method: Method,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Bytes,
        signing: PayloadSigning,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let request = self.build_request(method, url, headers, body, signing)?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, StorageError>((status, headers, body))
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            result = exchange => result,
        }
    }

    fn build_request(
        &self,
        method: Method,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Bytes,
        signing: PayloadSigning,
    ) -> Result<Request<Full<Bytes>>> {
        let signed = match signing {
            PayloadSigning::Hashed => self.signer.sign(method.as_str(), url, headers, &body)?,
            PayloadSigning::Unsigned => {
                self.signer.sign_unsigned_payload(method.as_str(), url, headers)?
            }
        };

        let mut builder = Request::builder().method(method).uri(url);
        for (name, value) in &signed {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder.body(Full::new(body))?)
    }

    /// Full URL for a key, with the key percent-encoded (slashes kept).
    pub(crate) fn object_url(&self, key: &str) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        let encoded_key = encode_object_key(key);
        let mut url =
            String::with_capacity(endpoint.len() + 1 + self.bucket.len() + 1 + encoded_key.len());
        url.push_str(endpoint);
        url.push('/');
        url.push_str(&self.bucket);
        url.push('/');
        url.push_str(&encoded_key);
        url
    }
}

/// Encode an object key for use in a URL path, preserving forward slashes.
/// Borrows when no encoding is needed (the common case).
fn encode_object_key(key: &str) -> Cow<'_, str> {
    let needs_encoding = key
        .bytes()
        .any(|b| !matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/'));
    if !needs_encoding {
        return Cow::Borrowed(key);
    }

    let mut result = String::with_capacity(key.len() + 32);
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                result.push(byte as char);
            }
            _ => {
                result.push('%');
                result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
    Cow::Owned(result)
}

/// Percent-encode a query parameter value into an existing buffer.
pub(crate) fn url_encode_into(buf: &mut String, s: &str) {
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                buf.push(byte as char);
            }
            _ => {
                buf.push('%');
                buf.push(HEX_UPPER[(byte >> 4) as usize] as char);
                buf.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
}

/// Extract the UploadId from an InitiateMultipartUpload response.
///
/// Matched by local element name at child-of-root depth; the document
/// namespace is not enforced. A 2xx response without the element is a
/// protocol violation, not a retry condition.
fn parse_initiate_response(xml: &[u8]) -> Result<String> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut depth = 0usize;
    let mut in_upload_id = false;
    let mut upload_id: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                in_upload_id = depth == 2 && e.local_name().as_ref() == b"UploadId";
            }
            Ok(Event::Text(e)) if in_upload_id => {
                let text = e
                    .unescape()
                    .map_err(|e| StorageError::Protocol(format!("initiate response XML: {e}")))?;
                upload_id = Some(text.into_owned());
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                in_upload_id = false;
            }
            Ok(Event::Empty(_)) => in_upload_id = false,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StorageError::Protocol(format!("initiate response XML: {e}")));
            }
            _ => {}
        }
    }

    upload_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StorageError::Protocol("initiate response carries no UploadId".to_string()))
}
