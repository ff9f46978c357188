//! Failure taxonomy shared by every S3 operation
//!
//! Nothing in this layer retries or suppresses a failure: each variant is
//! surfaced to the caller at the call that produced it. A part upload or
//! finalize that fails leaves the remote multipart session open on the
//! store; cleaning that up is the caller's responsibility.

use hyper::StatusCode;
use thiserror::Error;

/// Errors produced by S3 operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The request could not be signed (malformed URL, missing authority)
    #[error("request signing failed: {0}")]
    Signing(String),

    /// Network or connection-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The in-flight request was aborted by a cancellation signal
    #[error("operation cancelled")]
    Cancelled,

    /// A 2xx response whose body or headers violate the S3 contract
    /// (missing UploadId element, missing part ETag header)
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A non-success HTTP status; message is the raw response body text
    #[error("S3 error: {status} - {message}")]
    Api { status: StatusCode, message: String },

    /// Write or finish on an upload stream that has already been finalized
    #[error("upload stream is already finished")]
    StreamClosed,

    /// Request construction error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    /// IO error (reader-driven uploads)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Build an `Api` error from a status code and the raw response body.
    pub(crate) fn api(status: StatusCode, body: &[u8]) -> Self {
        StorageError::Api {
            status,
            message: String::from_utf8_lossy(body).to_string(),
        }
    }
}

impl From<hyper_util::client::legacy::Error> for StorageError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

impl From<hyper::Error> for StorageError {
    fn from(err: hyper::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
