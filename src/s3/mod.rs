//! S3 object-storage layer
//!
//! This module provides:
//! - AWS Signature Version 4 signing for every request
//! - A client facade for single-object open/head/delete operations
//! - A streaming multipart-upload write path and a lazy read path

pub mod client;
pub mod download;
pub mod error;
pub mod signer;
pub mod types;
pub mod upload;

pub use client::ObjectClient;
pub use download::ObjectReadStream;
pub use error::{Result, StorageError};
pub use signer::RequestSigner;
pub use types::{ObjectMetadata, StorageClass};
pub use upload::{MultipartUploadStream, PART_SIZE};
