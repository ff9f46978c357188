//! s3stream - Streaming client for S3-compatible object stores
//!
//! Objects are written through a multipart-upload stream that needs neither
//! the final object size up front nor whole-object buffering, and read back
//! as a lazily-drained HTTP response body.

pub mod config;
pub mod s3;

pub use config::{Config, Profile};
pub use s3::{
    MultipartUploadStream, ObjectClient, ObjectMetadata, ObjectReadStream, Result, StorageClass,
    StorageError, PART_SIZE,
};
