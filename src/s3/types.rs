//! Object attribute types and their wire representation

use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use serde::{Deserialize, Serialize};

/// Storage tier for an object
///
/// Maps bidirectionally to the `x-amz-storage-class` wire tokens. Decoding
/// is lenient: an unrecognized or missing token yields `Standard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageClass {
    Standard,
    StandardInfrequentAccess,
    OneZoneInfrequentAccess,
    IntelligentTiering,
    ArchiveFlexibleRetrieval,
    ArchiveInstantRetrieval,
    ArchiveDeepArchive,
    #[deprecated(
        note = "the STANDARD storage class is more cost-effective; kept for older stores"
    )]
    ReducedRedundancy,
}

impl Default for StorageClass {
    fn default() -> Self {
        StorageClass::Standard
    }
}

#[allow(deprecated)]
impl StorageClass {
    /// Wire token sent in `x-amz-storage-class`.
    pub fn as_wire(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::StandardInfrequentAccess => "STANDARD_IA",
            StorageClass::OneZoneInfrequentAccess => "ONEZONE_IA",
            StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageClass::ArchiveFlexibleRetrieval => "GLACIER",
            StorageClass::ArchiveInstantRetrieval => "GLACIER_IR",
            StorageClass::ArchiveDeepArchive => "DEEP_ARCHIVE",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
        }
    }

    /// Decode a wire token; unknown tokens fall back to `Standard`.
    pub fn from_wire(token: &str) -> Self {
        match token {
            "STANDARD" => StorageClass::Standard,
            "STANDARD_IA" => StorageClass::StandardInfrequentAccess,
            "ONEZONE_IA" => StorageClass::OneZoneInfrequentAccess,
            "INTELLIGENT_TIERING" => StorageClass::IntelligentTiering,
            "GLACIER" => StorageClass::ArchiveFlexibleRetrieval,
            "GLACIER_IR" => StorageClass::ArchiveInstantRetrieval,
            "DEEP_ARCHIVE" => StorageClass::ArchiveDeepArchive,
            "REDUCED_REDUNDANCY" => StorageClass::ReducedRedundancy,
            _ => StorageClass::Standard,
        }
    }
}

/// Attributes of a stored object, as reported by a HEAD response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Storage tier the object lives in
    pub storage_class: StorageClass,
    /// Entity tag, verbatim as the store sent it (quotes preserved)
    pub etag: String,
    /// Object size; 0 when the store omits Content-Length
    pub size_in_bytes: u64,
    /// MIME type, if reported
    pub content_type: Option<String>,
    /// Content encoding, if reported
    pub content_encoding: Option<String>,
}

impl ObjectMetadata {
    /// Map response headers to typed metadata.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header_str = |name| {
            headers
                .get(name)
                .and_then(|v: &hyper::header::HeaderValue| v.to_str().ok())
        };

        Self {
            storage_class: header_str("x-amz-storage-class")
                .map(StorageClass::from_wire)
                .unwrap_or_default(),
            etag: header_str(ETAG.as_str()).unwrap_or_default().to_string(),
            size_in_bytes: header_str(CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: header_str(CONTENT_TYPE.as_str()).map(String::from),
            content_encoding: header_str(CONTENT_ENCODING.as_str()).map(String::from),
        }
    }
}
