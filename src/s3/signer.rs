//! AWS Signature Version 4 request signing
//!
//! The signer is a pure collaborator: it takes a request descriptor
//! (method, URL, headers, payload hash) and returns the header map
//! augmented with `host`, `x-amz-date`, `x-amz-content-sha256` and
//! `authorization`. Signing keys are derived per day and cached.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::s3::error::{Result, StorageError};

type HmacSha256 = Hmac<Sha256>;

/// Fixed service identifier for the object-storage service
const SERVICE: &str = "s3";

/// Hex lookup table for percent encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// SHA256 of the empty payload, pre-computed for bodyless requests
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// AWS Signature Version 4 signer for S3 requests
pub struct RequestSigner {
    access_key: String,
    region: String,
    /// "AWS4" + secret key, the root of the key-derivation chain
    aws4_secret: Vec<u8>,
    /// Signing key per date stamp; the derived key only changes daily
    key_cache: Mutex<Option<(String, [u8; 32])>>,
}

impl Clone for RequestSigner {
    fn clone(&self) -> Self {
        Self {
            access_key: self.access_key.clone(),
            region: self.region.clone(),
            aws4_secret: self.aws4_secret.clone(),
            // fresh cache, repopulated on first sign
            key_cache: Mutex::new(None),
        }
    }
}

impl RequestSigner {
    pub fn new(access_key: impl Into<String>, secret_key: &str, region: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            region: region.into(),
            aws4_secret: format!("AWS4{secret_key}").into_bytes(),
            key_cache: Mutex::new(None),
        }
    }

    /// Sign a request, hashing the payload.
    ///
    /// Empty payloads use a pre-computed hash constant.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        payload: &[u8],
    ) -> Result<BTreeMap<String, String>> {
        if payload.is_empty() {
            self.sign_with_hash(method, url, headers, EMPTY_SHA256)
        } else {
            let hash = hex::encode(Sha256::digest(payload));
            self.sign_with_hash(method, url, headers, &hash)
        }
    }

    /// Sign a request with `UNSIGNED-PAYLOAD`, skipping the body hash.
    ///
    /// Used for part uploads, whose integrity is covered by `Content-MD5`.
    pub fn sign_unsigned_payload(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        self.sign_with_hash(method, url, headers, "UNSIGNED-PAYLOAD")
    }

    fn sign_with_hash(
        &self,
        method: &str,
        url: &str,
        mut headers: BTreeMap<String, String>,
        payload_hash: &str,
    ) -> Result<BTreeMap<String, String>> {
        let (host, path, query) = split_url(url)?;

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        // Required headers, lowercase so the BTreeMap yields canonical order
        headers.insert("host".to_string(), host.to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let canonical_query = canonical_query_string(query);

        let mut canonical_headers = String::with_capacity(headers.len() * 64);
        for (name, value) in &headers {
            canonical_headers.push_str(name);
            canonical_headers.push(':');
            canonical_headers.push_str(value.trim());
            canonical_headers.push('\n');
        }
        let signed_headers = headers
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");

        // Path is used as-is: callers build URLs with pre-encoded keys
        let canonical_request = format!(
            "{method}\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let scope = format!("{date_stamp}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = self.signature_for(&date_stamp, &string_to_sign);
        headers.insert(
            "authorization".to_string(),
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key
            ),
        );

        Ok(headers)
    }

    /// Compute the request signature, reusing the daily signing key.
    fn signature_for(&self, date_stamp: &str, string_to_sign: &str) -> String {
        let signing_key = {
            let mut cache = self.key_cache.lock().unwrap();
            let cached = match &*cache {
                Some((cached_date, key)) if cached_date == date_stamp => Some(*key),
                _ => None,
            };
            match cached {
                Some(key) => key,
                None => {
                    let key = self.derive_signing_key(date_stamp);
                    *cache = Some((date_stamp.to_string(), key));
                    key
                }
            }
        };
        hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()))
    }

    /// Four chained HMAC operations from the secret to the signing key.
    fn derive_signing_key(&self, date_stamp: &str) -> [u8; 32] {
        let k_date = hmac_sha256(&self.aws4_secret, date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

/// Split a URL into (host, path, query) slices without allocating.
///
/// Default ports are stripped from the host header value. A URL with an
/// empty authority cannot be canonicalized and fails the signing step.
fn split_url(url: &str) -> Result<(&str, &str, &str)> {
    let (https, after_scheme) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        (false, url)
    };

    let (authority, path_and_query) = match after_scheme.find('/') {
        Some(pos) => (&after_scheme[..pos], &after_scheme[pos..]),
        None => (after_scheme, "/"),
    };
    if authority.is_empty() {
        return Err(StorageError::Signing(format!(
            "request URL has no authority: {url}"
        )));
    }

    let (path, query) = match path_and_query.find('?') {
        Some(pos) => (&path_and_query[..pos], &path_and_query[pos + 1..]),
        None => (path_and_query, ""),
    };

    let host = if https {
        authority.strip_suffix(":443").unwrap_or(authority)
    } else {
        authority.strip_suffix(":80").unwrap_or(authority)
    };

    Ok((host, path, query))
}

/// Canonical query string: parameters sorted by name, values re-encoded,
/// valueless parameters normalized to `name=`.
fn canonical_query_string(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }

    let mut params: Vec<(String, String)> = query
        .split('&')
        .map(|pair| match pair.find('=') {
            Some(pos) => {
                let key = urlencoding::decode(&pair[..pos]).unwrap_or_else(|_| pair[..pos].into());
                let value =
                    urlencoding::decode(&pair[pos + 1..]).unwrap_or_else(|_| pair[pos + 1..].into());
                (uri_encode(&key), uri_encode(&value))
            }
            None => {
                let key = urlencoding::decode(pair).unwrap_or_else(|_| pair.into());
                (uri_encode(&key), String::new())
            }
        })
        .collect();
    params.sort_unstable();

    let mut out = String::with_capacity(query.len() + params.len() * 2);
    for (i, (key, value)) in params.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

/// RFC 3986 percent-encoding over a hex lookup table.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 16);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push('%');
                result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
    result
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    let mut output = [0u8; 32];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}
