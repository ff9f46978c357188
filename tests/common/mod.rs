//! In-process S3-compatible store used by the integration tests
//!
//! Serves the multipart-upload, get, head and delete surface over a real
//! HTTP/1.1 listener, records every request it sees, and verifies the
//! Content-MD5 of uploaded parts against the bytes actually received.

#![allow(dead_code)]

use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One request as seen by the store
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub storage_class: String,
}

#[derive(Debug, Default)]
pub struct PendingUpload {
    pub key: String,
    pub parts: Vec<(u32, Bytes)>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub storage_class: String,
}

#[derive(Default)]
pub struct StoreState {
    pub objects: HashMap<String, StoredObject>,
    pub uploads: HashMap<String, PendingUpload>,
    pub requests: Vec<RecordedRequest>,
    /// Answer every request with this status/body when set
    pub fail_with: Option<(u16, String)>,
    /// Misbehave: 200 initiate response without an UploadId element
    pub omit_upload_id: bool,
    /// Misbehave: 200 part-upload response without an ETag header
    pub omit_part_etag: bool,
    next_upload: u64,
}

pub struct MockStore {
    pub endpoint: String,
    state: Arc<Mutex<StoreState>>,
    handle: JoinHandle<()>,
}

impl MockStore {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(StoreState::default()));

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| handle_request(conn_state.clone(), req));
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Self {
            endpoint: format!("http://{addr}"),
            state,
            handle,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    /// Part-upload requests, in arrival order.
    pub fn part_uploads(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "PUT" && r.query.contains("partNumber="))
            .collect()
    }

    /// Bodies of complete-multipart requests, in arrival order.
    pub fn complete_bodies(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| {
                r.method == "POST"
                    && r.query.contains("uploadId=")
                    && !r.query.contains("partNumber=")
            })
            .map(|r| String::from_utf8_lossy(&r.body).to_string())
            .collect()
    }

    pub fn fail_with(&self, status: u16, message: &str) {
        self.state().fail_with = Some((status, message.to_string()));
    }

    pub fn omit_upload_id(&self) {
        self.state().omit_upload_id = true;
    }

    pub fn omit_part_etag(&self) {
        self.state().omit_part_etag = true;
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// "/bucket/a/b" -> "a/b"
fn object_key(path: &str) -> String {
    let without_bucket = path
        .trim_start_matches('/')
        .splitn(2, '/')
        .nth(1)
        .unwrap_or("");
    urlencoding::decode(without_bucket)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| without_bucket.to_string())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            Some(
                urlencoding::decode(value)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| value.to_string()),
            )
        } else {
            None
        }
    })
}

fn text_response(status: u16, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn xml_response(body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(200)
        .header("content-type", "application/xml")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

async fn handle_request(
    state: Arc<Mutex<StoreState>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let mut state = state.lock().unwrap();
    state.requests.push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        query: query.clone(),
        headers: headers.clone(),
        body: body.clone(),
    });

    if let Some((status, message)) = state.fail_with.clone() {
        return Ok(text_response(status, message));
    }

    let key = object_key(&path);

    let response = if method == Method::POST && query.split('&').any(|p| p == "uploads") {
        initiate(&mut state, key, &headers)
    } else if method == Method::PUT && query.contains("partNumber=") {
        upload_part(&mut state, &query, &headers, body)
    } else if method == Method::POST && query.contains("uploadId=") {
        complete(&mut state, &query)
    } else {
        match method {
            Method::GET => get_object(&state, &key),
            Method::HEAD => head_object(&state, &key),
            Method::DELETE => {
                if state.objects.remove(&key).is_some() {
                    text_response(204, String::new())
                } else {
                    text_response(404, no_such_key(&key))
                }
            }
            _ => text_response(400, "unsupported".to_string()),
        }
    };

    Ok(response)
}

fn initiate(
    state: &mut StoreState,
    key: String,
    headers: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    state.next_upload += 1;
    let upload_id = format!("upload-{}", state.next_upload);

    if state.omit_upload_id {
        return xml_response(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <InitiateMultipartUploadResult><Bucket>test-bucket</Bucket>\
             </InitiateMultipartUploadResult>"
                .to_string(),
        );
    }

    state.uploads.insert(
        upload_id.clone(),
        PendingUpload {
            key: key.clone(),
            parts: Vec::new(),
            content_type: headers.get("content-type").cloned(),
            content_encoding: headers.get("content-encoding").cloned(),
            storage_class: headers
                .get("x-amz-storage-class")
                .cloned()
                .unwrap_or_else(|| "STANDARD".to_string()),
        },
    );

    xml_response(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <InitiateMultipartUploadResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <Bucket>test-bucket</Bucket><Key>{key}</Key><UploadId>{upload_id}</UploadId>\
         </InitiateMultipartUploadResult>"
    ))
}

fn upload_part(
    state: &mut StoreState,
    query: &str,
    headers: &HashMap<String, String>,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let Some(part_number) = query_param(query, "partNumber").and_then(|n| n.parse::<u32>().ok())
    else {
        return text_response(400, "invalid partNumber".to_string());
    };
    let Some(upload_id) = query_param(query, "uploadId") else {
        return text_response(400, "missing uploadId".to_string());
    };

    // Integrity check: the declared digest must match the received bytes.
    let expected_md5 = base64::engine::general_purpose::STANDARD.encode(md5::compute(&body).0);
    if headers.get("content-md5") != Some(&expected_md5) {
        return text_response(400, "BadDigest".to_string());
    }

    let omit_etag = state.omit_part_etag;
    let Some(upload) = state.uploads.get_mut(&upload_id) else {
        return text_response(404, "NoSuchUpload".to_string());
    };

    let etag = format!("\"{:x}\"", md5::compute(&body));
    upload.parts.push((part_number, body));

    let mut builder = Response::builder().status(200);
    if !omit_etag {
        builder = builder.header("etag", etag);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

fn complete(state: &mut StoreState, query: &str) -> Response<Full<Bytes>> {
    let Some(upload_id) = query_param(query, "uploadId") else {
        return text_response(400, "missing uploadId".to_string());
    };
    let Some(mut upload) = state.uploads.remove(&upload_id) else {
        return text_response(404, "NoSuchUpload".to_string());
    };

    upload.parts.sort_by_key(|(number, _)| *number);
    let mut data = Vec::new();
    for (_, bytes) in &upload.parts {
        data.extend_from_slice(bytes);
    }
    let etag = format!("\"{:x}-{}\"", md5::compute(&data), upload.parts.len());
    let key = upload.key.clone();

    state.objects.insert(
        key.clone(),
        StoredObject {
            data: Bytes::from(data),
            etag: etag.clone(),
            content_type: upload.content_type,
            content_encoding: upload.content_encoding,
            storage_class: upload.storage_class,
        },
    );

    xml_response(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <CompleteMultipartUploadResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <Bucket>test-bucket</Bucket><Key>{key}</Key><ETag>{etag}</ETag>\
         </CompleteMultipartUploadResult>"
    ))
}

fn get_object(state: &StoreState, key: &str) -> Response<Full<Bytes>> {
    match state.objects.get(key) {
        Some(object) => {
            let mut builder = Response::builder()
                .status(200)
                .header("etag", &object.etag)
                .header("x-amz-storage-class", &object.storage_class)
                .header("content-length", object.data.len());
            if let Some(content_type) = &object.content_type {
                builder = builder.header("content-type", content_type);
            }
            if let Some(content_encoding) = &object.content_encoding {
                builder = builder.header("content-encoding", content_encoding);
            }
            builder.body(Full::new(object.data.clone())).unwrap()
        }
        None => text_response(404, no_such_key(key)),
    }
}

fn head_object(state: &StoreState, key: &str) -> Response<Full<Bytes>> {
    match state.objects.get(key) {
        Some(object) => {
            let mut builder = Response::builder()
                .status(200)
                .header("etag", &object.etag)
                .header("x-amz-storage-class", &object.storage_class)
                .header("content-length", object.data.len());
            if let Some(content_type) = &object.content_type {
                builder = builder.header("content-type", content_type);
            }
            if let Some(content_encoding) = &object.content_encoding {
                builder = builder.header("content-encoding", content_encoding);
            }
            builder.body(Full::new(Bytes::new())).unwrap()
        }
        None => text_response(404, String::new()),
    }
}

fn no_such_key(key: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Error><Code>NoSuchKey</Code><Key>{key}</Key></Error>"
    )
}
