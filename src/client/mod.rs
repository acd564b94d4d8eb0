//! Object-store client: bucket lifecycle, object transfer, presigned URLs
//!
//! Every operation is a single authenticated HTTP exchange (multipart
//! uploads excepted) against an S3-compatible endpoint:
//! - HTTP/1.1 with a tuned, shared connection pool
//! - TCP_NODELAY and keepalive on every connection
//! - UNSIGNED-PAYLOAD for object bodies (skips SHA256 of the stream)
//! - automatic retry with jitter for transport failures and 429/503
//! - per-call cancellation via `CancellationToken`
//!
//! Nothing is cached client-side: every existence probe and listing hits
//! the server, so results always reflect current remote state.

pub mod list;
pub mod multipart;

use crate::config::ClientConfig;
use crate::error::{Result, StoreError};
use crate::signer::SignerV4;
use crate::types::{BucketDescriptor, MultipartConfig, ObjectMetadata, MIN_PART_SIZE};
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

/// Hex lookup table for key encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Provider maximum for presigned URL expiry: 7 days
pub const MAX_PRESIGN_EXPIRY_SECS: i64 = 7 * 24 * 3600;

/// Pseudo-random jitter in 0.0..1.0 from the clock's nanoseconds;
/// good enough for backoff spreading without pulling in rand.
fn rand_jitter() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Request addressing for the configured endpoint
#[derive(Clone)]
struct Endpoint {
    scheme: &'static str,
    /// host[:port], default ports omitted
    authority: String,
    path_style: bool,
}

impl Endpoint {
    fn from_config(config: &ClientConfig) -> Self {
        let scheme = if config.use_ssl { "https" } else { "http" };
        let default_port = if config.use_ssl { 443 } else { 80 };
        let authority = match config.port {
            Some(port) if port != default_port => format!("{}:{}", config.endpoint, port),
            _ => config.endpoint.clone(),
        };
        Self {
            scheme,
            authority,
            path_style: config.path_style,
        }
    }

    /// Service root, for ListBuckets
    fn service_url(&self) -> String {
        format!("{}://{}/", self.scheme, self.authority)
    }

    /// Bucket URL without trailing slash
    fn bucket_url(&self, bucket: &str) -> String {
        if self.path_style {
            format!("{}://{}/{}", self.scheme, self.authority, bucket)
        } else {
            format!("{}://{}.{}", self.scheme, bucket, self.authority)
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        let encoded_key = encode_object_key(key);
        let base = self.bucket_url(bucket);
        let mut url = String::with_capacity(base.len() + 1 + encoded_key.len());
        url.push_str(&base);
        url.push('/');
        url.push_str(&encoded_key);
        url
    }
}

/// Encode an object key for the URL path, preserving forward slashes.
/// Returns Cow::Borrowed when nothing needs encoding (the common case).
fn encode_object_key(key: &str) -> Cow<str> {
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

/// Turn caller metadata into request headers.
///
/// Keys already carrying an `x-amz-` prefix pass through verbatim;
/// everything else becomes `x-amz-meta-<key>`. Lowercased either way so
/// the signer's canonical form holds.
fn metadata_headers(headers: &mut BTreeMap<String, String>, metadata: &ObjectMetadata) {
    for (key, value) in metadata {
        let key = key.to_ascii_lowercase();
        if key.starts_with("x-amz-") {
            headers.insert(key, value.clone());
        } else {
            headers.insert(format!("x-amz-meta-{}", key), value.clone());
        }
    }
}

/// S3-compatible object-store client.
///
/// Clone is cheap: clones share the underlying HTTP connection pool.
/// Construction never touches the network; call [`initialize`] once from
/// the owning application before first use.
///
/// [`initialize`]: ObjectStoreClient::initialize
#[derive(Clone)]
pub struct ObjectStoreClient {
    http: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    signer: SignerV4,
    endpoint: Endpoint,
    default_bucket: String,
    multipart: MultipartConfig,
    timeout: Duration,
    max_retries: u32,
}

impl ObjectStoreClient {
    /// Build a client from configuration. No network I/O happens here.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = TlsConnector::new()
            .map_err(|e| StoreError::Connectivity(format!("TLS connector init: {}", e)))?;
        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        let signer = SignerV4::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            config.session_token.clone(),
            config.region.clone(),
        );

        let mut multipart = MultipartConfig::default();
        if let Some(part_size) = config.part_size {
            multipart = multipart.with_part_size(part_size);
        }

        Ok(Self {
            http: client,
            signer,
            endpoint: Endpoint::from_config(config),
            default_bucket: config.bucket.clone(),
            multipart,
            timeout: Duration::from_secs(config.request_timeout),
            max_retries: config.max_retries,
        })
    }

    /// Override multipart tuning
    pub fn with_multipart_config(mut self, config: MultipartConfig) -> Self {
        self.multipart = MultipartConfig {
            part_size: config.part_size.max(MIN_PART_SIZE),
            concurrency: config.concurrency.max(1),
            threshold: config.threshold,
        };
        self
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The configured default bucket
    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    /// One-time startup hook: ensures the configured default bucket exists,
    /// creating it in the configured default region if absent.
    ///
    /// Failure here is the caller's decision to act on - typically abort
    /// startup. It is never swallowed.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        let bucket = self.default_bucket.clone();
        let region = self.signer.region().to_string();
        tracing::info!(%bucket, %region, "initializing object store client");

        if !self.bucket_exists(&bucket, cancel).await? {
            self.create_bucket(&bucket, &region, cancel).await?;
            tracing::info!(%bucket, "default bucket created");
        }
        Ok(())
    }

    // =========================================================================
    // Bucket operations
    // =========================================================================

    /// Probe whether a bucket exists.
    ///
    /// A 404 means `false`; any other server answer (including 403, which
    /// means the bucket exists but is someone else's) means `true`. Only
    /// transport failure is an error.
    pub async fn bucket_exists(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let url = self.endpoint.bucket_url(name);
        let (status, _, _) = self
            .request_with_retry(Method::HEAD, &url, BTreeMap::new(), Bytes::new(), false, cancel)
            .await?;

        let exists = status != StatusCode::NOT_FOUND;
        tracing::debug!(bucket = name, exists, status = %status, "bucket existence probe");
        Ok(exists)
    }

    /// Create a bucket. Idempotent: an existing bucket owned by this
    /// identity is success, not a conflict.
    pub async fn create_bucket(
        &self,
        name: &str,
        region: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.bucket_exists(name, cancel).await? {
            tracing::debug!(bucket = name, "bucket already present, create skipped");
            return Ok(());
        }

        let url = self.endpoint.bucket_url(name);
        let mut headers = BTreeMap::new();

        // us-east-1 is the implied default; sending its LocationConstraint
        // is rejected by AWS.
        let body = if region.is_empty() || region == "us-east-1" {
            Bytes::new()
        } else {
            headers.insert("content-type".to_string(), "application/xml".to_string());
            let xml = format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                region
            );
            headers.insert("content-length".to_string(), xml.len().to_string());
            Bytes::from(xml)
        };

        let (status, _, body_bytes) = self
            .request_with_retry(Method::PUT, &url, headers, body, true, cancel)
            .await?;

        if !status.is_success() {
            let err = StoreError::from_response(status, &body_bytes);
            // Lost the race against a concurrent create by the same identity
            if err.is_owned_bucket_conflict() {
                return Ok(());
            }
            return Err(err);
        }

        tracing::debug!(bucket = name, region, "bucket created");
        Ok(())
    }

    /// Remove a bucket. Idempotent: removing an absent bucket succeeds.
    /// A bucket that still holds objects fails with [`StoreError::NotEmpty`].
    pub async fn remove_bucket(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        if !self.bucket_exists(name, cancel).await? {
            tracing::debug!(bucket = name, "bucket already absent, remove skipped");
            return Ok(());
        }

        let url = self.endpoint.bucket_url(name);
        let (status, _, body_bytes) = self
            .request_with_retry(Method::DELETE, &url, BTreeMap::new(), Bytes::new(), false, cancel)
            .await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !status.is_success() {
            return Err(StoreError::from_response(status, &body_bytes));
        }

        tracing::debug!(bucket = name, "bucket removed");
        Ok(())
    }

    /// List all buckets owned by the authenticated identity.
    ///
    /// A single eager request; the S3 bucket list is server-side bounded
    /// and carries no pagination.
    pub async fn list_buckets(&self, cancel: &CancellationToken) -> Result<Vec<BucketDescriptor>> {
        let url = self.endpoint.service_url();
        let (status, _, body_bytes) = self
            .request_with_retry(Method::GET, &url, BTreeMap::new(), Bytes::new(), false, cancel)
            .await?;

        if !status.is_success() {
            return Err(StoreError::from_response(status, &body_bytes));
        }

        let buckets = parse_bucket_list(&body_bytes)?;
        tracing::debug!(count = buckets.len(), "listed buckets");
        Ok(buckets)
    }

    // =========================================================================
    // Object operations
    // =========================================================================

    /// Upload an object from an async byte stream.
    ///
    /// A known size below the multipart threshold goes up as one buffered
    /// PUT; anything larger or of unknown size streams through a multipart
    /// upload with bounded part concurrency. When `size` is declared it must
    /// match the bytes actually read, or the call fails with
    /// [`StoreError::SizeMismatch`] without leaving a completed object.
    ///
    /// On error the remote object state is undefined; re-issuing the same
    /// call overwrites whatever a prior attempt left behind.
    ///
    /// Returns the object's ETag.
    pub async fn put_object<R>(
        &self,
        bucket: &str,
        key: &str,
        mut reader: R,
        size: Option<u64>,
        metadata: Option<&ObjectMetadata>,
        cancel: &CancellationToken,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + Send,
    {
        match size {
            Some(declared) if declared < self.multipart.threshold => {
                let data = self.read_declared(&mut reader, declared).await?;
                self.put_buffered(bucket, key, data, metadata, cancel).await
            }
            _ => {
                self.upload_stream(bucket, key, &mut reader, size, metadata, cancel)
                    .await
            }
        }
    }

    /// Upload an object from an in-memory buffer in a single PUT.
    pub async fn put_object_bytes(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        metadata: Option<&ObjectMetadata>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.put_buffered(bucket, key, data, metadata, cancel).await
    }

    /// Download an object into memory.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let url = self.endpoint.object_url(bucket, key);
        let (status, _, body_bytes) = self
            .request_with_retry(Method::GET, &url, BTreeMap::new(), Bytes::new(), false, cancel)
            .await?;

        if !status.is_success() {
            return Err(StoreError::from_response(status, &body_bytes));
        }

        Ok(body_bytes)
    }

    /// Delete an object. Idempotent: succeeds whether or not the key existed.
    pub async fn remove_object(
        &self,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = self.endpoint.object_url(bucket, key);
        let (status, _, body_bytes) = self
            .request_with_retry(Method::DELETE, &url, BTreeMap::new(), Bytes::new(), false, cancel)
            .await?;

        // S3 answers 204 for absent keys already, but absorb a 404 from
        // stricter implementations too.
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !status.is_success() {
            return Err(StoreError::from_response(status, &body_bytes));
        }

        tracing::debug!(bucket, key, "object removed");
        Ok(())
    }

    /// Compute a presigned URL. Pure computation - the server is never
    /// contacted. Expiry must be positive and at most 7 days.
    pub fn presigned_url(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        expires_secs: i64,
        extra_params: Option<&BTreeMap<String, String>>,
    ) -> Result<String> {
        if expires_secs <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "presign expiry must be positive, got {}",
                expires_secs
            )));
        }
        if expires_secs > MAX_PRESIGN_EXPIRY_SECS {
            return Err(StoreError::InvalidArgument(format!(
                "presign expiry {}s exceeds the 7-day maximum",
                expires_secs
            )));
        }

        let url = self.endpoint.object_url(bucket, key);
        Ok(self
            .signer
            .presign(method.as_str(), &url, expires_secs as u64, extra_params))
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    /// Buffer exactly `declared` bytes from the reader, failing on both
    /// short reads and surplus bytes.
    async fn read_declared<R>(&self, reader: &mut R, declared: u64) -> Result<Bytes>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = vec![0u8; declared as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if (filled as u64) < declared {
            return Err(StoreError::SizeMismatch {
                declared,
                actual: filled as u64,
            });
        }

        // The stream must be exhausted at the declared size
        let mut probe = [0u8; 1];
        if reader.read(&mut probe).await? != 0 {
            return Err(StoreError::SizeMismatch {
                declared,
                actual: declared + 1,
            });
        }

        Ok(Bytes::from(buf))
    }

    /// Single-PUT upload of a complete in-memory body
    pub(crate) async fn put_buffered(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        metadata: Option<&ObjectMetadata>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = self.endpoint.object_url(bucket, key);

        let mut headers = BTreeMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/octet-stream".to_string(),
        );
        headers.insert("content-length".to_string(), data.len().to_string());
        if let Some(meta) = metadata {
            metadata_headers(&mut headers, meta);
        }

        let size = data.len();
        let (status, resp_headers, body_bytes) = self
            .request_with_retry(Method::PUT, &url, headers, data, false, cancel)
            .await?;

        if !status.is_success() {
            return Err(StoreError::from_response(status, &body_bytes));
        }

        tracing::debug!(bucket, key, size, "object stored");
        Ok(etag_from_headers(&resp_headers))
    }

    /// Send a request, re-signing and retrying on transient failure.
    ///
    /// Transport errors, timeouts and 429/503 retry up to `max_retries`
    /// times with exponential backoff plus jitter. Every attempt re-signs
    /// since the SigV4 timestamp moves. Any HTTP status is an Ok result;
    /// callers map non-2xx into the error taxonomy.
    ///
    /// `sign_body` selects exact payload hashing (small XML bodies) over
    /// UNSIGNED-PAYLOAD (object data).
    pub(crate) async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Bytes,
        sign_body: bool,
        cancel: &CancellationToken,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        self.request_with_attempts(method, url, headers, body, sign_body, cancel, self.max_retries)
            .await
    }

    /// Like [`request_with_retry`] but with an explicit retry budget.
    ///
    /// A budget of zero makes exactly one attempt. CompleteMultipartUpload
    /// needs that: replaying a complete the server already committed fails
    /// with NoSuchUpload even though the upload succeeded.
    ///
    /// [`request_with_retry`]: ObjectStoreClient::request_with_retry
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn request_with_attempts(
        &self,
        method: Method,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Bytes,
        sign_body: bool,
        cancel: &CancellationToken,
        max_retries: u32,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let mut last_err: Option<StoreError> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let base_ms = 100u64 * (1 << (attempt - 1));
                let jitter = (base_ms as f64 * 0.2 * rand_jitter()) as u64;
                let delay = Duration::from_millis(base_ms + jitter);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                tracing::debug!(url, attempt, "retrying request");
            }

            let signed_headers = if body.is_empty() {
                self.signer.sign(method.as_str(), url, headers.clone(), b"")
            } else if sign_body {
                self.signer.sign(method.as_str(), url, headers.clone(), &body)
            } else {
                self.signer
                    .sign_unsigned_payload(method.as_str(), url, headers.clone())
            };

            let mut req = Request::builder().method(method.clone()).uri(url);
            for (key, value) in signed_headers.iter() {
                req = req.header(key, value);
            }
            let request = req
                .body(Full::new(body.clone()))
                .map_err(|e| StoreError::InvalidArgument(format!("request build: {}", e)))?;

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                result = tokio::time::timeout(self.timeout, self.http.request(request)) => {
                    match result {
                        Err(_) => {
                            last_err = Some(StoreError::Connectivity(format!(
                                "request timed out after {:?}", self.timeout
                            )));
                            continue;
                        }
                        Ok(Err(e)) => {
                            last_err = Some(StoreError::Connectivity(format!(
                                "request failed: {}", e
                            )));
                            continue;
                        }
                        Ok(Ok(response)) => response,
                    }
                }
            };

            let status = response.status();
            if (status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::SERVICE_UNAVAILABLE)
                && attempt < max_retries
            {
                // Drain the body so the connection returns to the pool
                let _ = response.collect().await;
                last_err = Some(StoreError::Connectivity(format!(
                    "server throttled with {}",
                    status
                )));
                continue;
            }

            let resp_headers = response.headers().clone();
            let body_bytes = match response.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    last_err = Some(StoreError::Connectivity(format!("body read: {}", e)));
                    continue;
                }
            };

            return Ok((status, resp_headers, body_bytes));
        }

        Err(last_err
            .unwrap_or_else(|| StoreError::Connectivity("max retries exceeded".to_string())))
    }

    pub(crate) fn endpoint_object_url(&self, bucket: &str, key: &str) -> String {
        self.endpoint.object_url(bucket, key)
    }

    pub(crate) fn endpoint_bucket_url(&self, bucket: &str) -> String {
        self.endpoint.bucket_url(bucket)
    }

    pub(crate) fn multipart_config(&self) -> &MultipartConfig {
        &self.multipart
    }
}

/// Extract the ETag response header, stripped of quotes
pub(crate) fn etag_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('"').to_string())
        .unwrap_or_default()
}

/// Parse a ListAllMyBucketsResult document
fn parse_bucket_list(xml_data: &[u8]) -> Result<Vec<BucketDescriptor>> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut buckets = Vec::new();
    let mut current: Option<BucketDescriptor> = None;
    let mut current_text = String::with_capacity(64);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Bucket" {
                    current = Some(BucketDescriptor {
                        name: String::new(),
                        creation_date: None,
                    });
                }
            }
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Name" => {
                        if let Some(ref mut bucket) = current {
                            bucket.name = std::mem::take(&mut current_text);
                        }
                    }
                    b"CreationDate" => {
                        if let Some(ref mut bucket) = current {
                            bucket.creation_date = Some(std::mem::take(&mut current_text));
                        }
                    }
                    b"Bucket" => {
                        if let Some(bucket) = current.take() {
                            buckets.push(bucket);
                        }
                    }
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(StoreError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path_style: bool) -> ClientConfig {
        ClientConfig {
            endpoint: "s3.example.com".to_string(),
            port: None,
            use_ssl: true,
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            session_token: None,
            part_size: None,
            path_style,
            bucket: "default-bucket".to_string(),
            region: "us-east-1".to_string(),
            request_timeout: 300,
            max_retries: 3,
        }
    }

    #[test]
    fn test_path_style_addressing() {
        let ep = Endpoint::from_config(&config(true));
        assert_eq!(ep.service_url(), "https://s3.example.com/");
        assert_eq!(ep.bucket_url("photos"), "https://s3.example.com/photos");
        assert_eq!(
            ep.object_url("photos", "2024/cat.jpg"),
            "https://s3.example.com/photos/2024/cat.jpg"
        );
    }

    #[test]
    fn test_virtual_hosted_addressing() {
        let ep = Endpoint::from_config(&config(false));
        assert_eq!(ep.bucket_url("photos"), "https://photos.s3.example.com");
        assert_eq!(
            ep.object_url("photos", "cat.jpg"),
            "https://photos.s3.example.com/cat.jpg"
        );
    }

    #[test]
    fn test_non_default_port_kept() {
        let mut cfg = config(true);
        cfg.port = Some(9000);
        cfg.use_ssl = false;
        let ep = Endpoint::from_config(&cfg);
        assert_eq!(ep.bucket_url("b"), "http://s3.example.com:9000/b");

        // Default port is dropped from the authority
        let mut cfg = config(true);
        cfg.port = Some(443);
        let ep = Endpoint::from_config(&cfg);
        assert_eq!(ep.bucket_url("b"), "https://s3.example.com/b");
    }

    #[test]
    fn test_encode_object_key() {
        let result = encode_object_key("path/to/file.txt");
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(result, "path/to/file.txt");

        let result = encode_object_key("path/with spaces.txt");
        assert!(matches!(result, Cow::Owned(_)));
        assert_eq!(result, "path/with%20spaces.txt");
    }

    #[test]
    fn test_metadata_headers_prefixing() {
        let mut meta = ObjectMetadata::new();
        meta.insert("Author".to_string(), "alice".to_string());
        meta.insert("x-amz-storage-class".to_string(), "STANDARD".to_string());

        let mut headers = BTreeMap::new();
        metadata_headers(&mut headers, &meta);

        assert_eq!(headers.get("x-amz-meta-author").unwrap(), "alice");
        assert_eq!(headers.get("x-amz-storage-class").unwrap(), "STANDARD");
    }

    #[test]
    fn test_parse_bucket_list() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<ListAllMyBucketsResult>
  <Owner><ID>abc</ID></Owner>
  <Buckets>
    <Bucket><Name>alpha</Name><CreationDate>2024-01-15T10:00:00.000Z</CreationDate></Bucket>
    <Bucket><Name>beta</Name><CreationDate>2024-02-20T11:30:00.000Z</CreationDate></Bucket>
  </Buckets>
</ListAllMyBucketsResult>"#;

        let buckets = parse_bucket_list(xml).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].name, "alpha");
        assert_eq!(
            buckets[0].creation_date.as_deref(),
            Some("2024-01-15T10:00:00.000Z")
        );
        assert_eq!(buckets[1].name, "beta");
    }

    #[test]
    fn test_parse_bucket_list_empty() {
        let xml = br#"<ListAllMyBucketsResult><Buckets></Buckets></ListAllMyBucketsResult>"#;
        assert!(parse_bucket_list(xml).unwrap().is_empty());
    }

    #[test]
    fn test_presign_expiry_bounds() {
        let client = ObjectStoreClient::new(&config(true)).unwrap();

        let err = client
            .presigned_url(Method::GET, "b", "k", 0, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let err = client
            .presigned_url(Method::GET, "b", "k", -5, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let err = client
            .presigned_url(Method::GET, "b", "k", MAX_PRESIGN_EXPIRY_SECS + 1, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let url = client
            .presigned_url(Method::PUT, "b", "k", 3600, None)
            .unwrap();
        assert!(url.starts_with("https://s3.example.com/b/k?"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[test]
    fn test_client_is_clone() {
        let client = ObjectStoreClient::new(&config(true)).unwrap();
        let clone = client.clone();
        assert_eq!(clone.default_bucket(), "default-bucket");
    }

    #[tokio::test]
    async fn test_read_declared_detects_short_stream() {
        let client = ObjectStoreClient::new(&config(true)).unwrap();
        let data: &[u8] = b"hello";

        let err = client
            .read_declared(&mut &data[..], 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SizeMismatch {
                declared: 10,
                actual: 5
            }
        ));
    }

    #[tokio::test]
    async fn test_read_declared_detects_surplus() {
        let client = ObjectStoreClient::new(&config(true)).unwrap();
        let data: &[u8] = b"hello world";

        let err = client.read_declared(&mut &data[..], 5).await.unwrap_err();
        assert!(matches!(err, StoreError::SizeMismatch { declared: 5, .. }));
    }

    #[tokio::test]
    async fn test_read_declared_exact() {
        let client = ObjectStoreClient::new(&config(true)).unwrap();
        let data: &[u8] = b"hello";

        let bytes = client.read_declared(&mut &data[..], 5).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }
}
