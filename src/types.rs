//! Descriptors and wire-level response structures

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller-supplied metadata headers, attached verbatim at upload time.
///
/// Keys without an `x-amz-` prefix are sent as `x-amz-meta-<key>`.
pub type ObjectMetadata = BTreeMap<String, String>;

/// A bucket as reported by the service. Rebuilt on every `list_buckets`
/// call - never cached client-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketDescriptor {
    /// Bucket name, unique per endpoint
    pub name: String,
    /// Creation timestamp string as reported by the server
    pub creation_date: Option<String>,
}

/// One object in a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Object key
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Last modified timestamp (optional)
    pub last_modified: Option<String>,
    /// ETag (optional)
    pub etag: Option<String>,
    /// Storage class (STANDARD, STANDARD_IA, GLACIER, etc.)
    pub storage_class: Option<String>,
}

impl ObjectDescriptor {
    pub fn new(key: String, size: u64) -> Self {
        Self {
            key,
            size,
            last_modified: None,
            etag: None,
            storage_class: None,
        }
    }
}

/// One entry yielded by `list_objects`
#[derive(Debug, Clone)]
pub enum ListEntry {
    /// A concrete object
    Object(ObjectDescriptor),
    /// Synthetic directory marker from non-recursive listing, ending in
    /// the delimiter (e.g. "photos/2024/")
    CommonPrefix(String),
}

impl ListEntry {
    /// The key or prefix string, whichever this entry carries
    pub fn name(&self) -> &str {
        match self {
            ListEntry::Object(obj) => &obj.key,
            ListEntry::CommonPrefix(prefix) => prefix,
        }
    }
}

/// One page of a ListObjectsV2 response
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectDescriptor>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// Open multipart upload handle returned by CreateMultipartUpload
#[derive(Debug, Clone)]
pub struct MultipartInit {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Part number + ETag pair required by CompleteMultipartUpload
#[derive(Debug, Clone)]
pub struct CompletedPart {
    /// Part number (1-10000)
    pub part_number: u32,
    /// ETag returned from UploadPart
    pub etag: String,
}

/// S3 minimum part size for all parts except the last
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Multipart upload tuning
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Part size in bytes, clamped to the S3 minimum of 5MB
    pub part_size: usize,
    /// Concurrent part uploads per put_object call
    pub concurrency: usize,
    /// Uploads at or above this size (or of unknown size) go multipart
    pub threshold: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            part_size: 16 * 1024 * 1024,
            concurrency: 4,
            threshold: 64 * 1024 * 1024,
        }
    }
}

impl MultipartConfig {
    pub fn with_part_size(mut self, size: usize) -> Self {
        self.part_size = size.max(MIN_PART_SIZE);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_size_clamped_to_s3_minimum() {
        let config = MultipartConfig::default().with_part_size(1024);
        assert_eq!(config.part_size, MIN_PART_SIZE);

        let config = MultipartConfig::default().with_part_size(32 * 1024 * 1024);
        assert_eq!(config.part_size, 32 * 1024 * 1024);
    }

    #[test]
    fn test_concurrency_at_least_one() {
        let config = MultipartConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_list_entry_name() {
        let entry = ListEntry::Object(ObjectDescriptor::new("a/x".to_string(), 3));
        assert_eq!(entry.name(), "a/x");

        let entry = ListEntry::CommonPrefix("a/b/".to_string());
        assert_eq!(entry.name(), "a/b/");
    }
}
