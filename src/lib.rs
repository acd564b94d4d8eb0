//! s3kit - minimal async client for S3-compatible object stores
//!
//! Bucket lifecycle, object transfer (streaming + multipart), lazy listing
//! and presigned URLs over the S3 REST API with SigV4 signing. The hosting
//! application constructs one [`ObjectStoreClient`] per configuration,
//! calls [`ObjectStoreClient::initialize`] once at startup, and shares the
//! client by cloning (clones share the HTTP connection pool).

pub mod client;
pub mod config;
pub mod error;
pub mod signer;
pub mod types;

pub use client::ObjectStoreClient;
pub use config::ClientConfig;
pub use error::{Result, StoreError};
pub use types::{
    BucketDescriptor, ListEntry, MultipartConfig, ObjectDescriptor, ObjectMetadata,
};
