//! Blob storage boundary.
//!
//! The pipeline only needs three operations from the store: `get` an input
//! object (bytes, length and the encryption setting the store reports for
//! it), `head` an object (size metadata before converting tar content) and
//! `put` the merged archive (bytes, content type and an optional encryption
//! setting). [`BlobStore`] captures exactly that, so the retriever and the
//! archive store can be exercised against an in-memory backend in tests.
//!
//! # Backend URLs
//!
//! ```text
//! s3://                 # region from the environment
//! s3://eu-west-1        # explicit region
//! s3://?endpoint=http://localhost:9000   # S3-compatible endpoint (MinIO)
//! file:///srv/blobs     # {root}/{bucket}/{key}
//! memory://             # for testing
//! ```

pub mod error;
pub mod naming;
pub mod object_store_backend;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::{StoreError, StoreResult};
pub use object_store_backend::ObjectStoreBlobStore;

/// Object metadata attribute carrying the encryption setting on the
/// in-memory backend. S3 uses its native server-side encryption header.
pub const ENCRYPTION_ATTRIBUTE: &str = "server-side-encryption";

/// Media type of every archive written by the pipeline.
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Parsed backend specification from CLI/config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSpec {
    /// The scheme (s3, file, memory)
    pub scheme: String,
    /// Local root directory (file:// only)
    pub root: String,
    /// Optional region (s3 only)
    pub region: Option<String>,
    /// Optional endpoint override for S3-compatible stores
    pub endpoint: Option<String>,
}

impl StoreSpec {
    /// Parse a backend URL like `s3://eu-west-1` or `file:///path`.
    pub fn parse(url: &str) -> StoreResult<Self> {
        let parsed = url::Url::parse(url).map_err(|e| StoreError::InvalidSpec {
            spec: url.to_string(),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_string();
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .map(|h| h.to_string());

        let query = |name: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.to_string())
        };

        let spec = match scheme.as_str() {
            "memory" => Self {
                scheme,
                root: String::new(),
                region: None,
                endpoint: None,
            },
            "file" => {
                let root = parsed.path().to_string();
                if root.is_empty() || root == "/" {
                    return Err(StoreError::InvalidSpec {
                        spec: url.to_string(),
                        reason: "file URL must include a root directory".to_string(),
                    });
                }
                Self {
                    scheme,
                    root,
                    region: None,
                    endpoint: None,
                }
            }
            "s3" => Self {
                scheme,
                root: String::new(),
                region: host.or_else(|| query("region")),
                endpoint: query("endpoint"),
            },
            other => {
                return Err(StoreError::InvalidSpec {
                    spec: url.to_string(),
                    reason: format!("unsupported scheme: {}", other),
                })
            }
        };

        Ok(spec)
    }

    /// Check if this is a memory store (for testing).
    pub fn is_memory(&self) -> bool {
        self.scheme == "memory"
    }

    /// Check if this is a local file store.
    pub fn is_file(&self) -> bool {
        self.scheme == "file"
    }
}

/// Address of one object: bucket (container) plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A fully downloaded object.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Bytes,
    /// Size reported by the store
    pub content_length: u64,
    /// Server-side encryption setting reported for this object, if any
    pub encryption: Option<String>,
}

/// Object metadata without the body.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub size: u64,
    pub encryption: Option<String>,
}

/// Write parameters for [`BlobStore::put`].
#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    pub content_type: Option<String>,
    /// Attached only when `Some`; otherwise the store default applies
    pub encryption: Option<String>,
}

/// The blob storage trait.
///
/// Implementations handle the actual I/O to S3-compatible stores.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Download an object.
    ///
    /// # Returns
    ///
    /// - `Ok(FetchedObject)` with the body and metadata
    /// - `Err(StoreError::NotFound)` if the object doesn't exist
    async fn get(&self, location: &ObjectLocation) -> StoreResult<FetchedObject>;

    /// Fetch object metadata only.
    async fn head(&self, location: &ObjectLocation) -> StoreResult<ObjectHead>;

    /// Upload an object, replacing any existing one at `location`.
    async fn put(&self, location: &ObjectLocation, bytes: Bytes, request: PutRequest)
        -> StoreResult<()>;
}
