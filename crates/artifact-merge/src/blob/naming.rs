//! Naming conventions for blob keys and local staging.
//!
//! # Layout
//!
//! ```text
//! s3://{region}         -> bucket = S3 bucket, key = object key
//! file:///{root}        -> {root}/{bucket}/{key}
//! memory://             -> one in-memory store per bucket
//! ```
//!
//! Bucket names become directory names for the local backend, and artifact
//! names become temp-file prefixes during tar conversion, so both go through
//! [`sanitize_id`] first.

use object_store::path::Path;
use std::path::PathBuf;

/// Object key as an `object_store` path.
///
/// Leading slashes are dropped: `"/builds/a.zip"` and `"builds/a.zip"` name
/// the same object.
pub fn object_path(key: &str) -> Path {
    Path::from(key.trim_start_matches('/'))
}

/// Directory backing `bucket` under a local store root.
///
/// Returns: `{root}/{bucket}`
pub fn bucket_dir(root: &str, bucket: &str) -> PathBuf {
    PathBuf::from(root).join(sanitize_id(bucket))
}

/// Prefix for a staged conversion file.
///
/// Returns: `{name}-`
pub fn staging_prefix(name: &str) -> String {
    format!("{}-", sanitize_id(name))
}

/// Sanitize an identifier for use in file names.
/// Replaces potentially problematic characters.
pub fn sanitize_id(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    // "." and ".." would resolve to the parent when joined as a directory
    if sanitized.chars().all(|c| c == '.') {
        sanitized.replace('.', "_")
    } else {
        sanitized
    }
}
