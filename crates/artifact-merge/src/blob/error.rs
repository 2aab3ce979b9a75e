//! Error types for blob storage operations.

use thiserror::Error;

/// Result type for blob store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object not found.
    #[error("object not found: {location}")]
    NotFound { location: String },

    /// Access denied to the storage backend.
    #[error("access denied: {message}")]
    AccessDenied { message: String },

    /// Invalid store specification (URL parsing failed).
    #[error("invalid store spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    /// Network or I/O error.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic error from the underlying object store.
    #[error("object store error: {0}")]
    ObjectStore(object_store::Error),
}

impl StoreError {
    /// Returns true if this error indicates the object was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is an access/permission error.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied { .. })
    }

    /// Create from an object_store error with context about the object.
    pub fn from_object_store(err: object_store::Error, location: &str) -> Self {
        match &err {
            object_store::Error::NotFound { .. } => StoreError::NotFound {
                location: location.to_string(),
            },
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. } => StoreError::AccessDenied {
                message: format!("{}: {}", location, err),
            },
            _ => StoreError::ObjectStore(err),
        }
    }
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        StoreError::from_object_store(err, "unknown")
    }
}
