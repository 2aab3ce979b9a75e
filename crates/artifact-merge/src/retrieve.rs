//! Artifact retrieval: concurrent fetch of all declared inputs.
//!
//! Every input is fetched on the calling task with
//! [`futures::future::try_join_all`], so fetches overlap on I/O while
//! results come back in declared order. Tar-family inputs are converted to
//! zip on a blocking worker before being handed to the merge engine.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use thiserror::Error;

use crate::blob::{BlobStore, ObjectLocation, StoreError};
use crate::limits::MergeLimits;
use crate::normalize::{self, is_tar_family, ConversionError, StagingArea};

/// One declared input, before fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub location: ObjectLocation,
    /// Stable label used for subfolder names and revision markers
    pub name: String,
    pub revision: Option<String>,
}

impl ArtifactRef {
    pub fn new(location: ObjectLocation, name: impl Into<String>) -> Self {
        Self {
            location,
            name: name.into(),
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// A fetched input, always in zip format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedArtifact {
    pub name: String,
    pub revision: Option<String>,
    pub content: Bytes,
    /// Length of `content`; for converted inputs, the zip's length
    pub content_length: u64,
    /// Encryption setting the store reported for the source object
    pub encryption: Option<String>,
}

/// Retrieval failures. The first one aborts the whole fetch.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("failed to fetch artifact '{name}' from {location}: {source}")]
    Fetch {
        name: String,
        location: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to convert artifact '{name}': {source}")]
    Conversion {
        name: String,
        #[source]
        source: ConversionError,
    },

    #[error("artifact '{name}' at {location}: read {actual} bytes, store reported {expected}")]
    SizeMismatch {
        name: String,
        location: String,
        expected: u64,
        actual: u64,
    },

    #[error("conversion task for artifact '{name}' failed: {message}")]
    Task { name: String, message: String },
}

/// Fetches artifacts from a [`BlobStore`].
pub struct Retriever {
    store: Arc<dyn BlobStore>,
    staging: StagingArea,
    limits: MergeLimits,
}

impl Retriever {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            staging: StagingArea::system(),
            limits: MergeLimits::default(),
        }
    }

    pub fn with_staging(mut self, staging: StagingArea) -> Self {
        self.staging = staging;
        self
    }

    pub fn with_limits(mut self, limits: MergeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Fetch every artifact, preserving declared order.
    ///
    /// An empty list returns immediately without touching the store.
    pub async fn fetch_all(
        &self,
        refs: Vec<ArtifactRef>,
    ) -> Result<Vec<RetrievedArtifact>, RetrievalError> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let artifacts = try_join_all(refs.into_iter().map(|r| self.fetch_one(r))).await?;
        tracing::info!(count = artifacts.len(), "artifacts fetched");
        Ok(artifacts)
    }

    async fn fetch_one(&self, artifact: ArtifactRef) -> Result<RetrievedArtifact, RetrievalError> {
        if is_tar_family(&artifact.location.key) {
            return self.fetch_tar(artifact).await;
        }

        let fetched = self
            .store
            .get(&artifact.location)
            .await
            .map_err(|source| fetch_error(&artifact, source))?;

        tracing::info!(
            location = %artifact.location,
            bytes = fetched.content_length,
            "artifact fetched"
        );

        Ok(RetrievedArtifact {
            name: artifact.name,
            revision: artifact.revision,
            content_length: fetched.bytes.len() as u64,
            content: fetched.bytes,
            encryption: fetched.encryption,
        })
    }

    async fn fetch_tar(&self, artifact: ArtifactRef) -> Result<RetrievedArtifact, RetrievalError> {
        let head = self
            .store
            .head(&artifact.location)
            .await
            .map_err(|source| fetch_error(&artifact, source))?;

        let fetched = self
            .store
            .get(&artifact.location)
            .await
            .map_err(|source| fetch_error(&artifact, source))?;

        let actual = fetched.bytes.len() as u64;
        if actual != head.size {
            return Err(RetrievalError::SizeMismatch {
                name: artifact.name,
                location: artifact.location.to_string(),
                expected: head.size,
                actual,
            });
        }

        tracing::info!(
            location = %artifact.location,
            bytes = head.size,
            "tar-family artifact fetched"
        );

        let key = artifact.location.key.clone();
        let name = artifact.name.clone();
        let staging = self.staging.clone();
        let limits = self.limits;
        let bytes = fetched.bytes;

        let normalized = tokio::task::spawn_blocking(move || {
            normalize::normalize(&key, Cursor::new(bytes), &name, &staging, &limits)
        })
        .await
        .map_err(|e| RetrievalError::Task {
            name: artifact.name.clone(),
            message: e.to_string(),
        })?
        .map_err(|source| RetrievalError::Conversion {
            name: artifact.name.clone(),
            source,
        })?;

        Ok(RetrievedArtifact {
            name: artifact.name,
            revision: artifact.revision,
            content: normalized.content,
            content_length: normalized.content_length,
            encryption: fetched.encryption.or(head.encryption),
        })
    }
}

fn fetch_error(artifact: &ArtifactRef, source: StoreError) -> RetrievalError {
    tracing::warn!(location = %artifact.location, error = %source, "failed to fetch artifact");
    RetrievalError::Fetch {
        name: artifact.name.clone(),
        location: artifact.location.to_string(),
        source,
    }
}
