//! Archive store: serialize the merged archive and upload it.
//!
//! The encryption setting attached to the upload is derived from the
//! settings the store reported for the inputs. Fetches complete in any
//! order, so the choice is made by an explicit [`EncryptionPolicy`] over
//! the artifacts in declared order rather than by whichever fetch finished
//! last.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::{ArchiveError, MergedArchive};
use crate::blob::{BlobStore, ObjectLocation, PutRequest, StoreError, ZIP_CONTENT_TYPE};
use crate::retrieve::RetrievedArtifact;

/// How the output's encryption setting is chosen from the inputs.
///
/// Inputs whose object reported no setting are ignored by every policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPolicy {
    /// Setting of the first input, in declared order, that reported one.
    #[default]
    FirstDeclared,
    /// Setting of the last input, in declared order, that reported one.
    LastDeclared,
    /// All reported settings must be identical.
    RequireUniform,
}

/// Inputs disagree on encryption under [`EncryptionPolicy::RequireUniform`].
#[derive(Debug, Error)]
#[error("input artifacts report different encryption settings: {}", settings.join(", "))]
pub struct EncryptionConflict {
    pub settings: Vec<String>,
}

impl EncryptionPolicy {
    /// Pick the output setting from the artifacts, in declared order.
    pub fn resolve(
        &self,
        artifacts: &[RetrievedArtifact],
    ) -> Result<Option<String>, EncryptionConflict> {
        let mut observed = artifacts
            .iter()
            .filter_map(|a| a.encryption.as_deref())
            .filter(|s| !s.is_empty());

        match self {
            Self::FirstDeclared => Ok(observed.next().map(str::to_string)),
            Self::LastDeclared => Ok(observed.last().map(str::to_string)),
            Self::RequireUniform => {
                let mut settings: Vec<String> = Vec::new();
                for setting in observed {
                    if !settings.iter().any(|s| s == setting) {
                        settings.push(setting.to_string());
                    }
                }
                if settings.len() > 1 {
                    return Err(EncryptionConflict { settings });
                }
                Ok(settings.pop())
            }
        }
    }
}

impl FromStr for EncryptionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" | "first_declared" => Ok(Self::FirstDeclared),
            "last" | "last_declared" => Ok(Self::LastDeclared),
            "uniform" | "require_uniform" => Ok(Self::RequireUniform),
            other => Err(format!(
                "unknown encryption policy '{}' (expected first, last or uniform)",
                other
            )),
        }
    }
}

/// Failures while persisting the merged archive.
#[derive(Debug, Error)]
pub enum ArchiveStoreError {
    #[error("failed to serialize merged archive: {0}")]
    Serialize(#[from] ArchiveError),

    #[error("failed to upload merged archive to {location}: {source}")]
    Upload {
        location: String,
        #[source]
        source: StoreError,
    },

    #[error("serialization task failed: {0}")]
    Task(String),
}

/// Writes merged archives to a [`BlobStore`].
pub struct ArchiveStore {
    store: Arc<dyn BlobStore>,
}

impl ArchiveStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Serialize `archive` and upload it to `location`.
    ///
    /// `encryption` is attached only when it is a non-empty string; the
    /// store default applies otherwise. Returns the number of bytes written.
    pub async fn store(
        &self,
        location: &ObjectLocation,
        archive: MergedArchive,
        encryption: Option<&str>,
    ) -> Result<u64, ArchiveStoreError> {
        let bytes: Bytes = tokio::task::spawn_blocking(move || archive.to_zip_bytes())
            .await
            .map_err(|e| ArchiveStoreError::Task(e.to_string()))??;
        let size = bytes.len() as u64;

        let request = PutRequest {
            content_type: Some(ZIP_CONTENT_TYPE.to_string()),
            encryption: encryption
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };

        self.store
            .put(location, bytes, request)
            .await
            .map_err(|source| ArchiveStoreError::Upload {
                location: location.to_string(),
                source,
            })?;

        tracing::info!(
            location = %location,
            bytes = size,
            encryption = encryption.unwrap_or("store default"),
            "merged archive uploaded"
        );
        Ok(size)
    }
}
