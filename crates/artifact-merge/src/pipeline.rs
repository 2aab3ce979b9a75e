//! One merge run: retrieve, merge, store.

use std::sync::Arc;

use crate::archive::MergedArchive;
use crate::blob::{BlobStore, ObjectLocation};
use crate::error::PipelineError;
use crate::limits::MergeLimits;
use crate::merge;
use crate::normalize::StagingArea;
use crate::options::MergeOptions;
use crate::retrieve::{ArtifactRef, Retriever};
use crate::store::{ArchiveStore, EncryptionPolicy};

/// Everything one run needs, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Inputs in declared order; this is the merge order.
    pub inputs: Vec<ArtifactRef>,
    pub output: ObjectLocation,
    pub options: MergeOptions,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    /// Zero inputs were declared. Nothing was fetched or written.
    NothingToMerge,
    Merged {
        artifacts: usize,
        entries: usize,
        bytes_written: u64,
        encryption: Option<String>,
    },
}

impl RunReport {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NothingToMerge => "No artifacts found. Nothing to merge.",
            Self::Merged { .. } => "Merged artifacts successfully.",
        }
    }
}

pub struct MergePipeline {
    retriever: Retriever,
    archive_store: ArchiveStore,
    policy: EncryptionPolicy,
    limits: MergeLimits,
}

impl MergePipeline {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            retriever: Retriever::new(store.clone()),
            archive_store: ArchiveStore::new(store),
            policy: EncryptionPolicy::default(),
            limits: MergeLimits::default(),
        }
    }

    pub fn with_policy(mut self, policy: EncryptionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Limits apply to both tar conversion and zip loading.
    pub fn with_limits(mut self, limits: MergeLimits) -> Self {
        self.retriever = self.retriever.with_limits(limits);
        self.limits = limits;
        self
    }

    pub fn with_staging(mut self, staging: StagingArea) -> Self {
        self.retriever = self.retriever.with_staging(staging);
        self
    }

    pub fn policy(&self) -> EncryptionPolicy {
        self.policy
    }

    pub async fn run(&self, request: MergeRequest) -> Result<RunReport, PipelineError> {
        let MergeRequest {
            inputs,
            output,
            options,
        } = request;

        let artifacts = self.retriever.fetch_all(inputs).await?;
        if artifacts.is_empty() {
            tracing::info!("no artifacts found, nothing to merge");
            return Ok(RunReport::NothingToMerge);
        }

        let encryption = self.policy.resolve(&artifacts)?;
        let count = artifacts.len();
        let limits = self.limits;

        let archive = tokio::task::spawn_blocking(move || {
            merge::merge(MergedArchive::new(), artifacts, &options, &limits)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("merge task failed: {}", e)))??;

        let entries = archive.len();
        tracing::info!(artifacts = count, entries, "artifacts merged");

        let bytes_written = self
            .archive_store
            .store(&output, archive, encryption.as_deref())
            .await?;

        Ok(RunReport::Merged {
            artifacts: count,
            entries,
            bytes_written,
            encryption,
        })
    }
}
