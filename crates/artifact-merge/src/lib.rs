//! Build-artifact merging for pipeline stages.
//!
//! A pipeline hands this stage N build artifacts living in a blob store
//! (zip archives, or tar / tar.gz / tar.bz2 archives that are converted on
//! the fly) and one output location. The artifacts are fetched
//! concurrently, folded in declared order into a single zip archive, and
//! uploaded.
//!
//! - Root merge: all entries land at the archive root; on a path collision
//!   the later artifact wins.
//! - Subfolder merge (`{"subfolder": true}`): each artifact goes under a
//!   folder named after it.
//! - Revision markers (`{"revisions": true}`): one small entry per artifact
//!   holding its source revision.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use artifact_merge::{run_job, JobEvent, MergePipeline, ObjectStoreBlobStore};
//!
//! # async fn example(event_json: &str) -> anyhow::Result<()> {
//! let store = Arc::new(ObjectStoreBlobStore::from_url("s3://eu-west-1")?);
//! let pipeline = MergePipeline::new(store);
//!
//! let outcome = run_job(&pipeline, JobEvent::from_json(event_json)?).await;
//! println!("{}", outcome.message());
//! # Ok(())
//! # }
//! ```
//!
//! # Backends
//!
//! | URL | Backend |
//! |-----|---------|
//! | `s3://[region][?endpoint=URL]` | S3 or S3-compatible store, credentials from the environment |
//! | `file:///root` | Local directory, one sub-directory per bucket |
//! | `memory://` | In-process store (tests) |

pub mod archive;
pub mod blob;
pub mod error;
pub mod job;
pub mod limits;
pub mod merge;
pub mod normalize;
pub mod options;
pub mod pipeline;
pub mod retrieve;
pub mod store;

// Re-export main types
pub use archive::{ArchiveEntry, ArchiveError, MergedArchive};
pub use blob::{
    BlobStore, FetchedObject, ObjectHead, ObjectLocation, ObjectStoreBlobStore, PutRequest,
    StoreError, StoreResult, StoreSpec,
};
pub use error::{ErrorClass, PipelineError};
pub use job::{run_job, JobEvent, JobOutcome};
pub use limits::{MergeLimits, MergeLimitsOverrides};
pub use merge::{merge, MergeError};
pub use normalize::{is_tar_family, normalize, ConversionError, Normalized, StagingArea};
pub use options::{MergeOptions, OptionsError};
pub use pipeline::{MergePipeline, MergeRequest, RunReport};
pub use retrieve::{ArtifactRef, RetrievalError, RetrievedArtifact, Retriever};
pub use store::{ArchiveStore, ArchiveStoreError, EncryptionConflict, EncryptionPolicy};

pub use bytes::Bytes;
