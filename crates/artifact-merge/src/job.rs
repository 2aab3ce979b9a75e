//! Job boundary: the orchestration event in, a typed outcome out.
//!
//! The orchestrator invokes the stage with an event shaped like
//!
//! ```json
//! {
//!   "CodePipeline.job": {
//!     "id": "11111111-abcd-1111-abcd-111111abcdef",
//!     "data": {
//!       "actionConfiguration": {
//!         "configuration": { "UserParameters": "{\"subfolder\": true}" }
//!       },
//!       "inputArtifacts": [
//!         { "name": "BuildOutput", "revision": "abc123",
//!           "location": { "type": "S3",
//!             "s3Location": { "bucketName": "artifacts", "objectKey": "build.zip" } } }
//!       ],
//!       "outputArtifacts": [ ... ]
//!     }
//!   }
//! }
//! ```
//!
//! The core never talks to the orchestrator. [`run_job`] returns a
//! [`JobOutcome`] and the caller turns it into success or failure calls.

use serde::{Deserialize, Serialize};

use crate::blob::ObjectLocation;
use crate::error::{ErrorClass, PipelineError};
use crate::options::MergeOptions;
use crate::pipeline::{MergePipeline, MergeRequest};
use crate::retrieve::ArtifactRef;

#[derive(Debug, Clone, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "CodePipeline.job")]
    pub job: Job,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    pub data: JobData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    #[serde(default)]
    pub action_configuration: ActionConfiguration,
    #[serde(default)]
    pub input_artifacts: Vec<ArtifactDescriptor>,
    #[serde(default)]
    pub output_artifacts: Vec<ArtifactDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionConfiguration {
    #[serde(default)]
    pub configuration: ActionParameters,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionParameters {
    #[serde(rename = "UserParameters", default)]
    pub user_parameters: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    #[serde(default)]
    pub revision: Option<String>,
    pub location: ArtifactLocation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactLocation {
    #[serde(rename = "s3Location")]
    pub s3_location: S3Location,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Location {
    pub bucket_name: String,
    pub object_key: String,
}

impl ArtifactDescriptor {
    fn object_location(&self) -> ObjectLocation {
        ObjectLocation::new(
            self.location.s3_location.bucket_name.clone(),
            self.location.s3_location.object_key.clone(),
        )
    }

    fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            location: self.object_location(),
            name: self.name.clone(),
            revision: self.revision.clone(),
        }
    }
}

impl JobEvent {
    pub fn from_json(input: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(input).map_err(|e| PipelineError::InvalidJob {
            message: e.to_string(),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    /// Build the run request.
    ///
    /// Options are parsed before anything else so that a malformed
    /// parameter string fails the run before any fetch. Only the first
    /// output artifact is used.
    pub fn into_request(self) -> Result<MergeRequest, PipelineError> {
        let data = self.job.data;
        let options = MergeOptions::parse(
            data.action_configuration
                .configuration
                .user_parameters
                .as_deref(),
        )?;

        let output = data
            .output_artifacts
            .first()
            .map(ArtifactDescriptor::object_location)
            .ok_or(PipelineError::ConfigurationMissing)?;
        if data.output_artifacts.len() > 1 {
            tracing::warn!(
                declared = data.output_artifacts.len(),
                "several output artifacts declared, only the first is written"
            );
        }

        Ok(MergeRequest {
            inputs: data.input_artifacts.iter().map(ArtifactDescriptor::to_ref).collect(),
            output,
            options,
        })
    }
}

/// Result of one job, as handed to the orchestration side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success {
        job_id: String,
        message: String,
    },
    Failure {
        /// Absent when the event itself could not be read
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        message: String,
        class: ErrorClass,
        detail: String,
    },
}

impl JobOutcome {
    pub fn failure(job_id: Option<String>, error: &PipelineError) -> Self {
        let class = error.class();
        tracing::error!(job_id = job_id.as_deref().unwrap_or("-"), class = ?class, error = %error, "merge job failed");
        Self::Failure {
            job_id,
            message: class.failure_message().to_string(),
            class,
            detail: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success { message, .. } | Self::Failure { message, .. } => message,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success { .. } => 0,
            Self::Failure { class, .. } => class.exit_code(),
        }
    }
}

/// Run one job end to end.
pub async fn run_job(pipeline: &MergePipeline, event: JobEvent) -> JobOutcome {
    let job_id = event.job_id().to_string();
    tracing::info!(job_id = %job_id, "merge job started");

    let request = match event.into_request() {
        Ok(request) => request,
        Err(e) => return JobOutcome::failure(Some(job_id), &e),
    };

    match pipeline.run(request).await {
        Ok(report) => {
            tracing::info!(job_id = %job_id, "{}", report.message());
            JobOutcome::Success {
                job_id,
                message: report.message().to_string(),
            }
        }
        Err(e) => JobOutcome::failure(Some(job_id), &e),
    }
}
