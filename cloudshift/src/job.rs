//! The migration job record.
//!
//! A `MigrationJob` is mutated only by the coordinator and persisted after
//! every state transition. The checkpoint log in [`crate::metadata`] is the
//! sole mechanism for resuming an interrupted job; replaying it must
//! reconstruct an identical job snapshot.

use crate::error::MigrateResult;
use crate::state::{self, ImageState, JobState};
use crate::types::{
    DestinationDescriptor, ImageArtifact, JobId, JobRequest, SourceDescriptor, TransferProgress,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One migration attempt, end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: JobId,
    pub request: JobRequest,
    pub state: JobState,
    pub image_state: ImageState,
    /// Captured by the Discoverer, immutable afterwards.
    pub source: Option<SourceDescriptor>,
    /// Destination flavor chosen by the mapper (or the request override).
    pub flavor_id: Option<String>,
    pub artifact: Option<ImageArtifact>,
    pub destination: Option<DestinationDescriptor>,
    #[serde(default)]
    pub progress: TransferProgress,
    /// Message of the last recorded error, for the structured summary.
    #[serde(default)]
    pub last_error: Option<String>,
    /// The stage the job was in when it failed; a reopened job re-enters
    /// here.
    #[serde(default)]
    pub resume_state: Option<JobState>,
    /// Monotonic checkpoint sequence number.
    #[serde(default)]
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationJob {
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            request,
            state: JobState::Created,
            image_state: ImageState::NotStarted,
            source: None,
            flavor_id: None,
            artifact: None,
            destination: None,
            progress: TransferProgress::default(),
            last_error: None,
            resume_state: None,
            seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deterministic destination instance name, the provisioning idempotency
    /// key: a repeated call for the same job always targets the same name.
    pub fn destination_name(&self) -> String {
        format!("migrate-{}", self.id)
    }

    /// Apply a validated job-state transition.
    pub fn transition_to(&mut self, target: JobState) -> MigrateResult<()> {
        self.state = state::transition_job(self.state, target)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Apply a validated image-state transition.
    pub fn image_transition_to(&mut self, target: ImageState) -> MigrateResult<()> {
        self.image_state = state::transition_image(self.image_state, target)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Force the job into `Failed`, keeping whatever progress exists.
    pub fn mark_failed(&mut self, error: &crate::error::MigrateError) {
        if !self.state.is_terminal() {
            self.resume_state = Some(self.state);
            self.state = JobState::Failed;
        }
        // Image state stays at its last confirmed value so resume can
        // re-enter the pipeline without repeating completed stages.
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Re-enter a failed job at the stage it failed in. Returns false when
    /// the job is not failed or carries no resume point.
    pub fn reopen(&mut self) -> bool {
        if self.state != JobState::Failed {
            return false;
        }
        match self.resume_state.take() {
            Some(state) => {
                self.state = state;
                self.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Structured summary of what succeeded, what is pending, what failed.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            state: self.state,
            image_state: self.image_state,
            discovered: self.source.is_some(),
            flavor_id: self.flavor_id.clone(),
            image_ready: self.image_state == ImageState::Ready,
            destination_instance: self
                .destination
                .as_ref()
                .map(|d| d.instance_id.clone()),
            progress: self.progress,
            last_error: self.last_error.clone(),
        }
    }
}

/// The externally guaranteed output of a job: terminal state plus a
/// breakdown an operator can act on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub state: JobState,
    pub image_state: ImageState,
    pub discovered: bool,
    pub flavor_id: Option<String>,
    pub image_ready: bool,
    pub destination_instance: Option<String>,
    pub progress: TransferProgress,
    pub last_error: Option<String>,
}

impl JobSummary {
    /// Exit-code contract for the external CLI: success on both terminal
    /// success states.
    pub fn succeeded(&self) -> bool {
        matches!(
            self.state,
            JobState::Completed | JobState::DryRunCompleted
        )
    }
}
