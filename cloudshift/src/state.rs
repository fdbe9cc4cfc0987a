//! Job and image-pipeline state machines.
//!
//! Both machines validate every transition; the coordinator checkpoints a
//! transition to the metadata store before acting on it, which is what makes
//! an interrupted job resumable.
//!
//! Job state machine:
//! ```text
//! Created → Discovering → Imaging → Provisioning → Transferring → Completed
//!                 │
//!                 └──→ DryRunCompleted        (dry-run mode)
//! Failed reachable from any non-terminal state
//! ```
//!
//! Image state machine:
//! ```text
//! NotStarted → Snapshotting → Exported → Importing → Ready
//!      │             └────────────────────────↑
//!      └──→ Staged ───────────────────────────┘      (local image supplied)
//! Failed reachable from any non-terminal state
//! ```

use crate::error::{MigrateError, MigrateResult};
use serde::{Deserialize, Serialize};

// ============================================================================
// JOB STATE
// ============================================================================

/// Lifecycle state of a migration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job accepted and persisted, nothing executed yet.
    Created,
    /// Reading source instance metadata.
    Discovering,
    /// Image pipeline active; the fine-grained position is an [`ImageState`].
    Imaging,
    /// Creating the destination instance.
    Provisioning,
    /// Copying filesystem contents.
    Transferring,
    /// Terminal: migration finished.
    Completed,
    /// Terminal: dry-run finished without mutating anything.
    DryRunCompleted,
    /// Terminal: job failed; checkpoint log carries the error context.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::DryRunCompleted | JobState::Failed
        )
    }

    /// States a resumed job can be picked up from. `Failed` is included:
    /// a failed job re-enters the stage it failed in, from its last
    /// checkpoint.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, JobState::Completed | JobState::DryRunCompleted)
    }

    /// Check if a transition to `target` is valid.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;
        // Failed is reachable from every non-terminal state.
        if target == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (Created, Discovering)
                | (Discovering, Imaging)
                | (Discovering, DryRunCompleted)
                | (Imaging, Provisioning)
                | (Provisioning, Transferring)
                | (Provisioning, Completed)
                | (Transferring, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Discovering => "discovering",
            JobState::Imaging => "imaging",
            JobState::Provisioning => "provisioning",
            JobState::Transferring => "transferring",
            JobState::Completed => "completed",
            JobState::DryRunCompleted => "dry_run_completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "discovering" => Ok(JobState::Discovering),
            "imaging" => Ok(JobState::Imaging),
            "provisioning" => Ok(JobState::Provisioning),
            "transferring" => Ok(JobState::Transferring),
            "completed" => Ok(JobState::Completed),
            "dry_run_completed" => Ok(JobState::DryRunCompleted),
            "failed" => Ok(JobState::Failed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// IMAGE STATE
// ============================================================================

/// Position within the image pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    NotStarted,
    /// Provider-side snapshot requested, polling for completion.
    Snapshotting,
    /// Snapshot exported to the staging object store.
    Exported,
    /// Artifact staged and ready for registration (local-image entry point).
    Staged,
    /// Registered with the destination image service, polling conversion.
    Importing,
    /// Terminal: importable by the destination compute service.
    Ready,
    /// Terminal for this attempt; the last confirmed state before failure is
    /// preserved in the checkpoint log for resume.
    Failed,
}

impl ImageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageState::Ready | ImageState::Failed)
    }

    /// Check if a transition to `target` is valid.
    pub fn can_transition_to(&self, target: ImageState) -> bool {
        use ImageState::*;
        if target == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (NotStarted, Snapshotting)
                // Caller supplied a local image, no snapshot needed.
                | (NotStarted, Staged)
                | (Snapshotting, Exported)
                // Direct registration, export skipped.
                | (Snapshotting, Importing)
                | (Exported, Importing)
                | (Staged, Importing)
                | (Importing, Ready)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageState::NotStarted => "not_started",
            ImageState::Snapshotting => "snapshotting",
            ImageState::Exported => "exported",
            ImageState::Staged => "staged",
            ImageState::Importing => "importing",
            ImageState::Ready => "ready",
            ImageState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ImageState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(ImageState::NotStarted),
            "snapshotting" => Ok(ImageState::Snapshotting),
            "exported" => Ok(ImageState::Exported),
            "staged" => Ok(ImageState::Staged),
            "importing" => Ok(ImageState::Importing),
            "ready" => Ok(ImageState::Ready),
            "failed" => Ok(ImageState::Failed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// VALIDATED TRANSITION HELPERS
// ============================================================================

/// Apply a validated job-state transition.
pub fn transition_job(current: JobState, target: JobState) -> MigrateResult<JobState> {
    if !current.can_transition_to(target) {
        return Err(MigrateError::InvalidState(format!(
            "cannot transition job from {} to {}",
            current, target
        )));
    }
    Ok(target)
}

/// Apply a validated image-state transition.
pub fn transition_image(current: ImageState, target: ImageState) -> MigrateResult<ImageState> {
    if !current.can_transition_to(target) {
        return Err(MigrateError::InvalidState(format!(
            "cannot transition image from {} to {}",
            current, target
        )));
    }
    Ok(target)
}
