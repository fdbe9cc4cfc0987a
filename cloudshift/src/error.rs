//! Error taxonomy for migration jobs.
//!
//! Errors fall into two retry classes:
//! - retryable: transient provider/network conditions, retried with bounded
//!   exponential backoff at the stage that observed them
//! - fatal: bad input, missing permissions, or conditions that need operator
//!   remediation (quota, missing network/flavor/keypair)
//!
//! Every error is appended to the job's checkpoint log before it surfaces,
//! so a `Failed` job always carries enough context to diagnose or resume.

use thiserror::Error;

pub type MigrateResult<T> = Result<T, MigrateError>;

#[derive(Error, Debug)]
pub enum MigrateError {
    /// Source instance lookup failed: not found or insufficient permissions.
    /// Fatal, never retried.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Transient provider or network condition, including provider-call
    /// timeouts. Retried with bounded exponential backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Image pipeline stage failure. Retried per-stage up to a cap; the last
    /// confirmed `ImageState` is preserved for resume.
    #[error("image pipeline failed: {0}")]
    ImagePipeline(String),

    /// Destination provisioning failure (quota, missing network/flavor/
    /// keypair, provider rejection). Fatal, requires operator remediation.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Data transfer failure. Retried; partial progress is preserved and
    /// the transfer is resumable.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The destination flavor catalog is empty. Fatal.
    #[error("unmappable compute profile: {0}")]
    UnmappableProfile(String),

    /// Invalid job or image state transition.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Bad configuration handed to the coordinator.
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint store corruption or inconsistency.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Job cancelled cooperatively between stages.
    #[error("job cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Whether a bounded-backoff retry is allowed for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrateError::Transient(_) | MigrateError::Transfer(_)
        )
    }

    /// Short class name recorded in checkpoint logs.
    pub fn class(&self) -> &'static str {
        match self {
            MigrateError::Discovery(_) => "discovery",
            MigrateError::Transient(_) => "transient",
            MigrateError::ImagePipeline(_) => "image_pipeline",
            MigrateError::Provisioning(_) => "provisioning",
            MigrateError::Transfer(_) => "transfer",
            MigrateError::UnmappableProfile(_) => "unmappable_profile",
            MigrateError::InvalidState(_) => "invalid_state",
            MigrateError::Config(_) => "config",
            MigrateError::Metadata(_) => "metadata",
            MigrateError::Cancelled => "cancelled",
            MigrateError::Io(_) => "io",
            MigrateError::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classes() {
        assert!(MigrateError::Transient("throttled".into()).is_retryable());
        assert!(MigrateError::Transfer("connection reset".into()).is_retryable());

        assert!(!MigrateError::Discovery("not found".into()).is_retryable());
        assert!(!MigrateError::Provisioning("quota exceeded".into()).is_retryable());
        assert!(!MigrateError::UnmappableProfile("empty catalog".into()).is_retryable());
        assert!(!MigrateError::Cancelled.is_retryable());
    }
}
