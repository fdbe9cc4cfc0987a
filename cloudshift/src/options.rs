//! Coordinator configuration.
//!
//! Everything credential- or environment-shaped is resolved by the caller
//! before construction and handed in as one opaque options object; nothing
//! in the pipeline reads configuration ad hoc.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How image bytes reach the destination platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ImageStaging {
    /// Export the snapshot to the object store, then register from there.
    ObjectStore { bucket: String, prefix: String },
    /// Register the provider snapshot directly (streaming import).
    Direct,
}

impl Default for ImageStaging {
    fn default() -> Self {
        ImageStaging::Direct
    }
}

/// Tuning and placement knobs for a [`crate::coordinator::MigrationCoordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorOptions {
    /// Root directory of the metadata store.
    pub metadata_dir: PathBuf,

    /// Maximum concurrently executing jobs.
    #[serde(default = "default_max_jobs")]
    pub max_concurrent_jobs: usize,

    /// Attempts per retryable provider call.
    #[serde(default = "default_provider_attempts")]
    pub provider_attempts: u32,

    /// Attempts per image-pipeline stage before the job fails.
    #[serde(default = "default_stage_attempts")]
    pub max_stage_attempts: u32,

    /// Attempts for the data transfer before the job fails.
    #[serde(default = "default_transfer_attempts")]
    pub max_transfer_attempts: u32,

    /// Timeout applied to each individual provider call.
    #[serde(default = "default_call_timeout", with = "secs")]
    pub provider_call_timeout: Duration,

    /// Interval between provider-side status polls.
    #[serde(default = "default_poll_interval", with = "secs")]
    pub poll_interval: Duration,

    /// Deadline for one snapshot/export/import/instance poll loop.
    #[serde(default = "default_poll_deadline", with = "secs")]
    pub poll_deadline: Duration,

    #[serde(default)]
    pub image_staging: ImageStaging,
}

impl CoordinatorOptions {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            max_concurrent_jobs: default_max_jobs(),
            provider_attempts: default_provider_attempts(),
            max_stage_attempts: default_stage_attempts(),
            max_transfer_attempts: default_transfer_attempts(),
            provider_call_timeout: default_call_timeout(),
            poll_interval: default_poll_interval(),
            poll_deadline: default_poll_deadline(),
            image_staging: ImageStaging::default(),
        }
    }

    /// Policy for retryable provider calls.
    pub fn provider_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.provider_attempts,
            Duration::from_secs(1),
            Duration::from_secs(30),
        )
    }

    /// Policy for transfer attempts: longer backoff, connectivity recovers
    /// slowly.
    pub fn transfer_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_transfer_attempts,
            Duration::from_secs(2),
            Duration::from_secs(60),
        )
    }
}

fn default_max_jobs() -> usize {
    4
}

fn default_provider_attempts() -> u32 {
    3
}

fn default_stage_attempts() -> u32 {
    3
}

fn default_transfer_attempts() -> u32 {
    5
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_poll_deadline() -> Duration {
    Duration::from_secs(3600)
}

/// Durations persisted as whole seconds in options files.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_filled_in() {
        let opts: CoordinatorOptions =
            serde_json::from_str(r#"{"metadata_dir": "/var/lib/cloudshift"}"#).unwrap();
        assert_eq!(opts.max_concurrent_jobs, 4);
        assert_eq!(opts.provider_attempts, 3);
        assert_eq!(opts.poll_interval, Duration::from_secs(15));
        assert_eq!(opts.image_staging, ImageStaging::Direct);
    }

    #[test]
    fn staging_modes_round_trip() {
        let staging = ImageStaging::ObjectStore {
            bucket: "migrations".into(),
            prefix: "exports".into(),
        };
        let raw = serde_json::to_string(&staging).unwrap();
        assert_eq!(serde_json::from_str::<ImageStaging>(&raw).unwrap(), staging);
    }
}
