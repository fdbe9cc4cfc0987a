//! Inventory discovery against the source platform.
//!
//! Read-only: nothing on the source is mutated here. Transient API errors
//! are retried with bounded backoff; not-found and permission failures abort
//! the job immediately. Later stages never see a partially populated
//! descriptor because [`SourceProvider::describe_instance`] returns the
//! descriptor whole or not at all.

use crate::error::MigrateResult;
use crate::provider::SourceProvider;
use crate::retry::{self, RetryPolicy};
use crate::types::SourceDescriptor;
use std::sync::Arc;
use std::time::Duration;

pub struct Discoverer {
    provider: Arc<dyn SourceProvider>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl Discoverer {
    pub fn new(provider: Arc<dyn SourceProvider>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            call_timeout,
        }
    }

    /// Fetch the full source descriptor for `instance_id`.
    pub async fn discover(&self, instance_id: &str) -> MigrateResult<SourceDescriptor> {
        let descriptor = retry::retry_transient(&self.policy, "describe_instance", || {
            retry::with_timeout(
                self.call_timeout,
                "describe_instance",
                self.provider.describe_instance(instance_id),
            )
        })
        .await?;

        tracing::info!(
            instance_id,
            name = %descriptor.name,
            instance_type = %descriptor.instance_type,
            vcpus = descriptor.profile.vcpus,
            memory_mib = descriptor.profile.memory_mib,
            volumes = descriptor.volumes.len(),
            "discovered source instance"
        );
        Ok(descriptor)
    }
}
