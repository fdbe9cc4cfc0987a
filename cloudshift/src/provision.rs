//! Destination instance provisioning.
//!
//! Idempotent by construction: the instance name is derived from the job id,
//! and an existing instance with that name is adopted instead of duplicated.
//! Read-only lookups and status polls retry transient provider errors with
//! bounded backoff; everything that remains after that (quota, missing
//! network/flavor/keypair, provider rejection) is fatal and needs operator
//! remediation. Instance creation itself is never retried, because a
//! creation whose acknowledgment was lost may still have succeeded.

use crate::error::{MigrateError, MigrateResult};
use crate::job::MigrationJob;
use crate::options::CoordinatorOptions;
use crate::provider::{CreateInstanceRequest, DestinationProvider, InstanceRecord, InstanceStatus};
use crate::retry;
use crate::state::ImageState;
use crate::types::DestinationDescriptor;
use std::sync::Arc;

pub struct Provisioner {
    destination: Arc<dyn DestinationProvider>,
    options: CoordinatorOptions,
}

impl Provisioner {
    pub fn new(destination: Arc<dyn DestinationProvider>, options: CoordinatorOptions) -> Self {
        Self {
            destination,
            options,
        }
    }

    /// Create (or adopt) the destination instance for `job`.
    ///
    /// Requires a `Ready` image artifact and a mapped flavor on the job.
    pub async fn provision(&self, job: &MigrationJob) -> MigrateResult<DestinationDescriptor> {
        if job.image_state != ImageState::Ready {
            return Err(MigrateError::InvalidState(format!(
                "cannot provision with image in state {}",
                job.image_state
            )));
        }
        let image_id = job
            .artifact
            .as_ref()
            .and_then(|a| a.destination_image_id.clone())
            .ok_or_else(|| {
                MigrateError::Metadata("ready artifact without a destination image id".into())
            })?;
        let flavor_id = job
            .flavor_id
            .clone()
            .ok_or_else(|| MigrateError::Metadata("provisioning without a mapped flavor".into()))?;

        let name = job.destination_name();

        // Idempotency: a repeated provisioning call for the same job adopts
        // the instance created by the earlier attempt.
        if let Some(existing) = self.find_existing(&name).await? {
            tracing::info!(
                job = %job.id,
                instance = %existing.instance_id,
                "adopting existing destination instance"
            );
            return Ok(self.describe(job, existing));
        }

        let source = job
            .source
            .as_ref()
            .ok_or_else(|| MigrateError::Metadata("provisioning without a source descriptor".into()))?;

        let network_name = &job.request.network;
        let network_id = self
            .lookup("find_network", || {
                self.destination.find_network(network_name)
            })
            .await?
            .ok_or_else(|| {
                MigrateError::Provisioning(format!("network {} not found", network_name))
            })?;

        // Keypair: request override, else the source keypair, dropped with a
        // warning when the destination does not know it (the original tool
        // proceeds without one).
        let mut keypair = job.request.keypair.clone().or_else(|| source.keypair.clone());
        if let Some(name) = &keypair {
            if !self
                .lookup("find_keypair", || self.destination.find_keypair(name))
                .await?
            {
                tracing::warn!(job = %job.id, keypair = %name, "keypair not found, proceeding without it");
                keypair = None;
            }
        }

        let boot_volume_gib = match source.total_volume_gib() {
            0 => None,
            gib => Some(gib),
        };

        let request = CreateInstanceRequest {
            name: name.clone(),
            image_id,
            flavor_id: flavor_id.clone(),
            network_id,
            keypair,
            security_groups: source.security_groups.clone(),
            boot_volume_gib,
        };

        let instance_id = self
            .call("create_instance", self.destination.create_instance(&request))
            .await?;
        tracing::info!(job = %job.id, instance = %instance_id, flavor = %flavor_id, "instance creation initiated");

        self.wait_active(&instance_id).await?;

        // Floating IP is best-effort; a failure here never fails the job.
        match self.destination.attach_floating_ip(&instance_id).await {
            Ok(ip) => tracing::info!(job = %job.id, floating_ip = %ip, "floating IP attached"),
            Err(err) => {
                tracing::warn!(job = %job.id, error = %err, "could not attach floating IP")
            }
        }

        let record = self
            .lookup("get_instance", || {
                self.destination.get_instance(&instance_id)
            })
            .await?;
        Ok(self.describe(job, record))
    }

    async fn find_existing(&self, name: &str) -> MigrateResult<Option<InstanceRecord>> {
        self.lookup("find_instance_by_name", || {
            self.destination.find_instance_by_name(name)
        })
        .await
    }

    /// Read-only provider call: timeout per attempt, transient errors
    /// retried with backoff, whatever survives the retries is fatal.
    async fn lookup<T, F, Fut>(&self, what: &str, mut op: F) -> MigrateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = MigrateResult<T>>,
    {
        retry::retry_transient(&self.options.provider_retry(), what, || {
            retry::with_timeout(self.options.provider_call_timeout, what, op())
        })
        .await
        .map_err(|e| match e {
            MigrateError::Transient(msg) => MigrateError::Provisioning(msg),
            other => other,
        })
    }

    /// Mutating provider call: timeout, but no retry. A create whose
    /// acknowledgment was lost may still have gone through; the adoption
    /// lookup on the next run is the safe way to find out.
    async fn call<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = MigrateResult<T>>,
    ) -> MigrateResult<T> {
        retry::with_timeout(self.options.provider_call_timeout, what, fut)
            .await
            .map_err(|e| match e {
                MigrateError::Transient(msg) => MigrateError::Provisioning(msg),
                other => other,
            })
    }

    async fn wait_active(&self, instance_id: &str) -> MigrateResult<()> {
        retry::poll_until(
            self.options.poll_interval,
            self.options.poll_deadline,
            "instance build",
            || async {
                let status = self
                    .lookup("instance_status", || {
                        self.destination.instance_status(instance_id)
                    })
                    .await?;
                match status {
                    InstanceStatus::Active => Ok(Some(())),
                    InstanceStatus::Building => Ok(None),
                    InstanceStatus::Error(reason) => Err(MigrateError::Provisioning(format!(
                        "instance {} failed to build: {}",
                        instance_id, reason
                    ))),
                }
            },
        )
        .await
        .map_err(|e| match e {
            // Build deadline elapsed: still fatal for provisioning.
            MigrateError::Transient(msg) => MigrateError::Provisioning(msg),
            other => other,
        })
    }

    fn describe(&self, job: &MigrationJob, record: InstanceRecord) -> DestinationDescriptor {
        let source_groups = job
            .source
            .as_ref()
            .map(|s| s.security_groups.clone())
            .unwrap_or_default();
        DestinationDescriptor {
            instance_id: record.instance_id,
            name: record.name,
            flavor_id: record.flavor_id,
            network_id: job.request.network.clone(),
            keypair: job
                .request
                .keypair
                .clone()
                .or_else(|| job.source.as_ref().and_then(|s| s.keypair.clone())),
            security_groups: source_groups,
            private_ip: record.private_ip,
            floating_ip: record.floating_ip,
        }
    }
}
