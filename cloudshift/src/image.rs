//! The image pipeline: snapshot → export → stage → import.
//!
//! Drives the [`ImageState`] machine for one job. Every confirmed transition
//! is checkpointed before the next step starts, so a resumed job re-enters
//! the pipeline at its last confirmed state: a completed snapshot is never
//! re-created, a finished export is never re-run.
//!
//! Two alternate paths exist through the machine and are never combined in
//! one job:
//! - provider snapshot → object-store export → register (`ImageStaging::ObjectStore`)
//! - provider snapshot → direct registration (`ImageStaging::Direct`)
//!
//! A caller-supplied local image file bypasses the snapshot entirely and
//! enters at `Staged`, from where it is uploaded and registered.

use crate::error::{MigrateError, MigrateResult};
use crate::job::MigrationJob;
use crate::metadata::MetadataStore;
use crate::options::{CoordinatorOptions, ImageStaging};
use crate::provider::{
    DestinationProvider, ImageSource, ImportStatus, ObjectStore, SnapshotStatus, SourceProvider,
};
use crate::retry::{self, RetryPolicy};
use crate::state::ImageState;
use crate::types::{ImageArtifact, ImageFormat, ImageLocation};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ImagePipeline {
    source: Arc<dyn SourceProvider>,
    destination: Arc<dyn DestinationProvider>,
    object_store: Arc<dyn ObjectStore>,
    store: MetadataStore,
    options: CoordinatorOptions,
}

impl ImagePipeline {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        destination: Arc<dyn DestinationProvider>,
        object_store: Arc<dyn ObjectStore>,
        store: MetadataStore,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            source,
            destination,
            object_store,
            store,
            options,
        }
    }

    /// Backoff policy for one pipeline stage; a poll deadline counts as a
    /// transient failure and re-enters the same stage.
    fn stage_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.options.max_stage_attempts,
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }

    /// Advance the job's image state until `Ready`.
    ///
    /// Cancellation is honored between stages only; an in-flight provider
    /// call always completes first.
    pub async fn run(
        &self,
        job: &mut MigrationJob,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            tracing::debug!(job = %job.id, image_state = %job.image_state, "image pipeline step");
            match job.image_state {
                ImageState::NotStarted => self.start(job).await?,
                ImageState::Snapshotting => self.finish_snapshot(job).await?,
                ImageState::Exported => self.register_from_store(job).await?,
                ImageState::Staged => self.upload_and_register(job).await?,
                ImageState::Importing => self.finish_import(job).await?,
                ImageState::Ready => return Ok(()),
                ImageState::Failed => {
                    return Err(MigrateError::ImagePipeline(
                        "image previously failed hard; job cannot be resumed past it".into(),
                    ));
                }
            }
        }
    }

    /// `NotStarted` → `Snapshotting` (provider snapshot) or `Staged` (local
    /// image supplied by the caller).
    async fn start(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        if let Some(path) = job.request.local_image.clone() {
            if !path.exists() {
                return Err(MigrateError::Config(format!(
                    "local image file does not exist: {}",
                    path.display()
                )));
            }
            let format = job.request.image_format.unwrap_or(ImageFormat::Raw);
            job.artifact = Some(ImageArtifact::new(
                format,
                ImageLocation::LocalFile { path },
            ));
            job.image_transition_to(ImageState::Staged)?;
            self.store.checkpoint(job, None)?;
            return Ok(());
        }

        let source_name = job
            .source
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| job.request.source_instance_id.clone());
        let snapshot_name = format!("{}-migration-{}", source_name, job.id.short());
        let instance_id = job.request.source_instance_id.clone();

        let snapshot_id = retry::retry_transient(
            &self.options.provider_retry(),
            "create_snapshot",
            || {
                retry::with_timeout(
                    self.options.provider_call_timeout,
                    "create_snapshot",
                    self.source.create_snapshot(&instance_id, &snapshot_name),
                )
            },
        )
        .await?;

        tracing::info!(job = %job.id, snapshot = %snapshot_id, "snapshot requested");
        let format = job.request.image_format.unwrap_or(ImageFormat::Raw);
        let mut artifact = ImageArtifact::new(
            format,
            ImageLocation::ProviderImage {
                image_id: snapshot_id.clone(),
            },
        );
        artifact.snapshot_id = Some(snapshot_id);
        job.artifact = Some(artifact);
        job.image_transition_to(ImageState::Snapshotting)?;
        self.store.checkpoint(job, None)?;
        Ok(())
    }

    /// `Snapshotting` → `Exported` (object-store staging) or `Importing`
    /// (direct registration). Waits for the snapshot to become available
    /// first; on resume the existing snapshot id is reused, never re-created.
    async fn finish_snapshot(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        let snapshot_id = job
            .artifact
            .as_ref()
            .and_then(|a| a.snapshot_id.clone())
            .ok_or_else(|| {
                MigrateError::Metadata("snapshotting state without a snapshot id".into())
            })?;

        retry::retry_transient(&self.stage_policy(), "snapshot wait", || {
            self.wait_snapshot(&snapshot_id)
        })
        .await?;
        tracing::info!(job = %job.id, snapshot = %snapshot_id, "snapshot available");

        match self.options.image_staging.clone() {
            ImageStaging::ObjectStore { bucket, prefix } => {
                let key = match job.artifact.as_ref() {
                    Some(a) => format!("{}/{}.{}", prefix, a.artifact_id, a.format),
                    None => {
                        return Err(MigrateError::Metadata(
                            "snapshotting state without an artifact".into(),
                        ));
                    }
                };
                let task_id = retry::retry_transient(
                    &self.options.provider_retry(),
                    "export_snapshot",
                    || {
                        retry::with_timeout(
                            self.options.provider_call_timeout,
                            "export_snapshot",
                            self.source.export_snapshot(&snapshot_id, &bucket, &key),
                        )
                    },
                )
                .await?;

                retry::retry_transient(&self.stage_policy(), "export wait", || {
                    self.wait_export(&task_id)
                })
                .await?;
                tracing::info!(job = %job.id, bucket = %bucket, key = %key, "snapshot exported");

                if let Some(artifact) = job.artifact.as_mut() {
                    artifact.location = ImageLocation::ObjectStore { bucket, key };
                }
                job.image_transition_to(ImageState::Exported)?;
                self.store.checkpoint(job, None)?;
            }
            ImageStaging::Direct => {
                let image_id = self
                    .register(job, ImageSource::ProviderSnapshot {
                        snapshot_id: snapshot_id.clone(),
                    })
                    .await?;
                if let Some(artifact) = job.artifact.as_mut() {
                    artifact.destination_image_id = Some(image_id);
                }
                job.image_transition_to(ImageState::Importing)?;
                self.store.checkpoint(job, None)?;
            }
        }
        Ok(())
    }

    /// `Exported` → `Importing`: register the staged object with the
    /// destination image service.
    async fn register_from_store(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        let (bucket, key) = match job.artifact.as_ref().map(|a| &a.location) {
            Some(ImageLocation::ObjectStore { bucket, key }) => (bucket.clone(), key.clone()),
            _ => {
                return Err(MigrateError::Metadata(
                    "exported state without an object-store location".into(),
                ));
            }
        };
        let image_id = self
            .register(job, ImageSource::ObjectStore { bucket, key })
            .await?;
        if let Some(artifact) = job.artifact.as_mut() {
            artifact.destination_image_id = Some(image_id);
        }
        job.image_transition_to(ImageState::Importing)?;
        self.store.checkpoint(job, None)?;
        Ok(())
    }

    /// `Staged` → `Importing`: upload the local file to the staging store,
    /// then register it.
    async fn upload_and_register(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        let ImageStaging::ObjectStore { bucket, prefix } = self.options.image_staging.clone()
        else {
            return Err(MigrateError::Config(
                "a local image requires object-store staging (image_staging.mode = object_store)"
                    .into(),
            ));
        };
        let (path, key) = match job.artifact.as_ref() {
            Some(a) => match &a.location {
                ImageLocation::LocalFile { path } => (
                    path.clone(),
                    format!("{}/{}.{}", prefix, a.artifact_id, a.format),
                ),
                _ => {
                    return Err(MigrateError::Metadata(
                        "staged state without a local file location".into(),
                    ));
                }
            },
            None => {
                return Err(MigrateError::Metadata(
                    "staged state without an artifact".into(),
                ));
            }
        };

        retry::retry_transient(&self.options.provider_retry(), "object put", || {
            self.object_store.put(&bucket, &key, &path)
        })
        .await?;
        tracing::info!(job = %job.id, bucket = %bucket, key = %key, "local image uploaded");

        let image_id = self
            .register(job, ImageSource::ObjectStore {
                bucket: bucket.clone(),
                key: key.clone(),
            })
            .await?;
        if let Some(artifact) = job.artifact.as_mut() {
            artifact.location = ImageLocation::ObjectStore { bucket, key };
            artifact.destination_image_id = Some(image_id);
        }
        job.image_transition_to(ImageState::Importing)?;
        self.store.checkpoint(job, None)?;
        Ok(())
    }

    /// `Importing` → `Ready`: wait for destination-side conversion.
    async fn finish_import(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        let image_id = job
            .artifact
            .as_ref()
            .and_then(|a| a.destination_image_id.clone())
            .ok_or_else(|| {
                MigrateError::Metadata("importing state without a destination image id".into())
            })?;

        let result = retry::retry_transient(&self.stage_policy(), "import wait", || {
            self.wait_import(&image_id)
        })
        .await;

        if let Err(err) = result {
            // A hard provider error during conversion is not recoverable by
            // re-polling; record it on the image machine.
            if !err.is_retryable() {
                job.image_transition_to(ImageState::Failed)?;
                self.store.checkpoint(job, Some(&err))?;
            }
            return Err(err);
        }

        tracing::info!(job = %job.id, image = %image_id, "image ready on destination");
        job.image_transition_to(ImageState::Ready)?;
        self.store.checkpoint(job, None)?;
        Ok(())
    }

    async fn register(&self, job: &MigrationJob, source: ImageSource) -> MigrateResult<String> {
        let name = format!("{}-image", job.destination_name());
        let format = job
            .artifact
            .as_ref()
            .map(|a| a.format)
            .unwrap_or(ImageFormat::Raw);
        retry::retry_transient(&self.options.provider_retry(), "register_image", || {
            retry::with_timeout(
                self.options.provider_call_timeout,
                "register_image",
                self.destination.register_image(&name, format.as_str(), &source),
            )
        })
        .await
    }

    /// One full snapshot poll loop, bounded by the configured deadline.
    async fn wait_snapshot(&self, snapshot_id: &str) -> MigrateResult<()> {
        retry::poll_until(
            self.options.poll_interval,
            self.options.poll_deadline,
            "snapshot",
            || async {
                let status = retry::with_timeout(
                    self.options.provider_call_timeout,
                    "snapshot_status",
                    self.source.snapshot_status(snapshot_id),
                )
                .await?;
                match status {
                    SnapshotStatus::Available => Ok(Some(())),
                    SnapshotStatus::Pending => Ok(None),
                    SnapshotStatus::Error(reason) => Err(MigrateError::ImagePipeline(format!(
                        "snapshot {} failed: {}",
                        snapshot_id, reason
                    ))),
                }
            },
        )
        .await
    }

    async fn wait_export(&self, task_id: &str) -> MigrateResult<()> {
        retry::poll_until(
            self.options.poll_interval,
            self.options.poll_deadline,
            "export",
            || async {
                let status = retry::with_timeout(
                    self.options.provider_call_timeout,
                    "export_status",
                    self.source.export_status(task_id),
                )
                .await?;
                match status {
                    SnapshotStatus::Available => Ok(Some(())),
                    SnapshotStatus::Pending => Ok(None),
                    SnapshotStatus::Error(reason) => Err(MigrateError::ImagePipeline(format!(
                        "export task {} failed: {}",
                        task_id, reason
                    ))),
                }
            },
        )
        .await
    }

    async fn wait_import(&self, image_id: &str) -> MigrateResult<()> {
        retry::poll_until(
            self.options.poll_interval,
            self.options.poll_deadline,
            "import",
            || async {
                let status = retry::with_timeout(
                    self.options.provider_call_timeout,
                    "import_status",
                    self.destination.import_status(image_id),
                )
                .await?;
                match status {
                    ImportStatus::Active => Ok(Some(())),
                    ImportStatus::Converting => Ok(None),
                    ImportStatus::Error(reason) => Err(MigrateError::ImagePipeline(format!(
                        "image {} import failed: {}",
                        image_id, reason
                    ))),
                }
            },
        )
        .await
    }
}
