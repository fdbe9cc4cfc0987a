//! The migration coordinator: job ownership, stage sequencing, dry-run,
//! resume, and the bounded worker pool.
//!
//! Each job's stages run strictly in order (Discover → Image → Provision →
//! Transfer); independent jobs run concurrently up to
//! `max_concurrent_jobs`, sharing nothing mutable beyond the read-only
//! [`FlavorMapping`]. A checkpoint is persisted after every state
//! transition; on startup [`MigrationCoordinator::resume`] scans the store
//! and re-enters unfinished jobs at their last checkpoint.

use crate::discovery::Discoverer;
use crate::error::{MigrateError, MigrateResult};
use crate::flavor::FlavorMapping;
use crate::image::ImagePipeline;
use crate::job::{JobSummary, MigrationJob};
use crate::metadata::MetadataStore;
use crate::options::{CoordinatorOptions, ImageStaging};
use crate::provider::{DestinationProvider, ObjectStore, SourceProvider};
use crate::provision::Provisioner;
use crate::retry;
use crate::state::JobState;
use crate::transfer::{TransferEngine, TransferTransport};
use crate::types::{JobId, JobRequest};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Orchestrates migration jobs end to end.
///
/// Cheap to clone; all clones share the same store, providers, registry and
/// worker pool.
#[derive(Clone)]
pub struct MigrationCoordinator {
    options: CoordinatorOptions,
    store: MetadataStore,
    source: Arc<dyn SourceProvider>,
    destination: Arc<dyn DestinationProvider>,
    object_store: Arc<dyn ObjectStore>,
    transport: Arc<dyn TransferTransport>,
    mapping: Arc<FlavorMapping>,
    registry: Arc<RwLock<HashMap<JobId, JobSummary>>>,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl MigrationCoordinator {
    pub fn new(
        options: CoordinatorOptions,
        source: Arc<dyn SourceProvider>,
        destination: Arc<dyn DestinationProvider>,
        object_store: Arc<dyn ObjectStore>,
        transport: Arc<dyn TransferTransport>,
        mapping: FlavorMapping,
    ) -> MigrateResult<Self> {
        if options.max_concurrent_jobs == 0 {
            return Err(MigrateError::Config(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        let store = MetadataStore::open(&options.metadata_dir)?;
        let pool = Arc::new(Semaphore::new(options.max_concurrent_jobs));
        Ok(Self {
            options,
            store,
            source,
            destination,
            object_store,
            transport,
            mapping: Arc::new(mapping),
            registry: Arc::new(RwLock::new(HashMap::new())),
            pool,
            cancel: CancellationToken::new(),
        })
    }

    /// Build a flavor mapping from an exact table plus the destination's
    /// live catalog. Called once at startup, before construction.
    pub async fn load_flavor_mapping(
        destination: &Arc<dyn DestinationProvider>,
        options: &CoordinatorOptions,
        exact: HashMap<String, String>,
    ) -> MigrateResult<FlavorMapping> {
        let catalog = retry::retry_transient(&options.provider_retry(), "list_flavors", || {
            retry::with_timeout(
                options.provider_call_timeout,
                "list_flavors",
                destination.list_flavors(),
            )
        })
        .await?;
        tracing::info!(flavors = catalog.len(), "loaded destination flavor catalog");
        Ok(FlavorMapping::new(exact, catalog))
    }

    /// Accept a new job and persist its initial checkpoint.
    pub fn submit(&self, request: JobRequest) -> MigrateResult<JobId> {
        let mut job = MigrationJob::new(request);
        self.store.checkpoint(&mut job, None)?;
        let id = job.id.clone();
        self.registry.write().insert(id.clone(), job.summary());
        tracing::info!(
            job = %id,
            source = %job.request.source_instance_id,
            dry_run = job.request.mode.is_dry_run(),
            "job submitted"
        );
        Ok(id)
    }

    /// Execute (or continue) one job to a terminal state, bounded by the
    /// worker pool. Returns the job's structured summary; infrastructure
    /// failures (metadata store I/O) surface as errors.
    pub async fn run(&self, id: &JobId) -> MigrateResult<JobSummary> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| MigrateError::Cancelled)?;

        let mut job = self
            .store
            .load(id)?
            .ok_or_else(|| MigrateError::Metadata(format!("job {} not found", id)))?;

        // A failed job re-enters the stage it failed in.
        if job.state == JobState::Failed && job.reopen() {
            tracing::info!(job = %job.id, state = %job.state, "reopening failed job");
            self.store.checkpoint(&mut job, None)?;
        }

        let outcome = self.run_job(&mut job).await;
        match outcome {
            Ok(()) => {}
            Err(MigrateError::Cancelled) => {
                // Leave the job resumable at its last checkpoint.
                tracing::info!(job = %job.id, state = %job.state, "job cancelled between stages");
            }
            Err(err) => {
                tracing::error!(job = %job.id, state = %job.state, error = %err, "job failed");
                job.mark_failed(&err);
                self.store.checkpoint(&mut job, Some(&err))?;
            }
        }

        if matches!(job.state, JobState::Completed | JobState::DryRunCompleted) {
            self.store.archive(&job.id)?;
        }
        let summary = job.summary();
        self.registry.write().insert(job.id.clone(), summary.clone());
        Ok(summary)
    }

    /// Run many jobs concurrently; ordering across jobs is unspecified.
    pub async fn run_all(&self, ids: Vec<JobId>) -> Vec<MigrateResult<JobSummary>> {
        let tasks: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let coordinator = self.clone();
                tokio::spawn(async move { coordinator.run(&id).await })
            })
            .collect();
        futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|task| match task {
                Ok(result) => result,
                Err(join_err) => Err(MigrateError::Metadata(format!(
                    "job task panicked: {}",
                    join_err
                ))),
            })
            .collect()
    }

    /// Ids of persisted jobs that can be re-entered at their last
    /// checkpoint. Call at startup before accepting new work.
    pub fn resume(&self) -> MigrateResult<Vec<JobId>> {
        let ids = self.store.unfinished_jobs()?;
        for id in &ids {
            if let Some(job) = self.store.load(id)? {
                tracing::info!(
                    job = %id,
                    state = %job.state,
                    image_state = %job.image_state,
                    "resumable job found"
                );
                self.registry.write().insert(id.clone(), job.summary());
            }
        }
        Ok(ids)
    }

    /// Request cooperative cancellation: honored between stage transitions
    /// and at transfer attempt boundaries, never mid-provider-call.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Latest known summary for a job (persisted state preferred).
    pub fn summary(&self, id: &JobId) -> MigrateResult<Option<JobSummary>> {
        if let Some(job) = self.store.load(id)? {
            return Ok(Some(job.summary()));
        }
        Ok(self.registry.read().get(id).cloned())
    }

    /// Summaries of every job this coordinator has seen.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut all: Vec<_> = self.registry.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    // ------------------------------------------------------------------
    // STAGE SEQUENCING
    // ------------------------------------------------------------------

    async fn run_job(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        while !job.state.is_terminal() {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            match job.state {
                JobState::Created => {
                    job.transition_to(JobState::Discovering)?;
                    self.store.checkpoint(job, None)?;
                }
                JobState::Discovering => self.stage_discover(job).await?,
                JobState::Imaging => self.stage_image(job).await?,
                JobState::Provisioning => self.stage_provision(job).await?,
                JobState::Transferring => self.stage_transfer(job).await?,
                // Terminal states end the loop.
                JobState::Completed | JobState::DryRunCompleted | JobState::Failed => break,
            }
            self.registry.write().insert(job.id.clone(), job.summary());
        }
        Ok(())
    }

    /// Discover the source instance and map its flavor; in dry-run mode,
    /// log every mutation that would follow and finish.
    async fn stage_discover(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        let discoverer = Discoverer::new(
            self.source.clone(),
            self.options.provider_retry(),
            self.options.provider_call_timeout,
        );
        let descriptor = discoverer
            .discover(&job.request.source_instance_id)
            .await?;

        let flavor_id = match &job.request.flavor {
            Some(flavor) => {
                tracing::info!(job = %job.id, flavor = %flavor, "using requested flavor override");
                flavor.clone()
            }
            None => self
                .mapping
                .map(&descriptor.instance_type, &descriptor.profile)?,
        };

        job.source = Some(descriptor);
        job.flavor_id = Some(flavor_id);

        if job.request.mode.is_dry_run() {
            self.log_dry_run_plan(job);
            job.transition_to(JobState::DryRunCompleted)?;
        } else {
            job.transition_to(JobState::Imaging)?;
        }
        self.store.checkpoint(job, None)?;
        Ok(())
    }

    async fn stage_image(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        let pipeline = ImagePipeline::new(
            self.source.clone(),
            self.destination.clone(),
            self.object_store.clone(),
            self.store.clone(),
            self.options.clone(),
        );
        pipeline.run(job, &self.cancel).await?;
        job.transition_to(JobState::Provisioning)?;
        self.store.checkpoint(job, None)?;
        Ok(())
    }

    async fn stage_provision(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        let provisioner = Provisioner::new(self.destination.clone(), self.options.clone());
        let destination = provisioner.provision(job).await?;
        tracing::info!(
            job = %job.id,
            instance = %destination.instance_id,
            ip = destination.reachable_ip().unwrap_or("<none>"),
            "destination instance ready"
        );
        job.destination = Some(destination);
        let next = if job.request.transfer.is_some() {
            JobState::Transferring
        } else {
            JobState::Completed
        };
        job.transition_to(next)?;
        self.store.checkpoint(job, None)?;
        Ok(())
    }

    async fn stage_transfer(&self, job: &mut MigrationJob) -> MigrateResult<()> {
        let mut spec = job.request.transfer.clone().ok_or_else(|| {
            MigrateError::Metadata("transferring state without a transfer spec".into())
        })?;

        // Endpoints left unresolved at submit time take the addresses the
        // earlier stages discovered or created.
        if spec.source.host.is_none() {
            spec.source.host = job
                .source
                .as_ref()
                .and_then(|s| s.reachable_ip())
                .map(str::to_string);
        }
        if spec.destination.host.is_none() {
            spec.destination.host = job
                .destination
                .as_ref()
                .and_then(|d| d.reachable_ip())
                .map(str::to_string);
        }
        if spec.source.host.is_none() || spec.destination.host.is_none() {
            return Err(MigrateError::Transfer(
                "no reachable address for one of the transfer endpoints".into(),
            ));
        }

        let engine = TransferEngine::new(self.transport.clone(), self.options.clone());

        let mut progress = job.progress;
        let result = engine.transfer(&spec, &mut progress, &self.cancel).await;
        // Progress survives failed attempts for operator diagnosis.
        job.progress = progress;
        match result {
            Ok(_) => {
                job.transition_to(JobState::Completed)?;
                self.store.checkpoint(job, None)?;
                Ok(())
            }
            Err(err) => {
                self.store.checkpoint(job, Some(&err))?;
                Err(err)
            }
        }
    }

    /// The dry-run contract: name every mutating call that would be issued,
    /// issue none of them.
    fn log_dry_run_plan(&self, job: &MigrationJob) {
        let Some(source) = job.source.as_ref() else {
            return;
        };
        let flavor = job.flavor_id.as_deref().unwrap_or("<unmapped>");
        tracing::info!(job = %job.id, "dry-run: no mutating provider calls will be issued");
        if let Some(path) = &job.request.local_image {
            tracing::info!(
                job = %job.id,
                image = %path.display(),
                "dry-run: would upload local image and register it"
            );
        } else {
            tracing::info!(
                job = %job.id,
                instance = %source.instance_id,
                "dry-run: would create a snapshot of the source instance"
            );
            match &self.options.image_staging {
                ImageStaging::ObjectStore { bucket, prefix } => tracing::info!(
                    job = %job.id,
                    bucket = %bucket,
                    prefix = %prefix,
                    "dry-run: would export the snapshot to the object store and register it"
                ),
                ImageStaging::Direct => tracing::info!(
                    job = %job.id,
                    "dry-run: would register the snapshot directly with the destination"
                ),
            }
        }
        tracing::info!(
            job = %job.id,
            name = %job.destination_name(),
            flavor = %flavor,
            network = %job.request.network,
            "dry-run: would create the destination instance"
        );
        if let Some(spec) = &job.request.transfer {
            tracing::info!(
                job = %job.id,
                source = spec.source.host.as_deref().unwrap_or("<discovered address>"),
                destination = spec.destination.host.as_deref().unwrap_or("<provisioned address>"),
                excludes = spec.excludes.len(),
                "dry-run: would transfer data"
            );
        }
    }
}
