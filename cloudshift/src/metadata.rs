//! Durable job metadata: append-only checkpoint log plus a snapshot
//! document per job.
//!
//! Layout under the store root:
//! ```text
//! jobs/<job-id>/checkpoints.jsonl   append-only, one checkpoint per line
//! jobs/<job-id>/job.json            snapshot after the latest transition
//! archive/<job-id>/...              terminal jobs, moved wholesale
//! ```
//!
//! `job.json` is the resume contract and must stay backward-readable across
//! tool versions: additive fields are `#[serde(default)]` and unknown fields
//! are ignored on read. The checkpoint log exists so a `Failed` job carries
//! its full history; replaying it reconstructs a snapshot identical to
//! `job.json` (tested).

use crate::error::{MigrateError, MigrateResult};
use crate::job::MigrationJob;
use crate::state::{ImageState, JobState};
use crate::types::{
    DestinationDescriptor, ImageArtifact, JobId, JobRequest, SourceDescriptor, TransferProgress,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One record of the append-only checkpoint log.
///
/// Optional fields carry the value current at this transition; replay folds
/// the log with last-write-wins per field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub state: JobState,
    pub image_state: ImageState,
    /// Present on the first checkpoint only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<JobRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ImageArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<DestinationDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TransferProgress>,
    /// Stage to re-enter on reopen; always reflects the current value,
    /// absent meaning none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CheckpointError>,
}

/// Error context attached to a checkpoint before the error surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointError {
    pub class: String,
    pub message: String,
}

/// Filesystem-backed store for job metadata.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> MigrateResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("jobs"))?;
        fs::create_dir_all(root.join("archive"))?;
        Ok(Self { root })
    }

    fn job_dir(&self, id: &JobId) -> PathBuf {
        self.root.join("jobs").join(id.as_str())
    }

    fn log_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("checkpoints.jsonl")
    }

    fn snapshot_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("job.json")
    }

    /// Persist the job's current state: append a checkpoint to the log, then
    /// rewrite the snapshot atomically. Bumps `job.seq`.
    pub fn checkpoint(
        &self,
        job: &mut MigrationJob,
        error: Option<&MigrateError>,
    ) -> MigrateResult<()> {
        let dir = self.job_dir(&job.id);
        fs::create_dir_all(&dir)?;

        let first = job.seq == 0;
        let record = Checkpoint {
            seq: job.seq,
            at: job.updated_at,
            state: job.state,
            image_state: job.image_state,
            request: first.then(|| job.request.clone()),
            source: job.source.clone(),
            flavor_id: job.flavor_id.clone(),
            artifact: job.artifact.clone(),
            destination: job.destination.clone(),
            progress: Some(job.progress),
            resume_state: job.resume_state,
            error: error.map(|e| CheckpointError {
                class: e.class().to_string(),
                message: e.to_string(),
            }),
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&job.id))?;
        log.write_all(line.as_bytes())?;
        log.sync_all()?;

        job.seq += 1;
        write_atomic(&dir, &self.snapshot_path(&job.id), job)?;

        tracing::debug!(
            job = %job.id,
            seq = job.seq,
            state = %job.state,
            image_state = %job.image_state,
            "checkpointed"
        );
        Ok(())
    }

    /// Load the latest snapshot of a job, `Ok(None)` if unknown.
    pub fn load(&self, id: &JobId) -> MigrateResult<Option<MigrationJob>> {
        let path = self.snapshot_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Rebuild a job snapshot by folding the checkpoint log.
    ///
    /// Invariant: the result equals the persisted snapshot for the same job.
    pub fn replay(&self, id: &JobId) -> MigrateResult<Option<MigrationJob>> {
        let path = self.log_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let mut job: Option<MigrationJob> = None;

        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let record: Checkpoint = serde_json::from_str(line)?;
            match job.as_mut() {
                None => {
                    let request = record.request.clone().ok_or_else(|| {
                        MigrateError::Metadata(format!(
                            "checkpoint log for {} does not start with a request record",
                            id
                        ))
                    })?;
                    let mut initial = MigrationJob::new(request);
                    initial.id = id.clone();
                    initial.created_at = record.at;
                    apply(&mut initial, &record);
                    job = Some(initial);
                }
                Some(job) => apply(job, &record),
            }
        }
        Ok(job)
    }

    /// Ids of all non-archived jobs whose persisted state is resumable.
    pub fn unfinished_jobs(&self) -> MigrateResult<Vec<JobId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join("jobs"))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(JobId::parse) else {
                tracing::warn!(entry = %name.to_string_lossy(), "skipping non-job entry in store");
                continue;
            };
            if let Some(job) = self.load(&id)? {
                if job.state.is_resumable() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Move a terminal job's metadata under `archive/`.
    pub fn archive(&self, id: &JobId) -> MigrateResult<()> {
        let from = self.job_dir(id);
        if !from.exists() {
            return Err(MigrateError::Metadata(format!("job {} not found", id)));
        }
        let to = self.root.join("archive").join(id.as_str());
        fs::rename(&from, &to)?;
        tracing::debug!(job = %id, "archived");
        Ok(())
    }
}

/// Fold one checkpoint into a job, last-write-wins per field.
fn apply(job: &mut MigrationJob, record: &Checkpoint) {
    job.state = record.state;
    job.image_state = record.image_state;
    if record.source.is_some() {
        job.source = record.source.clone();
    }
    if record.flavor_id.is_some() {
        job.flavor_id = record.flavor_id.clone();
    }
    if record.artifact.is_some() {
        job.artifact = record.artifact.clone();
    }
    if record.destination.is_some() {
        job.destination = record.destination.clone();
    }
    if let Some(progress) = record.progress {
        job.progress = progress;
    }
    job.resume_state = record.resume_state;
    if let Some(error) = &record.error {
        job.last_error = Some(error.message.clone());
    }
    job.seq = record.seq + 1;
    job.updated_at = record.at;
}

/// Write JSON via a temp file in the same directory, then rename.
fn write_atomic(dir: &Path, path: &Path, job: &MigrationJob) -> MigrateResult<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, job)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| MigrateError::Metadata(format!("snapshot rename failed: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageFormat, ImageLocation, JobMode, JobRequest};
    use tempfile::TempDir;

    fn request() -> JobRequest {
        JobRequest {
            source_instance_id: "i-0abc".into(),
            mode: JobMode::Execute,
            local_image: None,
            image_format: None,
            network: "private".into(),
            keypair: None,
            flavor: None,
            transfer: None,
        }
    }

    fn store() -> (MetadataStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let store = MetadataStore::open(dir.path()).expect("open store");
        (store, dir)
    }

    #[test]
    fn checkpoint_then_load_round_trips() {
        let (store, _dir) = store();
        let mut job = MigrationJob::new(request());
        store.checkpoint(&mut job, None).unwrap();

        job.transition_to(JobState::Discovering).unwrap();
        store.checkpoint(&mut job, None).unwrap();

        let loaded = store.load(&job.id).unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Discovering);
        assert_eq!(loaded.seq, 2);
        assert_eq!(loaded.id, job.id);
    }

    #[test]
    fn replay_matches_snapshot() {
        let (store, _dir) = store();
        let mut job = MigrationJob::new(request());
        store.checkpoint(&mut job, None).unwrap();

        job.transition_to(JobState::Discovering).unwrap();
        store.checkpoint(&mut job, None).unwrap();

        job.transition_to(JobState::Imaging).unwrap();
        job.image_transition_to(ImageState::Snapshotting).unwrap();
        job.artifact = Some(ImageArtifact::new(
            ImageFormat::Raw,
            ImageLocation::ProviderImage {
                image_id: "ami-1".into(),
            },
        ));
        store.checkpoint(&mut job, None).unwrap();

        job.progress.files_copied = 12;
        job.progress.bytes_copied = 4096;
        let err = MigrateError::Transfer("link dropped".into());
        job.mark_failed(&err);
        store.checkpoint(&mut job, Some(&err)).unwrap();

        let snapshot = store.load(&job.id).unwrap().unwrap();
        let replayed = store.replay(&job.id).unwrap().unwrap();

        assert_eq!(replayed.id, snapshot.id);
        assert_eq!(replayed.state, snapshot.state);
        assert_eq!(replayed.image_state, snapshot.image_state);
        assert_eq!(replayed.artifact, snapshot.artifact);
        assert_eq!(replayed.progress, snapshot.progress);
        assert_eq!(replayed.last_error, snapshot.last_error);
        assert_eq!(replayed.resume_state, snapshot.resume_state);
        assert_eq!(replayed.seq, snapshot.seq);
    }

    #[test]
    fn unfinished_lists_resumable_jobs() {
        let (store, _dir) = store();

        let mut active = MigrationJob::new(request());
        active.transition_to(JobState::Discovering).unwrap();
        store.checkpoint(&mut active, None).unwrap();

        let mut done = MigrationJob::new(request());
        done.transition_to(JobState::Discovering).unwrap();
        done.transition_to(JobState::DryRunCompleted).unwrap();
        store.checkpoint(&mut done, None).unwrap();

        // Failed jobs stay resumable: they reopen at the failing stage.
        let mut failed = MigrationJob::new(request());
        failed.transition_to(JobState::Discovering).unwrap();
        let err = MigrateError::Transient("throttled".into());
        failed.mark_failed(&err);
        store.checkpoint(&mut failed, Some(&err)).unwrap();

        let mut unfinished = store.unfinished_jobs().unwrap();
        unfinished.sort();
        let mut expected = vec![active.id.clone(), failed.id.clone()];
        expected.sort();
        assert_eq!(unfinished, expected);
    }

    #[test]
    fn archive_removes_job_from_scan() {
        let (store, _dir) = store();
        let mut job = MigrationJob::new(request());
        store.checkpoint(&mut job, None).unwrap();

        store.archive(&job.id).unwrap();
        assert!(store.load(&job.id).unwrap().is_none());
        assert!(store.unfinished_jobs().unwrap().is_empty());
    }

    #[test]
    fn snapshot_tolerates_unknown_fields() {
        // Forward compatibility: a newer tool may add fields.
        let (store, _dir) = store();
        let mut job = MigrationJob::new(request());
        store.checkpoint(&mut job, None).unwrap();

        let path = store.snapshot_path(&job.id);
        let raw = fs::read_to_string(&path).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["some_future_field"] = serde_json::json!({"nested": true});
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let loaded = store.load(&job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
    }
}
