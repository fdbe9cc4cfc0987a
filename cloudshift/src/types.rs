//! Core data types for migration jobs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// JOB ID
// ============================================================================

/// Migration job identifier (ULID format for sortability).
///
/// ULIDs are 26-character strings encoding a 48-bit millisecond timestamp
/// plus 80 bits of randomness, lexicographically sortable by creation time.
///
/// # Example
///
/// ```
/// use cloudshift::types::JobId;
///
/// let id = JobId::new();
/// assert_eq!(id.as_str().len(), 26);
/// assert_eq!(id.short().len(), 8);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Length of a full job ID (26 chars = ULID format).
    pub const FULL_LENGTH: usize = 26;

    /// Length of the short form used for display (8 chars).
    pub const SHORT_LENGTH: usize = 8;

    /// Generate a new ULID-based job ID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Parse a JobId from an existing string.
    ///
    /// Returns `None` if the string is not a valid 26-char ULID string.
    pub fn parse(s: &str) -> Option<Self> {
        if Self::is_valid(s) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    /// Check if a string is a valid job ID format.
    pub fn is_valid(s: &str) -> bool {
        s.len() == Self::FULL_LENGTH && ulid::Ulid::from_string(s).is_ok()
    }

    /// Get the full job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the short form (first 8 characters) for display.
    pub fn short(&self) -> &str {
        &self.0[..Self::SHORT_LENGTH]
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.short())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// SOURCE DESCRIPTOR
// ============================================================================

/// Compute sizing of an instance as offered by a cloud platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeProfile {
    pub vcpus: u32,
    pub memory_mib: u64,
    /// Root storage in GiB, 0 if unknown.
    #[serde(default)]
    pub storage_gib: u64,
}

impl fmt::Display for ComputeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vCPU / {} MiB / {} GiB",
            self.vcpus, self.memory_mib, self.storage_gib
        )
    }
}

/// A block volume attached to the source instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedVolume {
    pub volume_id: String,
    pub size_gib: u64,
    /// Device name as seen by the source platform (e.g. `/dev/sda1`).
    pub device: Option<String>,
    pub volume_type: String,
    #[serde(default)]
    pub encrypted: bool,
}

/// Everything the orchestrator knows about the source instance.
///
/// Captured once by the Inventory Discoverer and immutable afterwards; later
/// stages only ever see a fully populated descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub instance_id: String,
    /// Display name, from the `Name` tag when present, else the instance id.
    pub name: String,
    /// Source platform's named instance type (e.g. `t3.medium`).
    pub instance_type: String,
    pub profile: ComputeProfile,
    pub volumes: Vec<AttachedVolume>,
    pub security_groups: Vec<String>,
    pub tags: HashMap<String, String>,
    pub keypair: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
}

impl SourceDescriptor {
    /// Total attached storage, used to size the destination boot volume.
    pub fn total_volume_gib(&self) -> u64 {
        self.volumes.iter().map(|v| v.size_gib).sum()
    }

    /// Address the transfer engine should reach the source at.
    pub fn reachable_ip(&self) -> Option<&str> {
        self.public_ip.as_deref().or(self.private_ip.as_deref())
    }
}

// ============================================================================
// IMAGE ARTIFACT
// ============================================================================

/// On-disk format of an image artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vmdk,
    Vhd,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vhd => "vhd",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an image artifact currently lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ImageLocation {
    /// A file on the machine running the orchestrator.
    LocalFile { path: PathBuf },
    /// An object in the staging object store.
    ObjectStore { bucket: String, key: String },
    /// A provider-native image (source snapshot or destination image id).
    ProviderImage { image_id: String },
}

/// A portable image produced by the Image Pipeline.
///
/// One artifact belongs to exactly one job; only the pipeline mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    /// Artifact id, stable across resume (UUID v4).
    pub artifact_id: String,
    pub format: ImageFormat,
    pub location: ImageLocation,
    /// Source-side snapshot id, once the snapshot stage confirmed it.
    pub snapshot_id: Option<String>,
    /// Destination-side image id, once import confirmed it.
    pub destination_image_id: Option<String>,
}

impl ImageArtifact {
    pub fn new(format: ImageFormat, location: ImageLocation) -> Self {
        Self {
            artifact_id: uuid::Uuid::new_v4().to_string(),
            format,
            location,
            snapshot_id: None,
            destination_image_id: None,
        }
    }
}

// ============================================================================
// DESTINATION DESCRIPTOR
// ============================================================================

/// The instance created on the destination platform.
///
/// Produced by the Instance Provisioner, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationDescriptor {
    pub instance_id: String,
    pub name: String,
    pub flavor_id: String,
    pub network_id: String,
    pub keypair: Option<String>,
    pub security_groups: Vec<String>,
    pub private_ip: Option<String>,
    /// Best-effort floating IP, `None` if allocation failed or was skipped.
    #[serde(default)]
    pub floating_ip: Option<String>,
}

impl DestinationDescriptor {
    /// Address the transfer engine should reach the destination at.
    pub fn reachable_ip(&self) -> Option<&str> {
        self.floating_ip.as_deref().or(self.private_ip.as_deref())
    }
}

// ============================================================================
// TRANSFER SPEC
// ============================================================================

/// Transfer mechanism for the data copy stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    /// Delta copy, resumable and convergent. Default.
    Rsync,
    /// One-shot recursive copy, no delta semantics.
    Scp,
}

impl Default for TransferMethod {
    fn default() -> Self {
        TransferMethod::Rsync
    }
}

/// One SSH-reachable endpoint of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEndpoint {
    /// `None` at submit time means "derive from the job's descriptors once
    /// they exist" (the destination address is only known after
    /// provisioning). Resolved by the coordinator before the engine runs.
    #[serde(default)]
    pub host: Option<String>,
    pub user: String,
    /// Reference to private key material (a path today; opaque to the engine).
    pub key_ref: PathBuf,
    pub path: String,
}

/// Full description of the data copy stage. Never mutated mid-transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSpec {
    pub source: TransferEndpoint,
    pub destination: TransferEndpoint,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub method: TransferMethod,
    /// Upper bound on parallel streams within this transfer.
    #[serde(default = "default_max_streams")]
    pub max_streams: u32,
}

fn default_max_streams() -> u32 {
    4
}

/// Cumulative transfer counters, checkpointed after every attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub attempts: u32,
}

/// Counters reported by one transport invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub files_copied: u64,
    pub bytes_copied: u64,
    /// Total files examined on the source side.
    pub files_total: u64,
}

// ============================================================================
// JOB REQUEST
// ============================================================================

/// Execution mode for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Perform the migration.
    Execute,
    /// Discovery and mapping only; log every mutation that would happen.
    DryRun,
}

impl JobMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, JobMode::DryRun)
    }
}

/// Parameters for one migration attempt, as handed to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Source instance to migrate.
    pub source_instance_id: String,
    pub mode: JobMode,
    /// Caller-supplied local image; skips the snapshot/export stages.
    #[serde(default)]
    pub local_image: Option<PathBuf>,
    #[serde(default)]
    pub image_format: Option<ImageFormat>,
    /// Destination network name to attach the instance to.
    pub network: String,
    /// Keypair override; defaults to the source keypair name.
    #[serde(default)]
    pub keypair: Option<String>,
    /// Flavor override; skips the Instance-Type Mapper when set.
    #[serde(default)]
    pub flavor: Option<String>,
    /// Data copy description; `None` skips the transfer stage.
    #[serde(default)]
    pub transfer: Option<TransferSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_format() {
        let id = JobId::new();
        assert_eq!(id.as_str().len(), JobId::FULL_LENGTH);
        assert!(JobId::is_valid(id.as_str()));
        assert_eq!(JobId::parse(id.as_str()), Some(id));
        assert_eq!(JobId::parse("not-a-ulid"), None);
    }

    #[test]
    fn source_descriptor_totals() {
        let descriptor = SourceDescriptor {
            instance_id: "i-0abc".into(),
            name: "web-1".into(),
            instance_type: "t3.medium".into(),
            profile: ComputeProfile {
                vcpus: 2,
                memory_mib: 4096,
                storage_gib: 20,
            },
            volumes: vec![
                AttachedVolume {
                    volume_id: "vol-1".into(),
                    size_gib: 20,
                    device: Some("/dev/sda1".into()),
                    volume_type: "gp3".into(),
                    encrypted: false,
                },
                AttachedVolume {
                    volume_id: "vol-2".into(),
                    size_gib: 100,
                    device: Some("/dev/sdb".into()),
                    volume_type: "gp3".into(),
                    encrypted: true,
                },
            ],
            security_groups: vec!["sg-1".into()],
            tags: HashMap::new(),
            keypair: Some("ops".into()),
            architecture: Some("x86_64".into()),
            platform: Some("linux".into()),
            private_ip: Some("10.0.0.5".into()),
            public_ip: None,
        };

        assert_eq!(descriptor.total_volume_gib(), 120);
        // Falls back to private IP when no public address exists.
        assert_eq!(descriptor.reachable_ip(), Some("10.0.0.5"));
    }

    #[test]
    fn destination_prefers_floating_ip() {
        let dest = DestinationDescriptor {
            instance_id: "srv-1".into(),
            name: "migrate-x".into(),
            flavor_id: "m1.medium".into(),
            network_id: "net-1".into(),
            keypair: None,
            security_groups: vec![],
            private_ip: Some("192.168.1.7".into()),
            floating_ip: Some("203.0.113.9".into()),
        };
        assert_eq!(dest.reachable_ip(), Some("203.0.113.9"));
    }
}
