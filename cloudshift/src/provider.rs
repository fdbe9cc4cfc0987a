//! Trait seams to the source and destination cloud control planes.
//!
//! The orchestrator never speaks a provider wire protocol itself; everything
//! external is reached through these traits. Production implementations wrap
//! the platform SDKs, tests use the mocks in `cloudshift-test-utils`.
//!
//! Contract notes:
//! - every method is a single provider round-trip; polling loops live in the
//!   callers (with explicit deadlines, see [`crate::retry`])
//! - transient failures are reported as [`MigrateError::Transient`] so the
//!   retry layer can distinguish them from fatal conditions

use crate::error::MigrateResult;
use crate::types::{ComputeProfile, SourceDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// POLLING STATUS TYPES
// ============================================================================

/// Provider-reported status of a snapshot or export task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    Pending,
    Available,
    Error(String),
}

/// Provider-reported status of a destination image import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportStatus {
    /// Queued or converting.
    Converting,
    Active,
    Error(String),
}

/// Provider-reported status of a destination instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Building,
    Active,
    Error(String),
}

/// One entry of the destination flavor catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorSpec {
    pub id: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub disk_gib: u64,
}

impl FlavorSpec {
    pub fn profile(&self) -> ComputeProfile {
        ComputeProfile {
            vcpus: self.vcpus,
            memory_mib: self.memory_mib,
            storage_gib: self.disk_gib,
        }
    }
}

/// Parameters for destination instance creation.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub network_id: String,
    pub keypair: Option<String>,
    pub security_groups: Vec<String>,
    /// Boot-from-volume size; `None` boots from the image directly.
    pub boot_volume_gib: Option<u64>,
}

/// Instance data returned by the destination provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub name: String,
    pub flavor_id: String,
    pub private_ip: Option<String>,
    pub floating_ip: Option<String>,
}

// ============================================================================
// SOURCE PROVIDER
// ============================================================================

/// Read/snapshot surface of the source platform (EC2-shaped).
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fetch instance metadata, volumes and tags in one descriptor.
    ///
    /// Must return [`MigrateError::Discovery`] for not-found or permission
    /// failures and [`MigrateError::Transient`] for retryable conditions.
    async fn describe_instance(&self, instance_id: &str) -> MigrateResult<SourceDescriptor>;

    /// Request a point-in-time image of the instance without rebooting it.
    /// Returns the provider-side snapshot/image id.
    async fn create_snapshot(&self, instance_id: &str, name: &str) -> MigrateResult<String>;

    /// One status poll of a snapshot created by [`Self::create_snapshot`].
    async fn snapshot_status(&self, snapshot_id: &str) -> MigrateResult<SnapshotStatus>;

    /// Start an export of the snapshot to the staging object store.
    /// Returns the provider-side export task id.
    async fn export_snapshot(
        &self,
        snapshot_id: &str,
        bucket: &str,
        key: &str,
    ) -> MigrateResult<String>;

    /// One status poll of an export task.
    async fn export_status(&self, task_id: &str) -> MigrateResult<SnapshotStatus>;
}

// ============================================================================
// DESTINATION PROVIDER
// ============================================================================

/// Image + compute surface of the destination platform (OpenStack-shaped).
#[async_trait]
pub trait DestinationProvider: Send + Sync {
    /// Full flavor catalog. Loaded once at startup for the mapper.
    async fn list_flavors(&self) -> MigrateResult<Vec<FlavorSpec>>;

    /// Resolve a network name to its id; `Ok(None)` when absent.
    async fn find_network(&self, name: &str) -> MigrateResult<Option<String>>;

    /// Check a keypair exists; `Ok(false)` when absent.
    async fn find_keypair(&self, name: &str) -> MigrateResult<bool>;

    /// Register an image with the destination image service, reading either
    /// from the object store or a provider-accessible location. Returns the
    /// destination image id; conversion continues asynchronously.
    async fn register_image(
        &self,
        name: &str,
        disk_format: &str,
        source: &ImageSource,
    ) -> MigrateResult<String>;

    /// One status poll of a registered image.
    async fn import_status(&self, image_id: &str) -> MigrateResult<ImportStatus>;

    /// Create an instance. The provider assigns the id; creation continues
    /// asynchronously until [`Self::instance_status`] reports `Active`.
    async fn create_instance(&self, req: &CreateInstanceRequest) -> MigrateResult<String>;

    /// Look up an instance by exact name; `Ok(None)` when absent.
    /// Provisioning idempotency depends on this.
    async fn find_instance_by_name(&self, name: &str) -> MigrateResult<Option<InstanceRecord>>;

    /// One status poll of an instance.
    async fn instance_status(&self, instance_id: &str) -> MigrateResult<InstanceStatus>;

    /// Fetch the record of an instance that exists.
    async fn get_instance(&self, instance_id: &str) -> MigrateResult<InstanceRecord>;

    /// Allocate and attach a floating IP. Best-effort; callers treat errors
    /// as non-fatal.
    async fn attach_floating_ip(&self, instance_id: &str) -> MigrateResult<String>;
}

/// Where the destination image service should read image bytes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    ObjectStore { bucket: String, key: String },
    /// Provider-to-provider reference (direct streaming import).
    ProviderSnapshot { snapshot_id: String },
}

// ============================================================================
// OBJECT STORE
// ============================================================================

/// Staging store for exported image artifacts.
///
/// Used only when direct streaming import is unsupported or a local image
/// file must be uploaded first.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file. Overwrites any existing object.
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> MigrateResult<()>;

    /// Download an object to a local file.
    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> MigrateResult<()>;

    async fn exists(&self, bucket: &str, key: &str) -> MigrateResult<bool>;
}
