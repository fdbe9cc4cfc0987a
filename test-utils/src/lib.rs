//! Mock providers, object store and transport for cloudshift tests.
//!
//! The mocks are deterministic and in-memory. Failure injection is explicit:
//! each mock carries counters that make the next N calls or polls fail, so
//! tests can script a transient outage and then assert what the orchestrator
//! did and did not re-execute afterwards. Every mutating call is counted.

use async_trait::async_trait;
use cloudshift::coordinator::MigrationCoordinator;
use cloudshift::error::{MigrateError, MigrateResult};
use cloudshift::flavor::FlavorMapping;
use cloudshift::options::{CoordinatorOptions, ImageStaging};
use cloudshift::provider::{
    CreateInstanceRequest, DestinationProvider, FlavorSpec, ImageSource, ImportStatus,
    InstanceRecord, InstanceStatus, ObjectStore, SnapshotStatus, SourceProvider,
};
use cloudshift::transfer::TransferTransport;
use cloudshift::types::{
    AttachedVolume, ComputeProfile, JobMode, JobRequest, SourceDescriptor, TransferEndpoint,
    TransferSpec, TransferStats,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ============================================================================
// SOURCE PROVIDER MOCK
// ============================================================================

/// In-memory EC2-shaped source.
#[derive(Default)]
pub struct MockSource {
    pub instances: Mutex<HashMap<String, SourceDescriptor>>,
    /// Next N `describe_instance` calls fail with a transient error.
    pub describe_failures: AtomicU32,
    /// Polls returning `Pending` before a snapshot becomes available.
    pub snapshot_pending_polls: AtomicU32,
    /// Polls returning `Pending` before an export task completes.
    pub export_pending_polls: AtomicU32,
    pub describe_calls: AtomicU32,
    pub create_snapshot_calls: AtomicU32,
    pub export_calls: AtomicU32,
    snapshot_seq: AtomicU32,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(descriptor: SourceDescriptor) -> Self {
        let mock = Self::default();
        mock.add_instance(descriptor);
        mock
    }

    pub fn add_instance(&self, descriptor: SourceDescriptor) {
        self.instances
            .lock()
            .insert(descriptor.instance_id.clone(), descriptor);
    }
}

#[async_trait]
impl SourceProvider for MockSource {
    async fn describe_instance(&self, instance_id: &str) -> MigrateResult<SourceDescriptor> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.describe_failures) {
            return Err(MigrateError::Transient("api throttled".into()));
        }
        self.instances
            .lock()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| {
                MigrateError::Discovery(format!("instance {} not found", instance_id))
            })
    }

    async fn create_snapshot(&self, instance_id: &str, _name: &str) -> MigrateResult<String> {
        if !self.instances.lock().contains_key(instance_id) {
            return Err(MigrateError::Discovery(format!(
                "instance {} not found",
                instance_id
            )));
        }
        self.create_snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let n = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("snap-{:04}", n))
    }

    async fn snapshot_status(&self, _snapshot_id: &str) -> MigrateResult<SnapshotStatus> {
        if take_one(&self.snapshot_pending_polls) {
            return Ok(SnapshotStatus::Pending);
        }
        Ok(SnapshotStatus::Available)
    }

    async fn export_snapshot(
        &self,
        snapshot_id: &str,
        _bucket: &str,
        _key: &str,
    ) -> MigrateResult<String> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("export-{}", snapshot_id))
    }

    async fn export_status(&self, _task_id: &str) -> MigrateResult<SnapshotStatus> {
        if take_one(&self.export_pending_polls) {
            return Ok(SnapshotStatus::Pending);
        }
        Ok(SnapshotStatus::Available)
    }
}

// ============================================================================
// DESTINATION PROVIDER MOCK
// ============================================================================

/// In-memory OpenStack-shaped destination.
pub struct MockDestination {
    pub flavors: Vec<FlavorSpec>,
    pub networks: Mutex<HashMap<String, String>>,
    pub keypairs: Mutex<HashSet<String>>,
    /// Registered images and their remaining `Converting` polls.
    images: Mutex<HashMap<String, u32>>,
    /// Instances keyed by name (provisioning looks them up by name).
    instances: Mutex<HashMap<String, InstanceRecord>>,
    /// Most recent `create_instance` request, for assertions.
    pub last_create: Mutex<Option<CreateInstanceRequest>>,
    /// Converting polls a freshly registered image goes through.
    pub import_pending_polls: u32,
    /// Next N `import_status` calls fail with a transient error.
    pub fail_import_polls: AtomicU32,
    /// Next N `find_network` calls fail with a transient error.
    pub fail_network_finds: AtomicU32,
    /// Building polls a freshly created instance goes through.
    pub instance_building_polls: AtomicU32,
    /// When set, `attach_floating_ip` fails (the caller must survive it).
    pub fail_floating_ip: AtomicU32,
    pub register_image_calls: AtomicU32,
    pub create_instance_calls: AtomicU32,
    pub floating_ip_calls: AtomicU32,
    image_seq: AtomicU32,
    instance_seq: AtomicU32,
}

impl MockDestination {
    pub fn new() -> Self {
        let mut networks = HashMap::new();
        networks.insert("private".to_string(), "net-0001".to_string());
        let mut keypairs = HashSet::new();
        keypairs.insert("ops".to_string());
        Self {
            flavors: standard_catalog(),
            networks: Mutex::new(networks),
            keypairs: Mutex::new(keypairs),
            images: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            last_create: Mutex::new(None),
            import_pending_polls: 0,
            fail_import_polls: AtomicU32::new(0),
            fail_network_finds: AtomicU32::new(0),
            instance_building_polls: AtomicU32::new(0),
            fail_floating_ip: AtomicU32::new(0),
            register_image_calls: AtomicU32::new(0),
            create_instance_calls: AtomicU32::new(0),
            floating_ip_calls: AtomicU32::new(0),
            image_seq: AtomicU32::new(0),
            instance_seq: AtomicU32::new(0),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }
}

impl Default for MockDestination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DestinationProvider for MockDestination {
    async fn list_flavors(&self) -> MigrateResult<Vec<FlavorSpec>> {
        Ok(self.flavors.clone())
    }

    async fn find_network(&self, name: &str) -> MigrateResult<Option<String>> {
        if take_one(&self.fail_network_finds) {
            return Err(MigrateError::Transient("network api throttled".into()));
        }
        Ok(self.networks.lock().get(name).cloned())
    }

    async fn find_keypair(&self, name: &str) -> MigrateResult<bool> {
        Ok(self.keypairs.lock().contains(name))
    }

    async fn register_image(
        &self,
        _name: &str,
        _disk_format: &str,
        _source: &ImageSource,
    ) -> MigrateResult<String> {
        self.register_image_calls.fetch_add(1, Ordering::SeqCst);
        let n = self.image_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("img-{:04}", n);
        self.images.lock().insert(id.clone(), self.import_pending_polls);
        Ok(id)
    }

    async fn import_status(&self, image_id: &str) -> MigrateResult<ImportStatus> {
        if take_one(&self.fail_import_polls) {
            return Err(MigrateError::Transient("image service unavailable".into()));
        }
        let mut images = self.images.lock();
        match images.get_mut(image_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Ok(ImportStatus::Converting)
            }
            Some(_) => Ok(ImportStatus::Active),
            None => Ok(ImportStatus::Error(format!("image {} unknown", image_id))),
        }
    }

    async fn create_instance(&self, req: &CreateInstanceRequest) -> MigrateResult<String> {
        if !self.images.lock().contains_key(&req.image_id) {
            return Err(MigrateError::Provisioning(format!(
                "image {} unknown",
                req.image_id
            )));
        }
        self.create_instance_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_create.lock() = Some(req.clone());
        let n = self.instance_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = InstanceRecord {
            instance_id: format!("srv-{:04}", n),
            name: req.name.clone(),
            flavor_id: req.flavor_id.clone(),
            private_ip: Some(format!("192.168.10.{}", n)),
            floating_ip: None,
        };
        let id = record.instance_id.clone();
        self.instances.lock().insert(req.name.clone(), record);
        Ok(id)
    }

    async fn find_instance_by_name(&self, name: &str) -> MigrateResult<Option<InstanceRecord>> {
        Ok(self.instances.lock().get(name).cloned())
    }

    async fn instance_status(&self, instance_id: &str) -> MigrateResult<InstanceStatus> {
        let known = self
            .instances
            .lock()
            .values()
            .any(|r| r.instance_id == instance_id);
        if !known {
            return Ok(InstanceStatus::Error(format!(
                "instance {} unknown",
                instance_id
            )));
        }
        if take_one(&self.instance_building_polls) {
            return Ok(InstanceStatus::Building);
        }
        Ok(InstanceStatus::Active)
    }

    async fn get_instance(&self, instance_id: &str) -> MigrateResult<InstanceRecord> {
        self.instances
            .lock()
            .values()
            .find(|r| r.instance_id == instance_id)
            .cloned()
            .ok_or_else(|| {
                MigrateError::Provisioning(format!("instance {} unknown", instance_id))
            })
    }

    async fn attach_floating_ip(&self, instance_id: &str) -> MigrateResult<String> {
        self.floating_ip_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_floating_ip) {
            return Err(MigrateError::Provisioning("floating ip pool exhausted".into()));
        }
        let mut instances = self.instances.lock();
        let record = instances
            .values_mut()
            .find(|r| r.instance_id == instance_id)
            .ok_or_else(|| {
                MigrateError::Provisioning(format!("instance {} unknown", instance_id))
            })?;
        let ip = format!("203.0.113.{}", 50 + self.floating_ip_calls.load(Ordering::SeqCst));
        record.floating_ip = Some(ip.clone());
        Ok(ip)
    }
}

/// An m1.* catalog matching the burned-in exact table.
pub fn standard_catalog() -> Vec<FlavorSpec> {
    let flavor = |id: &str, vcpus: u32, memory_mib: u64, disk_gib: u64| FlavorSpec {
        id: id.to_string(),
        vcpus,
        memory_mib,
        disk_gib,
    };
    vec![
        flavor("m1.tiny", 1, 512, 1),
        flavor("m1.small", 1, 2048, 20),
        flavor("m1.medium", 2, 4096, 40),
        flavor("m1.large", 4, 8192, 80),
        flavor("m1.xlarge", 8, 16384, 160),
        flavor("m1.2xlarge", 16, 32768, 320),
    ]
}

// ============================================================================
// OBJECT STORE MOCK
// ============================================================================

#[derive(Default)]
pub struct MockObjectStore {
    pub objects: Mutex<HashMap<(String, String), PathBuf>>,
    pub put_calls: AtomicU32,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> MigrateResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            local_path.to_path_buf(),
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str, _local_path: &Path) -> MigrateResult<()> {
        if !self
            .objects
            .lock()
            .contains_key(&(bucket.to_string(), key.to_string()))
        {
            return Err(MigrateError::Metadata(format!(
                "object {}/{} does not exist",
                bucket, key
            )));
        }
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> MigrateResult<bool> {
        Ok(self
            .objects
            .lock()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }
}

// ============================================================================
// TRANSPORT MOCK
// ============================================================================

/// In-memory delta-copying transport with rsync-like convergence.
///
/// Source and destination are file-name → size maps; a sync copies only
/// files missing or differing on the destination. `fail_next` makes the
/// next N sync calls copy half the remaining delta and then fail, which is
/// how an interrupted rsync behaves.
#[derive(Default)]
pub struct MockTransport {
    pub source_files: Mutex<BTreeMap<String, u64>>,
    pub dest_files: Mutex<BTreeMap<String, u64>>,
    pub fail_next: AtomicU32,
    pub sync_calls: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source_files(files: &[(&str, u64)]) -> Self {
        let transport = Self::default();
        let mut source = transport.source_files.lock();
        for (name, size) in files {
            source.insert(name.to_string(), *size);
        }
        drop(source);
        transport
    }
}

#[async_trait]
impl TransferTransport for MockTransport {
    async fn sync(&self, _spec: &TransferSpec) -> MigrateResult<TransferStats> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        let source = self.source_files.lock().clone();
        let mut dest = self.dest_files.lock();

        let delta: Vec<(String, u64)> = source
            .iter()
            .filter(|(name, size)| dest.get(*name) != Some(size))
            .map(|(name, size)| (name.clone(), *size))
            .collect();

        if take_one(&self.fail_next) {
            // Partial copy, then a dropped connection.
            for (name, size) in delta.iter().take(delta.len() / 2) {
                dest.insert(name.clone(), *size);
            }
            return Err(MigrateError::Transfer("connection reset by peer".into()));
        }

        let mut stats = TransferStats {
            files_total: source.len() as u64,
            ..TransferStats::default()
        };
        for (name, size) in delta {
            dest.insert(name, size);
            stats.files_copied += 1;
            stats.bytes_copied += size;
        }
        Ok(stats)
    }
}

// ============================================================================
// TEST CONTEXT
// ============================================================================

/// Isolated coordinator wired to mocks, with a throwaway metadata dir and
/// timings tuned so poll loops finish in milliseconds.
pub struct TestContext {
    pub source: Arc<MockSource>,
    pub destination: Arc<MockDestination>,
    pub object_store: Arc<MockObjectStore>,
    pub transport: Arc<MockTransport>,
    pub options: CoordinatorOptions,
    _temp_dir: TempDir, // Dropped after test
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_staging(ImageStaging::Direct)
    }

    pub fn with_staging(staging: ImageStaging) -> Self {
        cloudshift::logging::init_logging("cloudshift=warn");
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut options = CoordinatorOptions::new(temp_dir.path().join("metadata"));
        options.provider_call_timeout = Duration::from_secs(5);
        options.poll_interval = Duration::from_millis(1);
        options.poll_deadline = Duration::from_secs(2);
        options.max_stage_attempts = 2;
        options.image_staging = staging;

        let source = Arc::new(MockSource::new());
        source.add_instance(web_server_descriptor("i-0abc1234"));

        Self {
            source,
            destination: Arc::new(MockDestination::new()),
            object_store: Arc::new(MockObjectStore::new()),
            transport: Arc::new(MockTransport::new()),
            options,
            _temp_dir: temp_dir,
        }
    }

    pub fn coordinator(&self) -> MigrationCoordinator {
        let mapping = FlavorMapping::new(
            FlavorMapping::builtin_exact_table(),
            self.destination.flavors.clone(),
        );
        MigrationCoordinator::new(
            self.options.clone(),
            self.source.clone(),
            self.destination.clone(),
            self.object_store.clone(),
            self.transport.clone(),
            mapping,
        )
        .expect("failed to build coordinator")
    }

    /// A plain execute request for the fixture instance, no transfer stage.
    pub fn request(&self) -> JobRequest {
        JobRequest {
            source_instance_id: "i-0abc1234".into(),
            mode: JobMode::Execute,
            local_image: None,
            image_format: None,
            network: "private".into(),
            keypair: None,
            flavor: None,
            transfer: None,
        }
    }

    /// Same request with a data-copy stage; endpoint hosts are left for the
    /// coordinator to resolve from the discovered/provisioned addresses.
    pub fn request_with_transfer(&self) -> JobRequest {
        let mut request = self.request();
        request.transfer = Some(TransferSpec {
            source: TransferEndpoint {
                host: None,
                user: "ubuntu".into(),
                key_ref: PathBuf::from("/keys/migration.pem"),
                path: "/srv/data".into(),
            },
            destination: TransferEndpoint {
                host: None,
                user: "ubuntu".into(),
                key_ref: PathBuf::from("/keys/migration.pem"),
                path: "/srv/data".into(),
            },
            excludes: vec!["*.tmp".into()],
            method: Default::default(),
            max_streams: 4,
        });
        request
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A t3.medium web server with two volumes, the standard fixture.
pub fn web_server_descriptor(instance_id: &str) -> SourceDescriptor {
    SourceDescriptor {
        instance_id: instance_id.to_string(),
        name: "web-1".into(),
        instance_type: "t3.medium".into(),
        profile: ComputeProfile {
            vcpus: 2,
            memory_mib: 4096,
            storage_gib: 20,
        },
        volumes: vec![
            AttachedVolume {
                volume_id: "vol-root".into(),
                size_gib: 20,
                device: Some("/dev/sda1".into()),
                volume_type: "gp3".into(),
                encrypted: false,
            },
            AttachedVolume {
                volume_id: "vol-data".into(),
                size_gib: 80,
                device: Some("/dev/sdb".into()),
                volume_type: "gp3".into(),
                encrypted: true,
            },
        ],
        security_groups: vec!["sg-web".into()],
        tags: HashMap::from([("Name".to_string(), "web-1".to_string())]),
        keypair: Some("ops".into()),
        architecture: Some("x86_64".into()),
        platform: Some("linux".into()),
        private_ip: Some("10.0.0.5".into()),
        public_ip: Some("198.51.100.10".into()),
    }
}
