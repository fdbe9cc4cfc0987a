//! Cloudshift — a resumable compute-instance migration orchestrator.
//!
//! Moves a running instance (and its data) from a source cloud platform to
//! a destination platform: discovers the source configuration, produces a
//! destination-importable image, provisions an equivalent instance, and
//! copies the data across. Every state transition is checkpointed to a
//! durable metadata store, turning a fragile one-shot procedure into a
//! pipeline that can be interrupted and resumed without repeating expensive
//! steps.
//!
//! The cloud control planes, the object store, and the byte-transfer
//! transport are trait seams ([`provider`], [`transfer::TransferTransport`]);
//! this crate orchestrates, it does not speak provider wire protocols.
//!
//! # Example
//!
//! ```ignore
//! use cloudshift::coordinator::MigrationCoordinator;
//! use cloudshift::options::CoordinatorOptions;
//! use cloudshift::types::{JobMode, JobRequest};
//!
//! # async fn example(
//! #     source: std::sync::Arc<dyn cloudshift::provider::SourceProvider>,
//! #     destination: std::sync::Arc<dyn cloudshift::provider::DestinationProvider>,
//! #     object_store: std::sync::Arc<dyn cloudshift::provider::ObjectStore>,
//! #     transport: std::sync::Arc<dyn cloudshift::transfer::TransferTransport>,
//! # ) -> cloudshift::MigrateResult<()> {
//! let options = CoordinatorOptions::new("/var/lib/cloudshift");
//! let mapping = MigrationCoordinator::load_flavor_mapping(
//!     &destination,
//!     &options,
//!     cloudshift::flavor::FlavorMapping::builtin_exact_table(),
//! )
//! .await?;
//! let coordinator = MigrationCoordinator::new(
//!     options, source, destination, object_store, transport, mapping,
//! )?;
//!
//! let id = coordinator.submit(JobRequest {
//!     source_instance_id: "i-0abc123".into(),
//!     mode: JobMode::Execute,
//!     local_image: None,
//!     image_format: None,
//!     network: "private".into(),
//!     keypair: None,
//!     flavor: None,
//!     transfer: None,
//! })?;
//! let summary = coordinator.run(&id).await?;
//! assert!(summary.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod flavor;
pub mod image;
pub mod job;
pub mod logging;
pub mod metadata;
pub mod options;
pub mod provider;
pub mod provision;
pub mod retry;
pub mod state;
pub mod transfer;
pub mod types;

pub use coordinator::MigrationCoordinator;
pub use error::{MigrateError, MigrateResult};
pub use flavor::FlavorMapping;
pub use job::{JobSummary, MigrationJob};
pub use metadata::MetadataStore;
pub use options::CoordinatorOptions;
pub use state::{ImageState, JobState};
pub use types::{JobId, JobMode, JobRequest};
