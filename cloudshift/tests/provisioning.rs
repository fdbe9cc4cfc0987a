//! Integration tests for destination provisioning (idempotency, fatal
//! conditions, best-effort floating IP).

use cloudshift::job::MigrationJob;
use cloudshift::provider::{DestinationProvider, ImageSource};
use cloudshift::provision::Provisioner;
use cloudshift::state::ImageState;
use cloudshift::types::{ImageArtifact, ImageFormat, ImageLocation};
use cloudshift_test_utils::{web_server_descriptor, TestContext};
use std::sync::atomic::Ordering;

/// A job that already went through discovery and the image pipeline.
async fn ready_job(ctx: &TestContext) -> MigrationJob {
    let image_id = ctx
        .destination
        .register_image(
            "web-1-image",
            "raw",
            &ImageSource::ProviderSnapshot {
                snapshot_id: "snap-0001".into(),
            },
        )
        .await
        .unwrap();

    let mut job = MigrationJob::new(ctx.request());
    job.source = Some(web_server_descriptor("i-0abc1234"));
    job.flavor_id = Some("m1.medium".into());
    let mut artifact = ImageArtifact::new(
        ImageFormat::Raw,
        ImageLocation::ProviderImage {
            image_id: image_id.clone(),
        },
    );
    artifact.snapshot_id = Some("snap-0001".into());
    artifact.destination_image_id = Some(image_id);
    job.artifact = Some(artifact);
    job.image_state = ImageState::Ready;
    job
}

#[tokio::test]
async fn provisioning_is_idempotent_per_job() {
    let ctx = TestContext::new();
    let provisioner = Provisioner::new(ctx.destination.clone(), ctx.options.clone());
    let job = ready_job(&ctx).await;

    let first = provisioner.provision(&job).await.unwrap();
    let second = provisioner.provision(&job).await.unwrap();

    // The second call adopts the existing instance instead of duplicating it.
    assert_eq!(first.instance_id, second.instance_id);
    assert_eq!(
        ctx.destination.create_instance_calls.load(Ordering::SeqCst),
        1
    );
    assert_eq!(ctx.destination.instance_count(), 1);
    assert_eq!(first.name, job.destination_name());
    assert_eq!(first.flavor_id, "m1.medium");
}

#[tokio::test]
async fn transient_lookup_blips_are_retried() {
    let ctx = TestContext::new();
    ctx.destination.fail_network_finds.store(1, Ordering::SeqCst);
    let provisioner = Provisioner::new(ctx.destination.clone(), ctx.options.clone());
    let job = ready_job(&ctx).await;

    // One throttled network lookup must not strand the job in operator
    // territory; the retry absorbs it and provisioning proceeds.
    let descriptor = provisioner.provision(&job).await.unwrap();
    assert_eq!(descriptor.network_id, "private");
    assert_eq!(
        ctx.destination.create_instance_calls.load(Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn exhausted_lookup_retries_become_fatal() {
    let mut ctx = TestContext::new();
    ctx.options.provider_attempts = 1;
    ctx.destination.fail_network_finds.store(1, Ordering::SeqCst);
    let provisioner = Provisioner::new(ctx.destination.clone(), ctx.options.clone());
    let job = ready_job(&ctx).await;

    let err = provisioner.provision(&job).await.unwrap_err();
    // Past the retry budget the error is provisioning-class, not retryable.
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("provisioning failed"));
    assert_eq!(
        ctx.destination.create_instance_calls.load(Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn missing_network_is_fatal() {
    let ctx = TestContext::new();
    let provisioner = Provisioner::new(ctx.destination.clone(), ctx.options.clone());
    let mut job = ready_job(&ctx).await;
    job.request.network = "no-such-network".into();

    let err = provisioner.provision(&job).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("no-such-network"));
    assert_eq!(
        ctx.destination.create_instance_calls.load(Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn unknown_keypair_is_dropped_not_fatal() {
    let ctx = TestContext::new();
    let provisioner = Provisioner::new(ctx.destination.clone(), ctx.options.clone());
    let mut job = ready_job(&ctx).await;
    job.request.keypair = Some("ghost-key".into());

    let descriptor = provisioner.provision(&job).await.unwrap();
    assert_eq!(
        ctx.destination.create_instance_calls.load(Ordering::SeqCst),
        1
    );
    assert!(descriptor.private_ip.is_some());
}

#[tokio::test]
async fn floating_ip_failure_is_best_effort() {
    let ctx = TestContext::new();
    ctx.destination.fail_floating_ip.store(1, Ordering::SeqCst);
    let provisioner = Provisioner::new(ctx.destination.clone(), ctx.options.clone());
    let job = ready_job(&ctx).await;

    let descriptor = provisioner.provision(&job).await.unwrap();
    assert_eq!(ctx.destination.floating_ip_calls.load(Ordering::SeqCst), 1);
    assert!(descriptor.floating_ip.is_none());
    // The instance is still reachable through its private address.
    assert!(descriptor.reachable_ip().is_some());
}

#[tokio::test]
async fn provisioning_requires_a_ready_image() {
    let ctx = TestContext::new();
    let provisioner = Provisioner::new(ctx.destination.clone(), ctx.options.clone());
    let mut job = ready_job(&ctx).await;
    job.image_state = ImageState::Importing;

    let err = provisioner.provision(&job).await.unwrap_err();
    assert!(err.to_string().contains("invalid state"));
    assert_eq!(
        ctx.destination.create_instance_calls.load(Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn boot_volume_matches_source_storage() {
    let ctx = TestContext::new();
    let provisioner = Provisioner::new(ctx.destination.clone(), ctx.options.clone());
    let job = ready_job(&ctx).await;

    provisioner.provision(&job).await.unwrap();

    // The fixture has 20 + 80 GiB attached.
    let request = ctx.destination.last_create.lock().clone().unwrap();
    assert_eq!(request.boot_volume_gib, Some(100));
    assert_eq!(request.flavor_id, "m1.medium");
    assert_eq!(request.security_groups, vec!["sg-web".to_string()]);
    // Source keypair carries over when no override is set.
    assert_eq!(request.keypair.as_deref(), Some("ops"));
}
