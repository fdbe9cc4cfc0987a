//! Integration tests for the transfer engine: convergence, retry with
//! partial progress, attempt accounting.

use cloudshift::error::MigrateError;
use cloudshift::transfer::TransferEngine;
use cloudshift::types::{TransferEndpoint, TransferMethod, TransferProgress, TransferSpec};
use cloudshift_test_utils::{MockTransport, TestContext};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn spec() -> TransferSpec {
    TransferSpec {
        source: TransferEndpoint {
            host: Some("198.51.100.10".into()),
            user: "ubuntu".into(),
            key_ref: PathBuf::from("/keys/migration.pem"),
            path: "/srv/data".into(),
        },
        destination: TransferEndpoint {
            host: Some("203.0.113.7".into()),
            user: "ubuntu".into(),
            key_ref: PathBuf::from("/keys/migration.pem"),
            path: "/srv/data".into(),
        },
        excludes: vec![],
        method: TransferMethod::Rsync,
        max_streams: 4,
    }
}

#[tokio::test]
async fn repeated_transfer_converges_to_zero() {
    let ctx = TestContext::new();
    let transport = Arc::new(MockTransport::with_source_files(&[
        ("a.bin", 100),
        ("b.bin", 200),
    ]));
    let engine = TransferEngine::new(transport.clone(), ctx.options.clone());
    let cancel = CancellationToken::new();

    let mut progress = TransferProgress::default();
    let first = engine.transfer(&spec(), &mut progress, &cancel).await.unwrap();
    assert_eq!(first.files_copied, 2);
    assert_eq!(first.bytes_copied, 300);

    // Unchanged source: the second run moves nothing.
    let second = engine.transfer(&spec(), &mut progress, &cancel).await.unwrap();
    assert_eq!(second.files_copied, 0);
    assert_eq!(second.bytes_copied, 0);

    assert_eq!(progress.files_copied, 2);
    assert_eq!(progress.attempts, 2);
}

#[tokio::test]
async fn interrupted_transfer_retries_and_finishes() {
    let mut ctx = TestContext::new();
    ctx.options.max_transfer_attempts = 2;
    let transport = Arc::new(MockTransport::with_source_files(&[
        ("a.bin", 100),
        ("b.bin", 200),
        ("c.bin", 300),
        ("d.bin", 400),
    ]));
    transport.fail_next.store(1, Ordering::SeqCst);
    let engine = TransferEngine::new(transport.clone(), ctx.options.clone());
    let cancel = CancellationToken::new();

    let mut progress = TransferProgress::default();
    engine
        .transfer(&spec(), &mut progress, &cancel)
        .await
        .unwrap();

    assert_eq!(progress.attempts, 2);
    assert_eq!(transport.sync_calls.load(Ordering::SeqCst), 2);
    // Only the files the first attempt did not land moved on the retry.
    assert_eq!(progress.files_copied, 2);
    assert_eq!(
        *transport.dest_files.lock(),
        *transport.source_files.lock()
    );
}

#[tokio::test]
async fn exhausted_attempts_keep_partial_progress() {
    let mut ctx = TestContext::new();
    ctx.options.max_transfer_attempts = 1;
    let transport = Arc::new(MockTransport::with_source_files(&[
        ("a.bin", 100),
        ("b.bin", 200),
        ("c.bin", 300),
        ("d.bin", 400),
    ]));
    transport.fail_next.store(1, Ordering::SeqCst);
    let engine = TransferEngine::new(transport.clone(), ctx.options.clone());
    let cancel = CancellationToken::new();

    let mut progress = TransferProgress::default();
    let err = engine
        .transfer(&spec(), &mut progress, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrateError::Transfer(_)));
    assert_eq!(progress.attempts, 1);
    // The partial copy stays on the destination for the next resume.
    assert_eq!(transport.dest_files.lock().len(), 2);
}

#[tokio::test]
async fn cancellation_stops_before_the_first_attempt() {
    let ctx = TestContext::new();
    let transport = Arc::new(MockTransport::with_source_files(&[("a.bin", 100)]));
    let engine = TransferEngine::new(transport.clone(), ctx.options.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut progress = TransferProgress::default();
    let err = engine
        .transfer(&spec(), &mut progress, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrateError::Cancelled));
    assert_eq!(transport.sync_calls.load(Ordering::SeqCst), 0);
    assert!(transport.dest_files.lock().is_empty());
}
