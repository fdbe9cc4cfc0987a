//! Data transfer between the source and destination instances.
//!
//! The engine owns retry/backoff and progress accounting; the byte movement
//! itself is delegated to a [`TransferTransport`]. The production transport
//! shells out to rsync over SSH, whose delta semantics give the convergence
//! guarantee: re-invoking an interrupted transfer with the same spec copies
//! only what is missing, and an unchanged source copies zero bytes.

use crate::error::{MigrateError, MigrateResult};
use crate::options::CoordinatorOptions;
use crate::types::{TransferMethod, TransferProgress, TransferSpec, TransferStats};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

// ============================================================================
// TRANSPORT
// ============================================================================

/// One invocation of the underlying copy mechanism.
///
/// Implementations report connectivity failures as
/// [`MigrateError::Transfer`] so the engine can retry them.
/// `spec.max_streams` is an upper bound for transports that fan out
/// internally; single-stream transports (rsync, scp) need not consult it.
#[async_trait]
pub trait TransferTransport: Send + Sync {
    async fn sync(&self, spec: &TransferSpec) -> MigrateResult<TransferStats>;
}

/// rsync/scp over SSH, mirroring the flags of the original migration tooling.
pub struct RsyncTransport;

impl RsyncTransport {
    /// Both hosts must have been resolved by the coordinator by now.
    fn hosts(spec: &TransferSpec) -> MigrateResult<(&str, &str)> {
        let src = spec.source.host.as_deref().ok_or_else(|| {
            MigrateError::Config("transfer source host is unresolved".into())
        })?;
        let dst = spec.destination.host.as_deref().ok_or_else(|| {
            MigrateError::Config("transfer destination host is unresolved".into())
        })?;
        Ok((src, dst))
    }

    fn ssh_command(spec: &TransferSpec) -> String {
        format!(
            "ssh -i {} -o StrictHostKeyChecking=no",
            spec.source.key_ref.display()
        )
    }

    fn rsync_args(spec: &TransferSpec, src_host: &str, dst_host: &str) -> Vec<String> {
        let mut args = vec![
            "-az".to_string(),
            "--delete".to_string(),
            "--stats".to_string(),
            "-e".to_string(),
            Self::ssh_command(spec),
        ];
        for pattern in &spec.excludes {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        args.push(format!(
            "{}@{}:{}/",
            spec.source.user, src_host, spec.source.path
        ));
        args.push(format!(
            "{}@{}:{}/",
            spec.destination.user, dst_host, spec.destination.path
        ));
        args
    }

    fn scp_args(spec: &TransferSpec, src_host: &str, dst_host: &str) -> Vec<String> {
        vec![
            "-i".to_string(),
            spec.source.key_ref.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-r".to_string(),
            format!("{}@{}:{}", spec.source.user, src_host, spec.source.path),
            format!(
                "{}@{}:{}",
                spec.destination.user, dst_host, spec.destination.path
            ),
        ]
    }
}

#[async_trait]
impl TransferTransport for RsyncTransport {
    async fn sync(&self, spec: &TransferSpec) -> MigrateResult<TransferStats> {
        let (src_host, dst_host) = Self::hosts(spec)?;
        let (program, args) = match spec.method {
            TransferMethod::Rsync => ("rsync", Self::rsync_args(spec, src_host, dst_host)),
            TransferMethod::Scp => ("scp", Self::scp_args(spec, src_host, dst_host)),
        };
        tracing::info!(
            program,
            source = src_host,
            destination = dst_host,
            "starting transfer"
        );

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MigrateError::Transfer(format!("failed to spawn {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MigrateError::Transfer(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        match spec.method {
            TransferMethod::Rsync => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(parse_rsync_stats(&stdout))
            }
            // scp reports nothing machine-readable.
            TransferMethod::Scp => Ok(TransferStats::default()),
        }
    }
}

/// Extract counters from `rsync --stats` output.
fn parse_rsync_stats(stdout: &str) -> TransferStats {
    let mut stats = TransferStats::default();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Number of regular files transferred:") {
            stats.files_copied = parse_count(rest);
        } else if let Some(rest) = line.strip_prefix("Number of files transferred:") {
            // Older rsync versions.
            stats.files_copied = parse_count(rest);
        } else if let Some(rest) = line.strip_prefix("Total transferred file size:") {
            stats.bytes_copied = parse_count(rest);
        } else if let Some(rest) = line.strip_prefix("Number of files:") {
            stats.files_total = parse_count(rest);
        }
    }
    stats
}

/// Parse a number like `1,234` or `12 bytes` or `107 (reg: 85, dir: 22)`.
fn parse_count(raw: &str) -> u64 {
    raw.trim()
        .split_whitespace()
        .next()
        .unwrap_or("0")
        .replace(',', "")
        .parse()
        .unwrap_or(0)
}

// ============================================================================
// ENGINE
// ============================================================================

/// Retrying wrapper around a transport.
pub struct TransferEngine {
    transport: Arc<dyn TransferTransport>,
    options: CoordinatorOptions,
}

impl TransferEngine {
    pub fn new(transport: Arc<dyn TransferTransport>, options: CoordinatorOptions) -> Self {
        Self { transport, options }
    }

    /// Copy the spec'd tree, retrying connectivity failures with backoff.
    ///
    /// `progress` is updated in place: counters accumulate across attempts
    /// and survive an error return, so the caller's checkpoint preserves the
    /// last successful counts for operator diagnosis. Cancellation is
    /// honored between attempts, never mid-invocation.
    pub async fn transfer(
        &self,
        spec: &TransferSpec,
        progress: &mut TransferProgress,
        cancel: &CancellationToken,
    ) -> MigrateResult<TransferStats> {
        let policy = self.options.transfer_retry();
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            attempt += 1;
            progress.attempts += 1;

            match self.transport.sync(spec).await {
                Ok(stats) => {
                    progress.files_copied += stats.files_copied;
                    progress.bytes_copied += stats.bytes_copied;
                    tracing::info!(
                        attempt,
                        files = stats.files_copied,
                        bytes = stats.bytes_copied,
                        total_files = progress.files_copied,
                        total_bytes = progress.bytes_copied,
                        "transfer attempt converged"
                    );
                    return Ok(stats);
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transfer attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(
                        attempt,
                        files_copied = progress.files_copied,
                        error = %err,
                        "transfer failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}
