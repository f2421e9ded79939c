/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

//! Debounced reload trigger for the external DHCP server.
//!
//! Hosts-file writers call [`ReloadTrigger::request_reload`] and move on;
//! the worker collapses bursts into one reload per debounce window and
//! retries failures with backoff before giving up (the server re-reads the
//! file on its own schedule anyway, so an abandoned reload is degraded
//! freshness, not corruption).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);
const RELOAD_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[async_trait::async_trait]
pub trait ReloadRunner: Send + Sync + 'static {
    async fn reload(&self) -> Result<(), String>;
}

/// Runs the configured reload command, e.g. `systemctl reload dnsmasq` or a
/// `kill -HUP` wrapper. Arguments are passed positionally, never through a
/// shell.
pub struct CommandReload {
    program: String,
    args: Vec<String>,
}

impl CommandReload {
    /// `command` is the full argv; the first element is the program.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait::async_trait]
impl ReloadRunner for CommandReload {
    async fn reload(&self) -> Result<(), String> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| format!("spawning {}: {e}", self.program))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStatus {
    /// No reload has run yet.
    Idle,
    Ok,
    Failing,
}

impl ReloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadStatus::Idle => "idle",
            ReloadStatus::Ok => "ok",
            ReloadStatus::Failing => "failing",
        }
    }
}

#[derive(Clone)]
pub struct ReloadTrigger {
    tx: mpsc::Sender<()>,
    status: Arc<Mutex<ReloadStatus>>,
}

impl ReloadTrigger {
    /// Fire and forget. A full queue means a reload is already pending,
    /// which is exactly what the caller wants.
    pub fn request_reload(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn status(&self) -> ReloadStatus {
        *self.status.lock().expect("BUG: reload status poisoned")
    }
}

pub struct WorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn shutdown_and_wait(self) {
        drop(self.shutdown_tx);
        self.join_handle.await.expect("reload worker panicked");
    }
}

pub fn spawn(runner: Arc<dyn ReloadRunner>) -> (ReloadTrigger, WorkerHandle) {
    let (tx, mut rx) = mpsc::channel::<()>(16);
    let status = Arc::new(Mutex::new(ReloadStatus::Idle));
    let worker_status = status.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                received = rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    // Debounce: let the burst finish, then collapse it.
                    tokio::time::sleep(RELOAD_DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}

                    let ok = run_with_retries(runner.as_ref()).await;
                    *worker_status.lock().expect("BUG: reload status poisoned") = if ok {
                        ReloadStatus::Ok
                    } else {
                        ReloadStatus::Failing
                    };
                }
            }
        }
    });

    (
        ReloadTrigger { tx, status },
        WorkerHandle {
            shutdown_tx,
            join_handle,
        },
    )
}

async fn run_with_retries(runner: &dyn ReloadRunner) -> bool {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RELOAD_ATTEMPTS {
        match runner.reload().await {
            Ok(()) => {
                tracing::debug!(attempt, "DHCP reload succeeded");
                return true;
            }
            Err(error) => {
                tracing::warn!(attempt, %error, "DHCP reload failed");
                if attempt < RELOAD_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    tracing::error!(
        attempts = RELOAD_ATTEMPTS,
        "giving up on DHCP reload, server will pick the file up on its next cycle"
    );
    false
}
