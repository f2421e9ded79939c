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

//! The VPS gateway daemon: IP allocation for a hypervisor fleet, DHCP
//! server coordination, per-allocation link-layer enforcement, and the SSH
//! reverse-proxy, all behind one authenticated HTTP/WebSocket API that the
//! upstream VPS service drives.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod registry;
pub mod shutdown;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use allocation::AllocationStore;
use dhcp::reload::CommandReload;
use enforcer::Enforcer;
use enforcer::cmd::{CommandRunner, SystemRunner};
use enforcer::uplink::UplinkError;
use proxy::TcpDialer;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigError};
use crate::coordinator::Coordinator;
use crate::metrics::{GatewayMetrics, MetricsContext, ProxyMetricsObserver};
use crate::registry::ControllerRegistry;
use crate::shutdown::ShutdownHandle;

/// Run the gateway in the background, returning once both listeners are
/// bound. Dropping the handle shuts everything down.
pub async fn spawn(config: Config, api_secret: String) -> Result<SpawnHandle, SpawnError> {
    spawn_with_runner(config, api_secret, Arc::new(SystemRunner::new())).await
}

/// Like [`spawn`], with the enforcer's command runner injectable so tests
/// can observe rule programming instead of touching the kernel.
pub async fn spawn_with_runner(
    config: Config,
    api_secret: String,
    runner: Arc<dyn CommandRunner>,
) -> Result<SpawnHandle, SpawnError> {
    let pool = config.pool_config()?;
    let store = Arc::new(AllocationStore::new(pool));
    let metrics = Arc::new(GatewayMetrics::new());

    let uplink =
        enforcer::uplink::detect(runner.as_ref(), config.uplink_interface.as_deref()).await?;
    let enforcer = Arc::new(Enforcer::new(runner, uplink));

    let reload_runner =
        CommandReload::new(&config.reload_command).ok_or(SpawnError::EmptyReloadCommand)?;
    let (reload_trigger, reload_handle) = dhcp::reload::spawn(Arc::new(reload_runner));

    let registry = Arc::new(ControllerRegistry::new());
    let ssh_active = Arc::new(AtomicI64::new(0));
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        enforcer,
        reload_trigger.clone(),
        registry.clone(),
        metrics.clone(),
        config.hosts_file_path.clone(),
        config.lease_file_path.clone(),
        ssh_active.clone(),
    ));

    // The hosts file reflects the (empty) store from the first moment, so
    // the DHCP server never serves bindings from a previous run.
    coordinator.write_hosts().map_err(SpawnError::Hosts)?;

    let lease_poll = coordinator.spawn_lease_poll(config.lease_poll_interval);

    let metrics_handle = metrics::spawn(
        config.metrics_address,
        Arc::new(MetricsContext {
            metrics: metrics.clone(),
            store: store.clone(),
            reload: reload_trigger,
            ssh_active: ssh_active.clone(),
            started: coordinator.started(),
        }),
    )
    .await?;

    let observer = Arc::new(ProxyMetricsObserver::new(metrics, store, ssh_active));
    let api_handle = api::spawn(
        config.listen_address,
        api::AppState {
            coordinator: coordinator.clone(),
            registry,
            dialer: Arc::new(TcpDialer),
            observer,
            api_secret: Arc::new(api_secret),
        },
    )
    .await?;

    let api_addr = api_handle.local_addr;
    let metrics_addr = metrics_handle.local_addr;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join_handle = tokio::spawn(async move {
        shutdown_rx.await.ok();
        api_handle.shutdown_and_wait().await;
        metrics_handle.shutdown_and_wait().await;
        lease_poll.shutdown_and_wait().await;
        reload_handle.shutdown_and_wait().await;
    });

    Ok(SpawnHandle {
        api_addr,
        metrics_addr,
        shutdown_tx,
        join_handle,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Could not determine uplink interface: {0}")]
    Uplink(#[from] UplinkError),
    #[error("reload_command must name a program")]
    EmptyReloadCommand,
    #[error("Could not write initial hosts file: {0}")]
    Hosts(dhcp::DhcpFileError),
    #[error("Error spawning metrics listener: {0}")]
    Metrics(#[from] metrics::SpawnError),
    #[error("Error spawning API listener: {0}")]
    Api(#[from] api::SpawnError),
}

pub struct SpawnHandle {
    pub api_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ShutdownHandle<()> for SpawnHandle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}
