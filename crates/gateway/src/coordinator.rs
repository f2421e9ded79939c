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

//! Orchestration between the allocation store and its side effects.
//!
//! The store commits first; the hosts file, the packet filter and the DHCP
//! reload follow. A failed hosts write rolls the store mutation back, and a
//! failed enforcement rolls a fresh public allocation back, so an
//! allocation and its enforcement happen as a pair or not at all. The
//! recovery paths themselves only log.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

use allocation::{
    AllocateParams, Allocation, AllocationError, AllocationStore, Released,
};
use chrono::Utc;
use dhcp::DhcpFileError;
use dhcp::reload::ReloadTrigger;
use enforcer::{Enforcer, EnforcerError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wire::ErrorCode;
use wire::api::{DesiredAllocation, GatewayInfoResponse, LeaseRecord, SyncResult};

use crate::metrics::GatewayMetrics;
use crate::registry::ControllerRegistry;
use crate::shutdown::ShutdownHandle;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    InvalidAddress(#[from] network::AddressError),
    #[error("hosts file update failed: {0}")]
    Hosts(#[from] DhcpFileError),
    #[error("enforcement failed: {0}")]
    Enforcement(#[from] EnforcerError),
    #[error("lease file unavailable: {0}")]
    Leases(DhcpFileError),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Allocation(AllocationError::InvalidAddress(_)) => {
                ErrorCode::InvalidArgument
            }
            GatewayError::Allocation(AllocationError::PoolExhausted) => {
                ErrorCode::ResourceExhausted
            }
            GatewayError::Allocation(_) => ErrorCode::FailedPrecondition,
            GatewayError::InvalidAddress(_) => ErrorCode::InvalidArgument,
            GatewayError::Enforcement(EnforcerError::InvalidInput(_)) => {
                ErrorCode::InvalidArgument
            }
            GatewayError::Enforcement(_) | GatewayError::Hosts(_) | GatewayError::Leases(_) => {
                ErrorCode::Internal
            }
        }
    }
}

pub struct Coordinator {
    store: Arc<AllocationStore>,
    enforcer: Arc<Enforcer>,
    reload: ReloadTrigger,
    registry: Arc<ControllerRegistry>,
    metrics: Arc<GatewayMetrics>,
    hosts_path: PathBuf,
    lease_path: PathBuf,
    ssh_active: Arc<AtomicI64>,
    started: Instant,
    initial_sync_done: AtomicBool,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<AllocationStore>,
        enforcer: Arc<Enforcer>,
        reload: ReloadTrigger,
        registry: Arc<ControllerRegistry>,
        metrics: Arc<GatewayMetrics>,
        hosts_path: PathBuf,
        lease_path: PathBuf,
        ssh_active: Arc<AtomicI64>,
    ) -> Self {
        Self {
            store,
            enforcer,
            reload,
            registry,
            metrics,
            hosts_path,
            lease_path,
            ssh_active,
            started: Instant::now(),
            initial_sync_done: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<AllocationStore> {
        &self.store
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Render the current allocation set into the DHCP hosts file.
    pub fn write_hosts(&self) -> Result<(), DhcpFileError> {
        let contents = dhcp::hosts::render(&self.store.list(None, None));
        dhcp::hosts::write_atomic(&self.hosts_path, &contents)
    }

    /// Allocate (or refresh) a private pool address.
    pub async fn allocate(&self, params: AllocateParams) -> Result<Allocation, GatewayError> {
        let (allocation, _created) = self.allocate_inner(params).await?;
        Ok(allocation)
    }

    /// Allocate a public address and enforce its `(ip, mac)` binding. The
    /// two are a transaction: enforcement failure rolls the allocation
    /// back.
    pub async fn allocate_public(
        &self,
        params: AllocateParams,
    ) -> Result<Allocation, GatewayError> {
        let (allocation, created) = self.allocate_inner(params).await?;

        // A preferred address inside the pool comes back private; only
        // actual public bindings traverse the enforcer.
        if !allocation.is_public {
            return Ok(allocation);
        }

        if let Err(error) = self
            .enforcer
            .secure_public_ip(
                &allocation.ip_address.to_string(),
                &allocation.mac_address,
                &allocation.vps_id,
            )
            .await
        {
            tracing::error!(
                vps_id = %allocation.vps_id,
                ip = %allocation.ip_address,
                %error,
                "enforcement failed, rolling allocation back"
            );
            if created {
                self.store
                    .rollback_insert(&allocation.vps_id, allocation.ip_address);
                if let Err(hosts_error) = self.write_hosts() {
                    // Recovery path: log and continue.
                    tracing::warn!(%hosts_error, "hosts rewrite during rollback failed");
                }
                self.reload.request_reload();
            }
            return Err(error.into());
        }

        Ok(allocation)
    }

    async fn allocate_inner(
        &self,
        params: AllocateParams,
    ) -> Result<(Allocation, bool), GatewayError> {
        let created = self.store.list(None, Some(&params.vps_id)).is_empty();
        let allocation = self.store.allocate(params)?;

        if let Err(error) = self.write_hosts() {
            if created {
                self.store
                    .rollback_insert(&allocation.vps_id, allocation.ip_address);
            }
            return Err(error.into());
        }
        self.reload.request_reload();

        if created {
            self.metrics
                .dhcp_allocations_total
                .with_label_values(&[&allocation.organization_id])
                .inc();
        }
        Ok((allocation, created))
    }

    /// Release a binding. Unknown bindings are a success.
    pub async fn release(
        &self,
        vps_id: &str,
        ip: Ipv4Addr,
    ) -> Result<Option<Allocation>, GatewayError> {
        match self.store.release(vps_id, ip) {
            Released::Removed(removed) => {
                if let Err(error) = self.write_hosts() {
                    self.store.restore(removed);
                    return Err(error.into());
                }
                self.reload.request_reload();
                self.metrics
                    .dhcp_releases_total
                    .with_label_values(&[&removed.organization_id])
                    .inc();
                Ok(Some(removed))
            }
            Released::NotPresent => Ok(None),
        }
    }

    /// Release a public binding: enforcement teardown first (best effort),
    /// then the release proper.
    pub async fn release_public(
        &self,
        vps_id: &str,
        ip: Ipv4Addr,
        mac: &str,
    ) -> Result<Option<Allocation>, GatewayError> {
        if let Err(error) = self
            .enforcer
            .remove_public_ip(&ip.to_string(), mac)
            .await
        {
            tracing::warn!(vps_id, %ip, %error, "enforcement removal failed, releasing anyway");
        }
        self.release(vps_id, ip).await
    }

    /// Apply the controller's desired allocation set (the tie-breaker for
    /// all runtime state), mirroring public bindings into the packet
    /// filter.
    pub async fn apply_sync(&self, desired: &[DesiredAllocation]) -> SyncResult {
        let outcome = self.store.sync_desired(desired);
        let mut errors = outcome.errors.clone();

        let removed_bindings = outcome
            .removed
            .iter()
            .chain(outcome.rebound.iter().map(|(old, _)| old));
        for old in removed_bindings {
            if !old.is_public {
                continue;
            }
            if let Err(error) = self
                .enforcer
                .remove_public_ip(&old.ip_address.to_string(), &old.mac_address)
                .await
            {
                tracing::warn!(vps_id = %old.vps_id, %error, "sync: enforcement removal failed");
            }
        }

        let added_bindings = outcome
            .added
            .iter()
            .chain(outcome.rebound.iter().map(|(_, new)| new));
        for new in added_bindings {
            if !new.is_public {
                continue;
            }
            if let Err(error) = self
                .enforcer
                .secure_public_ip(&new.ip_address.to_string(), &new.mac_address, &new.vps_id)
                .await
            {
                tracing::warn!(vps_id = %new.vps_id, %error, "sync: enforcement failed");
                errors.push(format!("{}: {error}", new.vps_id));
            }
        }

        if let Err(error) = self.write_hosts() {
            tracing::error!(%error, "sync: hosts rewrite failed");
            errors.push(format!("hosts file: {error}"));
        } else {
            self.reload.request_reload();
        }

        let success = errors.is_empty();
        SyncResult {
            success,
            added: outcome.added_count(),
            removed: outcome.removed_count(),
            message: errors.join("; "),
        }
    }

    /// The lease-reader projection served by the API.
    pub fn leases(&self) -> Result<Vec<LeaseRecord>, GatewayError> {
        let leases = dhcp::leases::read_file(&self.lease_path, Utc::now())
            .map_err(GatewayError::Leases)?;
        Ok(leases
            .into_iter()
            .map(|l| LeaseRecord {
                mac_address: l.mac_address,
                ip_address: l.ip_address.to_string(),
                hostname: l.hostname,
                expires_at: l.expires_at,
            })
            .collect())
    }

    /// Compare the lease file against the store and promote leases the
    /// gateway does not know about, asking the controllers who they belong
    /// to. Best effort all the way down.
    pub async fn reconcile(&self) {
        let leases = match dhcp::leases::read_file(&self.lease_path, Utc::now()) {
            Ok(leases) => leases,
            Err(error) => {
                tracing::debug!(%error, "lease file not readable, skipping reconciliation");
                return;
            }
        };

        for lease in leases {
            if self
                .store
                .has_binding(&lease.mac_address, lease.ip_address)
            {
                continue;
            }

            let found = self
                .registry
                .find_vps_by_lease(&lease.ip_address.to_string(), &lease.mac_address)
                .await;
            if found.vps_id.is_empty() {
                tracing::debug!(
                    ip = %lease.ip_address,
                    mac = %lease.mac_address,
                    "no controller knows this lease"
                );
                continue;
            }

            tracing::info!(
                vps_id = %found.vps_id,
                ip = %lease.ip_address,
                "promoting unknown lease to allocation"
            );
            let is_public = !self.store.is_ip_in_pool(lease.ip_address);
            let params = AllocateParams {
                vps_id: found.vps_id.clone(),
                organization_id: found.organization_id.clone(),
                mac_address: lease.mac_address.clone(),
                preferred_ip: Some(lease.ip_address),
                allow_public: is_public,
            };
            let promoted = if is_public {
                self.allocate_public(params).await
            } else {
                self.allocate(params).await
            };
            if let Err(error) = promoted {
                tracing::warn!(vps_id = %found.vps_id, %error, "lease promotion failed");
            }
        }
    }

    /// Run the full reconciliation exactly once, the first time a
    /// controller registers.
    pub async fn initial_reconcile_once(&self) {
        if self.initial_sync_done.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("first controller registered, running initial reconciliation");
        self.reconcile().await;
    }

    pub fn gateway_info(&self) -> GatewayInfoResponse {
        let pool = self.store.pool();
        let stats = self.store.stats();
        GatewayInfoResponse {
            pool_start: pool.range.start().to_string(),
            pool_end: pool.range.end().to_string(),
            subnet_mask: pool.subnet_mask.to_string(),
            gateway: pool.gateway.to_string(),
            dns_servers: pool.dns_servers.iter().map(|ip| ip.to_string()).collect(),
            uplink_interface: self.enforcer.uplink().to_string(),
            total_ips: stats.pool_size,
            allocated_ips: stats.allocated,
            dhcp_status: self.reload.status().as_str().to_string(),
            ssh_active_sessions: self.ssh_active.load(Ordering::Relaxed).max(0) as u64,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    /// Watch the lease file for changes and reconcile when it moves.
    pub fn spawn_lease_poll(
        self: &Arc<Self>,
        interval: std::time::Duration,
    ) -> LeasePollHandle {
        let coordinator = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(async move {
            let mut last_mtime = file_mtime(&coordinator.lease_path);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let mtime = file_mtime(&coordinator.lease_path);
                        if mtime != last_mtime {
                            last_mtime = mtime;
                            coordinator.reconcile().await;
                        }
                    }
                }
            }
        });
        LeasePollHandle {
            shutdown_tx,
            join_handle,
        }
    }
}

fn file_mtime(path: &std::path::Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub struct LeasePollHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ShutdownHandle<()> for LeasePollHandle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}
