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

//! Shared fixtures for unit tests: a coordinator wired to temp files, a
//! command runner that records instead of executing, and a no-op reload.

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

use allocation::{AllocationStore, PoolConfig};
use dhcp::reload::ReloadRunner;
use enforcer::Enforcer;
use enforcer::cmd::{CmdError, CmdOutput, CommandRunner};
use network::Ipv4Range;

use crate::coordinator::Coordinator;
use crate::metrics::GatewayMetrics;
use crate::registry::ControllerRegistry;

#[derive(Default)]
pub(crate) struct MockRunner {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput, CmdError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));
        // Probes report "absent" so every ensure takes the install path.
        let exit_code = if args.first() == Some(&"-C") { 1 } else { 0 };
        Ok(CmdOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
        })
    }
}

struct NoopReload;

#[async_trait::async_trait]
impl ReloadRunner for NoopReload {
    async fn reload(&self) -> Result<(), String> {
        Ok(())
    }
}

pub(crate) struct TestEnv {
    pub registry: Arc<ControllerRegistry>,
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<AllocationStore>,
    pub runner: Arc<MockRunner>,
    pub metrics: Arc<GatewayMetrics>,
    reload: dhcp::reload::ReloadTrigger,
    // Held so the temp files and the reload worker outlive the test.
    _dir: tempfile::TempDir,
    _reload_handle: dhcp::reload::WorkerHandle,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("could not create temp dir");
        let pool = PoolConfig {
            range: Ipv4Range::new(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 12))
                .expect("valid test range"),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
        };
        let store = Arc::new(AllocationStore::new(pool));
        let metrics = Arc::new(GatewayMetrics::new());
        let runner = Arc::new(MockRunner::default());
        let enforcer = Arc::new(Enforcer::new(runner.clone(), "eth0".to_string()));
        let (reload_trigger, reload_handle) = dhcp::reload::spawn(Arc::new(NoopReload));
        let registry = Arc::new(ControllerRegistry::new());
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            enforcer,
            reload_trigger.clone(),
            registry.clone(),
            metrics.clone(),
            dir.path().join("dhcp-hosts"),
            dir.path().join("leases"),
            Arc::new(AtomicI64::new(0)),
        ));

        Self {
            registry,
            coordinator,
            store,
            runner,
            metrics,
            reload: reload_trigger,
            _dir: dir,
            _reload_handle: reload_handle,
        }
    }

    /// Rebuild the coordinator around a different command runner, keeping
    /// the rest of the fixture.
    pub fn replace_enforcer_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        let enforcer = Arc::new(Enforcer::new(runner, "eth0".to_string()));
        self.coordinator = Arc::new(Coordinator::new(
            self.store.clone(),
            enforcer,
            self.reload.clone(),
            self.registry.clone(),
            self.metrics.clone(),
            self.hosts_path(),
            self.lease_path(),
            Arc::new(AtomicI64::new(0)),
        ));
        self
    }

    pub fn lease_path(&self) -> std::path::PathBuf {
        self._dir.path().join("leases")
    }

    pub fn hosts_path(&self) -> std::path::PathBuf {
        self._dir.path().join("dhcp-hosts")
    }
}
