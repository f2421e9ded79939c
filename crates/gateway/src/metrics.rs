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

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use allocation::AllocationStore;
use dhcp::reload::{ReloadStatus, ReloadTrigger};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Request, Response};
use http_body_util::Full;
use hyper::body;
use hyper::body::Bytes;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};
use proxy::ProxyObserver;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::shutdown::ShutdownHandle;

pub struct GatewayMetrics {
    pub registry: Registry,
    pub active_allocations: IntGauge,
    pub pool_size: IntGauge,
    pub pool_available: IntGauge,
    pub ssh_active: IntGauge,
    pub uptime_seconds: IntGauge,
    pub dhcp_status: IntGauge,
    pub dhcp_allocations_total: IntCounterVec,
    pub dhcp_releases_total: IntCounterVec,
    pub ssh_connections_total: IntCounterVec,
    pub ssh_bytes_total: IntCounterVec,
    pub ssh_connection_duration_seconds: HistogramVec,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_allocations =
            IntGauge::new("active_allocations", "Number of live IP allocations")
                .expect("BUG: bad gauge definition");
        let pool_size = IntGauge::new("pool_size", "Size of the configured DHCP pool")
            .expect("BUG: bad gauge definition");
        let pool_available = IntGauge::new("pool_available", "Free addresses in the DHCP pool")
            .expect("BUG: bad gauge definition");
        let ssh_active = IntGauge::new("ssh_active", "Open SSH proxy sessions")
            .expect("BUG: bad gauge definition");
        let uptime_seconds = IntGauge::new("uptime_seconds", "Gateway process uptime")
            .expect("BUG: bad gauge definition");
        let dhcp_status = IntGauge::new(
            "dhcp_status",
            "Whether the last DHCP reload worked (1 healthy, 0 failing)",
        )
        .expect("BUG: bad gauge definition");
        let dhcp_allocations_total = IntCounterVec::new(
            Opts::new("dhcp_allocations_total", "IP allocations performed"),
            &["org"],
        )
        .expect("BUG: bad counter definition");
        let dhcp_releases_total = IntCounterVec::new(
            Opts::new("dhcp_releases_total", "IP releases performed"),
            &["org"],
        )
        .expect("BUG: bad counter definition");
        let ssh_connections_total = IntCounterVec::new(
            Opts::new("ssh_connections_total", "SSH proxy sessions opened"),
            &["org", "vps"],
        )
        .expect("BUG: bad counter definition");
        let ssh_bytes_total = IntCounterVec::new(
            Opts::new("ssh_bytes_total", "Bytes piped through the SSH proxy"),
            &["org", "vps", "direction"],
        )
        .expect("BUG: bad counter definition");
        let ssh_connection_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ssh_connection_duration_seconds",
                "Lifetime of SSH proxy sessions",
            ),
            &["org", "vps"],
        )
        .expect("BUG: bad histogram definition");

        for metric in [
            &active_allocations,
            &pool_size,
            &pool_available,
            &ssh_active,
            &uptime_seconds,
            &dhcp_status,
        ] {
            registry
                .register(Box::new(metric.clone()))
                .expect("BUG: duplicate gauge registration");
        }
        for counter in [
            &dhcp_allocations_total,
            &dhcp_releases_total,
            &ssh_connections_total,
            &ssh_bytes_total,
        ] {
            registry
                .register(Box::new(counter.clone()))
                .expect("BUG: duplicate counter registration");
        }
        registry
            .register(Box::new(ssh_connection_duration_seconds.clone()))
            .expect("BUG: duplicate histogram registration");

        Self {
            registry,
            active_allocations,
            pool_size,
            pool_available,
            ssh_active,
            uptime_seconds,
            dhcp_status,
            dhcp_allocations_total,
            dhcp_releases_total,
            ssh_connections_total,
            ssh_bytes_total,
            ssh_connection_duration_seconds,
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the scrape endpoint needs to refresh gauges from live state.
pub struct MetricsContext {
    pub metrics: Arc<GatewayMetrics>,
    pub store: Arc<AllocationStore>,
    pub reload: ReloadTrigger,
    pub ssh_active: Arc<AtomicI64>,
    pub started: Instant,
}

impl MetricsContext {
    fn refresh_gauges(&self) {
        let stats = self.store.stats();
        let m = &self.metrics;
        m.active_allocations.set(stats.allocated as i64);
        m.pool_size.set(stats.pool_size as i64);
        m.pool_available
            .set(stats.pool_size.saturating_sub(stats.allocated) as i64);
        m.ssh_active.set(self.ssh_active.load(Ordering::Relaxed));
        m.uptime_seconds.set(self.started.elapsed().as_secs() as i64);
        m.dhcp_status
            .set(if self.reload.status() == ReloadStatus::Failing {
                0
            } else {
                1
            });
    }
}

pub async fn spawn(
    address: SocketAddr,
    context: Arc<MetricsContext>,
) -> Result<MetricsHandle, SpawnError> {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let listener = TcpListener::bind(address).await.map_err(SpawnError::Listen)?;
    let local_addr = listener.local_addr().map_err(SpawnError::Listen)?;

    tracing::info!("metrics listening on {local_addr}");

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("metrics service shutting down");
                    break;
                }

                res = listener.accept() => match res {
                    Ok((stream, _addr)) => {
                        tokio::task::spawn({
                            let context = context.clone();
                            async move {
                                let io = TokioIo::new(stream);
                                auto::Builder::new(TokioExecutor::new())
                                    .serve_connection(
                                        io,
                                        hyper::service::service_fn(move |req| {
                                            let context = context.clone();
                                            async move { serve_metrics(req, context) }
                                        }),
                                    )
                                    .await
                            }
                        });
                    }
                    Err(error) => {
                        tracing::error!(%error, "error accepting metrics connection");
                    }
                }
            }
        }
    });

    Ok(MetricsHandle {
        local_addr,
        shutdown_tx,
        join_handle,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("error listening on metrics address: {0}")]
    Listen(std::io::Error),
}

fn serve_metrics(
    req: Request<body::Incoming>,
    context: Arc<MetricsContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            context.refresh_gauges();
            let mut buffer = vec![];
            let encoder = prometheus::TextEncoder::new();
            let metric_families = context.metrics.registry.gather();
            match encoder.encode(&metric_families, &mut buffer) {
                Ok(_) => Response::builder()
                    .status(200)
                    .header(CONTENT_TYPE, encoder.format_type())
                    .header(CONTENT_LENGTH, buffer.len())
                    .body(buffer.into()),
                Err(e) => Response::builder()
                    .status(500)
                    .body(format!("Encoding error: {e}").into()),
            }
        }
        (&Method::GET, "/health") => Response::builder().status(200).body("Healthy".into()),
        (&Method::GET, "/ready") => Response::builder().status(200).body("Ready".into()),
        (&Method::GET, "/") => Response::builder().status(200).body("/metrics".into()),
        _ => Response::builder().status(404).body("Invalid URL".into()),
    };

    Ok(response.expect("BUG: Response::builder error"))
}

pub struct MetricsHandle {
    pub local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ShutdownHandle<()> for MetricsHandle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}

/// Feeds proxy session lifecycle into the metric set, resolving the target
/// address back to an allocation for the org/vps labels.
pub struct ProxyMetricsObserver {
    metrics: Arc<GatewayMetrics>,
    store: Arc<AllocationStore>,
    ssh_active: Arc<AtomicI64>,
}

impl ProxyMetricsObserver {
    pub fn new(
        metrics: Arc<GatewayMetrics>,
        store: Arc<AllocationStore>,
        ssh_active: Arc<AtomicI64>,
    ) -> Self {
        Self {
            metrics,
            store,
            ssh_active,
        }
    }

    fn labels(&self, target: &str) -> (String, String) {
        target
            .parse()
            .ok()
            .and_then(|ip| self.store.find_by_ip(ip))
            .map(|a| (a.organization_id, a.vps_id))
            .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()))
    }
}

impl ProxyObserver for ProxyMetricsObserver {
    fn session_opened(&self, target: &str) {
        self.ssh_active.fetch_add(1, Ordering::Relaxed);
        let (org, vps) = self.labels(target);
        self.metrics
            .ssh_connections_total
            .with_label_values(&[&org, &vps])
            .inc();
    }

    fn session_closed(&self, target: &str, duration: Duration, bytes_up: u64, bytes_down: u64) {
        self.ssh_active.fetch_sub(1, Ordering::Relaxed);
        let (org, vps) = self.labels(target);
        self.metrics
            .ssh_bytes_total
            .with_label_values(&[&org, &vps, "up"])
            .inc_by(bytes_up);
        self.metrics
            .ssh_bytes_total
            .with_label_values(&[&org, &vps, "down"])
            .inc_by(bytes_down);
        self.metrics
            .ssh_connection_duration_seconds
            .with_label_values(&[&org, &vps])
            .observe(duration.as_secs_f64());
    }
}
