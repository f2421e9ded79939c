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

//! The gateway's control API: JSON unary endpoints plus the two WebSocket
//! streams (SSH proxy and controller registration). Every request carries
//! the shared secret in `x-api-secret`; the metrics listener is the only
//! unauthenticated surface, and it lives on its own port.

use std::net::SocketAddr;
use std::sync::Arc;

use allocation::AllocateParams;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wire::api::{
    AllocateIpRequest, AllocateIpResponse, AllocatePublicIpRequest, AllocatePublicIpResponse,
    GatewayInfoResponse, GetLeasesResponse, ListIpsRequest, ListIpsResponse, ReleaseIpRequest,
    ReleaseIpResponse, ReleasePublicIpRequest, SyncAllocationsRequest, SyncResult,
};
use wire::controller::ControllerMessage;
use wire::proxy::ProxyFrame;
use wire::{ErrorBody, ErrorCode};

use crate::coordinator::{Coordinator, GatewayError};
use crate::registry::{self, ControllerRegistry};
use crate::shutdown::ShutdownHandle;

pub const API_SECRET_HEADER: &str = "x-api-secret";

const STREAM_QUEUE_DEPTH: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub registry: Arc<ControllerRegistry>,
    pub dialer: Arc<dyn proxy::Dialer>,
    pub observer: Arc<dyn proxy::ProxyObserver>,
    pub api_secret: Arc<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/allocate-ip", post(allocate_ip))
        .route("/v1/allocate-public-ip", post(allocate_public_ip))
        .route("/v1/release-ip", post(release_ip))
        .route("/v1/release-public-ip", post(release_public_ip))
        .route("/v1/list-ips", post(list_ips))
        .route("/v1/leases", get(get_leases))
        .route("/v1/org-leases", post(org_leases))
        .route("/v1/sync-allocations", post(sync_allocations))
        .route("/v1/gateway-info", get(gateway_info))
        .route("/v1/proxy-ssh", get(proxy_ssh))
        .route("/v1/register-gateway", get(register_gateway))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_secret,
        ))
        .with_state(state)
}

/// Shared-secret check applied to every route on this listener.
async fn require_api_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(API_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    match provided {
        Some(secret) if secret == state.api_secret.as_str() => Ok(next.run(request).await),
        _ => Err(ApiError::new(
            ErrorCode::Unauthenticated,
            "missing or invalid x-api-secret header",
        )),
    }
}

pub struct ApiError(ErrorBody);

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self(ErrorBody::new(code, message))
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status())
            .expect("BUG: error codes map to valid statuses");
        (status, Json(self.0)).into_response()
    }
}

//
// Unary endpoints
//

async fn allocate_ip(
    State(state): State<AppState>,
    Json(req): Json<AllocateIpRequest>,
) -> Result<Json<AllocateIpResponse>, ApiError> {
    if req.vps_id.is_empty() {
        return Err(ApiError::invalid("vpsID is required"));
    }
    let preferred_ip = match req.preferred_ip.as_deref() {
        Some(ip) if !ip.is_empty() => {
            Some(network::parse_ipv4(ip).map_err(|e| ApiError::invalid(e.to_string()))?)
        }
        _ => None,
    };

    let allocation = state
        .coordinator
        .allocate(AllocateParams {
            vps_id: req.vps_id,
            organization_id: req.organization_id,
            mac_address: req.mac_address,
            preferred_ip,
            allow_public: false,
        })
        .await?;

    let pool = state.coordinator.store().pool();
    Ok(Json(AllocateIpResponse {
        ip_address: allocation.ip_address.to_string(),
        subnet_mask: pool.subnet_mask.to_string(),
        gateway: pool.gateway.to_string(),
        dns_servers: pool.dns_servers.iter().map(|ip| ip.to_string()).collect(),
        lease_expires: allocation.lease_expires,
    }))
}

async fn allocate_public_ip(
    State(state): State<AppState>,
    Json(req): Json<AllocatePublicIpRequest>,
) -> Result<Json<AllocatePublicIpResponse>, ApiError> {
    if req.vps_id.is_empty() {
        return Err(ApiError::invalid("vpsID is required"));
    }
    if req.mac_address.is_empty() {
        return Err(ApiError::invalid("macAddress is required for public IPs"));
    }
    let ip = network::parse_ipv4(&req.ip_address).map_err(|e| ApiError::invalid(e.to_string()))?;

    let allocation = state
        .coordinator
        .allocate_public(AllocateParams {
            vps_id: req.vps_id,
            organization_id: req.organization_id,
            mac_address: req.mac_address,
            preferred_ip: Some(ip),
            allow_public: true,
        })
        .await?;

    let gateway = match req.gateway.as_deref() {
        Some(gw) if !gw.is_empty() => {
            network::parse_ipv4(gw).map_err(|e| ApiError::invalid(e.to_string()))?
        }
        _ => network::default_gateway_for(allocation.ip_address),
    };
    Ok(Json(AllocatePublicIpResponse {
        ip_address: allocation.ip_address.to_string(),
        gateway: gateway.to_string(),
        netmask_prefix: req
            .netmask_prefix
            .unwrap_or(network::DEFAULT_PUBLIC_PREFIX_LEN),
    }))
}

async fn release_ip(
    State(state): State<AppState>,
    Json(req): Json<ReleaseIpRequest>,
) -> Result<Json<ReleaseIpResponse>, ApiError> {
    let ip = network::parse_ipv4(&req.ip_address).map_err(|e| ApiError::invalid(e.to_string()))?;
    let released = state.coordinator.release(&req.vps_id, ip).await?;
    Ok(Json(ReleaseIpResponse {
        released: released.is_some(),
    }))
}

async fn release_public_ip(
    State(state): State<AppState>,
    Json(req): Json<ReleasePublicIpRequest>,
) -> Result<Json<ReleaseIpResponse>, ApiError> {
    let ip = network::parse_ipv4(&req.ip_address).map_err(|e| ApiError::invalid(e.to_string()))?;
    let released = state
        .coordinator
        .release_public(&req.vps_id, ip, &req.mac_address)
        .await?;
    Ok(Json(ReleaseIpResponse {
        released: released.is_some(),
    }))
}

async fn list_ips(
    State(state): State<AppState>,
    Json(req): Json<ListIpsRequest>,
) -> Result<Json<ListIpsResponse>, ApiError> {
    let allocations = state
        .coordinator
        .store()
        .list(req.organization_id.as_deref(), req.vps_id.as_deref());
    Ok(Json(ListIpsResponse {
        allocations: allocations.iter().map(Into::into).collect(),
    }))
}

async fn get_leases(
    State(state): State<AppState>,
) -> Result<Json<GetLeasesResponse>, ApiError> {
    let leases = state.coordinator.leases()?;
    Ok(Json(GetLeasesResponse { leases }))
}

async fn org_leases(
    State(state): State<AppState>,
    Json(req): Json<ListIpsRequest>,
) -> Result<Json<ListIpsResponse>, ApiError> {
    let org = match req.organization_id.as_deref() {
        Some(org) if !org.is_empty() => org,
        _ => return Err(ApiError::invalid("organizationID is required")),
    };
    let allocations = state.coordinator.store().list(Some(org), None);
    Ok(Json(ListIpsResponse {
        allocations: allocations.iter().map(Into::into).collect(),
    }))
}

async fn sync_allocations(
    State(state): State<AppState>,
    Json(req): Json<SyncAllocationsRequest>,
) -> Result<Json<SyncResult>, ApiError> {
    Ok(Json(state.coordinator.apply_sync(&req.allocations).await))
}

async fn gateway_info(
    State(state): State<AppState>,
) -> Result<Json<GatewayInfoResponse>, ApiError> {
    Ok(Json(state.coordinator.gateway_info()))
}

//
// Streams
//

async fn proxy_ssh(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_proxy_socket(socket, state))
}

/// Bridge the WebSocket to the transport-agnostic multiplexer: JSON text
/// frames in, JSON text frames out.
async fn serve_proxy_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (to_mux, mux_inbound) = mpsc::channel::<ProxyFrame>(STREAM_QUEUE_DEPTH);
    let (mux_outbound, mut from_mux) = mpsc::channel::<ProxyFrame>(STREAM_QUEUE_DEPTH);
    let cancel = CancellationToken::new();

    let mux = tokio::spawn(proxy::run_stream(
        mux_inbound,
        mux_outbound,
        state.dialer.clone(),
        state.observer.clone(),
        cancel.clone(),
    ));
    let writer = tokio::spawn(async move {
        while let Some(frame) = from_mux.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(error) => {
                    tracing::error!(%error, "unserializable proxy frame dropped");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ProxyFrame>(&text) {
                Ok(frame) => {
                    if to_mux.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(error) => tracing::debug!(%error, "ignoring malformed proxy frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(%error, "proxy stream receive error");
                break;
            }
        }
    }

    cancel.cancel();
    drop(to_mux);
    let _ = mux.await;
    let _ = writer.await;
}

async fn register_gateway(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_registration_socket(socket, state))
}

async fn serve_registration_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (to_stream, stream_inbound) = mpsc::channel::<ControllerMessage>(STREAM_QUEUE_DEPTH);
    let (stream_outbound, mut from_stream) =
        mpsc::channel::<ControllerMessage>(STREAM_QUEUE_DEPTH);
    let cancel = CancellationToken::new();

    let driver = tokio::spawn(registry::run_controller_stream(
        state.registry.clone(),
        state.coordinator.clone(),
        stream_inbound,
        stream_outbound,
        cancel.clone(),
    ));
    let writer = tokio::spawn(async move {
        while let Some(message) = from_stream.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(error) => {
                    tracing::error!(%error, "unserializable stream message dropped");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ControllerMessage>(&text) {
                Ok(msg) => {
                    if to_stream.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(error) => tracing::debug!(%error, "ignoring malformed stream message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(%error, "registration stream receive error");
                break;
            }
        }
    }

    cancel.cancel();
    drop(to_stream);
    let _ = driver.await;
    let _ = writer.await;
}

//
// Listener lifecycle
//

pub async fn spawn(address: SocketAddr, state: AppState) -> Result<ApiHandle, SpawnError> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(SpawnError::Listen)?;
    let local_addr = listener.local_addr().map_err(SpawnError::Listen)?;

    tracing::info!("API listening on {local_addr}");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(state);
    let join_handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        });
        if let Err(error) = serve.await {
            tracing::error!(%error, "API server error");
        }
    });

    Ok(ApiHandle {
        local_addr,
        shutdown_tx,
        join_handle,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("error listening on API address: {0}")]
    Listen(std::io::Error),
}

pub struct ApiHandle {
    pub local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ShutdownHandle<()> for ApiHandle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}
