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

//! Controller registration streams and gateway-initiated fan-out.
//!
//! Every controller replica keeps one bidirectional stream open to the
//! gateway. The registry tracks the live streams, correlates the gateway's
//! outbound requests with their responses by request ID, and answers
//! fan-out calls with the first useful reply (any controller's answer is
//! correct; the authoritative database is shared behind them).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wire::api::AllocationRecord;
use wire::controller::{
    ControllerMessage, FindVpsByLeaseRequest, FindVpsByLeaseResponse, METHOD_FIND_VPS_BY_LEASE,
};

use crate::coordinator::Coordinator;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;
pub const FANOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// A completed `response` frame, keyed back to its request.
#[derive(Debug)]
pub struct PendingReply {
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct ControllerRegistry {
    streams: std::sync::RwLock<HashMap<String, mpsc::Sender<ControllerMessage>>>,
    pending: std::sync::Mutex<HashMap<String, oneshot::Sender<PendingReply>>>,
    counter: AtomicU64,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected_count(&self) -> usize {
        self.streams
            .read()
            .expect("BUG: stream map poisoned")
            .len()
    }

    fn register_stream(&self, controller_id: &str, tx: mpsc::Sender<ControllerMessage>) {
        let replaced = self
            .streams
            .write()
            .expect("BUG: stream map poisoned")
            .insert(controller_id.to_string(), tx);
        if replaced.is_some() {
            tracing::info!(controller_id, "controller reconnected, replacing stream");
        }
    }

    fn unregister_stream(&self, controller_id: &str) {
        self.streams
            .write()
            .expect("BUG: stream map poisoned")
            .remove(controller_id);
    }

    /// Complete a pending request. Responses for unknown IDs are drained
    /// silently: they are fan-out losers arriving late.
    pub fn complete(&self, request_id: &str, reply: PendingReply) {
        let waiter = self
            .pending
            .lock()
            .expect("BUG: pending map poisoned")
            .remove(request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => {
                tracing::debug!(request_id, "response for unknown request dropped");
            }
        }
    }

    /// Ask every connected controller who a `(ip, mac)` lease belongs to
    /// and return the first useful answer. Empty response (not an error)
    /// when nobody knows, nobody answers in time, or nobody is connected.
    pub async fn find_vps_by_lease(&self, ip: &str, mac: &str) -> FindVpsByLeaseResponse {
        let streams: Vec<(String, mpsc::Sender<ControllerMessage>)> = self
            .streams
            .read()
            .expect("BUG: stream map poisoned")
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();
        if streams.is_empty() {
            return FindVpsByLeaseResponse::default();
        }

        let payload = serde_json::to_value(FindVpsByLeaseRequest {
            ip_address: ip.to_string(),
            mac_address: mac.to_string(),
        })
        .expect("BUG: fan-out payload is always serializable");

        let mut request_ids = Vec::with_capacity(streams.len());
        let mut waiters: FuturesUnordered<oneshot::Receiver<PendingReply>> =
            FuturesUnordered::new();

        for (controller_id, tx) in streams {
            let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
            let request_id = format!("gateway-findvps-{sequence}-{controller_id}");
            let (reply_tx, reply_rx) = oneshot::channel();
            self.pending
                .lock()
                .expect("BUG: pending map poisoned")
                .insert(request_id.clone(), reply_tx);

            let message = ControllerMessage::Request {
                request_id: request_id.clone(),
                method: METHOD_FIND_VPS_BY_LEASE.to_string(),
                payload: payload.clone(),
            };
            if tx.send(message).await.is_err() {
                tracing::warn!(%controller_id, "fan-out send failed, dropping controller from wait set");
                self.pending
                    .lock()
                    .expect("BUG: pending map poisoned")
                    .remove(&request_id);
                continue;
            }
            request_ids.push(request_id);
            waiters.push(reply_rx);
        }

        let deadline = tokio::time::sleep(FANOUT_TIMEOUT);
        tokio::pin!(deadline);

        let mut result = FindVpsByLeaseResponse::default();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                reply = waiters.next() => match reply {
                    None => break,
                    Some(Ok(reply)) => {
                        if reply.error.is_some() {
                            continue;
                        }
                        match serde_json::from_value::<FindVpsByLeaseResponse>(reply.payload) {
                            Ok(found) if !found.vps_id.is_empty() => {
                                result = found;
                                break;
                            }
                            _ => continue,
                        }
                    }
                    // A dropped sender (stream went away); keep waiting on
                    // the rest.
                    Some(Err(_)) => continue,
                }
            }
        }

        // Losers may still answer later; their replies hit the
        // unknown-request drain in `complete`.
        let mut pending = self.pending.lock().expect("BUG: pending map poisoned");
        for request_id in request_ids {
            pending.remove(&request_id);
        }
        result
    }
}

/// Drive one controller stream from registration to disconnect.
///
/// The serving layer owns the transport and bridges it to the two
/// channels; everything protocol-level lives here.
pub async fn run_controller_stream(
    registry: Arc<ControllerRegistry>,
    coordinator: Arc<Coordinator>,
    mut inbound: mpsc::Receiver<ControllerMessage>,
    outbound: mpsc::Sender<ControllerMessage>,
    cancel: CancellationToken,
) {
    // The stream opens with `register`, or it does not open at all.
    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
            tracing::warn!("controller stream sent nothing, closing");
            return;
        }
        msg = inbound.recv() => msg,
    };
    let (controller_id, version) = match first {
        Some(ControllerMessage::Register {
            gateway_id,
            version,
        }) => (gateway_id, version),
        Some(other) => {
            tracing::warn!(?other, "first stream message was not register");
            let _ = outbound
                .send(ControllerMessage::ProtocolError {
                    message: "first message must be register".to_string(),
                })
                .await;
            return;
        }
        None => return,
    };

    tracing::info!(%controller_id, %version, "controller registered");
    registry.register_stream(&controller_id, outbound.clone());
    if outbound.send(ControllerMessage::Registered).await.is_err() {
        registry.unregister_stream(&controller_id);
        return;
    }

    // First registration kicks the one-shot startup reconciliation, off
    // the stream task so slow fan-outs don't stall the handshake.
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.initial_reconcile_once().await });
    }

    let mut last_rx = tokio::time::Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = heartbeat.tick() => {
                if last_rx.elapsed() > HEARTBEAT_INTERVAL * HEARTBEAT_MISS_LIMIT {
                    tracing::warn!(
                        %controller_id,
                        "missed {HEARTBEAT_MISS_LIMIT} heartbeats, closing stream"
                    );
                    break;
                }
                if outbound.send(ControllerMessage::Heartbeat).await.is_err() {
                    break;
                }
            }

            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                last_rx = tokio::time::Instant::now();
                match msg {
                    ControllerMessage::Register { .. } => {
                        tracing::warn!(%controller_id, "duplicate register on stream");
                        let _ = outbound.send(ControllerMessage::ProtocolError {
                            message: "already registered".to_string(),
                        }).await;
                        break;
                    }

                    ControllerMessage::Heartbeat => {
                        if outbound.send(ControllerMessage::Heartbeat).await.is_err() {
                            break;
                        }
                    }

                    ControllerMessage::SyncAllocations { allocations } => {
                        tracing::info!(
                            %controller_id,
                            desired = allocations.len(),
                            "applying sync_allocations"
                        );
                        let result = coordinator.apply_sync(&allocations).await;
                        if outbound.send(ControllerMessage::SyncResult(result)).await.is_err() {
                            break;
                        }
                    }

                    ControllerMessage::Response { request_id, payload, error } => {
                        registry.complete(&request_id, PendingReply { payload, error });
                    }

                    ControllerMessage::Request { request_id, method, payload } => {
                        let reply = match handle_controller_request(&coordinator, &method, payload) {
                            Ok(payload) => ControllerMessage::Response {
                                request_id,
                                payload,
                                error: None,
                            },
                            Err(message) => ControllerMessage::Response {
                                request_id,
                                payload: serde_json::Value::Null,
                                error: Some(message),
                            },
                        };
                        if outbound.send(reply).await.is_err() {
                            break;
                        }
                    }

                    ControllerMessage::Metrics { .. } => {
                        tracing::debug!(%controller_id, "controller metrics frame received");
                    }

                    other => {
                        tracing::debug!(%controller_id, ?other, "ignoring unexpected stream message");
                    }
                }
            }
        }
    }

    registry.unregister_stream(&controller_id);
    tracing::info!(%controller_id, "controller stream closed");
}

fn handle_controller_request(
    coordinator: &Coordinator,
    method: &str,
    _payload: serde_json::Value,
) -> Result<serde_json::Value, String> {
    match method {
        "list_allocations" => {
            let allocations: Vec<AllocationRecord> = coordinator
                .store()
                .list(None, None)
                .iter()
                .map(AllocationRecord::from)
                .collect();
            serde_json::to_value(serde_json::json!({ "allocations": allocations }))
                .map_err(|e| e.to_string())
        }
        "gateway_info" => serde_json::to_value(coordinator.gateway_info()).map_err(|e| e.to_string()),
        unknown => Err(format!("unknown method {unknown}")),
    }
}

#[cfg(test)]
mod tests {
    use wire::api::DesiredAllocation;

    use crate::test_support;

    use super::*;

    struct StreamHarness {
        to_gateway: mpsc::Sender<ControllerMessage>,
        from_gateway: mpsc::Receiver<ControllerMessage>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn open_stream(
        registry: &Arc<ControllerRegistry>,
        coordinator: &Arc<Coordinator>,
    ) -> StreamHarness {
        let (to_gateway, inbound) = mpsc::channel(16);
        let (outbound, from_gateway) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_controller_stream(
            registry.clone(),
            coordinator.clone(),
            inbound,
            outbound,
            cancel.clone(),
        ));
        StreamHarness {
            to_gateway,
            from_gateway,
            cancel,
            task,
        }
    }

    async fn register(harness: &mut StreamHarness, id: &str) {
        harness
            .to_gateway
            .send(ControllerMessage::Register {
                gateway_id: id.to_string(),
                version: "1.0.0".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            recv_non_heartbeat(&mut harness.from_gateway).await,
            Some(ControllerMessage::Registered)
        );
    }

    /// Skip the periodic heartbeats the gateway emits on its own.
    async fn recv_non_heartbeat(
        rx: &mut mpsc::Receiver<ControllerMessage>,
    ) -> Option<ControllerMessage> {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for stream message")
            {
                Some(ControllerMessage::Heartbeat) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_register_then_sync_allocations() {
        let env = test_support::TestEnv::new();
        let mut stream = open_stream(&env.registry, &env.coordinator);
        register(&mut stream, "controller-a").await;
        assert_eq!(env.registry.connected_count(), 1);

        stream
            .to_gateway
            .send(ControllerMessage::SyncAllocations {
                allocations: vec![DesiredAllocation {
                    vps_id: "vps-1".to_string(),
                    organization_id: "org-a".to_string(),
                    ip_address: "10.0.0.10".to_string(),
                    mac_address: "aa:bb:cc:dd:ee:01".to_string(),
                    is_public: false,
                }],
            })
            .await
            .unwrap();

        match recv_non_heartbeat(&mut stream.from_gateway).await {
            Some(ControllerMessage::SyncResult(result)) => {
                assert!(result.success, "{}", result.message);
                assert_eq!(result.added, 1);
                assert_eq!(result.removed, 0);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(env.store.list(None, None).len(), 1);

        stream.cancel.cancel();
        stream.task.await.unwrap();
        assert_eq!(env.registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_first_message_must_be_register() {
        let env = test_support::TestEnv::new();
        let mut stream = open_stream(&env.registry, &env.coordinator);

        stream
            .to_gateway
            .send(ControllerMessage::Heartbeat)
            .await
            .unwrap();
        match recv_non_heartbeat(&mut stream.from_gateway).await {
            Some(ControllerMessage::ProtocolError { .. }) => {}
            other => panic!("unexpected message {other:?}"),
        }
        stream.task.await.unwrap();
        assert_eq!(env.registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_register_closes_stream() {
        let env = test_support::TestEnv::new();
        let mut stream = open_stream(&env.registry, &env.coordinator);
        register(&mut stream, "controller-a").await;

        stream
            .to_gateway
            .send(ControllerMessage::Register {
                gateway_id: "controller-a".to_string(),
                version: "1.0.0".to_string(),
            })
            .await
            .unwrap();
        match recv_non_heartbeat(&mut stream.from_gateway).await {
            Some(ControllerMessage::ProtocolError { .. }) => {}
            other => panic!("unexpected message {other:?}"),
        }
        stream.task.await.unwrap();
        assert_eq!(env.registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_fanout_returns_first_useful_answer() {
        // Scenario: the fast controller has no answer, the slow one does;
        // the fan-out must wait past the first reply and return the useful
        // one.
        let env = test_support::TestEnv::new();
        let mut a = open_stream(&env.registry, &env.coordinator);
        register(&mut a, "controller-a").await;
        let mut b = open_stream(&env.registry, &env.coordinator);
        register(&mut b, "controller-b").await;

        let registry = env.registry.clone();
        let fanout =
            tokio::spawn(
                async move { registry.find_vps_by_lease("10.0.0.50", "aa:bb:cc:dd:ee:50").await },
            );

        let mut answered = 0;
        while answered < 2 {
            // Both streams got the request; answer each according to its
            // role.
            tokio::select! {
                msg = recv_non_heartbeat(&mut a.from_gateway) => {
                    let Some(ControllerMessage::Request { request_id, method, .. }) = msg else {
                        panic!("unexpected message on a: {msg:?}");
                    };
                    assert_eq!(method, METHOD_FIND_VPS_BY_LEASE);
                    assert!(request_id.ends_with("controller-a"));
                    let to_gateway = a.to_gateway.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        to_gateway.send(ControllerMessage::Response {
                            request_id,
                            payload: serde_json::json!({"vpsID": "vps-9", "organizationID": "org-b"}),
                            error: None,
                        }).await.unwrap();
                    });
                    answered += 1;
                }
                msg = recv_non_heartbeat(&mut b.from_gateway) => {
                    let Some(ControllerMessage::Request { request_id, .. }) = msg else {
                        panic!("unexpected message on b: {msg:?}");
                    };
                    b.to_gateway.send(ControllerMessage::Response {
                        request_id,
                        payload: serde_json::json!({"vpsID": ""}),
                        error: None,
                    }).await.unwrap();
                    answered += 1;
                }
            }
        }

        let found = fanout.await.unwrap();
        assert_eq!(found.vps_id, "vps-9");
        assert_eq!(found.organization_id, "org-b");

        a.cancel.cancel();
        b.cancel.cancel();
        a.task.await.unwrap();
        b.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fanout_timeout_returns_empty() {
        let env = test_support::TestEnv::new();
        let mut stream = open_stream(&env.registry, &env.coordinator);
        register(&mut stream, "controller-a").await;

        // Never answer; the deadline must produce an empty response.
        let found = env
            .registry
            .find_vps_by_lease("10.0.0.50", "aa:bb:cc:dd:ee:50")
            .await;
        assert_eq!(found.vps_id, "");

        stream.cancel.cancel();
        stream.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_fanout_with_no_controllers_is_empty() {
        let env = test_support::TestEnv::new();
        let found = env
            .registry
            .find_vps_by_lease("10.0.0.50", "aa:bb:cc:dd:ee:50")
            .await;
        assert_eq!(found.vps_id, "");
    }

    #[tokio::test]
    async fn test_unknown_response_is_drained() {
        let env = test_support::TestEnv::new();
        let mut stream = open_stream(&env.registry, &env.coordinator);
        register(&mut stream, "controller-a").await;

        stream
            .to_gateway
            .send(ControllerMessage::Response {
                request_id: "gateway-findvps-999-controller-a".to_string(),
                payload: serde_json::json!({"vpsID": "vps-ghost"}),
                error: None,
            })
            .await
            .unwrap();

        // The stream is still healthy afterwards: a request round-trips.
        stream
            .to_gateway
            .send(ControllerMessage::Request {
                request_id: "ctl-1".to_string(),
                method: "gateway_info".to_string(),
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();
        match recv_non_heartbeat(&mut stream.from_gateway).await {
            Some(ControllerMessage::Response { request_id, .. }) => {
                assert_eq!(request_id, "ctl-1");
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(env.registry.connected_count(), 1);

        stream.cancel.cancel();
        stream.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_disconnects_after_missed_heartbeats() {
        let env = test_support::TestEnv::new();
        let mut stream = open_stream(&env.registry, &env.coordinator);
        register(&mut stream, "controller-a").await;

        // Say nothing. Time auto-advances; after three missed heartbeat
        // windows the gateway closes the stream.
        loop {
            match tokio::time::timeout(Duration::from_secs(600), stream.from_gateway.recv())
                .await
                .expect("stream never closed")
            {
                Some(ControllerMessage::Heartbeat) => continue,
                Some(other) => panic!("unexpected message {other:?}"),
                None => break,
            }
        }
        stream.task.await.unwrap();
        assert_eq!(env.registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_controller_request_dispatch() {
        let env = test_support::TestEnv::new();
        let mut stream = open_stream(&env.registry, &env.coordinator);
        register(&mut stream, "controller-a").await;

        stream
            .to_gateway
            .send(ControllerMessage::Request {
                request_id: "ctl-1".to_string(),
                method: "gateway_info".to_string(),
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();
        match recv_non_heartbeat(&mut stream.from_gateway).await {
            Some(ControllerMessage::Response {
                request_id,
                payload,
                error,
            }) => {
                assert_eq!(request_id, "ctl-1");
                assert!(error.is_none());
                assert_eq!(payload["uplinkInterface"], "eth0");
            }
            other => panic!("unexpected message {other:?}"),
        }

        stream
            .to_gateway
            .send(ControllerMessage::Request {
                request_id: "ctl-2".to_string(),
                method: "reboot_world".to_string(),
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();
        match recv_non_heartbeat(&mut stream.from_gateway).await {
            Some(ControllerMessage::Response { error, .. }) => {
                assert!(error.unwrap().contains("unknown method"));
            }
            other => panic!("unexpected message {other:?}"),
        }

        stream.cancel.cancel();
        stream.task.await.unwrap();
    }
}
