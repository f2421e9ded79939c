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
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wire::proxy::ProxyFrame;

use crate::dialer::Dialer;
use crate::observer::ProxyObserver;
use crate::{DEFAULT_TARGET_PORT, DIAL_TIMEOUT, WRITE_TIMEOUT};

const READ_BUFFER_SIZE: usize = 8192;
const SESSION_QUEUE_DEPTH: usize = 32;

/// What the dispatcher hands an open session.
enum SessionCmd {
    Data(Vec<u8>),
    Close,
}

/// What the target-reader task reports back to its session.
enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Failed(String),
}

struct Session {
    cmd_tx: mpsc::Sender<SessionCmd>,
    cancel: CancellationToken,
}

/// Drive one proxy stream until the inbound side ends or `cancel` fires.
///
/// Frames for different sessions interleave arbitrarily; within a session
/// every outbound frame is emitted by exactly one task, which is what makes
/// the ordering guarantees hold. On return, every session task has been
/// torn down.
pub async fn run_stream(
    mut inbound: mpsc::Receiver<ProxyFrame>,
    outbound: mpsc::Sender<ProxyFrame>,
    dialer: Arc<dyn Dialer>,
    observer: Arc<dyn ProxyObserver>,
    cancel: CancellationToken,
) {
    // Everything spawned below hangs off this token, so one cancel tears
    // the whole stream down.
    let stream_token = cancel.child_token();
    let mut sessions: HashMap<String, Session> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::channel::<String>(SESSION_QUEUE_DEPTH);
    let mut open_tasks: usize = 0;

    loop {
        tokio::select! {
            _ = stream_token.cancelled() => break,

            finished = done_rx.recv() => {
                if let Some(connection_id) = finished {
                    sessions.remove(&connection_id);
                    open_tasks -= 1;
                }
            }

            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    ProxyFrame::Connect { connection_id, target, port } => {
                        if sessions.contains_key(&connection_id) {
                            send_frame(&outbound, ProxyFrame::Error {
                                connection_id,
                                error: "connection ID already in use".to_string(),
                            }).await;
                            continue;
                        }
                        let (cmd_tx, cmd_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
                        let session_token = stream_token.child_token();
                        sessions.insert(connection_id.clone(), Session {
                            cmd_tx,
                            cancel: session_token.clone(),
                        });
                        open_tasks += 1;
                        tokio::spawn(run_session(SessionContext {
                            connection_id,
                            target,
                            port: if port == 0 { DEFAULT_TARGET_PORT } else { port },
                            outbound: outbound.clone(),
                            dialer: dialer.clone(),
                            observer: observer.clone(),
                            cancel: session_token,
                            cmd_rx,
                            done_tx: done_tx.clone(),
                        }));
                    }

                    ProxyFrame::Data { connection_id, data } => {
                        match sessions.get(&connection_id) {
                            Some(session) => {
                                // A failed send means the session is mid
                                // teardown; its final frame is already on
                                // the way.
                                if session.cmd_tx.send(SessionCmd::Data(data)).await.is_err() {
                                    tracing::debug!(%connection_id, "data for closing session dropped");
                                }
                            }
                            None => {
                                send_frame(&outbound, ProxyFrame::Error {
                                    connection_id,
                                    error: "no such connection".to_string(),
                                }).await;
                            }
                        }
                    }

                    ProxyFrame::Close { connection_id } => {
                        match sessions.get(&connection_id) {
                            Some(session) => {
                                if session.cmd_tx.send(SessionCmd::Close).await.is_err() {
                                    tracing::debug!(%connection_id, "close for closing session dropped");
                                }
                            }
                            None => {
                                tracing::debug!(%connection_id, "close for unknown session ignored");
                            }
                        }
                    }

                    // Server-to-client frame types have no business arriving
                    // inbound; drop them.
                    other => {
                        tracing::debug!(
                            connection_id = other.connection_id(),
                            "ignoring unexpected inbound frame"
                        );
                    }
                }
            }
        }
    }

    // Tear down whatever is still open and wait for the tasks to report
    // back, so no session task outlives the stream.
    stream_token.cancel();
    while open_tasks > 0 {
        match done_rx.recv().await {
            Some(connection_id) => {
                sessions.remove(&connection_id);
                open_tasks -= 1;
            }
            None => break,
        }
    }
}

struct SessionContext {
    connection_id: String,
    target: String,
    port: u16,
    outbound: mpsc::Sender<ProxyFrame>,
    dialer: Arc<dyn Dialer>,
    observer: Arc<dyn ProxyObserver>,
    cancel: CancellationToken,
    cmd_rx: mpsc::Receiver<SessionCmd>,
    done_tx: mpsc::Sender<String>,
}

async fn run_session(ctx: SessionContext) {
    let SessionContext {
        connection_id,
        target,
        port,
        outbound,
        dialer,
        observer,
        cancel,
        mut cmd_rx,
        done_tx,
    } = ctx;

    let dialed = match timeout(DIAL_TIMEOUT, dialer.dial(&target, port)).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(error)) => {
            tracing::debug!(%connection_id, %target, %error, "dial failed");
            send_frame(
                &outbound,
                ProxyFrame::Error {
                    connection_id: connection_id.clone(),
                    error: format!("dial {target}:{port}: {error}"),
                },
            )
            .await;
            None
        }
        Err(_) => {
            send_frame(
                &outbound,
                ProxyFrame::Error {
                    connection_id: connection_id.clone(),
                    error: format!("dial {target}:{port}: timed out"),
                },
            )
            .await;
            None
        }
    };
    let Some(stream) = dialed else {
        send_frame(
            &outbound,
            ProxyFrame::Closed {
                connection_id: connection_id.clone(),
            },
        )
        .await;
        let _ = done_tx.send(connection_id).await;
        return;
    };

    observer.session_opened(&target);
    let started = tokio::time::Instant::now();
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // The reader must exist and be observed-ready before `connected` goes
    // out, but may not emit data until after it; hence the two-way
    // ready/go handshake.
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let (go_tx, go_rx) = oneshot::channel::<()>();
    let (read_tx, mut read_rx) = mpsc::channel::<ReadEvent>(SESSION_QUEUE_DEPTH);
    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        let _ = ready_tx.send(());
        if go_rx.await.is_err() {
            return;
        }
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = reader_cancel.cancelled() => break,
                read = read_half.read(&mut buf) => {
                    let event = match read {
                        Ok(0) => ReadEvent::Eof,
                        Ok(n) => ReadEvent::Data(buf[..n].to_vec()),
                        Err(error) => ReadEvent::Failed(error.to_string()),
                    };
                    let finished = !matches!(event, ReadEvent::Data(_));
                    if read_tx.send(event).await.is_err() || finished {
                        break;
                    }
                }
            }
        }
    });

    let _ = ready_rx.await;
    send_frame(
        &outbound,
        ProxyFrame::Connected {
            connection_id: connection_id.clone(),
        },
    )
    .await;
    let _ = go_tx.send(());

    let mut bytes_up: u64 = 0;
    let mut bytes_down: u64 = 0;

    // Sole emitter for this session from here on: the final frame is
    // whatever this loop decides, and nothing follows it.
    let final_frame = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,

            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCmd::Data(bytes)) => {
                    match timeout(WRITE_TIMEOUT, write_half.write_all(&bytes)).await {
                        Ok(Ok(())) => bytes_up += bytes.len() as u64,
                        Ok(Err(error)) => break Some(ProxyFrame::Error {
                            connection_id: connection_id.clone(),
                            error: format!("write to target: {error}"),
                        }),
                        Err(_) => break Some(ProxyFrame::Error {
                            connection_id: connection_id.clone(),
                            error: format!("write to target timed out after {}s", WRITE_TIMEOUT.as_secs()),
                        }),
                    }
                }
                Some(SessionCmd::Close) | None => break Some(ProxyFrame::Closed {
                    connection_id: connection_id.clone(),
                }),
            },

            event = read_rx.recv() => match event {
                Some(ReadEvent::Data(bytes)) => {
                    bytes_down += bytes.len() as u64;
                    send_frame(&outbound, ProxyFrame::Data {
                        connection_id: connection_id.clone(),
                        data: bytes,
                    }).await;
                }
                Some(ReadEvent::Eof) | None => break Some(ProxyFrame::Closed {
                    connection_id: connection_id.clone(),
                }),
                Some(ReadEvent::Failed(error)) => break Some(ProxyFrame::Error {
                    connection_id: connection_id.clone(),
                    error: format!("read from target: {error}"),
                }),
            },
        }
    };

    cancel.cancel();
    let _ = reader.await;

    if let Some(frame) = final_frame {
        send_frame(&outbound, frame).await;
    }
    observer.session_closed(&target, started.elapsed(), bytes_up, bytes_down);
    let _ = done_tx.send(connection_id).await;
}

async fn send_frame(outbound: &mpsc::Sender<ProxyFrame>, frame: ProxyFrame) {
    if outbound.send(frame).await.is_err() {
        tracing::debug!("proxy stream outbound side is gone");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::io::DuplexStream;

    use crate::observer::NoopObserver;

    use super::*;

    /// Hands out one half of a duplex pipe per dial and parks the other
    /// half for the test to drive.
    struct MockDialer {
        accepted_tx: mpsc::UnboundedSender<(String, DuplexStream)>,
        banner: Option<Vec<u8>>,
    }

    impl MockDialer {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, DuplexStream)>) {
            let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    accepted_tx,
                    banner: None,
                }),
                accepted_rx,
            )
        }

        /// Like `new`, but the target writes `banner` the instant the dial
        /// completes, racing the `connected` reply on purpose.
        fn with_banner(banner: &[u8]) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, DuplexStream)>) {
            let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    accepted_tx,
                    banner: Some(banner.to_vec()),
                }),
                accepted_rx,
            )
        }
    }

    #[async_trait::async_trait]
    impl Dialer for MockDialer {
        async fn dial(
            &self,
            target: &str,
            port: u16,
        ) -> std::io::Result<Box<dyn crate::SessionStream>> {
            let (client, mut server) = tokio::io::duplex(64 * 1024);
            if let Some(banner) = &self.banner {
                server.write_all(banner).await.unwrap();
            }
            self.accepted_tx
                .send((format!("{target}:{port}"), server))
                .expect("test dropped the accepted receiver");
            Ok(Box::new(client))
        }
    }

    struct RefusingDialer;

    #[async_trait::async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(
            &self,
            _target: &str,
            _port: u16,
        ) -> std::io::Result<Box<dyn crate::SessionStream>> {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
        }
    }

    struct CountingObserver {
        opened: Mutex<Vec<String>>,
        closed: Mutex<Vec<(String, u64, u64)>>,
    }

    impl CountingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opened: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProxyObserver for CountingObserver {
        fn session_opened(&self, target: &str) {
            self.opened.lock().unwrap().push(target.to_string());
        }
        fn session_closed(&self, target: &str, _d: Duration, up: u64, down: u64) {
            self.closed
                .lock()
                .unwrap()
                .push((target.to_string(), up, down));
        }
    }

    struct Harness {
        to_mux: mpsc::Sender<ProxyFrame>,
        from_mux: mpsc::Receiver<ProxyFrame>,
        accepted: mpsc::UnboundedReceiver<(String, DuplexStream)>,
        cancel: CancellationToken,
        mux: tokio::task::JoinHandle<()>,
    }

    fn start(dialer: Arc<dyn Dialer>, accepted: mpsc::UnboundedReceiver<(String, DuplexStream)>) -> Harness {
        start_with_observer(dialer, accepted, Arc::new(NoopObserver))
    }

    fn start_with_observer(
        dialer: Arc<dyn Dialer>,
        accepted: mpsc::UnboundedReceiver<(String, DuplexStream)>,
        observer: Arc<dyn ProxyObserver>,
    ) -> Harness {
        let (to_mux, inbound) = mpsc::channel(64);
        let (outbound, from_mux) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let mux = tokio::spawn(run_stream(
            inbound,
            outbound,
            dialer,
            observer,
            cancel.clone(),
        ));
        Harness {
            to_mux,
            from_mux,
            accepted,
            cancel,
            mux,
        }
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<ProxyFrame>) -> ProxyFrame {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended unexpectedly")
    }

    fn connect(id: &str, target: &str, port: u16) -> ProxyFrame {
        ProxyFrame::Connect {
            connection_id: id.to_string(),
            target: target.to_string(),
            port,
        }
    }

    fn data(id: &str, bytes: &[u8]) -> ProxyFrame {
        ProxyFrame::Data {
            connection_id: id.to_string(),
            data: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_connect_banner_close_frame_order() {
        // Scenario: the target races its banner against the connected
        // reply; the client must still see connected, data, closed.
        let (dialer, accepted) = MockDialer::with_banner(b"SSH-2.0-mock");
        let mut h = start(dialer, accepted);

        h.to_mux.send(connect("c1", "10.0.0.10", 22)).await.unwrap();
        let (addr, _server) = h.accepted.recv().await.unwrap();
        assert_eq!(addr, "10.0.0.10:22");

        assert_eq!(
            recv_frame(&mut h.from_mux).await,
            ProxyFrame::Connected {
                connection_id: "c1".to_string()
            }
        );
        assert_eq!(recv_frame(&mut h.from_mux).await, data("c1", b"SSH-2.0-mock"));

        h.to_mux
            .send(ProxyFrame::Close {
                connection_id: "c1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            recv_frame(&mut h.from_mux).await,
            ProxyFrame::Closed {
                connection_id: "c1".to_string()
            }
        );

        // Nothing further for c1.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.from_mux.try_recv().is_err());

        h.cancel.cancel();
        h.mux.await.unwrap();
    }

    #[tokio::test]
    async fn test_bytes_survive_both_directions_in_order() {
        let (dialer, accepted) = MockDialer::new();
        let mut h = start(dialer, accepted);

        h.to_mux.send(connect("c1", "10.0.0.10", 0)).await.unwrap();
        let (addr, mut server) = h.accepted.recv().await.unwrap();
        // Port 0 defaulted to 22.
        assert_eq!(addr, "10.0.0.10:22");
        recv_frame(&mut h.from_mux).await; // connected

        // Client -> target across several frames.
        for chunk in [&b"abc"[..], b"def", b"ghi"] {
            h.to_mux.send(data("c1", chunk)).await.unwrap();
        }
        let mut got = [0u8; 9];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"abcdefghi");

        // Target -> client across several writes.
        for chunk in [&b"123"[..], b"456"] {
            server.write_all(chunk).await.unwrap();
        }
        let mut received = Vec::new();
        while received.len() < 6 {
            match recv_frame(&mut h.from_mux).await {
                ProxyFrame::Data { data, .. } => received.extend_from_slice(&data),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(received, b"123456");

        h.cancel.cancel();
        h.mux.await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_interleave_independently() {
        let (dialer, accepted) = MockDialer::new();
        let mut h = start(dialer, accepted);

        h.to_mux.send(connect("c1", "10.0.0.10", 22)).await.unwrap();
        let (_, mut server1) = h.accepted.recv().await.unwrap();
        recv_frame(&mut h.from_mux).await;

        h.to_mux.send(connect("c2", "10.0.0.11", 22)).await.unwrap();
        let (_, mut server2) = h.accepted.recv().await.unwrap();
        recv_frame(&mut h.from_mux).await;

        h.to_mux.send(data("c2", b"to-two")).await.unwrap();
        h.to_mux.send(data("c1", b"to-one")).await.unwrap();

        let mut got1 = [0u8; 6];
        server1.read_exact(&mut got1).await.unwrap();
        assert_eq!(&got1, b"to-one");
        let mut got2 = [0u8; 6];
        server2.read_exact(&mut got2).await.unwrap();
        assert_eq!(&got2, b"to-two");

        h.cancel.cancel();
        h.mux.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_emits_error_then_closed() {
        let (_, accepted) = MockDialer::new();
        let mut h = start(Arc::new(RefusingDialer), accepted);

        h.to_mux.send(connect("c9", "10.0.0.99", 22)).await.unwrap();
        match recv_frame(&mut h.from_mux).await {
            ProxyFrame::Error { connection_id, error } => {
                assert_eq!(connection_id, "c9");
                assert!(error.contains("connection refused"), "{error}");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(
            recv_frame(&mut h.from_mux).await,
            ProxyFrame::Closed {
                connection_id: "c9".to_string()
            }
        );

        h.cancel.cancel();
        h.mux.await.unwrap();
    }

    #[tokio::test]
    async fn test_data_for_unknown_session_is_an_error() {
        let (dialer, accepted) = MockDialer::new();
        let mut h = start(dialer, accepted);

        h.to_mux.send(data("nope", b"hello")).await.unwrap();
        match recv_frame(&mut h.from_mux).await {
            ProxyFrame::Error { connection_id, .. } => assert_eq!(connection_id, "nope"),
            other => panic!("unexpected frame {other:?}"),
        }

        h.cancel.cancel();
        h.mux.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_connect_rejected() {
        let (dialer, accepted) = MockDialer::new();
        let mut h = start(dialer, accepted);

        h.to_mux.send(connect("c1", "10.0.0.10", 22)).await.unwrap();
        let _server = h.accepted.recv().await.unwrap();
        recv_frame(&mut h.from_mux).await;

        h.to_mux.send(connect("c1", "10.0.0.11", 22)).await.unwrap();
        match recv_frame(&mut h.from_mux).await {
            ProxyFrame::Error { connection_id, error } => {
                assert_eq!(connection_id, "c1");
                assert!(error.contains("already in use"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        h.cancel.cancel();
        h.mux.await.unwrap();
    }

    #[tokio::test]
    async fn test_target_eof_closes_session() {
        let (dialer, accepted) = MockDialer::new();
        let mut h = start(dialer, accepted);

        h.to_mux.send(connect("c1", "10.0.0.10", 22)).await.unwrap();
        let (_, server) = h.accepted.recv().await.unwrap();
        recv_frame(&mut h.from_mux).await;

        drop(server);
        assert_eq!(
            recv_frame(&mut h.from_mux).await,
            ProxyFrame::Closed {
                connection_id: "c1".to_string()
            }
        );

        h.cancel.cancel();
        h.mux.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_tears_down_every_session() {
        let observer = CountingObserver::new();
        let (dialer, accepted) = MockDialer::new();
        let mut h = start_with_observer(dialer, accepted, observer.clone());

        for i in 0..3 {
            h.to_mux
                .send(connect(&format!("c{i}"), "10.0.0.10", 22))
                .await
                .unwrap();
            h.accepted.recv().await.unwrap();
            recv_frame(&mut h.from_mux).await;
        }
        assert_eq!(observer.opened.lock().unwrap().len(), 3);

        h.cancel.cancel();
        h.mux.await.unwrap();
        // run_stream only returns once every session task reported in.
        assert_eq!(observer.closed.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_byte_accounting_reaches_observer() {
        let observer = CountingObserver::new();
        let (dialer, accepted) = MockDialer::new();
        let mut h = start_with_observer(dialer, accepted, observer.clone());

        h.to_mux.send(connect("c1", "10.0.0.10", 22)).await.unwrap();
        let (_, mut server) = h.accepted.recv().await.unwrap();
        recv_frame(&mut h.from_mux).await;

        h.to_mux.send(data("c1", b"12345")).await.unwrap();
        let mut sink = [0u8; 5];
        server.read_exact(&mut sink).await.unwrap();
        server.write_all(b"abc").await.unwrap();
        match recv_frame(&mut h.from_mux).await {
            ProxyFrame::Data { data, .. } => assert_eq!(data, b"abc"),
            other => panic!("unexpected frame {other:?}"),
        }

        h.to_mux
            .send(ProxyFrame::Close {
                connection_id: "c1".to_string(),
            })
            .await
            .unwrap();
        recv_frame(&mut h.from_mux).await; // closed

        h.cancel.cancel();
        h.mux.await.unwrap();

        let closed = observer.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        let (target, up, down) = &closed[0];
        assert_eq!(target, "10.0.0.10");
        assert_eq!(*up, 5);
        assert_eq!(*down, 3);
    }
}
