//! Per-agent tunnel session: request forwarding, inbound dispatch, health.
//!
//! A session owns the application-level view of one agent connection. All
//! outbound traffic — proxied requests, pongs, terminate — goes through a
//! single `mpsc` channel consumed by the connection's one writer task, so no
//! two tasks ever write the socket concurrently. Inbound frames arrive via
//! [`TunnelSession::dispatch`] from the connection's one reader task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::pending::{PendingGuard, PendingTable};
use super::{FrameType, TunnelFrame};

/// How long a proxied HTTP exchange waits for the agent's response.
pub const HTTP_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a WebSocket upgrade waits for the agent's response.
pub const WS_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);
/// A session with no heartbeat for this long is dead.
pub const HEARTBEAT_DEAD_AFTER: Duration = Duration::from_secs(45);

/// A browser request flattened for framing: method, path+query, comma-joined
/// headers, and the fully materialized body.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Why a proxied exchange failed without an agent response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    /// No response within the exchange deadline. Surfaced as 504.
    Timeout,
    /// The session closed before or during the exchange. Surfaced as 502.
    SessionClosed,
}

/// The socket writer is gone; the frame was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosed;

/// In-memory state for one live agent connection.
pub struct TunnelSession {
    tunnel_id: Uuid,
    id_str: String,
    pub local_port: i32,
    writer_tx: mpsc::Sender<Message>,
    pending: PendingTable,
    /// Browser-side WebSocket bridges keyed by upgrade correlation id.
    ws_sinks: Mutex<HashMap<String, mpsc::Sender<TunnelFrame>>>,
    last_heartbeat: Mutex<Instant>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl TunnelSession {
    pub fn new(tunnel_id: Uuid, local_port: i32, writer_tx: mpsc::Sender<Message>) -> Self {
        Self {
            tunnel_id,
            id_str: tunnel_id.to_string(),
            local_port,
            writer_tx,
            pending: PendingTable::new(),
            ws_sinks: Mutex::new(HashMap::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tunnel_id(&self) -> Uuid {
        self.tunnel_id
    }

    /// Forward an HTTP exchange and wait for the agent's `http_response`.
    pub async fn forward_http(&self, req: ForwardedRequest) -> Result<TunnelFrame, ForwardError> {
        let id = format!("{}-{}", self.id_str, self.next_seq());
        let frame = TunnelFrame::http_request(id.clone(), req.method, req.url, req.headers, req.body);
        self.exchange(&id, frame, HTTP_EXCHANGE_TIMEOUT).await
    }

    /// Forward a WebSocket upgrade and wait for the agent's
    /// `websocket_upgrade_response`. The caller inspects `status` to decide
    /// between bridging (101) and a plain HTTP reply.
    pub async fn forward_websocket_upgrade(
        &self,
        req: ForwardedRequest,
    ) -> Result<(String, TunnelFrame), ForwardError> {
        let id = format!("{}-ws-{}", self.id_str, self.next_seq());
        let frame = TunnelFrame::websocket_upgrade(id.clone(), req.method, req.url, req.headers);
        let response = self.exchange(&id, frame, WS_UPGRADE_TIMEOUT).await?;
        Ok((id, response))
    }

    /// Reserve a slot, write the request frame, await the response. The slot
    /// is removed on every exit path: response, timeout, teardown, or the
    /// caller's future being dropped.
    async fn exchange(
        &self,
        id: &str,
        frame: TunnelFrame,
        deadline: Duration,
    ) -> Result<TunnelFrame, ForwardError> {
        let rx = self.pending.reserve(id);
        let _guard = PendingGuard::new(&self.pending, id);

        self.send_frame(&frame)
            .await
            .map_err(|_| ForwardError::SessionClosed)?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without a value: the session closed underneath us.
            Ok(Err(_)) => Err(ForwardError::SessionClosed),
            Err(_) => Err(ForwardError::Timeout),
        }
    }

    /// Queue a frame on the session's single writer. Fails once the session
    /// is closed or the writer task has exited.
    pub async fn send_frame(&self, frame: &TunnelFrame) -> Result<(), SessionClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionClosed);
        }
        self.writer_tx
            .send(Message::Text(super::encode(frame).into()))
            .await
            .map_err(|_| SessionClosed)
    }

    /// Ask the agent to shut down. Idempotent; write errors after teardown
    /// are ignored.
    pub async fn send_terminate(&self) {
        let frame = TunnelFrame::terminate(&self.id_str, None);
        if self.send_frame(&frame).await.is_err() {
            debug!(tunnel_id = %self.id_str, "terminate after teardown, ignored");
        }
    }

    /// Route one inbound frame from the agent.
    pub async fn dispatch(&self, frame: TunnelFrame) {
        match frame.frame_type {
            FrameType::HttpResponse | FrameType::WebsocketUpgradeResponse => {
                let id = frame.id.clone();
                self.pending.complete(&id, frame);
            }
            FrameType::WebsocketData => {
                let sink = self
                    .ws_sinks
                    .lock()
                    .expect("ws sinks lock")
                    .get(&frame.id)
                    .cloned();
                match sink {
                    Some(tx) => {
                        if tx.send(frame).await.is_err() {
                            debug!("websocket bridge closed, dropping frame");
                        }
                    }
                    None => debug!(exchange_id = %frame.id, "no websocket bridge for frame"),
                }
            }
            FrameType::Ping => {
                if self.send_frame(&TunnelFrame::pong(frame.id)).await.is_err() {
                    warn!(tunnel_id = %self.id_str, "failed to answer agent ping");
                }
            }
            FrameType::Pong => self.touch_heartbeat(),
            // Server-originated types have no meaning inbound.
            FrameType::Connected
            | FrameType::HttpRequest
            | FrameType::WebsocketUpgrade
            | FrameType::Terminate => {
                debug!(frame_type = ?frame.frame_type, "ignoring inbound frame");
            }
        }
    }

    /// Register the browser-side sink for a bridged WebSocket exchange.
    pub fn register_ws_sink(&self, exchange_id: &str, tx: mpsc::Sender<TunnelFrame>) {
        self.ws_sinks
            .lock()
            .expect("ws sinks lock")
            .insert(exchange_id.to_string(), tx);
    }

    pub fn unregister_ws_sink(&self, exchange_id: &str) {
        self.ws_sinks.lock().expect("ws sinks lock").remove(exchange_id);
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat lock") = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().expect("heartbeat lock").elapsed()
    }

    /// Wall-clock equivalent of the last heartbeat, for registry listings.
    pub fn last_heartbeat_utc(&self) -> chrono::DateTime<chrono::Utc> {
        let age = chrono::Duration::from_std(self.heartbeat_age())
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        chrono::Utc::now() - age
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A session is healthy while its socket is open and a heartbeat was
    /// seen within [`HEARTBEAT_DEAD_AFTER`].
    pub fn is_healthy(&self) -> bool {
        !self.is_closed() && self.heartbeat_age() <= HEARTBEAT_DEAD_AFTER
    }

    /// Tear down the session: fail every in-flight exchange and end every
    /// WebSocket bridge. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.close_all();
        self.ws_sinks.lock().expect("ws sinks lock").clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn session() -> (Arc<TunnelSession>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(TunnelSession::new(Uuid::new_v4(), 3000, tx)), rx)
    }

    fn sent_frame(msg: &Message) -> TunnelFrame {
        let Message::Text(text) = msg else {
            panic!("expected text frame");
        };
        crate::tunnel::decode(text).expect("valid frame")
    }

    fn request() -> ForwardedRequest {
        ForwardedRequest {
            method: "GET".to_string(),
            url: "/hello".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn forward_http_resolves_with_matching_response() {
        let (session, mut writer_rx) = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.forward_http(request()).await })
        };

        let outbound = sent_frame(&writer_rx.recv().await.unwrap());
        assert_eq!(outbound.frame_type, FrameType::HttpRequest);
        assert_eq!(outbound.id, format!("{}-1", session.tunnel_id()));

        session
            .dispatch(TunnelFrame {
                frame_type: FrameType::HttpResponse,
                status: Some(200),
                body: Some(b"hi".to_vec()),
                ..TunnelFrame::connected(&outbound.id)
            })
            .await;

        let response = waiter.await.unwrap().expect("resolved");
        assert_eq!(response.status, Some(200));
        assert_eq!(response.body.as_deref(), Some(b"hi".as_slice()));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forward_http_times_out_and_clears_slot() {
        let (session, mut writer_rx) = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.forward_http(request()).await })
        };
        let _ = writer_rx.recv().await.unwrap();

        tokio::time::advance(HTTP_EXCHANGE_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(waiter.await.unwrap(), Err(ForwardError::Timeout));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn close_fails_inflight_exchange_with_session_closed() {
        let (session, mut writer_rx) = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.forward_http(request()).await })
        };
        let _ = writer_rx.recv().await.unwrap();

        session.close();
        assert_eq!(waiter.await.unwrap(), Err(ForwardError::SessionClosed));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (session, _writer_rx) = session();
        session.close();
        assert_eq!(
            session.forward_http(request()).await,
            Err(ForwardError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn exchange_ids_are_monotonic_and_never_reused() {
        let (session, mut writer_rx) = session();
        for expected_seq in 1..=3u64 {
            let waiter = {
                let session = session.clone();
                tokio::spawn(async move { session.forward_http(request()).await })
            };
            let outbound = sent_frame(&writer_rx.recv().await.unwrap());
            assert_eq!(
                outbound.id,
                format!("{}-{}", session.tunnel_id(), expected_seq)
            );
            session
                .dispatch(TunnelFrame {
                    frame_type: FrameType::HttpResponse,
                    status: Some(204),
                    ..TunnelFrame::connected(&outbound.id)
                })
                .await;
            waiter.await.unwrap().expect("resolved");
        }
    }

    #[tokio::test]
    async fn websocket_upgrade_uses_ws_id_namespace() {
        let (session, mut writer_rx) = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.forward_websocket_upgrade(request()).await })
        };
        let outbound = sent_frame(&writer_rx.recv().await.unwrap());
        assert_eq!(outbound.frame_type, FrameType::WebsocketUpgrade);
        assert_eq!(outbound.id, format!("{}-ws-1", session.tunnel_id()));

        session
            .dispatch(TunnelFrame {
                frame_type: FrameType::WebsocketUpgradeResponse,
                status: Some(101),
                ..TunnelFrame::connected(&outbound.id)
            })
            .await;
        let (id, response) = waiter.await.unwrap().expect("resolved");
        assert_eq!(id, outbound.id);
        assert_eq!(response.status, Some(101));
    }

    #[tokio::test]
    async fn agent_ping_is_answered_with_pong() {
        let (session, mut writer_rx) = session();
        let ping_id = format!("{}-ping-1722556800", session.tunnel_id());
        session
            .dispatch(TunnelFrame {
                frame_type: FrameType::Ping,
                ..TunnelFrame::connected(&ping_id)
            })
            .await;

        let pong = sent_frame(&writer_rx.recv().await.unwrap());
        assert_eq!(pong.frame_type, FrameType::Pong);
        assert_eq!(pong.id, ping_id);
    }

    #[tokio::test]
    async fn websocket_data_routes_to_registered_bridge() {
        let (session, _writer_rx) = session();
        let (bridge_tx, mut bridge_rx) = mpsc::channel(4);
        session.register_ws_sink("ex-1", bridge_tx);

        session
            .dispatch(TunnelFrame::websocket_data(
                "ex-1".to_string(),
                "1",
                b"ping".to_vec(),
            ))
            .await;
        let frame = bridge_rx.recv().await.unwrap();
        assert_eq!(frame.body.as_deref(), Some(b"ping".as_slice()));

        // Unknown ids are dropped without error.
        session
            .dispatch(TunnelFrame::websocket_data(
                "ex-404".to_string(),
                "1",
                b"lost".to_vec(),
            ))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_follows_heartbeat_age() {
        let (session, _writer_rx) = session();
        assert!(session.is_healthy());

        tokio::time::advance(HEARTBEAT_DEAD_AFTER + Duration::from_secs(1)).await;
        assert!(!session.is_healthy());

        session.touch_heartbeat();
        assert!(session.is_healthy());

        session.close();
        assert!(!session.is_healthy());
    }
}
