//! Agent control channel: upgrade, authenticate, run the session.
//!
//! `GET /api/v1/tunnel/connect` with a valid agent token plus `X-Tunnel-ID`
//! and `X-Tunnel-Auth` headers upgrades to the tunnel WebSocket. The upgrade
//! is performed by hand (hyper `OnUpgrade` + tungstenite server role) so the
//! raw TCP stream is in reach: keepalive and socket buffers are set on the
//! agent's connection specifically, not on anything the listener accepts.
//!
//! One writer task and one reader task own the socket halves; the heartbeat
//! loop pings every 15 s and declares the session dead after 45 s of
//! silence. Teardown removes the session from the active map, marks the
//! registry inactive, and fails every in-flight exchange.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, Response, StatusCode};
use axum::Extension;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::session::{TunnelSession, HEARTBEAT_DEAD_AFTER};
use super::TunnelFrame;
use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::registry::{Tunnel, TunnelStore};
use crate::AppState;

/// Transport-level ping cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// A read blocking longer than this means the peer is gone.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Per-write deadline on the socket sink.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// TCP send/receive buffer on the agent socket.
const SOCKET_BUFFER_SIZE: usize = 64 * 1024;
/// Keepalive probe interval; keeps NAT entries on the agent's path alive.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /api/v1/tunnel/connect` — authenticated agent WebSocket upgrade.
pub async fn connect(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
) -> Result<Response<Body>, ApiError> {
    let headers = request.headers();
    let tunnel_id = headers
        .get("x-tunnel-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing tunnel credentials".to_string()))?;
    let tunnel_auth = headers
        .get("x-tunnel-auth")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing tunnel credentials".to_string()))?
        .to_string();

    let tunnel_id = Uuid::parse_str(tunnel_id)
        .map_err(|_| ApiError::BadRequest("Invalid tunnel id".to_string()))?;

    let tunnel = state
        .registry
        .find_by_id(tunnel_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Tunnel not found".to_string()))?;

    if tunnel.user_id != user.user_id {
        return Err(ApiError::Forbidden(
            "Tunnel does not belong to user".to_string(),
        ));
    }

    if !state.registry.verify_auth(tunnel_id, &tunnel_auth).await? {
        return Err(ApiError::Unauthorized(
            "Invalid tunnel auth token".to_string(),
        ));
    }

    let accept_key = websocket_accept_key(request.headers())
        .ok_or_else(|| ApiError::BadRequest("WebSocket upgrade required".to_string()))?;
    let on_upgrade = request
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(|| ApiError::BadRequest("Connection does not support upgrade".to_string()))?;

    let span = info_span!("tunnel_session", tunnel_id = %tunnel_id);
    tokio::spawn(
        async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(error = %e, "upgrade failed before socket handoff");
                    return;
                }
            };
            let peer_ip = peer.ip().to_string();
            match upgraded.downcast::<TokioIo<TcpStream>>() {
                Ok(parts) => {
                    if !parts.read_buf.is_empty() {
                        // Agents wait for `connected` before speaking.
                        warn!(
                            bytes = parts.read_buf.len(),
                            "discarding data sent before the upgrade completed"
                        );
                    }
                    let stream = parts.io.into_inner();
                    apply_agent_socket_opts(&stream);
                    let socket =
                        WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
                    run_session(state, tunnel, peer_ip, socket).await;
                }
                Err(upgraded) => {
                    // Not plain TCP under us; run without per-socket options.
                    let socket = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    run_session(state, tunnel, peer_ip, socket).await;
                }
            }
        }
        .instrument(span),
    );

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Body::empty())
        .map_err(|e| ApiError::Internal(format!("Failed to build upgrade response: {e}")))
}

/// Validate the client's upgrade headers and derive the
/// `Sec-WebSocket-Accept` value for the 101 response.
fn websocket_accept_key(headers: &HeaderMap) -> Option<String> {
    let connection_ok = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    let upgrade_ok = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let version_ok = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "13");
    let key = headers.get(header::SEC_WEBSOCKET_KEY)?;
    (connection_ok && upgrade_ok && version_ok).then(|| derive_accept_key(key.as_bytes()))
}

/// Keepalive probes and 64 KiB buffers on the agent's TCP stream. Long-lived
/// outbound-dialed connections die silently behind NAT without the probes.
fn apply_agent_socket_opts(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_INTERVAL)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to enable TCP keepalive");
    }
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "failed to set receive buffer");
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "failed to set send buffer");
    }
}

/// Drive one agent connection from accept to teardown.
async fn run_session<S>(state: AppState, tunnel: Tunnel, peer_ip: String, socket: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tunnel_id = tunnel.id;

    if let Err(e) = state.registry.mark_active(tunnel_id, &peer_ip).await {
        warn!(error = %e, "failed to mark tunnel active, refusing session");
        let mut socket = socket;
        let frame = TunnelFrame::terminate(&tunnel_id.to_string(), Some("Database error".to_string()));
        let _ = socket.send(Message::Text(super::encode(&frame).into())).await;
        return;
    }

    let (sink, stream) = socket.split();
    let (writer_tx, writer_rx) = mpsc::channel::<Message>(256);
    let session = Arc::new(TunnelSession::new(
        tunnel_id,
        tunnel.local_port,
        writer_tx.clone(),
    ));

    // The single writer: every outbound frame, control frames included,
    // passes through this task.
    let writer_task = tokio::spawn(write_loop(sink, writer_rx));

    state.active.install(session.clone()).await;
    info!(subdomain = %tunnel.subdomain, peer_ip = %peer_ip, "agent connected");

    // `connected` must be the first frame the agent observes; the writer
    // queue preserves enqueue order.
    if session
        .send_frame(&TunnelFrame::connected(&tunnel_id.to_string()))
        .await
        .is_err()
    {
        warn!("failed to send connected frame");
        teardown(&state, &session).await;
        writer_task.abort();
        return;
    }

    let mut reader_task = tokio::spawn(read_loop(stream, session.clone()));

    let mut ticker = interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = &mut reader_task => {
                debug!("reader exited");
                break;
            }
            _ = ticker.tick() => {
                if session.is_closed() {
                    // Superseded by a reconnect, or stopped administratively.
                    debug!("session closed elsewhere, exiting");
                    break;
                }
                if session.heartbeat_age() > HEARTBEAT_DEAD_AFTER {
                    warn!("heartbeat timeout, tearing session down");
                    break;
                }
                if writer_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    warn!("ping write failed, tearing session down");
                    break;
                }
                // The in-memory heartbeat is the truth; the store trails it.
                if let Err(e) = state.registry.touch_last_seen(tunnel_id).await {
                    debug!(error = %e, "failed to touch last_seen");
                }
            }
        }
    }

    teardown(&state, &session).await;
    reader_task.abort();
    writer_task.abort();
    info!("agent disconnected");
}

/// Fail pending exchanges and drop the session from the active map (unless
/// a reconnect already superseded it). The store is only marked inactive
/// when no live session remains — the map is the truth.
async fn teardown(state: &AppState, session: &Arc<TunnelSession>) {
    session.close();
    state.active.remove(session).await;
    if state.active.get(session.tunnel_id()).await.is_none() {
        if let Err(e) = state.registry.mark_inactive(session.tunnel_id()).await {
            warn!(error = %e, "failed to mark tunnel inactive");
        }
    }
}

/// Consume the writer queue, enforcing a per-write deadline. Exiting drops
/// the receiver, which surfaces as send failures to everything upstream.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match timeout(WRITE_DEADLINE, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "socket write failed");
                break;
            }
            Err(_) => {
                warn!("socket write deadline exceeded");
                break;
            }
        }
    }
}

/// The single reader. Every inbound frame refreshes the heartbeat and
/// re-arms the 60 s read deadline; malformed frames are dropped without
/// touching the session.
async fn read_loop<S>(mut stream: SplitStream<WebSocketStream<S>>, session: Arc<TunnelSession>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = match timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                warn!("read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "socket read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        session.touch_heartbeat();

        match msg {
            Message::Text(text) => match super::decode(&text) {
                Ok(frame) => session.dispatch(frame).await,
                Err(e) => debug!(error = %e, "dropping malformed frame"),
            },
            // The transport answers pings on its own; both directions of
            // control traffic count as liveness.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) | Message::Frame(_) => debug!("ignoring non-text frame"),
        }
    }
}
