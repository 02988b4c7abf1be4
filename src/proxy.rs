//! Subdomain proxy front-end.
//!
//! Installed as the router fallback: anything that doesn't match the
//! management API lands here. The host's first label selects the tunnel;
//! the request is flattened into a tunnel frame and forwarded through the
//! live session, or answered with one of three HTML error pages.
//!
//! Hop-by-hop headers (RFC 7230 §6.1) are stripped from non-WebSocket
//! requests and from every response; end-to-end headers pass through
//! verbatim, multi-valued headers comma-joined.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, Instrument};

use crate::registry::TunnelStore;
use crate::templates;
use crate::tunnel::session::{ForwardError, ForwardedRequest, TunnelSession};
use crate::tunnel::TunnelFrame;
use crate::AppState;

/// Headers scoped to a single transport hop, never forwarded end-to-end.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// The candidate subdomain from a Host header, or `None` when the host is
/// the management origin, bare `localhost`, or has no subdomain label.
fn extract_subdomain(host: &str, base_domain: &str) -> Option<String> {
    if host.eq_ignore_ascii_case(base_domain) {
        return None;
    }
    let without_port = host.split(':').next().unwrap_or(host);
    let mut labels = without_port.split('.');
    let first = labels.next()?;
    // A bare host has no subdomain to route on.
    labels.next()?;
    let subdomain = first.to_ascii_lowercase();
    if subdomain.is_empty() || subdomain == "localhost" {
        return None;
    }
    Some(subdomain)
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

/// Flatten a `HeaderMap` into the wire representation, comma-joining
/// multi-valued headers.
fn headers_to_map(headers: &HeaderMap, strip_hop_by_hop: bool) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for name in headers.keys() {
        if strip_hop_by_hop && is_hop_by_hop(name.as_str()) {
            continue;
        }
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.to_string(), joined);
    }
    map
}

/// Router fallback: resolve the subdomain and hand the request to its live
/// session, or render the matching error page.
pub async fn handle_subdomain(State(state): State<AppState>, request: Request<Body>) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let Some(subdomain) = extract_subdomain(host, &state.config.proxy.base_domain) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No tunnel found"})),
        )
            .into_response();
    };

    let dashboard_url = format!("{}/dashboard", state.config.proxy.web_app_url);

    let tunnel = match state.registry.find_by_subdomain(&subdomain).await {
        Ok(Some(tunnel)) => tunnel,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Html(templates::tunnel_not_found(&subdomain, &dashboard_url)),
            )
                .into_response();
        }
        Err(e) => {
            error!(subdomain = %subdomain, error = %e, "tunnel lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Database error"})),
            )
                .into_response();
        }
    };

    // The in-memory map is the liveness truth; the stored flag only decides
    // which page to render when no session exists.
    let Some(session) = state.active.get(tunnel.id).await else {
        let (status, page) = if tunnel.is_active {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                templates::tunnel_connection_lost(&subdomain, &dashboard_url),
            )
        } else {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                templates::tunnel_offline(&subdomain, &dashboard_url),
            )
        };
        return (status, Html(page)).into_response();
    };

    let span = info_span!("proxied_request", subdomain = %subdomain, tunnel_id = %tunnel.id);
    if is_websocket_upgrade(request.headers()) {
        forward_websocket(&state, session, request).instrument(span).await
    } else {
        forward_http(&state, session, request).instrument(span).await
    }
}

fn request_url(uri: &axum::http::Uri) -> String {
    uri.path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string)
}

/// Forward a plain HTTP exchange and write the agent's response back.
async fn forward_http(
    state: &AppState,
    session: Arc<TunnelSession>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let forwarded = ForwardedRequest {
        method: parts.method.to_string(),
        url: request_url(&parts.uri),
        headers: headers_to_map(&parts.headers, true),
        body: match to_bytes(body, state.config.proxy.max_body_bytes).await {
            Ok(bytes) => bytes.to_vec(),
            Err(_) => {
                return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response()
            }
        },
    };

    match session.forward_http(forwarded).await {
        Ok(frame) => frame_to_response(&frame),
        Err(ForwardError::Timeout) => {
            (StatusCode::GATEWAY_TIMEOUT, "Tunnel request timeout").into_response()
        }
        Err(ForwardError::SessionClosed) => {
            (StatusCode::BAD_GATEWAY, "Tunnel connection lost").into_response()
        }
    }
}

/// Forward a WebSocket upgrade. A 101 from the agent upgrades the browser
/// side and bridges frames; anything else is returned as a plain response.
async fn forward_websocket(
    state: &AppState,
    session: Arc<TunnelSession>,
    request: Request<Body>,
) -> Response {
    let (mut parts, _body) = request.into_parts();
    let forwarded = ForwardedRequest {
        method: parts.method.to_string(),
        url: request_url(&parts.uri),
        // Upgrade negotiation headers must survive for the agent's handshake.
        headers: headers_to_map(&parts.headers, false),
        body: Vec::new(),
    };

    let (exchange_id, response) = match session.forward_websocket_upgrade(forwarded).await {
        Ok(pair) => pair,
        Err(ForwardError::Timeout) => {
            return (StatusCode::GATEWAY_TIMEOUT, "WebSocket upgrade timeout").into_response()
        }
        Err(ForwardError::SessionClosed) => {
            return (StatusCode::BAD_GATEWAY, "Tunnel connection lost").into_response()
        }
    };

    if response.status != Some(StatusCode::SWITCHING_PROTOCOLS.as_u16()) {
        return frame_to_response(&response);
    }

    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws
            .on_upgrade(move |socket| bridge(socket, session, exchange_id))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Relay frames between the browser socket and the agent session until
/// either side closes. `state.config.proxy` timeouts don't apply here; the
/// session's heartbeat machinery bounds a dead agent.
async fn bridge(browser: WebSocket, session: Arc<TunnelSession>, exchange_id: String) {
    let (mut browser_sink, mut browser_stream) = browser.split();
    let (agent_tx, mut agent_rx) = mpsc::channel::<TunnelFrame>(64);
    session.register_ws_sink(&exchange_id, agent_tx);
    debug!(exchange_id = %exchange_id, "websocket bridge open");

    // Agent → browser. Ends when the sink is unregistered (or the session
    // torn down), then tells the browser with a normal closure.
    let to_browser = tokio::spawn(async move {
        while let Some(frame) = agent_rx.recv().await {
            let message_type = frame
                .headers
                .as_ref()
                .and_then(|h| h.get("message_type"))
                .map_or("1", String::as_str);
            let payload = frame.body.unwrap_or_default();
            let message = if message_type == "2" {
                WsMessage::Binary(payload.into())
            } else {
                WsMessage::Text(String::from_utf8_lossy(&payload).into_owned().into())
            };
            if browser_sink.send(message).await.is_err() {
                return;
            }
        }
        let _ = browser_sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
    });

    // Browser → agent.
    while let Some(Ok(message)) = browser_stream.next().await {
        let (message_type, payload) = match message {
            WsMessage::Text(text) => ("1", text.as_bytes().to_vec()),
            WsMessage::Binary(bytes) => ("2", bytes.to_vec()),
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };
        let frame = TunnelFrame::websocket_data(exchange_id.clone(), message_type, payload);
        if session.send_frame(&frame).await.is_err() {
            break;
        }
    }

    // Dropping the sink ends the forwarding task, which closes the browser.
    session.unregister_ws_sink(&exchange_id);
    let _ = to_browser.await;
    debug!(exchange_id = %exchange_id, "websocket bridge closed");
}

/// Materialize an `http_response` frame as the browser-facing response.
/// Hop-by-hop headers are dropped unconditionally.
fn frame_to_response(frame: &TunnelFrame) -> Response {
    let status = frame
        .status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);

    let mut response = Response::new(Body::from(frame.body.clone().unwrap_or_default()));
    *response.status_mut() = status;

    if let Some(headers) = &frame.headers {
        for (name, value) in headers {
            if is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            } else {
                debug!(header = %name, "dropping unrepresentable response header");
            }
        }
    }

    response
}
