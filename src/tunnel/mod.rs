//! Tunnel wire protocol.
//!
//! Every message between the edge and an agent is one JSON object per text
//! WebSocket frame:
//!
//! ```json
//! {"type": "http_request", "id": "t1-1", "timestamp": 1722556800,
//!  "method": "GET", "url": "/hello", "headers": {"Accept": "text/plain"},
//!  "body": "<base64>"}
//! ```
//!
//! `type` is one of nine known values; a frame with a missing or unknown
//! `type` fails to decode and is dropped by the reader, never tearing the
//! session down. `body` is base64 on the wire and raw bytes in memory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod active;
pub mod connect;
pub mod pending;
pub mod session;

/// Discriminant for [`TunnelFrame`]. Serialized in `snake_case` as the
/// frame's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Connected,
    HttpRequest,
    HttpResponse,
    WebsocketUpgrade,
    WebsocketUpgradeResponse,
    WebsocketData,
    Ping,
    Pong,
    Terminate,
}

/// One framed tunnel message. Optional fields are omitted on the wire when
/// absent; `body` is transported base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, with = "base64_body", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelFrame {
    fn bare(frame_type: FrameType, id: String) -> Self {
        Self {
            frame_type,
            id,
            timestamp: chrono::Utc::now().timestamp(),
            method: None,
            url: None,
            headers: None,
            body: None,
            status: None,
            error: None,
        }
    }

    /// First frame on every session; `id` is the tunnel id.
    pub fn connected(tunnel_id: &str) -> Self {
        Self::bare(FrameType::Connected, tunnel_id.to_string())
    }

    pub fn http_request(
        id: String,
        method: String,
        url: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            method: Some(method),
            url: Some(url),
            headers: Some(headers),
            body: if body.is_empty() { None } else { Some(body) },
            ..Self::bare(FrameType::HttpRequest, id)
        }
    }

    pub fn websocket_upgrade(
        id: String,
        method: String,
        url: String,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            method: Some(method),
            url: Some(url),
            headers: Some(headers),
            ..Self::bare(FrameType::WebsocketUpgrade, id)
        }
    }

    /// A relayed browser-side WebSocket frame. `message_type` is `"1"` for
    /// text and `"2"` for binary, carried in the headers map.
    pub fn websocket_data(id: String, message_type: &str, payload: Vec<u8>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("message_type".to_string(), message_type.to_string());
        Self {
            headers: Some(headers),
            body: Some(payload),
            ..Self::bare(FrameType::WebsocketData, id)
        }
    }

    /// Application-level pong echoing the ping's id.
    pub fn pong(id: String) -> Self {
        Self::bare(FrameType::Pong, id)
    }

    pub fn terminate(tunnel_id: &str, error: Option<String>) -> Self {
        let id = format!("{}-terminate-{}", tunnel_id, chrono::Utc::now().timestamp());
        Self {
            error,
            ..Self::bare(FrameType::Terminate, id)
        }
    }
}

/// Decode one text frame. Fails on malformed JSON and on a missing or
/// unknown `type`.
pub fn decode(text: &str) -> Result<TunnelFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encode a frame to its wire form.
pub fn encode(frame: &TunnelFrame) -> String {
    serde_json::to_string(frame).expect("TunnelFrame serializes")
}

/// Base64 transport encoding for the optional `body` field.
mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &TunnelFrame) -> TunnelFrame {
        decode(&encode(frame)).expect("decodes")
    }

    #[test]
    fn roundtrip_http_request() {
        let mut headers = HashMap::new();
        headers.insert("Accept".to_string(), "text/plain".to_string());
        let frame = TunnelFrame::http_request(
            "t1-1".to_string(),
            "GET".to_string(),
            "/hello?x=1".to_string(),
            headers,
            b"payload".to_vec(),
        );
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn roundtrip_bare_frames() {
        for frame in [
            TunnelFrame::connected("t1"),
            TunnelFrame::pong("t1-ping-1".to_string()),
            TunnelFrame::terminate("t1", Some("stopped".to_string())),
        ] {
            assert_eq!(roundtrip(&frame), frame);
        }
    }

    #[test]
    fn body_is_base64_on_the_wire() {
        let frame = TunnelFrame::websocket_data("t1-ws-1".to_string(), "1", b"ping".to_vec());
        let wire = encode(&frame);
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["body"], "cGluZw==");
        assert_eq!(value["headers"]["message_type"], "1");
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = decode(r#"{"type":"warp_drive","id":"x","timestamp":0}"#);
        assert!(err.is_err());
    }

    #[test]
    fn decode_rejects_missing_type() {
        assert!(decode(r#"{"id":"x","timestamp":0}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn decode_tolerates_absent_optional_fields() {
        let frame = decode(r#"{"type":"pong","id":"t1-ping-5","timestamp":12}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::Pong);
        assert_eq!(frame.id, "t1-ping-5");
        assert!(frame.body.is_none());
        assert!(frame.headers.is_none());
    }

    #[test]
    fn status_survives_roundtrip() {
        let frame = TunnelFrame {
            status: Some(503),
            ..TunnelFrame::bare(FrameType::HttpResponse, "t1-2".to_string())
        };
        assert_eq!(roundtrip(&frame).status, Some(503));
    }
}
