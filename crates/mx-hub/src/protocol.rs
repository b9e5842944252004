//! WebSocket frame types.
//!
//! Frames are JSON objects discriminated by `type`. Unknown client frame
//! types are logged and dropped; frames that are not JSON objects at all are
//! answered with an `INVALID_MESSAGE` error. The hub never crashes on
//! malformed input.

use serde::{Deserialize, Serialize};

/// Error code: direct recipient not connected or send failed.
pub const ERR_DELIVERY_FAILED: &str = "DELIVERY_FAILED";
/// Error code: frame was not parseable JSON.
pub const ERR_INVALID_MESSAGE: &str = "INVALID_MESSAGE";

// ---------------------------------------------------------------------------
// Client → Hub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    /// Direct (`to` present) or broadcast message.
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// Liveness reply to a hub ping.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        matrix_id: Option<String>,
    },
    /// Client-initiated liveness probe; the hub echoes a ping back.
    Ping,
    /// Presence update.
    Presence { status: PresenceStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
        }
    }
}

/// What to do with an inbound text frame.
pub enum ParsedFrame {
    Frame(ClientFrame),
    /// Valid JSON with an unrecognized `type`: log and drop.
    UnknownType(String),
    /// Not valid JSON (or not an object): answer `INVALID_MESSAGE`.
    Invalid,
}

pub fn parse_client_frame(raw: &str) -> ParsedFrame {
    match serde_json::from_str::<ClientFrame>(raw) {
        Ok(frame) => ParsedFrame::Frame(frame),
        Err(_) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => {
                let kind = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("<missing>")
                    .to_string();
                ParsedFrame::UnknownType(kind)
            }
            Err(_) => ParsedFrame::Invalid,
        },
    }
}

// ---------------------------------------------------------------------------
// Hub → Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once after the WebSocket is accepted.
    Registered {
        matrix_id: String,
        online_matrices: Vec<String>,
    },
    /// A relayed message. `metadata` carries the sender's `sequence_number`
    /// so peers can dedup and order.
    Message {
        from: String,
        content: String,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// Presence change of some matrix.
    Presence {
        matrix_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    /// Heartbeat.
    Ping,
    /// Typed error surfaced to one client.
    Error { code: String, message: String },
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("serialize server frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_per_wire_shapes() {
        match parse_client_frame(r#"{"type":"message","to":"beta","content":"x"}"#) {
            ParsedFrame::Frame(ClientFrame::Message { to, content, .. }) => {
                assert_eq!(to.as_deref(), Some("beta"));
                assert_eq!(content, "x");
            }
            _ => panic!("expected message frame"),
        }
        match parse_client_frame(r#"{"type":"pong","matrix_id":"alpha"}"#) {
            ParsedFrame::Frame(ClientFrame::Pong { matrix_id }) => {
                assert_eq!(matrix_id.as_deref(), Some("alpha"))
            }
            _ => panic!("expected pong frame"),
        }
        match parse_client_frame(r#"{"type":"presence","status":"away"}"#) {
            ParsedFrame::Frame(ClientFrame::Presence { status }) => {
                assert_eq!(status, PresenceStatus::Away)
            }
            _ => panic!("expected presence frame"),
        }
    }

    #[test]
    fn unknown_type_is_dropped_not_invalid() {
        match parse_client_frame(r#"{"type":"telepathy","content":"hm"}"#) {
            ParsedFrame::UnknownType(kind) => assert_eq!(kind, "telepathy"),
            _ => panic!("expected unknown type"),
        }
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(parse_client_frame("not json"), ParsedFrame::Invalid));
    }

    #[test]
    fn server_frames_serialize_with_type_tag() {
        let frame = ServerFrame::Registered {
            matrix_id: "alpha".into(),
            online_matrices: vec!["alpha".into(), "beta".into()],
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "registered");
        assert_eq!(json["online_matrices"][1], "beta");

        let err = ServerFrame::error(ERR_DELIVERY_FAILED, "beta is offline");
        let json: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "DELIVERY_FAILED");
    }
}
