//! Text framing of the collaborator's Socket.IO server (Engine.IO v4) over a
//! plain websocket transport. Only the default namespace is joined.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Query string of the websocket upgrade request.
pub const HANDSHAKE_QUERY: &str = "EIO=4&transport=websocket";
/// Joins the default namespace.
pub const CONNECT: &str = "40";
pub const PONG: &str = "3";

/// Body of the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl Handshake {
    /// Longest silence tolerated before the server counts as gone.
    pub fn liveness(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    /// The server accepted the namespace join.
    Connected,
    ConnectError(String),
    Disconnect,
    Event { name: String, payload: Value },
    /// Upgrades, noops, acks, binary attachments and other namespaces.
    Ignored,
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownType(char),
    #[error("event packet without a name")]
    MissingName,
    #[error("malformed packet body: {0}")]
    Body(#[from] serde_json::Error),
}

pub fn decode(text: &str) -> Result<Packet, PacketError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let body = chars.as_str();
    match kind {
        '0' => Ok(Packet::Open(serde_json::from_str(body)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_message(body),
        '5' | '6' => Ok(Packet::Ignored),
        other => Err(PacketError::UnknownType(other)),
    }
}

fn decode_message(body: &str) -> Result<Packet, PacketError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let Some(body) = default_namespace(chars.as_str()) else {
        return Ok(Packet::Ignored);
    };
    match kind {
        '0' => Ok(Packet::Connected),
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(body),
        '3' | '5' | '6' => Ok(Packet::Ignored),
        '4' => {
            let reason = match serde_json::from_str::<Value>(body) {
                Ok(Value::Object(map)) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| body.to_owned()),
                Ok(Value::String(message)) => message,
                _ => body.to_owned(),
            };
            Ok(Packet::ConnectError(reason))
        }
        other => Err(PacketError::UnknownType(other)),
    }
}

/// Strips an explicit `/,` namespace prefix. `None` for any other namespace.
fn default_namespace(body: &str) -> Option<&str> {
    if !body.starts_with('/') {
        return Some(body);
    }
    let (namespace, rest) = body.split_once(',').unwrap_or((body, ""));
    (namespace == "/").then_some(rest)
}

fn decode_event(body: &str) -> Result<Packet, PacketError> {
    // An ack id may precede the argument array.
    let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut args = serde_json::from_str::<Vec<Value>>(body)?.into_iter();
    let name = match args.next() {
        Some(Value::String(name)) => name,
        _ => return Err(PacketError::MissingName),
    };
    let payload = args.next().unwrap_or_else(|| Value::Object(Map::new()));
    Ok(Packet::Event { name, payload })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn open_packet_carries_heartbeat_timings() {
        let packet = decode(
            r#"0{"sid":"Lbo5JLzTotvW3g2LAAAA","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .expect("open");
        let handshake = match packet {
            Packet::Open(handshake) => handshake,
            other => panic!("unexpected packet {other:?}"),
        };
        assert_eq!(handshake.sid, "Lbo5JLzTotvW3g2LAAAA");
        assert_eq!(handshake.liveness(), Duration::from_secs(45));
    }

    #[test]
    fn events_decode_with_and_without_payload() {
        assert_eq!(
            decode(r#"42["attendance_marked",{"name":"ASHA"}]"#).expect("event"),
            Packet::Event {
                name: "attendance_marked".into(),
                payload: json!({ "name": "ASHA" }),
            }
        );
        assert_eq!(
            decode(r#"4217["image_captured"]"#).expect("event"),
            Packet::Event {
                name: "image_captured".into(),
                payload: json!({}),
            }
        );
        assert_eq!(
            decode(r#"42/,["camera_error",{"message":"busy"}]"#).expect("event"),
            Packet::Event {
                name: "camera_error".into(),
                payload: json!({ "message": "busy" }),
            }
        );
    }

    #[test]
    fn control_packets_and_other_namespaces() {
        assert_eq!(decode("2").expect("ping"), Packet::Ping);
        assert_eq!(decode("1").expect("close"), Packet::Close);
        assert_eq!(decode(r#"40{"sid":"abc"}"#).expect("ack"), Packet::Connected);
        assert_eq!(decode("41").expect("disconnect"), Packet::Disconnect);
        assert_eq!(
            decode(r#"44{"message":"Not authorized"}"#).expect("refused"),
            Packet::ConnectError("Not authorized".into())
        );
        assert_eq!(
            decode(r#"42/admin,["attendance_marked",{}]"#).expect("namespaced"),
            Packet::Ignored
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode(""), Err(PacketError::Empty)));
        assert!(matches!(decode("not a packet"), Err(PacketError::UnknownType('n'))));
        assert!(matches!(decode("42[17]"), Err(PacketError::MissingName)));
        assert!(matches!(decode("42{oops"), Err(PacketError::Body(_))));
    }
}
