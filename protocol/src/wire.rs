//! # Wire Codec
//!
//! One UDP datagram carries one UTF-8 JSON object. The envelope fields
//! and the eight message kinds are a bit-compatibility boundary: field
//! names and value types must survive round-trips exactly, because
//! foreign implementations interoperate at this layer.
//!
//! Decoding is strict and two-stage. Stage one is byte-level (UTF-8 and
//! JSON syntax); stage two is schema validation with a stable snake_case
//! reason string per failure mode. The reasons feed the
//! `recv_invalid_json` / `recv_invalid_schema` events, so they are part
//! of the external contract too. A malformed datagram is always a logged
//! drop, never an error that propagates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::WIRE_VERSION;
use crate::pow::PowCredential;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// The eight message kinds of the protocol.
///
/// An envelope whose `msg_type` is a well-formed string but not one of
/// these passes schema validation and is dropped by the dispatcher with
/// `recv_unknown_type` — unknown kinds are a routing concern, not a
/// schema concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Admission request; carries capabilities and the optional PoW.
    Hello,
    /// Request for a snapshot of the receiver's peer view.
    GetPeers,
    /// Snapshot of peers, sent in reply to HELLO and GET_PEERS.
    PeersList,
    /// Liveness probe.
    Ping,
    /// Probe echo.
    Pong,
    /// Application payload under epidemic dissemination.
    Gossip,
    /// Digest advertisement of recently seen gossip ids (hybrid mode).
    Ihave,
    /// Request for gossip bodies advertised in an IHAVE.
    Iwant,
}

impl MsgType {
    /// The wire spelling of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Hello => "HELLO",
            MsgType::GetPeers => "GET_PEERS",
            MsgType::PeersList => "PEERS_LIST",
            MsgType::Ping => "PING",
            MsgType::Pong => "PONG",
            MsgType::Gossip => "GOSSIP",
            MsgType::Ihave => "IHAVE",
            MsgType::Iwant => "IWANT",
        }
    }

    /// Parses a wire spelling. `None` for anything unrecognized.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "HELLO" => Some(MsgType::Hello),
            "GET_PEERS" => Some(MsgType::GetPeers),
            "PEERS_LIST" => Some(MsgType::PeersList),
            "PING" => Some(MsgType::Ping),
            "PONG" => Some(MsgType::Pong),
            "GOSSIP" => Some(MsgType::Gossip),
            "IHAVE" => Some(MsgType::Ihave),
            "IWANT" => Some(MsgType::Iwant),
            _ => None,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A validated wire message.
///
/// `msg_type` stays a string here because schema validation accepts any
/// non-empty value; routing to a [`MsgType`] happens in the dispatcher.
/// `payload` stays an untyped object so that cached GOSSIP envelopes can
/// be re-sent verbatim and forwards never lose fields a newer peer
/// might have added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire version; always [`WIRE_VERSION`].
    pub version: u64,
    /// Unique message id; the deduplication key for GOSSIP.
    pub msg_id: String,
    /// Wire spelling of the message kind.
    pub msg_type: String,
    /// Node id of the emitting hop (not the originator — forwarding
    /// keeps the previous hop's value).
    pub sender_id: String,
    /// `host:port` the emitting hop claims to be bound to. Informational;
    /// replies go to the datagram source address instead.
    pub sender_addr: String,
    /// Sender clock at emission, epoch milliseconds.
    pub timestamp_ms: i64,
    /// Kind-specific object.
    pub payload: Value,
    /// Hop budget. Required for GOSSIP, optional elsewhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl Envelope {
    /// Serializes to the compact single-datagram form.
    pub fn encode(&self) -> Vec<u8> {
        // Envelope is plain data; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// The parsed message kind, if recognized.
    pub fn kind(&self) -> Option<MsgType> {
        MsgType::parse(&self.msg_type)
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// HELLO payload: advertised capabilities plus the optional admission
/// proof-of-work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Capability strings; must include `udp` and `json`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Admission puzzle solution, required when the receiver gates with
    /// `pow_k > 0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pow: Option<PowCredential>,
}

/// GET_PEERS payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPeersPayload {
    /// Requested snapshot size; the receiver clamps to its own limit.
    #[serde(default)]
    pub max_peers: Option<u64>,
}

/// One entry of a PEERS_LIST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer's node id.
    pub node_id: String,
    /// The peer's `host:port`.
    pub addr: String,
}

/// PEERS_LIST payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersListPayload {
    /// Peer records, already excluding the sender itself.
    #[serde(default)]
    pub peers: Vec<PeerRecord>,
}

/// PING payload; PONG echoes it field-for-field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingPayload {
    /// Probe id, echoed back verbatim.
    #[serde(default)]
    pub ping_id: Option<String>,
    /// Probe sequence number, echoed back verbatim.
    #[serde(default)]
    pub seq: Option<i64>,
}

/// GOSSIP payload: the opaque application message plus origin metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GossipPayload {
    /// Application topic tag.
    #[serde(default)]
    pub topic: Option<String>,
    /// Opaque application data.
    #[serde(default)]
    pub data: Option<Value>,
    /// Node id of the originator (stable across hops).
    #[serde(default)]
    pub origin_id: Option<String>,
    /// Originator clock at first emission.
    #[serde(default)]
    pub origin_timestamp_ms: Option<i64>,
}

/// IHAVE payload: a digest advertisement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IhavePayload {
    /// Advertised message ids, capped at `max_ids` by the sender.
    pub ids: Vec<String>,
    /// The sender's advertisement cap.
    #[serde(default)]
    pub max_ids: Option<u64>,
}

/// IWANT payload: ids the requester has not seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IwantPayload {
    /// Requested message ids.
    pub ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Why a datagram was dropped at the codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes were not UTF-8 JSON at all.
    #[error("invalid json: {reason}")]
    InvalidJson {
        /// Stable reason string for the `recv_invalid_json` event.
        reason: String,
    },
    /// JSON parsed but the envelope schema did not hold.
    #[error("invalid schema: {reason}")]
    InvalidSchema {
        /// Stable reason string for the `recv_invalid_schema` event.
        reason: String,
        /// `msg_type`, when extractable from the rejected value.
        msg_type: Option<String>,
        /// `msg_id`, when extractable from the rejected value.
        msg_id: Option<String>,
    },
}

fn schema_error(value: &Value, reason: impl Into<String>) -> DecodeError {
    let get_str = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    DecodeError::InvalidSchema {
        reason: reason.into(),
        msg_type: get_str("msg_type"),
        msg_id: get_str("msg_id"),
    }
}

fn is_int(value: &Value) -> bool {
    value.is_i64() || value.is_u64()
}

fn non_empty_string(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.trim().is_empty())
}

/// Lenient `host:port` shape check for `sender_addr`. Port 0 is allowed:
/// external injectors identify themselves as `127.0.0.1:0`.
fn valid_host_port(raw: &str) -> bool {
    match raw.rsplit_once(':') {
        Some((host, port)) => !host.trim().is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Decodes and validates one datagram.
///
/// Field checks run in a fixed order so a given malformed message always
/// yields the same reason string.
pub fn decode(data: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidJson {
        reason: "utf8_decode_error".to_string(),
    })?;
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson {
        reason: format!("json_decode_error:{e}"),
    })?;

    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Err(schema_error(&value, "message_not_object")),
    };

    for field in [
        "version",
        "msg_id",
        "msg_type",
        "sender_id",
        "sender_addr",
        "timestamp_ms",
        "payload",
    ] {
        if !obj.contains_key(field) {
            return Err(schema_error(&value, format!("missing_{field}")));
        }
    }

    if obj["version"].as_u64() != Some(WIRE_VERSION) {
        return Err(schema_error(&value, "invalid_version"));
    }
    let msg_id = match non_empty_string(&obj["msg_id"]) {
        Some(s) => s.to_string(),
        None => return Err(schema_error(&value, "invalid_msg_id")),
    };
    let msg_type = match non_empty_string(&obj["msg_type"]) {
        Some(s) => s.to_string(),
        None => return Err(schema_error(&value, "invalid_msg_type")),
    };
    let sender_id = match non_empty_string(&obj["sender_id"]) {
        Some(s) => s.to_string(),
        None => return Err(schema_error(&value, "invalid_sender_id")),
    };
    let sender_addr = match non_empty_string(&obj["sender_addr"]) {
        Some(s) => s.to_string(),
        None => return Err(schema_error(&value, "invalid_sender_addr")),
    };
    if !valid_host_port(&sender_addr) {
        return Err(schema_error(&value, "invalid_sender_addr_format"));
    }
    let timestamp_ms = match obj["timestamp_ms"].as_i64() {
        Some(ts) if is_int(&obj["timestamp_ms"]) => ts,
        _ => return Err(schema_error(&value, "invalid_timestamp_ms")),
    };
    if !obj["payload"].is_object() {
        return Err(schema_error(&value, "invalid_payload_type"));
    }

    let ttl = match obj.get("ttl") {
        None => None,
        Some(Value::Null) => None,
        Some(v) if is_int(v) => v.as_i64(),
        Some(_) => {
            let reason = if msg_type == "GOSSIP" {
                "invalid_ttl"
            } else {
                "invalid_ttl_type"
            };
            return Err(schema_error(&value, reason));
        }
    };

    if msg_type == "GOSSIP" {
        match ttl {
            None => return Err(schema_error(&value, "missing_ttl")),
            Some(t) if t < 0 => return Err(schema_error(&value, "invalid_ttl")),
            Some(_) => {}
        }
    }

    Ok(Envelope {
        version: WIRE_VERSION,
        msg_id,
        msg_type,
        sender_id,
        sender_addr,
        timestamp_ms,
        payload: obj["payload"].clone(),
        ttl,
    })
}
