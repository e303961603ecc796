use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::error::now_ms;

/// Peer ids are plain strings, unique within one bus (`spec.md` §3).
pub type PeerId = String;

pub const PROTOCOL_MARKER: &str = "crossbus";
pub const PROTOCOL_VERSION: u32 = 1;

/// Message type tag, per `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeType {
    Signal,
    Broadcast,
    Request,
    Response,
    HandshakeInit,
    HandshakeAck,
    HandshakeComplete,
    Ping,
    Pong,
    Bye,
    Presence,
}

/// Fields shared by every envelope, regardless of type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub marker: String,
    pub version: u32,
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub seq: Option<u64>,
    pub created_at_ms: u64,
    pub source: PeerId,
    pub destination: Option<PeerId>,
    pub correlation_id: Option<Uuid>,
    pub vector_clock: Option<VectorClock>,
}

/// Immutable protocol message. Constructed only through the `Envelope::*`
/// builders below; there is no setter, so there is no way to mutate a field
/// after construction (the Rust equivalent of "deeply frozen").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    header: EnvelopeHeader,
    payload: serde_json::Value,
}

impl Envelope {
    fn new(
        kind: EnvelopeType,
        source: PeerId,
        destination: Option<PeerId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            header: EnvelopeHeader {
                marker: PROTOCOL_MARKER.to_string(),
                version: PROTOCOL_VERSION,
                id: Uuid::new_v4(),
                kind,
                seq: None,
                created_at_ms: now_ms(),
                source,
                destination,
                correlation_id: None,
                vector_clock: None,
            },
            payload,
        }
    }

    pub fn signal(source: PeerId, destination: Option<PeerId>, payload: serde_json::Value) -> Self {
        let kind = if destination.is_some() {
            EnvelopeType::Signal
        } else {
            EnvelopeType::Broadcast
        };
        Self::new(kind, source, destination, payload)
    }

    pub fn broadcast(source: PeerId, payload: serde_json::Value) -> Self {
        Self::new(EnvelopeType::Broadcast, source, None, payload)
    }

    pub fn request(
        source: PeerId,
        destination: PeerId,
        correlation_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        let mut env = Self::new(EnvelopeType::Request, source, Some(destination), payload);
        env.header.correlation_id = Some(correlation_id);
        env
    }

    pub fn response(
        source: PeerId,
        destination: PeerId,
        correlation_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        let mut env = Self::new(EnvelopeType::Response, source, Some(destination), payload);
        env.header.correlation_id = Some(correlation_id);
        env
    }

    pub fn handshake_init(source: PeerId, payload: serde_json::Value) -> Self {
        Self::new(EnvelopeType::HandshakeInit, source, None, payload)
    }

    /// A targeted INIT carrying the handshake id as its correlation id, so
    /// the responder's ACK can be matched back to the initiator's pending
    /// handshake entry.
    pub fn handshake_init_to(
        source: PeerId,
        destination: PeerId,
        handshake_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        let mut env = Self::new(EnvelopeType::HandshakeInit, source, Some(destination), payload);
        env.header.correlation_id = Some(handshake_id);
        env
    }

    pub fn handshake_ack(source: PeerId, destination: PeerId, payload: serde_json::Value) -> Self {
        Self::new(EnvelopeType::HandshakeAck, source, Some(destination), payload)
    }

    /// An ACK carrying back the handshake id it answers as its correlation id.
    pub fn handshake_ack_for(
        source: PeerId,
        destination: PeerId,
        handshake_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        let mut env = Self::new(EnvelopeType::HandshakeAck, source, Some(destination), payload);
        env.header.correlation_id = Some(handshake_id);
        env
    }

    pub fn handshake_complete(source: PeerId, destination: PeerId, payload: serde_json::Value) -> Self {
        Self::new(EnvelopeType::HandshakeComplete, source, Some(destination), payload)
    }

    pub fn presence(source: PeerId, payload: serde_json::Value) -> Self {
        Self::new(EnvelopeType::Presence, source, None, payload)
    }

    pub fn bye(source: PeerId, payload: serde_json::Value) -> Self {
        Self::new(EnvelopeType::Bye, source, None, payload)
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.header.seq = Some(seq);
        self
    }

    pub fn with_vector_clock(mut self, clock: VectorClock) -> Self {
        self.header.vector_clock = Some(clock);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn id(&self) -> Uuid {
        self.header.id
    }

    pub fn kind(&self) -> EnvelopeType {
        self.header.kind
    }

    pub fn seq(&self) -> Option<u64> {
        self.header.seq
    }

    pub fn source(&self) -> &PeerId {
        &self.header.source
    }

    pub fn destination(&self) -> Option<&PeerId> {
        self.header.destination.as_ref()
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.header.correlation_id
    }

    pub fn vector_clock(&self) -> Option<&VectorClock> {
        self.header.vector_clock.as_ref()
    }

    pub fn created_at_ms(&self) -> u64 {
        self.header.created_at_ms
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// True iff `value` carries the marker, a compatible version, an id and
    /// a recognized type tag — `spec.md` §4.1's `isProtocolMessage`.
    pub fn is_protocol_message(value: &serde_json::Value) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        let marker_ok = obj.get("marker").and_then(|v| v.as_str()) == Some(PROTOCOL_MARKER);
        let version_ok = obj
            .get("version")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32 == PROTOCOL_VERSION)
            .unwrap_or(false);
        let has_id = obj.get("id").is_some();
        let kind_ok = obj
            .get("type")
            .and_then(|v| v.as_str())
            .map(|t| {
                matches!(
                    t,
                    "signal"
                        | "broadcast"
                        | "request"
                        | "response"
                        | "handshake-init"
                        | "handshake-ack"
                        | "handshake-complete"
                        | "ping"
                        | "pong"
                        | "bye"
                        | "presence"
                )
            })
            .unwrap_or(false);
        marker_ok && version_ok && has_id && kind_ok
    }
}

/// Walks a payload tree and collects transfer-eligible binary leaves without
/// duplicates (`spec.md` §4.1's `findTransferables`). A binary leaf is
/// recognized as an object of shape `{"$bin": "<base64>"}`; the set is
/// deduplicated by the encoded content itself.
pub fn find_transferables(value: &serde_json::Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    collect_transferables(value, &mut out, &mut seen);
    out
}

fn collect_transferables(
    value: &serde_json::Value,
    out: &mut Vec<String>,
    seen: &mut std::collections::HashSet<String>,
) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(b64)) = map.get("$bin") {
                if map.len() == 1 && seen.insert(b64.clone()) {
                    out.push(b64.clone());
                }
                return;
            }
            for v in map.values() {
                collect_transferables(v, out, seen);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                collect_transferables(v, out, seen);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_produce_distinct_ids_and_no_setter_exists() {
        let a = Envelope::signal("alice".into(), None, serde_json::json!({"x": 1}));
        let b = Envelope::signal("alice".into(), None, serde_json::json!({"x": 1}));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), EnvelopeType::Broadcast);
    }

    #[test]
    fn request_and_response_share_a_correlation_id() {
        let cid = Uuid::new_v4();
        let req = Envelope::request("a".into(), "b".into(), cid, serde_json::json!(null));
        let resp = Envelope::response("b".into(), "a".into(), cid, serde_json::json!(null));
        assert_eq!(req.correlation_id(), Some(cid));
        assert_eq!(resp.correlation_id(), Some(cid));
    }

    #[test]
    fn is_protocol_message_rejects_wrong_version() {
        let mut value = serde_json::json!({
            "marker": PROTOCOL_MARKER,
            "version": PROTOCOL_VERSION + 1,
            "id": "x",
            "type": "signal",
        });
        assert!(!Envelope::is_protocol_message(&value));
        value["version"] = serde_json::json!(PROTOCOL_VERSION);
        assert!(Envelope::is_protocol_message(&value));
    }

    #[test]
    fn find_transferables_deduplicates_binary_leaves() {
        let payload = serde_json::json!({
            "a": {"$bin": "AAAA"},
            "b": [{"$bin": "AAAA"}, {"$bin": "BBBB"}],
        });
        let mut found = find_transferables(&payload);
        found.sort();
        assert_eq!(found, vec!["AAAA".to_string(), "BBBB".to_string()]);
    }
}
