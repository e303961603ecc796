use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::emitter::EventEmitter;
use crate::envelope::{Envelope, PeerId};
use crate::error::{now_ms, CrossBusError, ErrorCode, Result};
use crate::transport::Transport;

/// Connection lifecycle state of a peer, per `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

/// Per-peer table entry. The send function is opaque to the core; the core
/// calls it but never closes it (transports own their own lifecycle).
pub struct PeerRecord {
    pub id: PeerId,
    pub status: PeerStatus,
    pub capabilities: Vec<String>,
    pub metadata: serde_json::Value,
    pub transport: Arc<dyn Transport>,
    pub last_seen_ms: u64,
}

/// Address space, per-peer sequence counters, and unicast/broadcast routing,
/// per `spec.md` §4.4. Sequence allocation is split into its own lock so it
/// never needs the whole-table lock, matching the reference workspace's
/// preference for narrowly scoped mutexes over one big node-state lock.
pub struct PeerTable {
    peers: Mutex<HashMap<PeerId, PeerRecord>>,
    sequences: Mutex<HashMap<PeerId, Arc<AtomicU64>>>,
    max_peers: usize,
    emitter: Arc<EventEmitter>,
}

/// Filters accepted by `broadcast`.
#[derive(Default, Clone)]
pub struct BroadcastFilter {
    pub exclude: Vec<PeerId>,
    pub include: Option<Vec<PeerId>>,
}

impl PeerTable {
    pub fn new(max_peers: usize, emitter: Arc<EventEmitter>) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            max_peers,
            emitter,
        }
    }

    pub fn add_peer(
        &self,
        id: PeerId,
        transport: Arc<dyn Transport>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(&id) {
            return Err(CrossBusError::from_code(
                ErrorCode::PeerExists,
                serde_json::json!({"peerId": id}),
            ));
        }
        if self.max_peers > 0 && peers.len() >= self.max_peers {
            return Err(CrossBusError::from_code(
                ErrorCode::MaxPeers,
                serde_json::json!({"maxPeers": self.max_peers}),
            ));
        }
        peers.insert(
            id.clone(),
            PeerRecord {
                id: id.clone(),
                status: PeerStatus::Connecting,
                capabilities: Vec::new(),
                metadata,
                transport,
                last_seen_ms: now_ms(),
            },
        );
        drop(peers);
        self.sequences
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::new(AtomicU64::new(0)));
        debug!(peer = %id, "peer added");
        self.emitter
            .emit_sync("peer:added", &serde_json::json!({"peerId": id}), None);
        Ok(())
    }

    pub fn remove_peer(&self, id: &str) -> Option<PeerRecord> {
        let removed = self.peers.lock().unwrap().remove(id);
        self.sequences.lock().unwrap().remove(id);
        if removed.is_some() {
            debug!(peer = %id, "peer removed");
            self.emitter
                .emit_sync("peer:removed", &serde_json::json!({"peerId": id}), None);
        }
        removed
    }

    pub fn set_status(&self, id: &str, status: PeerStatus) -> Result<()> {
        let mut peers = self.peers.lock().unwrap();
        let record = peers
            .get_mut(id)
            .ok_or_else(|| CrossBusError::from_code(ErrorCode::PeerNotFound, serde_json::json!({"peerId": id})))?;
        record.status = status;
        record.last_seen_ms = now_ms();
        drop(peers);
        self.emitter.emit_sync(
            "peer:status",
            &serde_json::json!({"peerId": id, "status": format!("{:?}", status)}),
            None,
        );
        Ok(())
    }

    pub fn touch(&self, id: &str) {
        if let Some(record) = self.peers.lock().unwrap().get_mut(id) {
            record.last_seen_ms = now_ms();
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.lock().unwrap().contains_key(id)
    }

    pub fn status_of(&self, id: &str) -> Option<PeerStatus> {
        self.peers.lock().unwrap().get(id).map(|r| r.status)
    }

    pub fn capabilities_of(&self, id: &str) -> Option<Vec<String>> {
        self.peers.lock().unwrap().get(id).map(|r| r.capabilities.clone())
    }

    pub fn set_capabilities(&self, id: &str, capabilities: Vec<String>) {
        if let Some(record) = self.peers.lock().unwrap().get_mut(id) {
            record.capabilities = capabilities;
        }
    }

    /// Snapshot of current peer ids, for broadcast iteration and health checks.
    pub fn snapshot_ids(&self) -> Vec<PeerId> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_seen_ms(&self, id: &str) -> Option<u64> {
        self.peers.lock().unwrap().get(id).map(|r| r.last_seen_ms)
    }

    /// Allocates the next sequence number for `destination`, per `spec.md`
    /// §4.4 ("each outbound envelope obtains the next sequence for its
    /// destination before the send is attempted").
    pub fn next_sequence(&self, destination: &str) -> u64 {
        let counter = self
            .sequences
            .lock()
            .unwrap()
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    fn transport_for(&self, id: &str) -> Result<(Arc<dyn Transport>, PeerStatus)> {
        let peers = self.peers.lock().unwrap();
        let record = peers
            .get(id)
            .ok_or_else(|| CrossBusError::from_code(ErrorCode::NoRoute, serde_json::json!({"peerId": id})))?;
        Ok((record.transport.clone(), record.status))
    }

    /// The security domain `id`'s registered transport reports for itself,
    /// per `spec.md` §6 — the trusted counterpart to whatever an envelope's
    /// payload might claim about its own origin.
    pub fn origin_of(&self, id: &str) -> Result<String> {
        let (transport, _status) = self.transport_for(id)?;
        Ok(transport.origin().to_string())
    }

    /// Sends regardless of connection status — used only for the handshake
    /// envelopes that must reach a peer still in `connecting` status before
    /// ordinary routing (which requires `Connected`) would allow it.
    pub async fn send_to_connecting(&self, target: &str, envelope: Envelope) -> Result<()> {
        let (transport, _status) = self.transport_for(target)?;
        let seq = self.next_sequence(target);
        transport.send(envelope.with_seq(seq)).await
    }

    /// Unicast routing, per `spec.md` §4.4: unknown peer → `NoRoute`;
    /// non-connected peer → `PeerDisconnected`. Neither invokes the transport.
    pub async fn route(&self, target: &str, envelope: Envelope) -> Result<()> {
        let (transport, status) = self.transport_for(target)?;
        if status != PeerStatus::Connected {
            return Err(CrossBusError::from_code(
                ErrorCode::PeerDisconnected,
                serde_json::json!({"peerId": target}),
            ));
        }
        let seq = self.next_sequence(target);
        let envelope = envelope.with_seq(seq);
        transport.send(envelope).await
    }

    /// Iterates the current peer snapshot; a per-peer failure does not abort
    /// the broadcast (`spec.md` §4.4 / scenario S6).
    pub async fn broadcast(&self, envelope: Envelope, filter: BroadcastFilter) -> HashMap<PeerId, Result<()>> {
        let targets: Vec<PeerId> = match &filter.include {
            Some(include) => include.clone(),
            None => self.snapshot_ids(),
        };
        let mut results = HashMap::new();
        for target in targets {
            if filter.exclude.contains(&target) {
                continue;
            }
            let result = self.route(&target, envelope.clone()).await;
            if let Err(err) = &result {
                warn!(peer = %target, error = %err, "broadcast send failed");
            }
            results.insert(target, result);
        }
        results
    }
}
