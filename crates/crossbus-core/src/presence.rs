use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::emitter::EventEmitter;
use crate::envelope::{Envelope, PeerId};
use crate::error::{now_ms, CrossBusError, ErrorCode, Result};
use crate::peer::{PeerStatus, PeerTable};
use crate::transport::Transport;

/// Stand-in transport for a peer registered off a bare liveness signal
/// (no transport was ever handed in). Routing to it always fails with
/// `PeerDisconnected` rather than silently succeeding, until something
/// replaces the record with a real transport (e.g. via `add_peer` once
/// the caller actually dials the peer).
struct UnreachableTransport;

impl Transport for UnreachableTransport {
    fn send(&self, _envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Err(CrossBusError::from_code(ErrorCode::PeerDisconnected, serde_json::json!({}))) })
    }
}

/// Join/leave/heartbeat with per-peer liveness timeout, per `spec.md` §4.9.
///
/// Owns two `tokio` tickers (heartbeat, sweep), both cancelled on `stop()`
/// so the bus can tear them down cleanly on `destroy()`.
pub struct Presence {
    local_peer_id: PeerId,
    peers: Arc<PeerTable>,
    emitter: Arc<EventEmitter>,
    heartbeat_interval: Duration,
    liveness_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Presence {
    pub fn new(
        local_peer_id: PeerId,
        peers: Arc<PeerTable>,
        emitter: Arc<EventEmitter>,
        heartbeat_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            local_peer_id,
            peers,
            emitter,
            heartbeat_interval,
            liveness_timeout,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Publishes `join` and begins emitting `heartbeat` at the configured
    /// interval, plus a sweeper that marks stale peers removed.
    pub async fn start(&self) {
        info!(peer = %self.local_peer_id, "presence started");
        self.emitter.emit_sync(
            "join",
            &serde_json::json!({"peerId": self.local_peer_id}),
            Some(&self.local_peer_id),
        );

        let emitter = self.emitter.clone();
        let local_id = self.local_peer_id.clone();
        let interval = self.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                emitter.emit_sync("heartbeat", &serde_json::json!({"peerId": local_id}), Some(&local_id));
            }
        });

        let peers = self.peers.clone();
        let emitter = self.emitter.clone();
        let liveness_timeout = self.liveness_timeout;
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(liveness_timeout / 2 + Duration::from_millis(1));
            loop {
                ticker.tick().await;
                let now = now_ms();
                for id in peers.snapshot_ids() {
                    if let Some(last_seen) = peers.last_seen_ms(&id) {
                        if now.saturating_sub(last_seen) > liveness_timeout.as_millis() as u64 {
                            peers.remove_peer(&id);
                            emitter.emit_sync("leave", &serde_json::json!({"peerId": id}), Some(&id));
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(heartbeat_task);
        tasks.push(sweep_task);
    }

    /// Publishes `leave` and cancels both tickers.
    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.emitter.emit_sync(
            "leave",
            &serde_json::json!({"peerId": self.local_peer_id}),
            Some(&self.local_peer_id),
        );
    }

    /// Handles an inbound `join`/`update`/`heartbeat` from `peer`: upserts
    /// the sender's record (idempotent join) and touches its last-seen.
    pub fn on_liveness_signal(&self, peer: &str) {
        if !self.peers.contains(peer) {
            // §4.9: a heartbeat from an unknown peer implicitly, idempotently
            // joins it. No real transport arrived with the signal, so the
            // record gets a stand-in that can never actually route — routing
            // to this peer still fails, just via the ordinary
            // `PeerDisconnected` path instead of `NoRoute`, until something
            // (e.g. a later `add_peer`) replaces it with a real one.
            if self
                .peers
                .add_peer(peer.to_string(), Arc::new(UnreachableTransport), serde_json::json!({}))
                .is_err()
            {
                return;
            }
            self.emitter
                .emit_sync("join", &serde_json::json!({"peerId": peer}), Some(&peer.to_string()));
        }
        self.peers.touch(peer);
        if self.peers.status_of(peer) != Some(PeerStatus::Connected) {
            let _ = self.peers.set_status(peer, PeerStatus::Connected);
        }
    }

    /// Handles an inbound `leave` from `peer`: removes it immediately.
    pub fn on_leave_signal(&self, peer: &str) {
        if self.peers.remove_peer(peer).is_some() {
            self.emitter
                .emit_sync("leave", &serde_json::json!({"peerId": peer}), Some(&peer.to_string()));
        }
    }
}
