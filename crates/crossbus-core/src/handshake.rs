use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::envelope::PeerId;
use crate::error::{CrossBusError, ErrorCode, Result};

/// What the initiator gets back once the responder has acked.
pub struct AckOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
    pub peer_capabilities: Vec<String>,
    pub peer_metadata: serde_json::Value,
}

struct PendingHandshake {
    completion: oneshot::Sender<Result<AckOutcome>>,
    timer: JoinHandle<()>,
}

/// Three-phase, initiator-driven connect (INIT/ACK/COMPLETE), per
/// `spec.md` §4.8. Reuses `PendingTable`'s timer-per-entry pattern, since a
/// pending handshake and a pending request share the same shape: an id, a
/// deadline, and a one-shot completion.
///
/// Handshake ids are minted from `Uuid::new_v4`, which is cryptographically
/// unguessable, per §4.8's requirement.
pub struct HandshakeTable {
    pending: Arc<Mutex<HashMap<Uuid, PendingHandshake>>>,
}

impl Default for HandshakeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeTable {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Installs a pending INIT awaiting ACK, with its own deadline timer.
    pub async fn begin(&self, deadline: Duration) -> (Uuid, oneshot::Receiver<Result<AckOutcome>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let pending_for_timer = self.pending.clone();
        let timer_id = id;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let mut pending = pending_for_timer.lock().await;
            if let Some(entry) = pending.remove(&timer_id) {
                let _ = entry.completion.send(Err(CrossBusError::from_code(
                    ErrorCode::HandshakeTimeout,
                    serde_json::json!({"handshakeId": timer_id.to_string()}),
                )));
            }
        });
        self.pending.lock().await.insert(id, PendingHandshake { completion: tx, timer });
        (id, rx)
    }

    /// Completes a pending handshake with the responder's ACK. No-op if the
    /// handshake id is unknown (already timed out, or a forged/stale id) —
    /// per §4.8, "unconfirmed COMPLETE messages are ignored" generalizes to
    /// any unmatched handshake id.
    pub async fn complete(&self, id: Uuid, outcome: AckOutcome) {
        if let Some(entry) = self.pending.lock().await.remove(&id) {
            entry.timer.abort();
            let _ = entry.completion.send(Ok(outcome));
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Origin/capability gate the responder runs against an incoming INIT,
/// per `spec.md` §4.8 step 2 and §4.11's `allowedOrigins`/`strictMode`.
pub trait OriginValidator: Send + Sync {
    fn validate(&self, origin: &str, peer_id: &PeerId) -> std::result::Result<(), String>;
}

/// Accepts any origin — the default outside `strictMode`.
pub struct AllowAllOrigins;

impl OriginValidator for AllowAllOrigins {
    fn validate(&self, _origin: &str, _peer_id: &PeerId) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Rejects wildcard origins and requires explicit membership, per
/// `createSecure`'s `strictMode` contract.
pub struct AllowListOrigins {
    pub allowed: Vec<String>,
}

impl OriginValidator for AllowListOrigins {
    fn validate(&self, origin: &str, _peer_id: &PeerId) -> std::result::Result<(), String> {
        if self.allowed.iter().any(|a| a == origin) {
            Ok(())
        } else {
            Err(format!("origin '{origin}' is not in the allow-list"))
        }
    }
}
