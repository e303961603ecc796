use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::PeerId;
use crate::error::{CrossBusError, ErrorCode, Result};

/// What the remote side reported back for a request.
pub enum RemoteOutcome {
    Success(serde_json::Value),
    Failure(CrossBusError),
}

struct PendingEntry {
    target: PeerId,
    #[allow(dead_code)]
    handler: String,
    completion: oneshot::Sender<Result<serde_json::Value>>,
    timer: JoinHandle<()>,
}

/// Request id allocation, promise-backed completion, timeouts, cancellation,
/// and a size cap — `spec.md` §4.5.
///
/// Timers are owned by the entry and aborted on every completion path so a
/// late timer never fires against a freed slot.
pub struct PendingTable {
    entries: Arc<Mutex<HashMap<Uuid, PendingEntry>>>,
    max_pending: usize,
    dropped_late_responses: Arc<std::sync::atomic::AtomicU64>,
}

impl PendingTable {
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_pending,
            dropped_late_responses: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Number of responses that arrived after their pending entry had
    /// already been completed (timeout, cancel, or a prior response) and
    /// were therefore dropped silently, per `spec.md` §7/§9 open question (a).
    pub fn dropped_late_responses(&self) -> u64 {
        self.dropped_late_responses.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Installs a pending entry with its own timeout timer and returns the
    /// request id plus a receiver the caller awaits for completion.
    pub async fn create(
        &self,
        target: PeerId,
        handler: String,
        timeout: Duration,
    ) -> Result<(Uuid, oneshot::Receiver<Result<serde_json::Value>>)> {
        let mut entries = self.entries.lock().await;
        if self.max_pending > 0 && entries.len() >= self.max_pending {
            return Err(CrossBusError::from_code(
                ErrorCode::MaxPending,
                serde_json::json!({"maxPending": self.max_pending}),
            ));
        }
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let entries_for_timer = self.entries.clone();
        let timer_id = id;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut entries = entries_for_timer.lock().await;
            if let Some(entry) = entries.remove(&timer_id) {
                let _ = entry
                    .completion
                    .send(Err(CrossBusError::from_code(
                        ErrorCode::ResponseTimeout,
                        serde_json::json!({"requestId": timer_id.to_string()}),
                    )));
            }
        });

        entries.insert(
            id,
            PendingEntry {
                target,
                handler,
                completion: tx,
                timer,
            },
        );
        Ok((id, rx))
    }

    /// Completes an entry with the remote's reported outcome. Dropped
    /// silently (with a counter bump) if the entry no longer exists.
    pub async fn resolve(&self, id: Uuid, outcome: RemoteOutcome) {
        let entry = self.entries.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let result = match outcome {
                    RemoteOutcome::Success(value) => Ok(value),
                    RemoteOutcome::Failure(err) => Err(err),
                };
                let _ = entry.completion.send(result);
            }
            None => {
                self.dropped_late_responses
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(request_id = %id, "dropped late response for unknown or already-completed request");
            }
        }
    }

    /// Rejects an entry with an explicit error (used for local failures such
    /// as `SendFailed`, distinct from a resolved remote outcome).
    pub async fn reject(&self, id: Uuid, err: CrossBusError) {
        if let Some(entry) = self.entries.lock().await.remove(&id) {
            entry.timer.abort();
            let _ = entry.completion.send(Err(err));
        }
    }

    /// Cancels a single pending entry with a cancellation error.
    pub async fn cancel(&self, id: Uuid) {
        self.reject(
            id,
            CrossBusError::with_message(ErrorCode::ResponseTimeout, "request was cancelled", serde_json::json!({})),
        )
        .await;
    }

    /// Rejects every pending entry targeting `peer` (peer loss).
    pub async fn cancel_for_peer(&self, peer: &str) {
        let ids: Vec<Uuid> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|(_, e)| e.target == peer)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.reject(
                id,
                CrossBusError::from_code(ErrorCode::PeerDisconnected, serde_json::json!({"peerId": peer})),
            )
            .await;
        }
    }

    /// Rejects every pending entry with `Destroyed`, used on bus shutdown.
    pub async fn cancel_all(&self) {
        let ids: Vec<Uuid> = self.entries.lock().await.keys().copied().collect();
        for id in ids {
            self.reject(id, CrossBusError::from_code(ErrorCode::Destroyed, serde_json::json!({})))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scenario_s2_timeout_clears_the_pending_table() {
        let table = PendingTable::new(0);
        let (_id, rx) = table
            .create("b".to_string(), "x".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let result = rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::ResponseTimeout);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn resolve_completes_exactly_once_and_a_second_resolve_is_dropped() {
        let table = PendingTable::new(0);
        let (id, rx) = table
            .create("b".to_string(), "echo".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        table.resolve(id, RemoteOutcome::Success(serde_json::json!(42))).await;
        assert_eq!(table.dropped_late_responses(), 0);
        table.resolve(id, RemoteOutcome::Success(serde_json::json!(43))).await;
        assert_eq!(table.dropped_late_responses(), 1);
        let value = rx.await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!(42));
    }

    #[tokio::test]
    async fn max_pending_cap_rejects_new_requests() {
        let table = PendingTable::new(1);
        let _first = table
            .create("b".to_string(), "x".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        let second = table
            .create("b".to_string(), "x".to_string(), Duration::from_secs(5))
            .await;
        assert_eq!(second.unwrap_err().code, ErrorCode::MaxPending);
    }

    #[tokio::test]
    async fn cancel_for_peer_rejects_only_that_peers_entries() {
        let table = PendingTable::new(0);
        let (_a, rx_a) = table
            .create("b".to_string(), "x".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        let (_c, rx_c) = table
            .create("other".to_string(), "x".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        table.cancel_for_peer("b").await;
        assert!(rx_a.await.unwrap().is_err());
        assert_eq!(table.len().await, 1);
        drop(rx_c);
    }
}
