use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::warn;

use crate::envelope::{EnvelopeType, PeerId};
use crate::error::CrossBusError;

/// Inbound or outbound, per `spec.md` §3 "Hook entry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDirection {
    Inbound,
    Outbound,
}

/// Context passed to every hook invocation, per `spec.md` §4.7.
#[derive(Clone)]
pub struct HookContext {
    pub direction: HookDirection,
    pub envelope_type: EnvelopeType,
    pub local_peer_id: PeerId,
    pub counterpart: Option<PeerId>,
    pub handler_name: Option<String>,
}

/// A hook transform's outcome: a replacement payload, `None` (drop outbound
/// / unchanged inbound), or an error — logged and bypassed, per §4.7/§7.
pub type HookResult = Result<Option<serde_json::Value>, CrossBusError>;

pub type HookFn = Arc<dyn Fn(serde_json::Value, HookContext) -> BoxFuture<'static, HookResult> + Send + Sync>;

struct HookEntry {
    id: u64,
    direction: HookDirection,
    priority: i32,
    func: HookFn,
    insertion_order: u64,
}

/// Ordered inbound/outbound transforms with error isolation, per
/// `spec.md` §4.7. Execution is strictly serial in ascending priority
/// order (lower runs first, default 10); a hook that errors is logged and
/// its transform discarded, with the previous payload passed onward —
/// subsequent hooks still run.
pub struct HookPipeline {
    hooks: Mutex<Vec<HookEntry>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl HookPipeline {
    pub const DEFAULT_PRIORITY: i32 = 10;

    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn add(&self, direction: HookDirection, priority: i32, func: HookFn) -> u64 {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let mut hooks = self.hooks.lock().unwrap();
        hooks.push(HookEntry {
            id,
            direction,
            priority,
            func,
            insertion_order: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
        });
        hooks.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.insertion_order.cmp(&b.insertion_order)));
        id
    }

    pub fn remove(&self, id: u64) {
        self.hooks.lock().unwrap().retain(|h| h.id != id);
    }

    fn ordered(&self, direction: HookDirection) -> Vec<HookFn> {
        self.hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.direction == direction)
            .map(|h| h.func.clone())
            .collect()
    }

    /// Runs every hook for `direction` in priority order, feeding each
    /// hook's awaited output to the next. Returns `None` only when an
    /// outbound hook explicitly drops the message; an inbound `None` or an
    /// erroring hook never drops the message, only skips that hook's
    /// transform.
    pub async fn run(
        &self,
        direction: HookDirection,
        ctx: HookContext,
        mut payload: serde_json::Value,
    ) -> Option<serde_json::Value> {
        for hook in self.ordered(direction) {
            match hook(payload.clone(), ctx.clone()).await {
                Ok(Some(next)) => payload = next,
                Ok(None) if direction == HookDirection::Outbound => return None,
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "hook errored; transform discarded, previous payload passed onward");
                }
            }
        }
        Some(payload)
    }
}
