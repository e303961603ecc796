//! In-process `Transport` for `crossbus-core`, used by local demos and
//! tests where peers live in the same address space. Grounded on the
//! teacher's `InMemoryDiscovery`: a thread-safe, `Clone`-shareable
//! registry backed by `Arc<Mutex<…>>`, with zero third-party
//! dependencies beyond the async runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbus_core::{Bus, CrossBusError, Envelope, ErrorCode, PeerId, Transport};
use futures::future::BoxFuture;
use tracing::warn;

#[derive(Default)]
struct Inner {
    buses: HashMap<PeerId, Bus>,
}

/// Shared directory of buses reachable by peer id. Multiple clones see the
/// same registrations, mirroring how two nodes constructed against the same
/// `InMemoryDiscovery` in the teacher crate observe each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bus` as reachable under `peer_id`. Call this once per bus
    /// with its own peer id so other buses' `MemoryTransport`s can find it.
    pub fn register(&self, peer_id: impl Into<PeerId>, bus: Bus) {
        self.inner.lock().unwrap().buses.insert(peer_id.into(), bus);
    }

    pub fn unregister(&self, peer_id: &str) {
        self.inner.lock().unwrap().buses.remove(peer_id);
    }

    /// Builds a transport that delivers to `target` through this network.
    /// Install one per peer added to a bus, the way a real transport would
    /// be constructed per remote address.
    pub fn transport_to(&self, target: impl Into<PeerId>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            target: target.into(),
        })
    }
}

/// A `Transport` that hands envelopes directly to a target bus's
/// `on_inbound`, skipping any wire encoding — the in-process counterpart of
/// a socket write.
pub struct MemoryTransport {
    network: MemoryNetwork,
    target: PeerId,
}

impl Transport for MemoryTransport {
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, crossbus_core::Result<()>> {
        let network = self.network.clone();
        let target = self.target.clone();
        Box::pin(async move {
            let bus = {
                let guard = network.inner.lock().unwrap();
                guard.buses.get(&target).cloned()
            };
            match bus {
                Some(bus) => bus.on_inbound(envelope).await,
                None => {
                    warn!(peer = %target, "memory transport: no bus registered for target");
                    Err(CrossBusError::from_code(
                        ErrorCode::Unreachable,
                        serde_json::json!({"peer": target}),
                    ))
                }
            }
        })
    }

    fn origin(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbus_core::{BusOptions, HandlerContext};

    #[tokio::test]
    async fn delivers_a_request_between_two_registered_buses() {
        let network = MemoryNetwork::new();

        let bus_a = Bus::new(BusOptions {
            peer_id: "a".to_string(),
            ..Default::default()
        });
        let bus_b = Bus::new(BusOptions {
            peer_id: "b".to_string(),
            ..Default::default()
        });

        network.register("a", bus_a.clone());
        network.register("b", bus_b.clone());

        bus_a.add_peer("b", network.transport_to("b"), serde_json::json!({})).unwrap();
        bus_b.add_peer("a", network.transport_to("a"), serde_json::json!({})).unwrap();

        bus_b
            .handle(
                "echo",
                Arc::new(move |payload: serde_json::Value, _ctx: HandlerContext| {
                    Box::pin(async move { Ok(payload) }) as BoxFuture<'static, crossbus_core::Result<serde_json::Value>>
                }),
                Default::default(),
            )
            .unwrap();

        let response = bus_a
            .request("b", "echo", serde_json::json!({"ping": true}), None)
            .await
            .unwrap();
        assert_eq!(response, serde_json::json!({"ping": true}));
    }

    #[tokio::test]
    async fn unreachable_target_surfaces_as_an_error_not_a_panic() {
        let network = MemoryNetwork::new();
        let bus_a = Bus::new(BusOptions {
            peer_id: "a".to_string(),
            ..Default::default()
        });
        bus_a.add_peer("ghost", network.transport_to("ghost"), serde_json::json!({})).unwrap();
        let err = bus_a.signal("poke", serde_json::json!({}), Some("ghost".to_string())).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unreachable);
    }
}
