use futures::future::BoxFuture;

use crate::envelope::Envelope;
use crate::error::CrossBusError;

/// The seam between the routing core and an external collaborator, per
/// `spec.md` §6. The core never interprets a transport's wire format; it
/// only requires that sent envelopes eventually reach the other side's
/// `onMessage` equivalent (modeled here as whatever the transport's own
/// implementation wires up on construction).
///
/// Modeled directly on the reference workspace's `DiscoveryProvider` seam:
/// a small trait object the core holds per peer and calls into, never
/// owning or closing it.
pub trait Transport: Send + Sync {
    /// Delivers `envelope` to whatever sits on the other end. May be
    /// synchronous or asynchronous; errors surface to the caller of the
    /// originating public method and, for requests, complete the pending
    /// entry with `SendFailed`.
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, Result<(), CrossBusError>>;

    /// A string identifying the sender's security domain, or one of
    /// `"broadcast"`, `"worker"`, `"channel"`, `"serviceworker"` for
    /// transports without a notion of origin.
    fn origin(&self) -> &str {
        "unknown"
    }
}
