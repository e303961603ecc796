//! Routing and RPC engine for the CrossBus peer-to-peer message bus.
//!
//! This crate is the CORE: envelope format, peer table, handler registry,
//! pending-request lifecycle, pipeline hooks, event dispatch, presence, and
//! the causal-ordering subsystem. It knows nothing about any specific
//! transport bearer — see the [`transport::Transport`] trait for the seam
//! external collaborators implement.

pub mod bus;
pub mod clock;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod hooks;
pub mod peer;
pub mod pending;
pub mod presence;
pub mod transport;

pub use bus::{Bus, BusOptions, BusOptionsBuilder, HealthSnapshot, Diagnosis, DiagnosticIssue};
pub use clock::{CausalOrderer, VectorClock};
pub use emitter::{EventEmitter, ListenerMode, ListenerOptions};
pub use envelope::{Envelope, EnvelopeHeader, EnvelopeType, PeerId};
pub use error::{CrossBusError, ErrorCode, Result};
pub use handler::{HandlerContext, HandlerFn, HandlerOptions, HandlerRegistry};
pub use handshake::{AckOutcome, AllowAllOrigins, AllowListOrigins, HandshakeTable, OriginValidator};
pub use hooks::{HookContext, HookDirection, HookFn, HookPipeline, HookResult};
pub use peer::{BroadcastFilter, PeerRecord, PeerStatus, PeerTable};
pub use pending::{PendingTable, RemoteOutcome};
pub use presence::Presence;
pub use transport::Transport;
