use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{CausalOrderer, VectorClock};
use crate::emitter::{EventEmitter, ListenerOptions};
use crate::envelope::{Envelope, EnvelopeType, PeerId};
use crate::error::{CrossBusError, ErrorCode, Result};
use crate::handler::{HandlerContext, HandlerFn, HandlerOptions, HandlerRegistry};
use crate::handshake::{AckOutcome, AllowAllOrigins, AllowListOrigins, HandshakeTable, OriginValidator};
use crate::hooks::{HookContext, HookDirection, HookFn, HookPipeline};
use crate::pending::{PendingTable, RemoteOutcome};
use crate::peer::{BroadcastFilter, PeerStatus, PeerTable};
use crate::presence::Presence;
use crate::transport::Transport;

/// Construction options affecting bus semantics.
#[derive(Clone, Serialize, Deserialize)]
pub struct BusOptions {
    pub peer_id: PeerId,
    pub is_hub: bool,
    pub allowed_origins: Vec<String>,
    pub max_peers: usize,
    pub max_pending_requests: usize,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub ack_timeout: Duration,
    pub strict_mode: bool,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_millis")]
    pub liveness_timeout: Duration,
    pub causal_ordering: bool,
    pub orderer_buffer_size: usize,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            peer_id: Uuid::new_v4().to_string(),
            is_hub: false,
            allowed_origins: Vec::new(),
            max_peers: 0,
            max_pending_requests: 0,
            request_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            strict_mode: false,
            heartbeat_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
            causal_ordering: false,
            orderer_buffer_size: 256,
        }
    }
}

/// Small builder-with-defaults, matching the reference workspace's own
/// `P2pConfig::new()` construction style.
pub struct BusOptionsBuilder {
    options: BusOptions,
}

impl BusOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: BusOptions::default(),
        }
    }

    pub fn peer_id(mut self, id: impl Into<PeerId>) -> Self {
        self.options.peer_id = id.into();
        self
    }

    pub fn is_hub(mut self, is_hub: bool) -> Self {
        self.options.is_hub = is_hub;
        self
    }

    pub fn allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.options.allowed_origins = origins;
        self
    }

    pub fn max_peers(mut self, max: usize) -> Self {
        self.options.max_peers = max;
        self
    }

    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.options.max_pending_requests = max;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.options.ack_timeout = timeout;
        self
    }

    pub fn strict_mode(mut self, strict: bool) -> Self {
        self.options.strict_mode = strict;
        self
    }

    pub fn causal_ordering(mut self, enabled: bool) -> Self {
        self.options.causal_ordering = enabled;
        self
    }

    pub fn build(self) -> BusOptions {
        self.options
    }
}

impl Default for BusOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot returned by `healthCheck()`.
#[derive(Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub peers: Vec<PeerId>,
    pub handlers: Vec<String>,
    pub uptime_ms: u64,
    /// Always `None` on this target; see SPEC_FULL.md §2 for why the field
    /// is kept rather than removed.
    pub memory_bytes: Option<u64>,
}

/// One issue surfaced by `diagnose()`.
#[derive(Serialize)]
pub struct DiagnosticIssue {
    pub severity: &'static str,
    pub message: String,
    pub suggestion: String,
}

#[derive(Serialize)]
pub struct Diagnosis {
    pub issues: Vec<DiagnosticIssue>,
}

/// Per-peer result of a `broadcastRequest`, independent of its siblings.
pub type BroadcastRequestResult = HashMap<PeerId, Result<serde_json::Value>>;

struct Inner {
    options: BusOptions,
    emitter: Arc<EventEmitter>,
    peers: Arc<PeerTable>,
    pending: PendingTable,
    handlers: HandlerRegistry,
    hooks: HookPipeline,
    handshakes: HandshakeTable,
    presence: Presence,
    origin_validator: Box<dyn OriginValidator>,
    orderer: Option<AsyncMutex<CausalOrderer<Envelope>>>,
    destroyed: AtomicBool,
    started_at_ms: u64,
}

/// Composes every other component and exposes the public operations of a
/// peer-to-peer message bus. `Bus` is a cheap-clone handle (`Arc`-wrapped
/// `Inner`), the same shape as the reference workspace's `P2pHandle` — here the
/// shared state is the tables themselves rather than channel senders, since
/// CrossBus's core is direct-call rather than actor-loop shaped.
#[derive(Clone)]
pub struct Bus(Arc<Inner>);

impl Bus {
    pub fn new(options: BusOptions) -> Self {
        let emitter = Arc::new(EventEmitter::new());
        let peers = Arc::new(PeerTable::new(options.max_peers, emitter.clone()));
        let presence = Presence::new(
            options.peer_id.clone(),
            peers.clone(),
            emitter.clone(),
            options.heartbeat_interval,
            options.liveness_timeout,
        );
        let origin_validator: Box<dyn OriginValidator> = if options.strict_mode {
            Box::new(AllowListOrigins {
                allowed: options.allowed_origins.clone(),
            })
        } else {
            Box::new(AllowAllOrigins)
        };
        let orderer = options
            .causal_ordering
            .then(|| AsyncMutex::new(CausalOrderer::new(options.orderer_buffer_size)));
        let inner = Inner {
            pending: PendingTable::new(options.max_pending_requests),
            handlers: HandlerRegistry::new(),
            hooks: HookPipeline::new(),
            handshakes: HandshakeTable::new(),
            presence,
            origin_validator,
            orderer,
            destroyed: AtomicBool::new(false),
            started_at_ms: crate::error::now_ms(),
            options,
            emitter,
            peers,
        };
        Self(Arc::new(inner))
    }

    /// Enforces `strictMode` and rejects wildcard origins at construction
    /// time, per §4.11's `createSecure` factory.
    pub fn create_secure(mut options: BusOptions) -> Result<Self> {
        options.strict_mode = true;
        if options.allowed_origins.iter().any(|o| o == "*") {
            return Err(CrossBusError::with_message(
                ErrorCode::OriginForbidden,
                "createSecure rejects a wildcard entry in allowedOrigins",
                serde_json::json!({}),
            ));
        }
        Ok(Self::new(options))
    }

    fn check_alive(&self) -> Result<()> {
        if self.0.destroyed.load(AtomicOrdering::SeqCst) {
            Err(CrossBusError::from_code(ErrorCode::Destroyed, serde_json::json!({})))
        } else {
            Ok(())
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.0.options.peer_id
    }

    pub async fn start_presence(&self) -> Result<()> {
        self.check_alive()?;
        self.0.presence.start().await;
        Ok(())
    }

    // ---- peer table -------------------------------------------------

    pub fn add_peer(&self, id: impl Into<PeerId>, transport: Arc<dyn Transport>, meta: serde_json::Value) -> Result<()> {
        self.check_alive()?;
        let id = id.into();
        self.0.peers.add_peer(id.clone(), transport, meta)?;
        self.0.peers.set_status(&id, PeerStatus::Connected)
    }

    /// Adds a peer in `connecting` status, for callers that drive a
    /// handshake to completion themselves via `initiate_handshake` before
    /// the peer becomes routable.
    pub fn add_peer_connecting(&self, id: impl Into<PeerId>, transport: Arc<dyn Transport>, meta: serde_json::Value) -> Result<()> {
        self.check_alive()?;
        self.0.peers.add_peer(id.into(), transport, meta)
    }

    pub fn remove_peer(&self, id: &str) -> Result<()> {
        self.check_alive()?;
        self.0.peers.remove_peer(id);
        let bus = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            bus.0.pending.cancel_for_peer(&id).await;
        });
        Ok(())
    }

    // ---- handlers -----------------------------------------------------

    pub fn handle(&self, name: impl Into<String>, func: HandlerFn, options: HandlerOptions) -> Result<()> {
        self.check_alive()?;
        self.0.handlers.handle(name, func, options)
    }

    pub fn remove_handler(&self, name: &str) -> Result<bool> {
        self.check_alive()?;
        Ok(self.0.handlers.remove_handler(name))
    }

    // ---- hooks ----------------------------------------------------------

    pub fn add_outbound_hook(&self, priority: i32, func: HookFn) -> Result<u64> {
        self.check_alive()?;
        Ok(self.0.hooks.add(HookDirection::Outbound, priority, func))
    }

    pub fn add_inbound_hook(&self, priority: i32, func: HookFn) -> Result<u64> {
        self.check_alive()?;
        Ok(self.0.hooks.add(HookDirection::Inbound, priority, func))
    }

    pub fn remove_hook(&self, id: u64) -> Result<()> {
        self.check_alive()?;
        self.0.hooks.remove(id);
        Ok(())
    }

    // ---- emitter re-exports --------------------------------------------

    pub fn on_sync(&self, pattern: &str, options: ListenerOptions, f: impl Fn(&serde_json::Value, Option<&PeerId>) + Send + Sync + 'static) -> u64 {
        self.0.emitter.on_sync(pattern, options, f)
    }

    pub fn off(&self, pattern: &str, listener_id: u64) {
        self.0.emitter.off(pattern, listener_id);
    }

    pub async fn emit(&self, name: &str, data: serde_json::Value, source: Option<PeerId>) {
        self.0.emitter.emit(name, data, source).await;
    }

    // ---- outbound: signal / broadcast / request ------------------------

    async fn run_outbound_hooks(&self, kind: EnvelopeType, counterpart: Option<PeerId>, handler_name: Option<String>, payload: serde_json::Value) -> Option<serde_json::Value> {
        let ctx = HookContext {
            direction: HookDirection::Outbound,
            envelope_type: kind,
            local_peer_id: self.0.options.peer_id.clone(),
            counterpart,
            handler_name,
        };
        self.0.hooks.run(HookDirection::Outbound, ctx, payload).await
    }

    /// Emits locally and, when targeted, routes via the transport. An
    /// untargeted signal broadcasts, per §4.11.
    pub async fn signal(&self, name: &str, data: serde_json::Value, target: Option<PeerId>) -> Result<()> {
        self.check_alive()?;
        self.0.emitter.emit(name, data.clone(), Some(self.0.options.peer_id.clone())).await;

        let payload = serde_json::json!({"name": name, "data": data});
        let Some(payload) = self.run_outbound_hooks(EnvelopeType::Signal, target.clone(), None, payload).await else {
            return Ok(());
        };

        match target {
            Some(target) => {
                let envelope = Envelope::signal(self.0.options.peer_id.clone(), Some(target.clone()), payload);
                self.0.peers.route(&target, envelope).await
            }
            None => {
                self.broadcast(name, data, BroadcastFilter::default()).await
            }
        }
    }

    /// Broadcasts to every connected peer except `filter.exclude`, per §4.4/S6.
    pub async fn broadcast(&self, name: &str, data: serde_json::Value, filter: BroadcastFilter) -> Result<()> {
        self.check_alive()?;
        self.0.emitter.emit(name, data.clone(), Some(self.0.options.peer_id.clone())).await;

        let payload = serde_json::json!({"name": name, "data": data});
        let Some(payload) = self.run_outbound_hooks(EnvelopeType::Broadcast, None, None, payload).await else {
            return Ok(());
        };
        let envelope = Envelope::broadcast(self.0.options.peer_id.clone(), payload);
        let results = self.0.peers.broadcast(envelope, filter).await;
        // A per-peer failure must not abort the broadcast; aggregate but
        // don't propagate individual failures to the caller.
        debug!(failures = results.values().filter(|r| r.is_err()).count(), "broadcast complete");
        Ok(())
    }

    /// Allocates a pending entry, sends REQUEST, resolves when the matching
    /// RESPONSE arrives — or rejects on timeout, per §4.11/S1/S2.
    pub async fn request(&self, target: &str, handler: &str, data: serde_json::Value, timeout: Option<Duration>) -> Result<serde_json::Value> {
        self.check_alive()?;
        let timeout = timeout.unwrap_or(self.0.options.request_timeout);

        let (request_id, rx) = self
            .0
            .pending
            .create(target.to_string(), handler.to_string(), timeout)
            .await?;

        let payload = serde_json::json!({"handler": handler, "data": data});
        let payload = self
            .run_outbound_hooks(EnvelopeType::Request, Some(target.to_string()), Some(handler.to_string()), payload)
            .await;
        let Some(payload) = payload else {
            self.0.pending.cancel(request_id).await;
            return Err(CrossBusError::with_message(
                ErrorCode::InvalidMessage,
                "outbound hook dropped the request before it was sent",
                serde_json::json!({}),
            ));
        };

        let envelope = Envelope::request(self.0.options.peer_id.clone(), target.to_string(), request_id, payload);
        if let Err(err) = self.0.peers.route(target, envelope).await {
            self.0
                .pending
                .reject(
                    request_id,
                    CrossBusError::from_code(ErrorCode::SendFailed, serde_json::json!({"cause": err.message})),
                )
                .await;
        }

        rx.await.unwrap_or_else(|_| {
            Err(CrossBusError::from_code(ErrorCode::Destroyed, serde_json::json!({})))
        })
    }

    /// Fires the same request at every connected peer; per-peer completions
    /// are independent, per §4.11.
    pub async fn broadcast_request(&self, handler: &str, data: serde_json::Value, timeout: Option<Duration>) -> BroadcastRequestResult {
        let targets = self.0.peers.snapshot_ids();
        let mut results = HashMap::new();
        for target in targets {
            let result = self.request(&target, handler, data.clone(), timeout).await;
            results.insert(target, result);
        }
        results
    }

    // ---- inbound dispatch ------------------------------------------------

    async fn run_inbound_hooks(&self, kind: EnvelopeType, counterpart: PeerId, handler_name: Option<String>, payload: serde_json::Value) -> serde_json::Value {
        let ctx = HookContext {
            direction: HookDirection::Inbound,
            envelope_type: kind,
            local_peer_id: self.0.options.peer_id.clone(),
            counterpart: Some(counterpart),
            handler_name,
        };
        self.0.hooks.run(HookDirection::Inbound, ctx, payload).await.unwrap_or(serde_json::Value::Null)
    }

    /// Entry point a transport calls with a received envelope. Dispatches to
    /// the emitter (signals/broadcasts), the handler registry (requests), or
    /// the pending-request resolver (responses), per §2's control-flow
    /// summary. When causal ordering is enabled, messages pass through the
    /// orderer first.
    pub async fn on_inbound(&self, envelope: Envelope) -> Result<()> {
        if self.0.destroyed.load(AtomicOrdering::SeqCst) {
            return Err(CrossBusError::from_code(ErrorCode::Destroyed, serde_json::json!({})));
        }
        if let Some(clock) = envelope.vector_clock() {
            if self.0.orderer.is_some() {
                return self.on_inbound_ordered(envelope.clone(), clock.clone()).await;
            }
        }
        self.dispatch(envelope).await
    }

    async fn on_inbound_ordered(&self, envelope: Envelope, clock: VectorClock) -> Result<()> {
        let sender = envelope.source().clone();
        let mut orderer = self.0.orderer.as_ref().unwrap().lock().await;
        let deliverable = orderer.offer(sender, clock, envelope);
        drop(orderer);
        for (_, envelope) in deliverable {
            self.dispatch(envelope).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let source = envelope.source().clone();
        self.0.peers.touch(&source);
        match envelope.kind() {
            EnvelopeType::Signal | EnvelopeType::Broadcast => {
                let payload = self.run_inbound_hooks(envelope.kind(), source.clone(), None, envelope.into_payload()).await;
                let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let data = payload.get("data").cloned().unwrap_or(serde_json::Value::Null);
                self.0.emitter.emit(&name, data, Some(source)).await;
                Ok(())
            }
            EnvelopeType::Request => self.dispatch_request(envelope).await,
            EnvelopeType::Response => self.dispatch_response(envelope).await,
            EnvelopeType::HandshakeInit => self.dispatch_handshake_init(envelope).await,
            EnvelopeType::HandshakeAck => self.dispatch_handshake_ack(envelope).await,
            EnvelopeType::HandshakeComplete => self.dispatch_handshake_complete(envelope).await,
            EnvelopeType::Presence => {
                self.0.presence.on_liveness_signal(&source);
                Ok(())
            }
            EnvelopeType::Bye => {
                self.0.presence.on_leave_signal(&source);
                Ok(())
            }
            EnvelopeType::Ping | EnvelopeType::Pong => Ok(()),
        }
    }

    async fn dispatch_request(&self, envelope: Envelope) -> Result<()> {
        let source = envelope.source().clone();
        let correlation_id = envelope
            .correlation_id()
            .ok_or_else(|| CrossBusError::from_code(ErrorCode::InvalidMessage, serde_json::json!({})))?;
        let payload = self
            .run_inbound_hooks(EnvelopeType::Request, source.clone(), None, envelope.into_payload())
            .await;
        let handler_name = payload.get("handler").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let data = payload.get("data").cloned().unwrap_or(serde_json::Value::Null);

        let ctx = HandlerContext {
            name: handler_name.clone(),
            source: source.clone(),
            local_peer_id: self.0.options.peer_id.clone(),
        };
        let outcome = self.0.handlers.invoke(&handler_name, data, ctx).await;
        let response_payload = match outcome {
            Ok(value) => serde_json::json!({"success": true, "data": value}),
            Err(err) => serde_json::json!({"success": false, "error": serde_json::to_value(&err).unwrap_or(serde_json::Value::Null)}),
        };
        let response = Envelope::response(self.0.options.peer_id.clone(), source.clone(), correlation_id, response_payload);
        self.0.peers.route(&source, response).await
    }

    async fn dispatch_response(&self, envelope: Envelope) -> Result<()> {
        let correlation_id = envelope
            .correlation_id()
            .ok_or_else(|| CrossBusError::from_code(ErrorCode::InvalidMessage, serde_json::json!({})))?;
        let source = envelope.source().clone();
        let payload = self
            .run_inbound_hooks(EnvelopeType::Response, source, None, envelope.into_payload())
            .await;
        let success = payload.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        let outcome = if success {
            RemoteOutcome::Success(payload.get("data").cloned().unwrap_or(serde_json::Value::Null))
        } else {
            let code_str = payload
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(|c| c.as_str())
                .unwrap_or("HANDLER_ERROR");
            let message = payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("remote handler failed")
                .to_string();
            RemoteOutcome::Failure(CrossBusError::with_message(
                code_from_wire(code_str),
                message,
                payload.get("error").and_then(|e| e.get("details")).cloned().unwrap_or(serde_json::json!({})),
            ))
        };
        self.0.pending.resolve(correlation_id, outcome).await;
        Ok(())
    }

    async fn dispatch_handshake_init(&self, envelope: Envelope) -> Result<()> {
        let source = envelope.source().clone();
        let handshake_id = envelope
            .correlation_id()
            .ok_or_else(|| CrossBusError::from_code(ErrorCode::InvalidMessage, serde_json::json!({})))?;
        let payload = envelope.payload();
        let capabilities: Vec<String> = payload
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default();

        // The origin is read from the source peer's own registered
        // transport (`Transport::origin`, per §6), never from the INIT
        // payload: the payload is attacker-controlled content the remote
        // peer wrote itself, and trusting it would let any peer bypass
        // `strictMode`/`allowedOrigins` by simply lying about who it is.
        let (accept, reason) = match self.0.peers.origin_of(&source) {
            Ok(origin) => match self.0.origin_validator.validate(&origin, &source) {
                Ok(()) => (true, None),
                Err(reason) => (false, Some(reason)),
            },
            Err(err) => (false, Some(err.to_string())),
        };

        let ack_payload = serde_json::json!({
            "accept": accept,
            "reason": reason,
            "peerId": self.0.options.peer_id,
            "capabilities": Vec::<String>::new(),
        });
        let ack = Envelope::handshake_ack_for(self.0.options.peer_id.clone(), source.clone(), handshake_id, ack_payload);
        if accept {
            self.0.peers.set_capabilities(&source, capabilities);
        }
        self.0.peers.send_to_connecting(&source, ack).await
    }

    async fn dispatch_handshake_ack(&self, envelope: Envelope) -> Result<()> {
        let source = envelope.source().clone();
        let payload = envelope.payload();
        let accepted = payload.get("accept").and_then(|v| v.as_bool()).unwrap_or(false);
        let reason = payload.get("reason").and_then(|v| v.as_str()).map(String::from);
        let capabilities: Vec<String> = payload
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default();

        // correlation id here doubles as the handshake id.
        if let Some(handshake_id) = envelope.correlation_id() {
            self.0
                .handshakes
                .complete(
                    handshake_id,
                    AckOutcome {
                        accepted,
                        reason,
                        peer_capabilities: capabilities.clone(),
                        peer_metadata: serde_json::json!({}),
                    },
                )
                .await;
        }
        if accepted {
            self.0.peers.set_capabilities(&source, capabilities);
            let complete = Envelope::handshake_complete(self.0.options.peer_id.clone(), source.clone(), serde_json::json!({}));
            self.0.peers.send_to_connecting(&source, complete).await?;
            self.0.peers.set_status(&source, PeerStatus::Connected)?;
        }
        Ok(())
    }

    async fn dispatch_handshake_complete(&self, envelope: Envelope) -> Result<()> {
        let source = envelope.source().clone();
        self.0.peers.set_status(&source, PeerStatus::Connected)
    }

    /// Initiates a handshake with a peer already present in the table
    /// (typically just added in `connecting` status via `add_peer`'s
    /// lower-level sibling), per §4.8. `origin` is carried for the remote
    /// side's logs only — its own responder derives the origin it actually
    /// validates against from our registered transport, not from this field.
    pub async fn initiate_handshake(&self, target: &str, origin: &str, capabilities: Vec<String>) -> Result<AckOutcome> {
        self.check_alive()?;
        let (handshake_id, rx) = self.0.handshakes.begin(self.0.options.ack_timeout).await;
        let init_payload = serde_json::json!({"origin": origin, "capabilities": capabilities});
        let init = Envelope::handshake_init_to(self.0.options.peer_id.clone(), target.to_string(), handshake_id, init_payload);
        self.0.peers.send_to_connecting(target, init).await?;
        rx.await.unwrap_or_else(|_| Err(CrossBusError::from_code(ErrorCode::Destroyed, serde_json::json!({}))))
    }

    // ---- lifecycle --------------------------------------------------------

    /// Idempotent teardown: cancels pending, closes presence, clears peers,
    /// transitions to destroyed. Any subsequent public operation fails with
    /// `Destroyed` (invariant 10).
    pub async fn destroy(&self) {
        if self.0.destroyed.swap(true, AtomicOrdering::SeqCst) {
            return; // already destroyed; idempotent no-op
        }
        info!(peer = %self.0.options.peer_id, "bus destroyed");
        self.0.presence.stop().await;
        self.0.pending.cancel_all().await;
        for id in self.0.peers.snapshot_ids() {
            self.0.peers.remove_peer(&id);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.load(AtomicOrdering::SeqCst)
    }

    pub async fn health_check(&self) -> HealthSnapshot {
        let snapshot = HealthSnapshot {
            status: if self.is_destroyed() { "destroyed" } else { "running" },
            peers: self.0.peers.snapshot_ids(),
            handlers: self.0.handlers.names(),
            uptime_ms: crate::error::now_ms().saturating_sub(self.0.started_at_ms),
            memory_bytes: None,
        };
        self.0
            .emitter
            .emit(
                "bus:health",
                serde_json::json!({"status": snapshot.status, "uptimeMs": snapshot.uptime_ms}),
                Some(self.0.options.peer_id.clone()),
            )
            .await;
        snapshot
    }

    /// Lightweight self-assessment: pending table near cap, peers stuck
    /// connecting, orderer buffer above 80% — per SPEC_FULL.md §2.
    pub async fn diagnose(&self) -> Diagnosis {
        let mut issues = Vec::new();
        let pending_len = self.0.pending.len().await;
        if self.0.options.max_pending_requests > 0 {
            let ratio = pending_len as f64 / self.0.options.max_pending_requests as f64;
            if ratio >= 0.8 {
                issues.push(DiagnosticIssue {
                    severity: "warning",
                    message: format!("pending-request table at {:.0}% of its cap", ratio * 100.0),
                    suggestion: "raise maxPendingRequests or investigate slow responders".to_string(),
                });
            }
        }
        if let Some(orderer) = &self.0.orderer {
            let orderer = orderer.lock().await;
            let len = orderer.len();
            // max_size is private to CausalOrderer by design; 80% uses the
            // configured bound from BusOptions directly.
            let ratio = len as f64 / self.0.options.orderer_buffer_size.max(1) as f64;
            if ratio >= 0.8 {
                issues.push(DiagnosticIssue {
                    severity: "warning",
                    message: format!("causal orderer buffer at {:.0}% of its bound", ratio * 100.0),
                    suggestion: "check for a stalled sender or raise orderer_buffer_size".to_string(),
                });
            }
        }
        Diagnosis { issues }
    }
}

fn code_from_wire(code: &str) -> ErrorCode {
    use ErrorCode::*;
    match code {
        "HANDSHAKE_TIMEOUT" => HandshakeTimeout,
        "HANDSHAKE_REJECTED" => HandshakeRejected,
        "ORIGIN_FORBIDDEN" => OriginForbidden,
        "PEER_EXISTS" => PeerExists,
        "PEER_NOT_FOUND" => PeerNotFound,
        "PEER_DISCONNECTED" => PeerDisconnected,
        "RESPONSE_TIMEOUT" => ResponseTimeout,
        "ACK_TIMEOUT" => AckTimeout,
        "QUEUE_FULL" => QueueFull,
        "INVALID_MESSAGE" => InvalidMessage,
        "VERSION_MISMATCH" => VersionMismatch,
        "TRANSFER_FAILURE" => TransferFailure,
        "MESSAGE_TOO_LARGE" => MessageTooLarge,
        "UNREACHABLE" => Unreachable,
        "TTL_EXCEEDED" => TtlExceeded,
        "NO_ROUTE" => NoRoute,
        "NO_HANDLER" => NoHandler,
        "HANDLER_TIMEOUT" => HandlerTimeout,
        "HANDLER_EXISTS" => HandlerExists,
        "CHANNEL_FAILED" => ChannelFailed,
        "CHANNEL_CLOSED" => ChannelClosed,
        "MAX_PEERS" => MaxPeers,
        "MAX_PENDING" => MaxPending,
        "DESTROYED" => Destroyed,
        "CIRCUIT_OPEN" => CircuitOpen,
        "PAYLOAD_TOO_LARGE" => PayloadTooLarge,
        "RATE_LIMITED" => RateLimited,
        "UNAUTHORIZED" => Unauthorized,
        "INVALID_PAYLOAD" => InvalidPayload,
        "SEND_FAILED" => SendFailed,
        _ => HandlerError,
    }
}
