use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Closed enumeration of error codes a bus can surface across its public API.
///
/// Grouped the way `spec.md` §7 groups them (connection, messaging, routing,
/// handler, channel, resource, resilience, security); the grouping is only
/// documentation here, the enum itself is flat so callers can match on it
/// without nesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // connection
    HandshakeTimeout,
    HandshakeRejected,
    OriginForbidden,
    PeerExists,
    PeerNotFound,
    PeerDisconnected,
    // messaging
    ResponseTimeout,
    AckTimeout,
    QueueFull,
    InvalidMessage,
    VersionMismatch,
    TransferFailure,
    MessageTooLarge,
    // routing
    Unreachable,
    TtlExceeded,
    NoRoute,
    // handler
    NoHandler,
    HandlerError,
    HandlerTimeout,
    HandlerExists,
    // channel
    ChannelFailed,
    ChannelClosed,
    // resources
    MaxPeers,
    MaxPending,
    Destroyed,
    // resilience
    CircuitOpen,
    // security
    PayloadTooLarge,
    RateLimited,
    Unauthorized,
    InvalidPayload,
    // transport boundary
    SendFailed,
}

impl ErrorCode {
    /// Default human message for the code, used when a caller doesn't supply one.
    pub fn default_message(self) -> &'static str {
        use ErrorCode::*;
        match self {
            HandshakeTimeout => "handshake did not complete before its deadline",
            HandshakeRejected => "handshake was rejected by the responder",
            OriginForbidden => "origin is not in the allow-list",
            PeerExists => "a peer with this id is already registered",
            PeerNotFound => "no peer is registered with this id",
            PeerDisconnected => "peer is registered but not connected",
            ResponseTimeout => "no response arrived before the deadline",
            AckTimeout => "no handshake ack arrived before the deadline",
            QueueFull => "backpressure queue is at capacity",
            InvalidMessage => "received object is not a recognized protocol message",
            VersionMismatch => "protocol version is incompatible",
            TransferFailure => "failed to extract transferable payload leaves",
            MessageTooLarge => "message exceeds the configured size limit",
            Unreachable => "destination is unreachable",
            TtlExceeded => "message exceeded its relay ttl",
            NoRoute => "no route to the requested peer",
            NoHandler => "no handler is registered for this name",
            HandlerError => "handler threw while processing the request",
            HandlerTimeout => "handler exceeded its allotted time",
            HandlerExists => "a handler with this name is already registered",
            ChannelFailed => "underlying channel failed",
            ChannelClosed => "underlying channel is closed",
            MaxPeers => "peer table is at its configured maximum",
            MaxPending => "pending-request table is at its configured maximum",
            Destroyed => "bus has been destroyed",
            CircuitOpen => "circuit breaker is open",
            PayloadTooLarge => "payload exceeds the configured size limit",
            RateLimited => "rate limit exceeded",
            Unauthorized => "operation is not authorized",
            InvalidPayload => "payload failed schema validation",
            SendFailed => "transport send failed",
        }
    }

    /// Whether this code is retryable by default; overridable per instance.
    pub fn default_retryable(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            ResponseTimeout
                | AckTimeout
                | QueueFull
                | Unreachable
                | ChannelFailed
                | CircuitOpen
                | RateLimited
                | SendFailed
                | HandlerTimeout
        )
    }

    /// A short remediation hint suitable for surfacing to an operator.
    pub fn remediation_hint(self) -> &'static str {
        use ErrorCode::*;
        match self {
            HandshakeTimeout => "check that the responder is reachable and fast enough to ack",
            HandshakeRejected => "verify the origin/validator predicate on the responder",
            OriginForbidden => "add the origin to allowedOrigins or disable strictMode",
            PeerExists => "remove the existing peer first or pick a different id",
            PeerNotFound => "call addPeer before routing to this id",
            PeerDisconnected => "wait for reconnection or remove and re-add the peer",
            ResponseTimeout => "increase timeoutMs or investigate the responder's latency",
            AckTimeout => "increase the handshake deadline or check the responder",
            QueueFull => "drain the queue or raise its configured maximum",
            InvalidMessage => "ensure the transport only forwards protocol envelopes",
            VersionMismatch => "align protocol versions on both ends",
            TransferFailure => "check the payload for unsupported transferable leaves",
            MessageTooLarge => "split the payload or raise the size limit",
            Unreachable => "check transport connectivity to the destination",
            TtlExceeded => "reduce hop count or raise the ttl budget",
            NoRoute => "add the peer before routing to it",
            NoHandler => "register a handler for this name before calling it",
            HandlerError => "inspect details.message for the handler's reported failure",
            HandlerTimeout => "raise the handler's allotted time or optimize it",
            HandlerExists => "remove the existing handler first or pick a different name",
            ChannelFailed => "inspect the underlying transport for failures",
            ChannelClosed => "re-establish the channel before sending again",
            MaxPeers => "raise maxPeers or remove an existing peer first",
            MaxPending => "raise maxPendingRequests or await outstanding requests",
            Destroyed => "construct a new bus; this one is no longer usable",
            CircuitOpen => "wait for the reset timeout before retrying",
            PayloadTooLarge => "reduce payload size or raise the limit",
            RateLimited => "wait for the next refill tick before retrying",
            Unauthorized => "check handler options and peer permissions",
            InvalidPayload => "fix the payload per the reported path and message",
            SendFailed => "inspect the transport error and consider retrying",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Uniform error type carried across the public API, per `spec.md` §4.2.
///
/// `cause` is deliberately not `Serialize` (the wrapped error may come from
/// an arbitrary external collaborator); serialization flattens it to a
/// string summary via `cause_chain()`. `Display`/`std::error::Error` come
/// from `thiserror`, matching the reference workspace's own error types.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct CrossBusError {
    pub code: ErrorCode,
    pub message: String,
    pub details: serde_json::Value,
    pub retryable: bool,
    pub timestamp_ms: u64,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CrossBusError {
    /// Build an error from a code, taking its default message and retryability.
    pub fn from_code(code: ErrorCode, details: serde_json::Value) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            details,
            retryable: code.default_retryable(),
            timestamp_ms: now_ms(),
            cause: None,
        }
    }

    /// Build an error from a code with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            retryable: code.default_retryable(),
            timestamp_ms: now_ms(),
            cause: None,
        }
    }

    /// Wrap an underlying error, preserving its text as the cause chain.
    pub fn wrap(
        code: ErrorCode,
        cause: impl std::error::Error + Send + Sync + 'static,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            details,
            retryable: code.default_retryable(),
            timestamp_ms: now_ms(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    fn cause_chain(&self) -> Option<String> {
        self.cause.as_ref().map(|c| c.to_string())
    }
}

impl Clone for CrossBusError {
    fn clone(&self) -> Self {
        Self {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
            retryable: self.retryable,
            timestamp_ms: self.timestamp_ms,
            cause: self.cause_chain().map(|s| {
                Box::new(std::io::Error::new(std::io::ErrorKind::Other, s))
                    as Box<dyn std::error::Error + Send + Sync>
            }),
        }
    }
}

/// JSON-safe wire record for a `CrossBusError`, per `spec.md` §4.2.
impl Serialize for CrossBusError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("CrossBusError", 6)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("details", &self.details)?;
        state.serialize_field("retryable", &self.retryable)?;
        state.serialize_field("timestampMs", &self.timestamp_ms)?;
        state.serialize_field("cause", &self.cause_chain())?;
        state.end()
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub type Result<T> = std::result::Result<T, CrossBusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_message_and_retryability_come_from_the_code() {
        let err = CrossBusError::from_code(ErrorCode::ResponseTimeout, serde_json::json!({}));
        assert_eq!(err.message, "no response arrived before the deadline");
        assert!(err.retryable);
    }

    #[test]
    fn retryable_override_sticks() {
        let err = CrossBusError::from_code(ErrorCode::NoRoute, serde_json::json!({})).retryable(true);
        assert!(err.retryable);
    }

    #[test]
    fn serializes_to_a_json_safe_record() {
        let err = CrossBusError::wrap(
            ErrorCode::SendFailed,
            std::io::Error::new(std::io::ErrorKind::Other, "socket reset"),
            serde_json::json!({"peer": "b"}),
        );
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "SEND_FAILED");
        assert_eq!(value["cause"], "socket reset");
    }
}
