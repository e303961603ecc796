use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::envelope::PeerId;
use crate::error::{CrossBusError, ErrorCode, Result};

/// Context handed to a registered handler when invoked for an incoming
/// request, per `spec.md` §4.6.
#[derive(Clone)]
pub struct HandlerContext {
    pub name: String,
    pub source: PeerId,
    pub local_peer_id: PeerId,
}

pub type HandlerFn =
    Arc<dyn Fn(serde_json::Value, HandlerContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Per-handler options, per `spec.md` §3 "Handler entry".
#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// If set, only these peers may invoke the handler; others get `Unauthorized`.
    pub allowed_peers: Option<Vec<PeerId>>,
    /// Maximum time a handler is allowed to run before `HandlerTimeout`.
    pub timeout: Option<Duration>,
}

struct HandlerEntry {
    func: HandlerFn,
    options: HandlerOptions,
}

/// Name→function map with collision rejection, per `spec.md` §4.6.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, name: impl Into<String>, func: HandlerFn, options: HandlerOptions) -> Result<()> {
        let name = name.into();
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&name) {
            return Err(CrossBusError::from_code(
                ErrorCode::HandlerExists,
                serde_json::json!({"name": name}),
            ));
        }
        handlers.insert(name, HandlerEntry { func, options });
        Ok(())
    }

    pub fn remove_handler(&self, name: &str) -> bool {
        self.handlers.lock().unwrap().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.lock().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.lock().unwrap().keys().cloned().collect()
    }

    /// Looks up and invokes a handler, honoring its allowed-peers list and
    /// timeout. Never panics on handler failure: failures are converted to
    /// `HandlerError`/`Unauthorized`/`HandlerTimeout` results, per §4.6/§7 —
    /// the caller turns this into a RESPONSE envelope either way.
    pub async fn invoke(&self, name: &str, payload: serde_json::Value, ctx: HandlerContext) -> Result<serde_json::Value> {
        let (func, options) = {
            let handlers = self.handlers.lock().unwrap();
            let entry = handlers
                .get(name)
                .ok_or_else(|| CrossBusError::from_code(ErrorCode::NoHandler, serde_json::json!({"name": name})))?;
            (entry.func.clone(), entry.options.clone())
        };

        if let Some(allowed) = &options.allowed_peers {
            if !allowed.contains(&ctx.source) {
                return Err(CrossBusError::from_code(
                    ErrorCode::Unauthorized,
                    serde_json::json!({"name": name, "peerId": ctx.source}),
                ));
            }
        }

        let fut = AssertUnwindSafe(func(payload, ctx.clone())).catch_unwind();
        let outcome = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(unwind_result) => unwind_result,
                Err(_) => {
                    return Err(CrossBusError::from_code(
                        ErrorCode::HandlerTimeout,
                        serde_json::json!({"name": name}),
                    ))
                }
            },
            None => fut.await,
        };

        // A handler panic is this runtime's equivalent of "the handler
        // threw": converted to `HandlerError` rather than unwinding into the
        // dispatcher, and the panic payload's stack is never forwarded
        // across the boundary — only its message, per §4.6/§7.
        outcome.unwrap_or_else(|panic| Err(handler_error(name, panic_message(&panic))))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Wraps a handler so it always reports `HandlerError` (rather than a Rust
/// panic) for an internal failure, and never forwards a stack trace across
/// the boundary — only the reported message lands in `details.message`.
pub fn handler_error(name: &str, message: impl Into<String>) -> CrossBusError {
    CrossBusError::with_message(
        ErrorCode::HandlerError,
        message,
        serde_json::json!({"name": name}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(source: &str) -> HandlerContext {
        HandlerContext {
            name: "echo".to_string(),
            source: source.to_string(),
            local_peer_id: "local".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_handler_name_is_rejected() {
        let registry = HandlerRegistry::new();
        let f: HandlerFn = Arc::new(|v, _| Box::pin(async move { Ok(v) }));
        registry.handle("echo", f.clone(), HandlerOptions::default()).unwrap();
        let err = registry.handle("echo", f, HandlerOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::HandlerExists);
    }

    #[tokio::test]
    async fn missing_handler_reports_no_handler() {
        let registry = HandlerRegistry::new();
        let err = registry
            .invoke("missing", serde_json::json!(null), ctx("a"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NoHandler);
    }

    #[tokio::test]
    async fn disallowed_peer_is_unauthorized() {
        let registry = HandlerRegistry::new();
        let f: HandlerFn = Arc::new(|v, _| Box::pin(async move { Ok(v) }));
        registry
            .handle(
                "echo",
                f,
                HandlerOptions {
                    allowed_peers: Some(vec!["friend".to_string()]),
                    timeout: None,
                },
            )
            .unwrap();
        let err = registry
            .invoke("echo", serde_json::json!(null), ctx("stranger"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn handler_exceeding_its_timeout_reports_handler_timeout() {
        let registry = HandlerRegistry::new();
        let f: HandlerFn = Arc::new(|_, _| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(serde_json::json!(null))
            })
        });
        registry
            .handle(
                "slow",
                f,
                HandlerOptions {
                    allowed_peers: None,
                    timeout: Some(Duration::from_millis(5)),
                },
            )
            .unwrap();
        let err = registry
            .invoke("slow", serde_json::json!(null), ctx("a"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HandlerTimeout);
    }

    #[tokio::test]
    async fn a_panicking_handler_reports_handler_error_instead_of_unwinding() {
        let registry = HandlerRegistry::new();
        let f: HandlerFn = Arc::new(|_, _| Box::pin(async move { panic!("boom") }));
        registry.handle("panics", f, HandlerOptions::default()).unwrap();
        let err = registry
            .invoke("panics", serde_json::json!(null), ctx("a"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HandlerError);
        assert_eq!(err.message, "boom");
    }
}
