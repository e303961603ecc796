use std::sync::Arc;
use std::time::Duration;

use crossbus_core::{EventEmitter, HookContext, HookDirection, HookResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Coalesces outbound signals within a time window or up to a maximum batch
/// size. Registers as an outbound-intercept capability rather than
/// overriding `signal` directly, by being installed as an outbound hook
/// that always drops the message (returns `Ok(None)`) and instead appends it
/// to an internal buffer; a background flush task delivers the accumulated
/// batch through the caller-supplied `deliver` callback.
pub struct Batcher {
    max_batch_size: usize,
    buffer: Arc<Mutex<Vec<serde_json::Value>>>,
    deliver: Arc<dyn Fn(Vec<serde_json::Value>) + Send + Sync>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    pub fn new(window: Duration, max_batch_size: usize, deliver: impl Fn(Vec<serde_json::Value>) + Send + Sync + 'static) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let buffer_for_task = buffer.clone();
        let deliver: Arc<dyn Fn(Vec<serde_json::Value>) + Send + Sync> = Arc::new(deliver);
        let deliver_for_task = deliver.clone();
        let flush_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            loop {
                ticker.tick().await;
                let mut buf = buffer_for_task.lock().await;
                if !buf.is_empty() {
                    let batch = std::mem::take(&mut *buf);
                    deliver_for_task(batch);
                }
            }
        });
        Self {
            max_batch_size,
            buffer,
            deliver,
            flush_task: Mutex::new(Some(flush_task)),
        }
    }

    /// The outbound hook function this batcher installs on a bus, per the
    /// `HookFn` signature. Always swallows the message (`Ok(None)`), buffers
    /// it, and flushes immediately once the buffer reaches `max_batch_size`
    /// rather than waiting for the next window tick.
    pub fn outbound_hook(self: &Arc<Self>) -> crossbus_core::HookFn {
        let this = self.clone();
        Arc::new(move |payload, _ctx: HookContext| {
            let this = this.clone();
            Box::pin(async move {
                let mut buf = this.buffer.lock().await;
                buf.push(payload);
                if buf.len() >= this.max_batch_size {
                    let batch = std::mem::take(&mut *buf);
                    drop(buf);
                    (this.deliver)(batch);
                }
                Ok(None) as HookResult
            })
        })
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.flush_task.lock().await.take() {
            task.abort();
        }
    }
}

/// Expands a received batch envelope back into individual dispatches, the
/// inbound-side counterpart of the hook above. A batch payload is shaped
/// `{"batch": [sub-signal, ...]}` where each sub-signal is itself a
/// `{"name", "data"}` pair (the same shape the outbound hook buffered).
/// Every sub-signal but the first is emitted directly against `emitter`
/// here, since the inbound hook pipeline can only return one value back
/// into the normal dispatch path; the first is returned so that path
/// delivers it exactly as it would any other signal. Non-batch payloads
/// pass through unchanged, matching the rest of the inbound hook surface.
pub fn expand_batch_hook(emitter: Arc<EventEmitter>) -> crossbus_core::HookFn {
    Arc::new(move |payload, ctx: HookContext| {
        let emitter = emitter.clone();
        Box::pin(async move {
            match payload.get("batch").and_then(|b| b.as_array()).cloned() {
                Some(items) if !items.is_empty() => {
                    for item in &items[1..] {
                        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                        let data = item.get("data").cloned().unwrap_or(serde_json::Value::Null);
                        emitter.emit(name, data, ctx.counterpart.clone()).await;
                    }
                    Ok(Some(items[0].clone()))
                }
                _ => Ok(None),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn batcher_flushes_on_its_window() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered2 = delivered.clone();
        let batcher = Arc::new(Batcher::new(Duration::from_millis(20), 100, move |batch| {
            delivered2.fetch_add(batch.len(), Ordering::SeqCst);
        }));
        let hook = batcher.outbound_hook();
        let ctx = HookContext {
            direction: HookDirection::Outbound,
            envelope_type: crossbus_core::EnvelopeType::Signal,
            local_peer_id: "a".to_string(),
            counterpart: None,
            handler_name: None,
        };
        hook(serde_json::json!({"x": 1}), ctx.clone()).await.unwrap();
        hook(serde_json::json!({"x": 2}), ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn batcher_flushes_immediately_once_max_batch_size_is_reached() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered2 = delivered.clone();
        let batcher = Arc::new(Batcher::new(Duration::from_secs(30), 2, move |batch| {
            delivered2.fetch_add(batch.len(), Ordering::SeqCst);
        }));
        let hook = batcher.outbound_hook();
        let ctx = HookContext {
            direction: HookDirection::Outbound,
            envelope_type: crossbus_core::EnvelopeType::Signal,
            local_peer_id: "a".to_string(),
            counterpart: None,
            handler_name: None,
        };
        hook(serde_json::json!({"x": 1}), ctx.clone()).await.unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 0, "below max batch size, no flush yet");
        hook(serde_json::json!({"x": 2}), ctx).await.unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 2, "reaching max batch size flushes without waiting for the window");
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn expand_batch_hook_dispatches_every_sub_signal_not_just_the_first() {
        let emitter = Arc::new(EventEmitter::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        emitter.on_async("item", Default::default(), move |data, _source| {
            let seen = seen2.clone();
            async move {
                seen.lock().await.push(data);
            }
        });

        let hook = expand_batch_hook(emitter.clone());
        let ctx = HookContext {
            direction: HookDirection::Inbound,
            envelope_type: crossbus_core::EnvelopeType::Signal,
            local_peer_id: "a".to_string(),
            counterpart: Some("b".to_string()),
            handler_name: None,
        };
        let batch = serde_json::json!({"batch": [
            {"name": "item", "data": 1},
            {"name": "item", "data": 2},
            {"name": "item", "data": 3},
        ]});
        let result = hook(batch, ctx).await.unwrap();
        assert_eq!(result, Some(serde_json::json!({"name": "item", "data": 1})), "first item returned for the normal dispatch path");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().await, vec![serde_json::json!(2), serde_json::json!(3)], "remaining items emitted directly");
    }
}
