use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::envelope::PeerId;

/// Whether a listener runs inline or is scheduled on the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    Sync,
    Async,
}

type SyncFn = Arc<dyn Fn(&Value, Option<&PeerId>) + Send + Sync>;
type AsyncFn = Arc<dyn Fn(Value, Option<PeerId>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum ListenerKind {
    Sync(SyncFn),
    Async(AsyncFn),
}

/// A registered listener entry, per `spec.md` §3 "Listener entry".
#[derive(Clone)]
struct Listener {
    id: u64,
    kind: ListenerKind,
    priority: i32,
    once: bool,
    source_filter: Option<PeerId>,
    insertion_order: u64,
}

/// Options accepted by `on`, mirroring `spec.md` §4.3's `options` bag.
#[derive(Default, Clone)]
pub struct ListenerOptions {
    pub priority: i32,
    pub once: bool,
    pub source_filter: Option<PeerId>,
}

/// Priority-ordered, wildcard-capable, sync/async event dispatcher.
///
/// Matching follows `spec.md` §4.3: exact-name buckets, `ns:*` namespace
/// buckets, and one catch-all `*` bucket, avoiding regex at dispatch time
/// per the §9 design note.
pub struct EventEmitter {
    exact: Mutex<HashMap<String, Vec<Listener>>>,
    namespace: Mutex<HashMap<String, Vec<Listener>>>,
    catch_all: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
    next_seq: AtomicU64,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            exact: Mutex::new(HashMap::new()),
            namespace: Mutex::new(HashMap::new()),
            catch_all: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        }
    }

    fn insert(&self, pattern: &str, kind: ListenerKind, options: ListenerOptions) -> u64 {
        let id = self.next_listener_id.fetch_add(1, AtomicOrdering::Relaxed);
        let listener = Listener {
            id,
            kind,
            priority: options.priority,
            once: options.once,
            source_filter: options.source_filter,
            insertion_order: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
        };
        if pattern == "*" {
            self.catch_all.lock().unwrap().push(listener);
        } else if let Some(ns) = pattern.strip_suffix(":*") {
            self.namespace
                .lock()
                .unwrap()
                .entry(ns.to_string())
                .or_default()
                .push(listener);
        } else {
            self.exact
                .lock()
                .unwrap()
                .entry(pattern.to_string())
                .or_default()
                .push(listener);
        }
        id
    }

    /// Registers a synchronous listener. Returns a listener id usable with `off`.
    pub fn on_sync(
        &self,
        pattern: &str,
        options: ListenerOptions,
        f: impl Fn(&Value, Option<&PeerId>) + Send + Sync + 'static,
    ) -> u64 {
        self.insert(pattern, ListenerKind::Sync(Arc::new(f)), options)
    }

    /// Registers an async listener, scheduled on `tokio::spawn` when emitted.
    pub fn on_async<F>(&self, pattern: &str, options: ListenerOptions, f: impl Fn(Value, Option<PeerId>) -> F + Send + Sync + 'static) -> u64
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let wrapped: AsyncFn = Arc::new(move |v, s| Box::pin(f(v, s)));
        self.insert(pattern, ListenerKind::Async(wrapped), options)
    }

    /// Removes a listener registered under `pattern` by id.
    pub fn off(&self, pattern: &str, listener_id: u64) {
        if pattern == "*" {
            self.catch_all.lock().unwrap().retain(|l| l.id != listener_id);
        } else if let Some(ns) = pattern.strip_suffix(":*") {
            if let Some(bucket) = self.namespace.lock().unwrap().get_mut(ns) {
                bucket.retain(|l| l.id != listener_id);
            }
        } else if let Some(bucket) = self.exact.lock().unwrap().get_mut(pattern) {
            bucket.retain(|l| l.id != listener_id);
        }
    }

    fn matching(&self, name: &str) -> Vec<Listener> {
        let mut matched = Vec::new();
        if let Some(bucket) = self.exact.lock().unwrap().get(name) {
            matched.extend(bucket.iter().cloned());
        }
        {
            let namespaces = self.namespace.lock().unwrap();
            for (ns, bucket) in namespaces.iter() {
                if name.starts_with(ns.as_str()) && name[ns.len()..].starts_with(':') {
                    matched.extend(bucket.iter().cloned());
                }
            }
        }
        matched.extend(self.catch_all.lock().unwrap().iter().cloned());
        // Priority descending (numerically higher first), insertion order breaks ties.
        matched.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.insertion_order.cmp(&b.insertion_order))
        });
        matched
    }

    fn detach_once(&self, pattern_kind: &Listener, name: &str) {
        // `once` listeners can live in any of the three buckets; look the id
        // up in whichever bucket it was matched from by trying all three.
        self.exact
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .retain(|l| l.id != pattern_kind.id);
        let mut namespaces = self.namespace.lock().unwrap();
        for bucket in namespaces.values_mut() {
            bucket.retain(|l| l.id != pattern_kind.id);
        }
        self.catch_all.lock().unwrap().retain(|l| l.id != pattern_kind.id);
    }

    /// Fast, purely synchronous emit: only `Sync` listeners run; `Async`
    /// listeners matching this name are skipped (used on hot paths where the
    /// caller cannot await scheduling).
    pub fn emit_sync(&self, name: &str, data: &Value, source: Option<&PeerId>) {
        for listener in self.matching(name) {
            if let Some(filter) = &listener.source_filter {
                if source != Some(filter) {
                    continue;
                }
            }
            if listener.once {
                self.detach_once(&listener, name);
            }
            if let ListenerKind::Sync(f) = &listener.kind {
                f(data, source);
            }
        }
    }

    /// Full emit: sync listeners run inline, async listeners are scheduled
    /// via `tokio::spawn`, preserving relative order within each mode.
    pub async fn emit(&self, name: &str, data: Value, source: Option<PeerId>) {
        for listener in self.matching(name) {
            if let Some(filter) = &listener.source_filter {
                if source.as_ref() != Some(filter) {
                    continue;
                }
            }
            if listener.once {
                self.detach_once(&listener, name);
            }
            match &listener.kind {
                ListenerKind::Sync(f) => f(&data, source.as_ref()),
                ListenerKind::Async(f) => {
                    let fut = f(data.clone(), source.clone());
                    tokio::spawn(fut);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn exact_namespace_and_catch_all_all_match() {
        let emitter = EventEmitter::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h1 = hits.clone();
        emitter.on_sync("peer:added", ListenerOptions::default(), move |_, _| {
            h1.lock().unwrap().push("exact");
        });
        let h2 = hits.clone();
        emitter.on_sync("peer:*", ListenerOptions::default(), move |_, _| {
            h2.lock().unwrap().push("ns");
        });
        let h3 = hits.clone();
        emitter.on_sync("*", ListenerOptions::default(), move |_, _| {
            h3.lock().unwrap().push("catch_all");
        });
        emitter.emit_sync("peer:added", &Value::Null, None);
        let mut got = hits.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec!["catch_all", "exact", "ns"]);
    }

    #[test]
    fn scenario_listener_ordering_by_priority_then_insertion() {
        let emitter = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            let order = order.clone();
            emitter.on_sync(
                "t",
                ListenerOptions {
                    priority,
                    ..Default::default()
                },
                move |_, _| order.lock().unwrap().push(label),
            );
        }
        emitter.emit_sync("t", &Value::Null, None);
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn once_listener_is_detached_before_the_next_emit() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicI32::new(0));
        let c = count.clone();
        emitter.on_sync(
            "t",
            ListenerOptions {
                once: true,
                ..Default::default()
            },
            move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        emitter.emit_sync("t", &Value::Null, None);
        emitter.emit_sync("t", &Value::Null, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_listeners_are_scheduled_and_eventually_run() {
        let emitter = EventEmitter::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        emitter.on_async("t", ListenerOptions::default(), move |_, _| {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        });
        emitter.emit("t", Value::Null, None).await;
        tokio::time::timeout(std::time::Duration::from_millis(200), rx)
            .await
            .expect("async listener should run")
            .unwrap();
    }
}
