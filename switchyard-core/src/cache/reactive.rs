//! Reactive Cache
//!
//! Memoizes query results per request and keeps them consistent after
//! writes. Every cached request is a derived node of a [`ReactiveGraph`];
//! a query issued while another cached query of the same cache is being
//! computed becomes a source of that query's node.
//!
//! # How It Works
//!
//! 1. `query` finds (or creates) the node for the request key, links it to
//!    the query currently being computed, and reads it.
//! 2. A handler that finishes without suspending yields a ready value. One
//!    that suspends yields a pending value that every waiter shares; when it
//!    settles the result is written back in place without notifying anyone.
//! 3. `invalidate` marks matching nodes dirty. Observers are marked
//!    maybe-dirty and only recompute if a source actually changed value.
//! 4. Writes schedule one coalesced stabilization pass (see
//!    [`DeferredStabilizer`]).
//!
//! A failed computation is never kept: the node is marked dirty again so the
//! next query retries.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{self, try_join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use super::hydration::Snapshot;
use super::stabilizer::DeferredStabilizer;
use super::strategy::{DispatchInvoke, Invoke, InvalidateTarget, RequestCache, SharedCache};
use crate::config::CacheConfig;
use crate::context::{self, RequestKind};
use crate::error::Result;
use crate::graph::{NodeId, ReactiveGraph, Subscription};
use crate::handlers::HandlerFuture;
use crate::request::{CacheKey, RequestDescriptor};
use crate::transaction;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// A computation still in flight, shared by every waiter.
pub type PendingValue = Shared<BoxFuture<'static, Result<Value>>>;

/// The value held by a cache node.
#[derive(Clone)]
pub enum CachedValue {
    Ready(Value),
    Pending {
        /// Distinguishes computations of the same node.
        generation: u64,
        future: PendingValue,
    },
}

impl CachedValue {
    /// Ready values compare structurally. Pending values never compare equal.
    fn same(a: &Self, b: &Self) -> bool {
        match (a, b) {
            (Self::Ready(a), Self::Ready(b)) => a == b,
            _ => false,
        }
    }

    pub fn ready(&self) -> Option<&Value> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Pending { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

impl Default for CachedValue {
    fn default() -> Self {
        Self::Ready(Value::Null)
    }
}

impl fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Pending { generation, .. } => f
                .debug_struct("Pending")
                .field("generation", generation)
                .finish(),
        }
    }
}

struct CacheEntry {
    node: NodeId,
    touched: Instant,
}

/// A memoizing cache backed by a reactive graph.
pub struct ReactiveCache {
    graph: Arc<ReactiveGraph<CachedValue>>,
    entries: DashMap<CacheKey, CacheEntry>,
    stabilizer: DeferredStabilizer,
    config: CacheConfig,
}

impl ReactiveCache {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let graph = Arc::new(ReactiveGraph::with_equality(CachedValue::same));
        let weak: Weak<ReactiveGraph<CachedValue>> = Arc::downgrade(&graph);
        let stabilizer = DeferredStabilizer::new(config.stabilize, move || {
            weak.upgrade().map_or(0, |graph| graph.stabilize())
        });
        Self {
            graph,
            entries: DashMap::new(),
            stabilizer,
            config,
        }
    }

    /// A new cache, ready to attach to a record.
    pub fn shared() -> SharedCache {
        Arc::new(Self::new())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The graph holding this cache's nodes.
    pub fn graph(&self) -> &Arc<ReactiveGraph<CachedValue>> {
        &self.graph
    }

    /// The node caching `request`, if it was ever queried or set.
    pub fn node_of(&self, request: &RequestDescriptor) -> Option<NodeId> {
        self.entries.get(&request.cache_key()).map(|entry| entry.node)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run a stabilization pass now, returning the number of nodes visited.
    pub fn stabilize_now(&self) -> usize {
        self.stabilizer.run()
    }

    /// Call `listener` with every new ready value of `request`.
    ///
    /// Returns `None` when the request is not cached yet. Dropping the
    /// subscription stops the listener.
    pub fn subscribe<F>(
        &self,
        request: &RequestDescriptor,
        listener: F,
    ) -> Option<Subscription<CachedValue>>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let node = self.node_of(request)?;
        let listener = Arc::new(listener);
        Some(Subscription::new(&self.graph, node, move |value| match value {
            CachedValue::Ready(value) => listener(value),
            CachedValue::Pending { future, .. } => {
                if let Ok(handle) = Handle::try_current() {
                    let listener = listener.clone();
                    let future = future.clone();
                    handle.spawn(async move {
                        if let Ok(value) = future.await {
                            listener(&value);
                        }
                    });
                }
            }
        }))
    }

    /// Every ready value, keyed by canonical cache key.
    pub fn snapshot(&self) -> Snapshot {
        let nodes: Vec<(CacheKey, NodeId)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.node))
            .collect();
        nodes
            .into_iter()
            .filter_map(|(key, node)| match self.graph.peek(node)? {
                CachedValue::Ready(value) => Some((key.into_string(), value)),
                CachedValue::Pending { .. } => None,
            })
            .collect()
    }

    /// Seed the cache from a snapshot. Seeded entries are served until they
    /// are invalidated.
    pub fn hydrate(&self, snapshot: Snapshot) {
        let count = snapshot.len();
        for (key, value) in snapshot {
            self.set_key(CacheKey::from_raw(key), value);
        }
        debug!(entries = count, "cache hydrated");
        self.stabilizer.schedule();
    }

    /// Drop entries that were idle for longer than the configured eviction
    /// threshold and that no other node observes. Returns how many were
    /// dropped.
    pub fn evict_idle(&self) -> usize {
        let Some(threshold) = self.config.eviction.idle_after() else {
            return 0;
        };
        let idle: Vec<(CacheKey, NodeId)> = self
            .entries
            .iter()
            .filter(|entry| entry.touched.elapsed() >= threshold)
            .map(|entry| (entry.key().clone(), entry.node))
            .collect();

        let mut evicted = 0;
        for (key, node) in idle {
            if self.graph.observer_count(node) > 0 {
                continue;
            }
            if self.entries.remove(&key).is_some() {
                self.graph.remove(node);
                evicted += 1;
            }
        }
        debug!(evicted, "idle cache entries evicted");
        evicted
    }

    fn node_for(&self, key: CacheKey, invoke: Invoke) -> NodeId {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.touched = Instant::now();
            let node = entry.node;
            drop(entry);
            // Later recomputes run with the most recent caller's scope.
            self.graph.replace_compute_silently(node, compute(invoke));
            return node;
        }
        self.insert_node(key, || self.graph.derived(compute(invoke)))
    }

    fn insert_node(&self, key: CacheKey, create: impl FnOnce() -> NodeId) -> NodeId {
        let node = create();
        match self.entries.entry(key) {
            Entry::Occupied(existing) => {
                let kept = existing.get().node;
                drop(existing);
                self.graph.remove(node);
                kept
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    node,
                    touched: Instant::now(),
                });
                node
            }
        }
    }

    /// The node of the cached query currently being computed, if it belongs
    /// to this cache.
    fn observer_for(&self, request: &RequestDescriptor) -> Option<NodeId> {
        let parent = context::current().or_else(|| request.attached_context().cloned())?;
        if parent.kind() != RequestKind::Query {
            return None;
        }
        self.entries
            .get(&parent.request().cache_key())
            .map(|entry| entry.node)
    }

    fn set_key(&self, key: CacheKey, value: Value) {
        let existing = self.entries.get(&key).map(|entry| entry.node);
        let node = existing.unwrap_or_else(|| {
            self.insert_node(key, || self.graph.derived(CachedValue::default))
        });
        self.graph.set_value(node, CachedValue::Ready(value));
    }

    /// Stabilize when the surrounding transaction settles, whichever way.
    fn stabilize_after_transaction(&self) {
        if let Some(tx) = transaction::current() {
            let on_success = self.stabilizer.clone();
            tx.on_success(move || on_success.schedule());
            let on_error = self.stabilizer.clone();
            tx.on_error(move || on_error.schedule());
        }
    }
}

impl Default for ReactiveCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReactiveCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveCache")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .field("stabilizer", &self.stabilizer)
            .finish()
    }
}

fn compute(invoke: Invoke) -> impl Fn() -> CachedValue + Send + Sync + 'static {
    move || {
        let future = invoke().shared();
        match future.clone().now_or_never() {
            Some(Ok(value)) => CachedValue::Ready(value),
            _ => CachedValue::Pending {
                generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
                future,
            },
        }
    }
}

/// Record how a pending computation ended, unless a newer one replaced it.
fn settle(graph: &ReactiveGraph<CachedValue>, node: NodeId, generation: u64, result: &Result<Value>) {
    let is_current = |value: &CachedValue| {
        matches!(value, CachedValue::Pending { generation: g, .. } if *g == generation)
    };
    match result {
        Ok(value) => {
            graph.write_silently(node, |slot| {
                if is_current(slot) {
                    *slot = CachedValue::Ready(value.clone());
                }
            });
        }
        Err(_) => {
            if graph.peek(node).as_ref().is_some_and(is_current) {
                trace!(node = node.raw(), "failed computation discarded");
                graph.mark_dirty_silently(node);
            }
        }
    }
}

impl RequestCache for ReactiveCache {
    fn query(&self, request: &RequestDescriptor, invoke: Invoke) -> HandlerFuture {
        let node = self.node_for(request.cache_key(), invoke);
        let observer = self.observer_for(request);
        let graph = self.graph.clone();
        match graph.get(node, observer) {
            Err(err) => future::ready(Err(err)).boxed(),
            Ok(CachedValue::Ready(value)) => future::ready(Ok(value)).boxed(),
            Ok(CachedValue::Pending { generation, future }) => async move {
                let result = future.await;
                settle(&graph, node, generation, &result);
                result
            }
            .boxed(),
        }
    }

    fn mutate(&self, _request: &RequestDescriptor, invoke: Invoke) -> HandlerFuture {
        self.stabilize_after_transaction();
        let stabilizer = self.stabilizer.clone();
        let call = invoke();
        async move {
            let result = call.await;
            stabilizer.schedule();
            result
        }
        .boxed()
    }

    fn dispatch(
        &self,
        _request: &RequestDescriptor,
        invoke: DispatchInvoke,
    ) -> BoxFuture<'static, Result<()>> {
        self.stabilize_after_transaction();
        let stabilizer = self.stabilizer.clone();
        let calls = invoke();
        async move {
            let result = try_join_all(calls).await.map(|_| ());
            stabilizer.schedule();
            result
        }
        .boxed()
    }

    fn invalidate(&self, target: &InvalidateTarget) {
        let nodes: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|entry| target.matches(entry.key()))
            .map(|entry| entry.node)
            .collect();
        for &node in &nodes {
            self.graph.refresh(node);
        }
        debug!(
            target = %target.cache_key(),
            refreshed = nodes.len(),
            "cache invalidated"
        );
        if !nodes.is_empty() {
            self.stabilizer.schedule();
        }
    }

    fn set(&self, request: &RequestDescriptor, value: Value) {
        self.set_key(request.cache_key(), value);
        self.stabilizer.schedule();
    }

    fn get_cached(&self, request: &RequestDescriptor) -> Option<Value> {
        let node = self.node_of(request)?;
        match self.graph.peek(node)? {
            CachedValue::Ready(value) => Some(value),
            CachedValue::Pending { future, .. } => match future.peek() {
                Some(Ok(value)) => Some(value.clone()),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionPolicy, StabilizeMode};
    use crate::context::{RequestContext, RequestOptions};
    use crate::error::CoreError;
    use crate::handlers::HandlerRecord;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn request(path: &[&str]) -> RequestDescriptor {
        RequestDescriptor::new(path.iter().copied(), vec![])
    }

    fn counting(value: Value) -> (Invoke, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoke: Invoke = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            async move { Ok(value) }.boxed()
        });
        (invoke, calls)
    }

    #[tokio::test]
    async fn queries_are_memoized() {
        let cache = ReactiveCache::new();
        let (invoke, calls) = counting(json!(0));
        let req = request(&["Counter", "getCount"]);

        assert_eq!(cache.query(&req, invoke.clone()).await, Ok(json!(0)));
        assert_eq!(cache.query(&req, invoke).await, Ok(json!(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_cached(&req), Some(json!(0)));
    }

    #[tokio::test]
    async fn prefix_invalidation_only_touches_matching_entries() {
        let cache = ReactiveCache::with_config(CacheConfig {
            stabilize: StabilizeMode::Immediate,
            ..CacheConfig::default()
        });
        let (first, first_calls) = counting(json!(1));
        let (second, second_calls) = counting(json!(2));
        let a = request(&["Client1", "getCount"]);
        let b = request(&["Client12", "getCount"]);

        cache.query(&a, first.clone()).await.unwrap();
        cache.query(&b, second.clone()).await.unwrap();

        cache.invalidate(&InvalidateTarget::prefix(["Client1"]));
        assert_eq!(first_calls.load(Ordering::SeqCst), 2);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = ReactiveCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoke: Invoke = Arc::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(CoreError::handler("flaky"))
                } else {
                    Ok(json!(n))
                }
            }
            .boxed()
        });
        let req = request(&["Flaky", "get"]);

        assert!(cache.query(&req, invoke.clone()).await.is_err());
        assert_eq!(cache.query(&req, invoke.clone()).await, Ok(json!(1)));
        assert_eq!(cache.query(&req, invoke).await, Ok(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pending_values_are_shared_and_settle_in_place() {
        let cache = ReactiveCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoke: Invoke = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!("slow"))
            }
            .boxed()
        });
        let req = request(&["Slow", "get"]);

        let first = cache.query(&req, invoke.clone());
        let second = cache.query(&req, invoke);
        assert_eq!(cache.get_cached(&req), None);

        let (first, second) = futures_util::join!(first, second);
        assert_eq!(first, Ok(json!("slow")));
        assert_eq!(second, Ok(json!("slow")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let node = cache.node_of(&req).unwrap();
        assert!(matches!(cache.graph().peek(node), Some(CachedValue::Ready(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_queries_on_other_threads_run_the_handler_once() {
        let cache = Arc::new(ReactiveCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoke: Invoke = Arc::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            // Holds the worker thread so the second query lands mid-compute.
            std::thread::sleep(Duration::from_millis(30));
            async move { Ok(json!(n)) }.boxed()
        });
        let req = request(&["Report", "build"]);

        let racers: Vec<_> = (0..2)
            .map(|_| {
                let (cache, invoke, req) = (cache.clone(), invoke.clone(), req.clone());
                tokio::spawn(async move { cache.query(&req, invoke).await })
            })
            .collect();
        for racer in racers {
            assert_eq!(racer.await.unwrap(), Ok(json!(0)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nested_queries_track_their_dependencies() {
        let cache = Arc::new(ReactiveCache::new());
        let text = Arc::new(Mutex::new(String::from("a")));
        let derived_req = request(&["Store", "getDerived"]);
        let string_req = request(&["Store", "getString"]);

        let source = text.clone();
        let string_invoke: Invoke = Arc::new(move || {
            let value = source.lock().clone();
            async move { Ok(json!(value)) }.boxed()
        });

        let parent = Arc::new(RequestContext::new(
            RequestKind::Query,
            &derived_req,
            None,
            HandlerRecord::new().into_node(),
            None,
            RequestOptions::default(),
        ));
        let derived_invoke: Invoke = {
            let cache = cache.clone();
            let string_req = string_req.clone();
            Arc::new(move || {
                let cache = cache.clone();
                let string_req = string_req.clone();
                let string_invoke = string_invoke.clone();
                context::with_context(parent.clone(), async move {
                    let value = cache.query(&string_req, string_invoke).await?;
                    Ok(json!(format!("derived:{}", value.as_str().unwrap_or_default())))
                })
                .boxed()
            })
        };

        let first = cache.query(&derived_req, derived_invoke.clone()).await;
        assert_eq!(first, Ok(json!("derived:a")));

        let derived = cache.node_of(&derived_req).unwrap();
        let string = cache.node_of(&string_req).unwrap();
        assert_eq!(cache.graph().source_count(derived), 1);
        assert_eq!(cache.graph().observer_count(string), 1);

        *text.lock() = String::from("b");
        cache.invalidate(&InvalidateTarget::from(string_req));
        let second = cache.query(&derived_req, derived_invoke).await;
        assert_eq!(second, Ok(json!("derived:b")));
    }

    #[tokio::test]
    async fn hydrated_entries_are_served_without_running_handlers() {
        let server = ReactiveCache::new();
        let req = request(&["Catalog", "list"]);
        let (invoke, _) = counting(json!(["apple"]));
        server.query(&req, invoke).await.unwrap();
        let snapshot = server.snapshot();
        assert_eq!(snapshot.len(), 1);

        let client = ReactiveCache::new();
        client.hydrate(snapshot);
        let (invoke, calls) = counting(json!(["pear"]));
        assert_eq!(client.query(&req, invoke.clone()).await, Ok(json!(["apple"])));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        client.invalidate(&InvalidateTarget::from(req.clone()));
        assert_eq!(client.query(&req, invoke).await, Ok(json!(["pear"])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_hear_about_new_values() {
        let cache = ReactiveCache::with_config(CacheConfig {
            stabilize: StabilizeMode::Immediate,
            ..CacheConfig::default()
        });
        let req = request(&["Counter", "getCount"]);
        let (invoke, _) = counting(json!(0));
        cache.query(&req, invoke).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = cache
            .subscribe(&req, move |value| sink.lock().push(value.clone()))
            .unwrap();

        cache.set(&req, json!(5));
        cache.set(&req, json!(5));
        assert_eq!(*seen.lock(), vec![json!(5)]);

        drop(subscription);
        cache.set(&req, json!(6));
        assert_eq!(*seen.lock(), vec![json!(5)]);
        assert!(cache.subscribe(&request(&["Missing"]), |_| {}).is_none());
    }

    #[tokio::test]
    async fn idle_entries_are_evicted_only_when_configured() {
        let retaining = ReactiveCache::new();
        let req = request(&["Counter", "getCount"]);
        let (invoke, _) = counting(json!(0));
        retaining.query(&req, invoke.clone()).await.unwrap();
        assert_eq!(retaining.evict_idle(), 0);

        let evicting = ReactiveCache::with_config(CacheConfig {
            eviction: EvictionPolicy::Idle { idle_ms: 0 },
            ..CacheConfig::default()
        });
        evicting.query(&req, invoke).await.unwrap();
        assert_eq!(evicting.evict_idle(), 1);
        assert!(evicting.is_empty());
        assert_eq!(evicting.get_cached(&req), None);
    }
}
