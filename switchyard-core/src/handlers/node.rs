//! Handler graph nodes.
//!
//! A handler graph is a tree of records. A record maps keys to child nodes and
//! may carry a private `internal` node, a cache override, an injection hook or
//! an unwrap hook. Feature modules build their fragment once; fragments are
//! composed into sequences at runtime.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::cache::SharedCache;
use crate::context::RequestContext;
use crate::error::Result;
use crate::request::{Args, Key, RequestDescriptor};

/// Future returned by every handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// A non-callable dependency (repository, client, configuration).
pub type Injectable = Arc<dyn Any + Send + Sync>;

/// Builds an injectable when its record is injected.
pub type OnInjectFn = Arc<dyn Fn(InjectPayload) -> Result<Injectable> + Send + Sync>;

/// Takes over every request that reaches its record.
pub type UnwrapFn = Arc<dyn Fn(RequestDescriptor) -> HandlerFuture + Send + Sync>;

/// What an `on_inject` hook is told about the injection site.
#[derive(Debug, Clone)]
pub struct InjectPayload {
    /// Path that was injected.
    pub path: Vec<Key>,
    /// Context of the request doing the injection.
    pub context: Option<Arc<RequestContext>>,
}

/// A callable handler. Receives positional arguments, returns JSON.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(Args) -> HandlerFuture + Send + Sync>);

impl Handler {
    /// Wrap an async function whose result is serializable.
    pub fn new<F, Fut, R>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Serialize,
    {
        Self(Arc::new(move |args| {
            let fut = f(args);
            async move {
                let value = fut.await?;
                Ok(serde_json::to_value(value)?)
            }
            .boxed()
        }))
    }

    /// Wrap a function that already produces JSON futures.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Args) -> HandlerFuture + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: Args) -> HandlerFuture {
        (self.0)(args)
    }

    pub fn ptr_eq(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

/// A node of the handler graph.
#[derive(Clone)]
pub enum HandlerNode {
    /// A callable. Reached with an empty remaining path it is a direct
    /// handler; reached with path left over it is a topic listener.
    Leaf(Handler),
    /// Several fragments at the same place. Every element is searched.
    Sequence(Arc<[HandlerNode]>),
    /// Named children plus hooks.
    Record(Arc<HandlerRecord>),
    /// A non-callable injectable.
    Value(Injectable),
}

impl HandlerNode {
    pub fn leaf<F, Fut, R>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Serialize,
    {
        Self::Leaf(Handler::new(f))
    }

    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::Value(Arc::new(value))
    }

    pub fn sequence(nodes: impl IntoIterator<Item = HandlerNode>) -> Self {
        Self::Sequence(nodes.into_iter().collect())
    }

    /// Whether both nodes are the same fragment (not merely equal).
    pub fn ptr_eq(&self, other: &HandlerNode) -> bool {
        match (self, other) {
            (Self::Leaf(a), Self::Leaf(b)) => a.ptr_eq(b),
            (Self::Sequence(a), Self::Sequence(b)) => Arc::ptr_eq(a, b),
            (Self::Record(a), Self::Record(b)) => Arc::ptr_eq(a, b),
            (Self::Value(a), Self::Value(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Whether `fragment` is this node or one of the sequences it is made of.
    pub fn contains_fragment(&self, fragment: &HandlerNode) -> bool {
        if self.ptr_eq(fragment) {
            return true;
        }
        match self {
            Self::Sequence(nodes) => nodes.iter().any(|node| node.contains_fragment(fragment)),
            _ => false,
        }
    }

    /// Put `inner` in front of `outer`, so its handlers are found first.
    /// Composing a fragment that `outer` already contains is a no-op.
    pub fn compose(inner: &HandlerNode, outer: &HandlerNode) -> HandlerNode {
        if outer.contains_fragment(inner) {
            outer.clone()
        } else {
            Self::Sequence(Arc::from(vec![inner.clone(), outer.clone()]))
        }
    }
}

impl fmt::Debug for HandlerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(_) => f.write_str("Leaf"),
            Self::Sequence(nodes) => f.debug_list().entries(nodes.iter()).finish(),
            Self::Record(record) => fmt::Debug::fmt(record.as_ref(), f),
            Self::Value(_) => f.write_str("Value"),
        }
    }
}

impl From<HandlerRecord> for HandlerNode {
    fn from(record: HandlerRecord) -> Self {
        Self::Record(Arc::new(record))
    }
}

impl From<Handler> for HandlerNode {
    fn from(handler: Handler) -> Self {
        Self::Leaf(handler)
    }
}

impl From<Vec<HandlerNode>> for HandlerNode {
    fn from(nodes: Vec<HandlerNode>) -> Self {
        Self::Sequence(Arc::from(nodes))
    }
}

/// A record of named handlers.
///
/// ```rust,ignore
/// let counter = HandlerRecord::new()
///     .handler("getCount", move |_| async move { Ok(count.load(SeqCst)) })
///     .handler("increment", move |_| async move { Ok(count.fetch_add(1, SeqCst)) })
///     .provide("repository", CounterRepository::default())
///     .cache(ReactiveCache::shared());
/// ```
#[derive(Clone, Default)]
pub struct HandlerRecord {
    children: IndexMap<Key, HandlerNode>,
    internal: Option<HandlerNode>,
    cache: Option<SharedCache>,
    on_inject: Option<OnInjectFn>,
    unwrap: Option<UnwrapFn>,
}

impl HandlerRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler under `name`.
    pub fn handler<F, Fut, R>(self, name: impl Into<Key>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Serialize,
    {
        self.child(name, HandlerNode::leaf(f))
    }

    /// Register any node under `name`, replacing a previous one.
    pub fn child(mut self, name: impl Into<Key>, node: impl Into<HandlerNode>) -> Self {
        self.children.insert(name.into(), node.into());
        self
    }

    /// Set the private node. It is only visible to nested requests and to
    /// injection.
    pub fn internal(mut self, node: impl Into<HandlerNode>) -> Self {
        self.internal = Some(node.into());
        self
    }

    /// Add an injectable to the private node, creating a private record if
    /// there is none yet.
    pub fn provide<T: Any + Send + Sync>(mut self, name: impl Into<Key>, value: T) -> Self {
        let value = HandlerNode::value(value);
        self.internal = Some(match self.internal.take() {
            Some(HandlerNode::Record(mut record)) => {
                Arc::make_mut(&mut record).children.insert(name.into(), value);
                HandlerNode::Record(record)
            }
            Some(other) => HandlerNode::sequence([
                other,
                HandlerRecord::new().child(name, value).into(),
            ]),
            None => HandlerRecord::new().child(name, value).into(),
        });
        self
    }

    /// Attach a cache to this record and everything beneath it.
    pub fn cache(mut self, cache: SharedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn on_inject<F>(mut self, f: F) -> Self
    where
        F: Fn(InjectPayload) -> Result<Injectable> + Send + Sync + 'static,
    {
        self.on_inject = Some(Arc::new(f));
        self
    }

    /// Turn this record into a pass-through: every request reaching it is
    /// handed to `f` with the remaining path.
    pub fn unwrap_with<F>(mut self, f: F) -> Self
    where
        F: Fn(RequestDescriptor) -> HandlerFuture + Send + Sync + 'static,
    {
        self.unwrap = Some(Arc::new(f));
        self
    }

    pub fn get(&self, key: &Key) -> Option<&HandlerNode> {
        self.children.get(key)
    }

    pub fn children(&self) -> impl Iterator<Item = (&Key, &HandlerNode)> {
        self.children.iter()
    }

    pub fn internal_node(&self) -> Option<&HandlerNode> {
        self.internal.as_ref()
    }

    pub fn cache_override(&self) -> Option<&SharedCache> {
        self.cache.as_ref()
    }

    pub fn on_inject_hook(&self) -> Option<&OnInjectFn> {
        self.on_inject.as_ref()
    }

    pub fn unwrap_hook(&self) -> Option<&UnwrapFn> {
        self.unwrap.as_ref()
    }

    pub fn into_node(self) -> HandlerNode {
        self.into()
    }
}

impl fmt::Debug for HandlerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRecord")
            .field("children", &self.children)
            .field("internal", &self.internal)
            .field("cache", &self.cache.is_some())
            .field("on_inject", &self.on_inject.is_some())
            .field("unwrap", &self.unwrap.is_some())
            .finish()
    }
}
