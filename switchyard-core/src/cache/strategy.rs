//! Cache strategies.
//!
//! A cache decides how each verb runs a handler: whether results are
//! memoized, and what has to be recomputed after a write. Records pick their
//! strategy with a cache override; everything else uses the pass-through
//! default.

use std::fmt;
use std::sync::{Arc, OnceLock};

use futures_util::future::{try_join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::Value;

use crate::error::Result;
use crate::handlers::HandlerFuture;
use crate::request::{CacheKey, Key, RequestDescriptor};

/// Runs the resolved handler once per call.
pub type Invoke = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;

/// Starts every fan-out handler of a dispatch.
pub type DispatchInvoke = Box<dyn FnOnce() -> Vec<HandlerFuture> + Send>;

/// A cache shared between the records that use it.
pub type SharedCache = Arc<dyn RequestCache>;

/// What to invalidate.
#[derive(Debug, Clone)]
pub enum InvalidateTarget {
    /// Every entry beneath a path prefix.
    Prefix(Vec<Key>),
    /// Exactly one request.
    Exact(RequestDescriptor),
}

impl InvalidateTarget {
    pub fn prefix<I, K>(path: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Self::Prefix(path.into_iter().map(Into::into).collect())
    }

    /// The path the target lives under.
    pub fn path(&self) -> &[Key] {
        match self {
            Self::Prefix(path) => path,
            Self::Exact(request) => request.path(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        match self {
            Self::Prefix(path) => CacheKey::for_prefix(path),
            Self::Exact(request) => request.cache_key(),
        }
    }

    /// Whether an entry stored under `key` is covered.
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Prefix(_) => key.starts_with(&self.cache_key()),
            Self::Exact(_) => *key == self.cache_key(),
        }
    }
}

impl From<RequestDescriptor> for InvalidateTarget {
    fn from(request: RequestDescriptor) -> Self {
        Self::Exact(request)
    }
}

/// How a cache runs the three verbs.
pub trait RequestCache: Send + Sync + fmt::Debug {
    /// Run (or reuse) a query.
    fn query(&self, request: &RequestDescriptor, invoke: Invoke) -> HandlerFuture;

    /// Run a mutation. Never memoized.
    fn mutate(&self, request: &RequestDescriptor, invoke: Invoke) -> HandlerFuture;

    /// Run every fan-out handler of a dispatch and wait for all of them.
    fn dispatch(
        &self,
        request: &RequestDescriptor,
        invoke: DispatchInvoke,
    ) -> BoxFuture<'static, Result<()>>;

    /// Mark matching entries stale.
    fn invalidate(&self, target: &InvalidateTarget);

    /// Force the value of an entry.
    fn set(&self, request: &RequestDescriptor, value: Value);

    /// The cached value of a request, without computing it.
    fn get_cached(&self, _request: &RequestDescriptor) -> Option<Value> {
        None
    }
}

/// No memoization: every call runs the handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughCache;

impl RequestCache for PassThroughCache {
    fn query(&self, _request: &RequestDescriptor, invoke: Invoke) -> HandlerFuture {
        invoke()
    }

    fn mutate(&self, _request: &RequestDescriptor, invoke: Invoke) -> HandlerFuture {
        invoke()
    }

    fn dispatch(
        &self,
        _request: &RequestDescriptor,
        invoke: DispatchInvoke,
    ) -> BoxFuture<'static, Result<()>> {
        let calls = invoke();
        async move {
            try_join_all(calls).await?;
            Ok(())
        }
        .boxed()
    }

    fn invalidate(&self, _target: &InvalidateTarget) {}

    fn set(&self, _request: &RequestDescriptor, _value: Value) {}
}

/// The cache used where no record overrides it.
pub fn default_cache() -> SharedCache {
    static DEFAULT: OnceLock<SharedCache> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(PassThroughCache)).clone()
}
