//! Invokers
//!
//! The verbs that tie everything together. Each call extends the ambient
//! context with a fresh [`RequestContext`], resolves handlers against the
//! context's graph and runs them through the cache that owns them:
//!
//! - `query`: first match, memoized by the owning cache.
//! - `mutate`: first match, inside a transaction. A successful mutation
//!   invalidates the owning cache for the request's parent prefix.
//! - `dispatch`: every match, grouped by owning cache, groups run
//!   concurrently, inside a transaction. No match is not an error.
//! - `invalidate`: marks the owning cache's entries under a prefix stale.
//!
//! Requests issued from inside a handler may see that handler's private
//! (`internal`) nodes. Requests issued from outside never do.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{try_join_all, BoxFuture};
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::{debug, warn, Instrument, Span};

use crate::cache::{DispatchInvoke, InvalidateTarget, Invoke, SharedCache};
use crate::context::{self, RequestContext, RequestKind};
use crate::error::{CoreError, Result};
use crate::handlers::{resolve, resolve_first_raw, HandlerFuture, HandlerNode, Resolved};
use crate::request::{Key, Request, RequestDescriptor};
use crate::transaction::{self, Transaction};

/// Entry points for issuing requests against a handler graph.
///
/// Cheap to clone. Invokers without a graph of their own only resolve
/// against the graph of the request being served.
#[derive(Debug, Clone, Default)]
pub struct Invokers {
    graph: Option<HandlerNode>,
}

struct NextCall {
    context: Arc<RequestContext>,
    private_scope: bool,
    root: bool,
}

impl Invokers {
    /// Invokers resolving against `graph`.
    pub fn new(graph: impl Into<HandlerNode>) -> Self {
        Self {
            graph: Some(graph.into()),
        }
    }

    /// Invokers with no graph of their own.
    pub fn global() -> Self {
        Self::default()
    }

    /// Invokers whose graph puts `fragment` in front of this one's, so its
    /// handlers are found first.
    pub fn scoped(&self, fragment: impl Into<HandlerNode>) -> Self {
        let fragment = fragment.into();
        let graph = match &self.graph {
            Some(graph) => HandlerNode::compose(&fragment, graph),
            None => fragment,
        };
        Self { graph: Some(graph) }
    }

    pub fn graph(&self) -> Option<&HandlerNode> {
        self.graph.as_ref()
    }

    /// Run a query and decode its result.
    pub async fn query<T: DeserializeOwned>(&self, request: &Request<T>) -> Result<T> {
        let value = self.query_value(request.descriptor()).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run a query, returning the raw JSON result with the request's
    /// transforms applied.
    pub async fn query_value(&self, request: &RequestDescriptor) -> Result<Value> {
        let next = self.next_call(RequestKind::Query, request)?;
        let span = request_span(&next.context);
        async {
            let resolved = first_handler(&next, request)?;
            let invoke = bind(&next.context, &resolved, request);
            let value = if next.context.options().no_cache {
                debug!("cache bypassed");
                invoke().await?
            } else {
                resolved.cache.query(request, invoke).await?
            };
            request.apply_transforms(value)
        }
        .instrument(span)
        .await
    }

    /// Run a mutation and decode its result.
    pub async fn mutate<T: DeserializeOwned>(&self, request: &Request<T>) -> Result<T> {
        let value = self.mutate_value(request.descriptor()).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run a mutation, returning the raw JSON result with the request's
    /// transforms applied.
    ///
    /// Resolves once the mutation and all follow-up work it queued on its
    /// transaction have settled.
    pub async fn mutate_value(&self, request: &RequestDescriptor) -> Result<Value> {
        let next = self.next_call(RequestKind::Mutate, request)?;
        let span = request_span(&next.context);
        let resolved = first_handler(&next, request)?;
        let invoke = bind(&next.context, &resolved, request);
        let cache = resolved.cache;
        let path = request.path();
        let parent = InvalidateTarget::prefix(&path[..path.len().saturating_sub(1)]);

        within_transaction(&next, async move {
            let value = cache.mutate(request, invoke).await?;
            // Siblings of the mutated accessor may read what it changed.
            cache.invalidate(&parent);
            request.apply_transforms(value)
        })
        .instrument(span)
        .await
    }

    /// Run every handler registered for `request`.
    ///
    /// Resolves once all of them and all follow-up work they queued have
    /// settled. The first failure fails the whole dispatch.
    pub async fn dispatch(&self, request: &RequestDescriptor) -> Result<()> {
        let next = self.next_call(RequestKind::Dispatch, request)?;
        let span = request_span(&next.context);
        let handlers = resolve(request, next.context.graph(), next.private_scope);
        if handlers.is_empty() {
            debug!(parent: &span, "no listeners");
            return Ok(());
        }

        // Keyed by cache identity.
        let mut groups: IndexMap<usize, (SharedCache, Vec<Resolved>)> = IndexMap::new();
        for resolved in handlers {
            let id = Arc::as_ptr(&resolved.cache) as *const () as usize;
            groups
                .entry(id)
                .or_insert_with(|| (resolved.cache.clone(), Vec::new()))
                .1
                .push(resolved);
        }
        debug!(parent: &span, groups = groups.len(), "dispatching");

        let context = next.context.clone();
        within_transaction(&next, async move {
            let calls: Vec<BoxFuture<'static, Result<()>>> = groups
                .into_values()
                .map(|(cache, members)| {
                    let context = context.clone();
                    let owned = request.clone();
                    let invoke: DispatchInvoke = Box::new(move || {
                        members
                            .iter()
                            .map(|resolved| start(&context, resolved, &owned))
                            .collect()
                    });
                    cache.dispatch(request, invoke)
                })
                .collect();
            try_join_all(calls).await.map(|_| ())
        })
        .instrument(span)
        .await
    }

    /// Dispatch without waiting.
    ///
    /// Inside a transaction the dispatch is queued on it, so the root call
    /// still waits for it. Otherwise it runs detached and failures are only
    /// logged.
    pub fn emit(&self, request: RequestDescriptor) {
        let this = self.clone();
        let work = async move { this.dispatch(&request).await };

        match transaction::current() {
            Some(tx) if !tx.state().is_closed() => tx.defer(work),
            _ => match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(context::propagate(async move {
                        if let Err(err) = work.await {
                            warn!(error = %err, "emitted event failed");
                        }
                    }));
                }
                Err(_) => warn!("no runtime to emit on; event dropped"),
            },
        }
    }

    /// Dispatch the request being served again, with its first path segment
    /// replaced by `prefix`.
    pub async fn redispatch(&self, prefix: impl Into<Key>) -> Result<()> {
        let current = context::current().ok_or(CoreError::NoContext {
            operation: "redispatch",
        })?;
        let mut path: Vec<Key> = current.request().path().to_vec();
        match path.first_mut() {
            Some(first) => *first = prefix.into(),
            None => path.push(prefix.into()),
        }
        let request = current
            .request()
            .with_path(path)
            .with_context(Some(current.clone()));
        self.dispatch(&request).await
    }

    /// Mark the entries covered by `target` stale in the cache that owns
    /// them.
    pub fn invalidate(&self, target: impl Into<InvalidateTarget>) {
        let target = target.into();
        match self.owning_cache(target.path()) {
            Some(cache) => cache.invalidate(&target),
            None => debug!(target = %target.cache_key(), "nothing owns the invalidated path"),
        }
    }

    /// Force the cached value of `request`.
    pub fn set_cache<T: Serialize>(&self, request: &Request<T>, value: &T) -> Result<()> {
        self.set_cache_value(request.descriptor(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn set_cache_value(&self, request: &RequestDescriptor, value: Value) {
        if let Some(cache) = self.owning_cache(request.path()) {
            cache.set(request, value);
        }
    }

    /// Whether an outside caller would find a handler for `request`.
    pub fn has_handler(&self, request: &RequestDescriptor) -> bool {
        self.lookup_graph()
            .map_or(false, |graph| !resolve(request, &graph, false).is_empty())
    }

    /// Run `fut` as a new root transaction carrying `attributes`.
    pub async fn transaction<F, T>(&self, attributes: Map<String, Value>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        transaction::transaction(attributes, fut).await
    }

    fn lookup_graph(&self) -> Option<HandlerNode> {
        context::current()
            .map(|context| context.graph().clone())
            .or_else(|| self.graph.clone())
    }

    fn owning_cache(&self, path: &[Key]) -> Option<SharedCache> {
        let graph = self.lookup_graph()?;
        resolve_first_raw(path, &graph).map(|found| found.cache)
    }

    fn next_call(&self, kind: RequestKind, request: &RequestDescriptor) -> Result<NextCall> {
        let parent = context::current().or_else(|| request.attached_context().cloned());

        let inherited = parent
            .as_ref()
            .and_then(|parent| parent.transaction().cloned())
            .or_else(transaction::current)
            .filter(|tx| !tx.state().is_closed());
        let (transaction, root) = match inherited {
            Some(tx) => (Some(tx), false),
            None if kind != RequestKind::Query => (Some(Transaction::new(Map::new())), true),
            None => (None, false),
        };

        let options = parent
            .as_ref()
            .map(|parent| parent.options())
            .unwrap_or_default()
            .merge(context::options());

        let graph = match (parent.as_ref().map(|p| p.graph().clone()), &self.graph) {
            (Some(outer), Some(own)) if outer.contains_fragment(own) => outer,
            (Some(outer), Some(own)) => HandlerNode::sequence([outer, own.clone()]),
            (Some(outer), None) => outer,
            (None, Some(own)) => own.clone(),
            (None, None) => {
                return Err(CoreError::NoHandler {
                    path: request.dotted_path(),
                })
            }
        };

        let context = Arc::new(RequestContext::new(
            kind,
            request,
            parent.as_ref().map(|p| p.request_id().clone()),
            graph,
            transaction,
            options,
        ));
        Ok(NextCall {
            context,
            private_scope: parent.is_some(),
            root,
        })
    }
}

fn request_span(context: &RequestContext) -> Span {
    tracing::debug_span!(
        "request",
        request_id = %context.request_id(),
        parent_request_id = ?context.parent_request_id().map(|id| id.as_str()),
        kind = %context.kind(),
        path = %context.request().dotted_path(),
    )
}

fn first_handler(next: &NextCall, request: &RequestDescriptor) -> Result<Resolved> {
    resolve(request, next.context.graph(), next.private_scope)
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::NoHandler {
            path: request.dotted_path(),
        })
}

/// Start `resolved` with `context` as the ambient context, both while the
/// handler builds its future and while that future runs.
fn start(
    context: &Arc<RequestContext>,
    resolved: &Resolved,
    request: &RequestDescriptor,
) -> HandlerFuture {
    let call = context::enter_sync(context.clone(), || resolved.call(request));
    context::with_context(context.clone(), call).boxed()
}

fn bind(context: &Arc<RequestContext>, resolved: &Resolved, request: &RequestDescriptor) -> Invoke {
    let context = context.clone();
    let resolved = resolved.clone();
    let request = request.clone();
    Arc::new(move || start(&context, &resolved, &request))
}

async fn within_transaction<F, T>(next: &NextCall, body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match next.context.transaction() {
        Some(tx) if next.root => transaction::run_root(tx.clone(), body).await,
        existing => transaction::run(existing.cloned(), body).await,
    }
}
