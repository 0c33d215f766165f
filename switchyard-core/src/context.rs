//! Ambient Request Context
//!
//! The request context tracks which request is currently being served. This
//! enables dependency injection and call nesting without threading parameters:
//! a handler can ask for an injectable, or issue a nested request, and the
//! nested request knows its parent.
//!
//! # Implementation
//!
//! The context is a `tokio::task_local!`. It follows the logical call across
//! suspension points rather than the physical thread, and every scope restores
//! the previous value when it exits, whether the body returned, failed or
//! panicked. Nested scopes stack naturally.

use std::any::{type_name, Any};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::handlers::{resolve_first_raw, HandlerNode, InjectPayload, Injectable};
use crate::request::{dotted, Key, RequestDescriptor};
use crate::transaction::{self, Transaction};

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
    static OPTIONS: RequestOptions;
}

/// The verb a request was issued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Query,
    Mutate,
    Dispatch,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutate => "mutate",
            Self::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options. Options are ambient and inherited by nested requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Run queries without going through the cache.
    pub no_cache: bool,
}

impl RequestOptions {
    pub(crate) fn merge(self, other: RequestOptions) -> Self {
        Self {
            no_cache: self.no_cache || other.no_cache,
        }
    }
}

/// Random identifier given to every invocation, used to correlate logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Eight random hex digits.
    pub fn random() -> Self {
        Self(format!("{:08x}", rand::random::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of one invocation, visible to its handler and to every request the
/// handler issues.
pub struct RequestContext {
    kind: RequestKind,
    request: RequestDescriptor,
    request_id: RequestId,
    parent_request_id: Option<RequestId>,
    graph: HandlerNode,
    transaction: Option<Arc<Transaction>>,
    options: RequestOptions,
}

impl RequestContext {
    pub(crate) fn new(
        kind: RequestKind,
        request: &RequestDescriptor,
        parent_request_id: Option<RequestId>,
        graph: HandlerNode,
        transaction: Option<Arc<Transaction>>,
        options: RequestOptions,
    ) -> Self {
        Self {
            kind,
            // The stored copy must not point back at older contexts.
            request: request.detached(),
            request_id: RequestId::random(),
            parent_request_id,
            graph,
            transaction,
            options,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// The request being served.
    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn parent_request_id(&self) -> Option<&RequestId> {
        self.parent_request_id.as_ref()
    }

    /// The handler graph nested requests resolve against.
    pub fn graph(&self) -> &HandlerNode {
        &self.graph
    }

    /// The open unit of work, if this request runs inside one.
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    pub fn options(&self) -> RequestOptions {
        self.options
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("kind", &self.kind)
            .field("path", &self.request.dotted_path())
            .field("request_id", &self.request_id)
            .field("parent_request_id", &self.parent_request_id)
            .field("in_transaction", &self.transaction.is_some())
            .field("options", &self.options)
            .finish()
    }
}

/// The context of the request currently being served, if any.
pub fn current() -> Option<Arc<RequestContext>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Run `fut` with `context` installed as the ambient context.
pub async fn with_context<F: Future>(context: Arc<RequestContext>, fut: F) -> F::Output {
    CURRENT.scope(context, fut).await
}

/// Synchronous variant of [`with_context`].
pub fn enter_sync<R>(context: Arc<RequestContext>, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(context, f)
}

/// Options installed by an enclosing [`no_cache`] scope.
pub fn options() -> RequestOptions {
    OPTIONS.try_with(|options| *options).unwrap_or_default()
}

/// Run `fut` so that every query it issues bypasses the cache.
pub async fn no_cache<F: Future>(fut: F) -> F::Output {
    let options = options().merge(RequestOptions { no_cache: true });
    OPTIONS.scope(options, fut).await
}

/// The verb of the request currently being served.
pub fn current_request_kind() -> Result<RequestKind> {
    current()
        .map(|context| context.kind())
        .ok_or(CoreError::NoContext {
            operation: "current_request_kind",
        })
}

/// Wrap `fut` so it sees the caller's context, options and transaction even
/// when it is spawned as a separate task.
pub fn propagate<F>(fut: F) -> BoxFuture<'static, F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    let fut = transaction::carry(fut);
    let fut = match OPTIONS.try_with(|options| *options) {
        Ok(options) => OPTIONS.scope(options, fut).boxed(),
        Err(_) => fut,
    };
    match current() {
        Some(context) => CURRENT.scope(context, fut).boxed(),
        None => fut,
    }
}

/// Resolve the injectable named `key`.
///
/// The lookup starts in the record that owns the current request and walks
/// outward to the graph root, so a handler at `["Orders", "place"]` asking
/// for `"repository"` tries `["Orders", "repository"]` and then
/// `["repository"]`. Private (`internal`) nodes are always searched.
pub fn inject<T: Any + Send + Sync>(key: impl Into<Key>) -> Result<Arc<T>> {
    let context = current().ok_or(CoreError::NoContext { operation: "inject" })?;
    let key = key.into();
    let scope = context.request().path();
    let owner = &scope[..scope.len().saturating_sub(1)];

    for depth in (0..=owner.len()).rev() {
        let mut path = owner[..depth].to_vec();
        path.push(key.clone());
        if let Some(found) = resolve_first_raw(&path, context.graph()) {
            return materialize(&context, path, found.node);
        }
    }

    Err(CoreError::NoInjectable {
        path: key.to_string(),
    })
}

/// Resolve the injectable at an absolute `path`.
pub fn inject_path<T, I, K>(path: I) -> Result<Arc<T>>
where
    T: Any + Send + Sync,
    I: IntoIterator<Item = K>,
    K: Into<Key>,
{
    let context = current().ok_or(CoreError::NoContext {
        operation: "inject_path",
    })?;
    let path: Vec<Key> = path.into_iter().map(Into::into).collect();
    match resolve_first_raw(&path, context.graph()) {
        Some(found) => materialize(&context, path, found.node),
        None => Err(CoreError::NoInjectable {
            path: dotted(&path),
        }),
    }
}

fn materialize<T: Any + Send + Sync>(
    context: &Arc<RequestContext>,
    path: Vec<Key>,
    node: HandlerNode,
) -> Result<Arc<T>> {
    let dotted_path = dotted(&path);
    let wrong_type = || CoreError::InjectableType {
        path: dotted_path.clone(),
        expected: type_name::<T>(),
    };

    let value: Injectable = match node {
        HandlerNode::Value(value) => value,
        HandlerNode::Record(record) => match record.on_inject_hook() {
            Some(hook) => hook(InjectPayload {
                path,
                context: Some(context.clone()),
            })?,
            None => return Err(wrong_type()),
        },
        _ => return Err(wrong_type()),
    };

    value.downcast::<T>().map_err(|_| wrong_type())
}
