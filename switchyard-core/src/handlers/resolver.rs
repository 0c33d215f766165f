//! Handler resolution.
//!
//! Resolution walks a request path through the handler graph segment by
//! segment. Every record passed on the way may override the cache; the
//! override closest to the handler wins.

use tracing::debug;

use super::node::{Handler, HandlerFuture, HandlerNode, HandlerRecord, UnwrapFn};
use crate::cache::{default_cache, SharedCache};
use crate::request::{Args, Key, Path, RequestDescriptor};

/// How a resolved handler is called.
#[derive(Clone)]
pub enum Target {
    /// Called with the request's positional arguments.
    Handler(Handler),
    /// Reached with path left over: called with the wire form of the request.
    Topic(Handler),
    /// A pass-through record: receives the request with the path that was
    /// still left when the record was reached.
    Unwrap { hook: UnwrapFn, remaining: Path },
}

/// A handler together with the cache that owns its results.
#[derive(Clone)]
pub struct Resolved {
    pub target: Target,
    pub cache: SharedCache,
}

impl Resolved {
    /// Call the handler for `request`.
    pub fn call(&self, request: &RequestDescriptor) -> HandlerFuture {
        match &self.target {
            Target::Handler(handler) => handler.call(Args::new(request.args().to_vec())),
            Target::Topic(handler) => handler.call(Args::new(vec![request.to_wire_value()])),
            Target::Unwrap { hook, remaining } => hook(request.with_path(remaining.iter())),
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self.target, Target::Topic(_))
    }
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.target {
            Target::Handler(_) => "handler",
            Target::Topic(_) => "topic",
            Target::Unwrap { .. } => "unwrap",
        };
        f.debug_struct("Resolved").field("target", &target).finish()
    }
}

/// Find every handler for `request`.
///
/// Private (`internal`) nodes are searched, with the same remaining path,
/// only when `private_scope` is set; they are searched before the record's
/// public children. `query` and `mutate` use the first match, `dispatch`
/// uses all of them.
pub fn resolve(
    request: &RequestDescriptor,
    graph: &HandlerNode,
    private_scope: bool,
) -> Vec<Resolved> {
    let mut found = Vec::new();
    walk(graph, request.path(), &default_cache(), private_scope, &mut found);
    debug!(
        path = %request.dotted_path(),
        private_scope,
        matches = found.len(),
        "resolved handlers"
    );
    found
}

fn walk(
    node: &HandlerNode,
    path: &[Key],
    cache: &SharedCache,
    private_scope: bool,
    found: &mut Vec<Resolved>,
) {
    match node {
        HandlerNode::Leaf(handler) => {
            let target = if path.is_empty() {
                Target::Handler(handler.clone())
            } else {
                Target::Topic(handler.clone())
            };
            found.push(Resolved {
                target,
                cache: cache.clone(),
            });
        }
        HandlerNode::Sequence(nodes) => {
            for node in nodes.iter() {
                walk(node, path, cache, private_scope, found);
            }
        }
        HandlerNode::Record(record) => {
            let cache = owning_cache(record, cache);

            if let Some(hook) = record.unwrap_hook() {
                found.push(Resolved {
                    target: Target::Unwrap {
                        hook: hook.clone(),
                        remaining: path.iter().cloned().collect(),
                    },
                    cache,
                });
                return;
            }

            if private_scope {
                if let Some(internal) = record.internal_node() {
                    walk(internal, path, &cache, private_scope, found);
                }
            }

            let Some((first, rest)) = path.split_first() else {
                return;
            };
            if let Some(next) = record.get(first) {
                walk(next, rest, &cache, private_scope, found);
            }
        }
        HandlerNode::Value(_) => {}
    }
}

/// The raw node at a path, and the cache that owns it.
#[derive(Debug, Clone)]
pub struct RawMatch {
    pub node: HandlerNode,
    pub cache: SharedCache,
}

/// Find the first node at `path` without binding it as a callable.
///
/// Used for injection and for locating the cache that owns a path. Private
/// nodes are always searched first. When the path ends on a record, that
/// record's own cache override applies.
pub fn resolve_first_raw(path: &[Key], graph: &HandlerNode) -> Option<RawMatch> {
    first(graph, path, &default_cache())
}

fn first(node: &HandlerNode, path: &[Key], cache: &SharedCache) -> Option<RawMatch> {
    match node {
        HandlerNode::Sequence(nodes) => nodes.iter().find_map(|node| first(node, path, cache)),
        HandlerNode::Record(record) => {
            let cache = owning_cache(record, cache);
            if path.is_empty() {
                return Some(RawMatch {
                    node: node.clone(),
                    cache,
                });
            }
            if let Some(found) = record
                .internal_node()
                .and_then(|internal| first(internal, path, &cache))
            {
                return Some(found);
            }
            let (head, rest) = path.split_first()?;
            first(record.get(head)?, rest, &cache)
        }
        _ if path.is_empty() => Some(RawMatch {
            node: node.clone(),
            cache: cache.clone(),
        }),
        _ => None,
    }
}

fn owning_cache(record: &HandlerRecord, inherited: &SharedCache) -> SharedCache {
    record
        .cache_override()
        .cloned()
        .unwrap_or_else(|| inherited.clone())
}
