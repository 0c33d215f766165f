//! Effect Subscriptions
//!
//! An effect is a side-effect-only node that re-runs whenever a source it
//! observes changes value during stabilization. Effects back UI-style
//! subscriptions: the listener is told about new values, and the handle
//! disposes the effect node when dropped.
//!
//! Effects never fail on teardown races: reading a disposed effect yields its
//! last value, and an effect whose graph is already gone simply does nothing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::node::NodeId;
use super::scheduler::ReactiveGraph;

/// Handle to an effect node. Dropping it disposes the node.
pub struct Subscription<T: Clone + Send + Sync + 'static> {
    graph: Weak<ReactiveGraph<T>>,
    id: NodeId,
    disposed: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    /// Observe `source`, calling `listener` with its new value each time it
    /// changes. The listener does not run for the current value.
    pub fn new<F>(graph: &Arc<ReactiveGraph<T>>, source: NodeId, listener: F) -> Self
    where
        T: Default,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(graph);
        let id = graph.effect(move || {
            let Some(value) = weak.upgrade().and_then(|graph| graph.peek(source)) else {
                return T::default();
            };
            listener(&value);
            value
        });
        graph.add_edge(source, id);

        Self {
            graph: Arc::downgrade(graph),
            id,
            disposed: AtomicBool::new(false),
        }
    }

    /// The effect node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Stop listening. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(graph) = self.graph.upgrade() {
            graph.remove(self.id);
        }
    }

    /// Whether the subscription has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
