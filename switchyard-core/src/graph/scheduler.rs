//! Reactive Graph
//!
//! The graph owns every node and coordinates reads, invalidation and
//! stabilization. It ensures that sources are always brought up to date before
//! their observers.
//!
//! # Algorithm
//!
//! Push-pull propagation:
//!
//! 1. When a node is refreshed, it becomes `Dirty` and every transitive
//!    observer becomes `MaybeDirty`.
//! 2. Reading a node pulls: a `MaybeDirty` node first updates its sources,
//!    and only recomputes if one of them actually changed value.
//! 3. A recompute that yields a value equal to the previous one does not dirty
//!    the direct observers.
//! 4. A stabilization pass collects every non-clean node, sorts them
//!    topologically (sources before observers) and updates each once.
//!
//! Compute functions run without the graph lock held, so they may read other
//! nodes of the same graph. A derived node forgets its sources when it
//! recomputes and records whatever the new run reads, so a branch it stopped
//! taking no longer dirties it. Each node has a gate held while it
//! recomputes: a second reader of the same dirty node waits and then takes the
//! fresh value.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::node::{ComputeFn, DirtyState, Node, NodeId, NodeKind};
use crate::error::{CoreError, Result};

/// A graph of memoized computations with tracked source/observer edges.
pub struct ReactiveGraph<T> {
    nodes: Mutex<HashMap<NodeId, Node<T>>>,
    equals: fn(&T, &T) -> bool,
}

impl<T: Clone + Send + Sync + 'static> ReactiveGraph<T> {
    /// Create an empty graph using `PartialEq` to detect unchanged values.
    pub fn new() -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(|a, b| a == b)
    }

    /// Create an empty graph with a custom equality policy.
    pub fn with_equality(equals: fn(&T, &T) -> bool) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            equals,
        }
    }

    /// Add a derived node. It is computed lazily on first read.
    pub fn derived<F>(&self, compute: F) -> NodeId
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.insert(Node::new(NodeKind::Derived, Arc::new(compute)))
    }

    /// Add an effect node. It runs during stabilization once one of its
    /// sources changed.
    pub fn effect<F>(&self, run: F) -> NodeId
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.insert(Node::new(NodeKind::Effect, Arc::new(run)))
    }

    fn insert(&self, node: Node<T>) -> NodeId {
        let id = node.id();
        self.nodes.lock().insert(id, node);
        id
    }

    /// Read a node's current value, computing it if stale.
    ///
    /// When `observer` is given, the edge `id -> observer` is recorded on both
    /// ends. Recording an existing edge is a no-op.
    pub fn get(&self, id: NodeId, observer: Option<NodeId>) -> Result<T> {
        {
            let mut nodes = self.nodes.lock();
            let node = nodes.get(&id).ok_or(CoreError::Disposed)?;
            if node.is_disposed() {
                return match node.kind() {
                    NodeKind::Effect => node.value().cloned().ok_or(CoreError::Disposed),
                    NodeKind::Derived => Err(CoreError::Disposed),
                };
            }
            if let Some(observer) = observer {
                link(&mut nodes, id, observer);
            }
        }

        self.update_if_necessary(id);

        let nodes = self.nodes.lock();
        nodes
            .get(&id)
            .and_then(|node| node.value().cloned())
            .ok_or(CoreError::Disposed)
    }

    /// The last computed value, without computing or tracking.
    pub fn peek(&self, id: NodeId) -> Option<T> {
        self.nodes.lock().get(&id).and_then(|node| node.value().cloned())
    }

    /// Record the edge `source -> observer`. Returns `false` when either end
    /// is missing or disposed, or the edge already existed.
    pub fn add_edge(&self, source: NodeId, observer: NodeId) -> bool {
        link(&mut self.nodes.lock(), source, observer)
    }

    /// Remove the edge `source -> observer` from both ends.
    pub fn remove_edge(&self, source: NodeId, observer: NodeId) {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get_mut(&source) {
            node.remove_dependent(observer);
        }
        if let Some(node) = nodes.get_mut(&observer) {
            node.remove_dependency(source);
        }
    }

    /// Replace a node's compute function and mark it (and transitively its
    /// observers) dirty.
    pub fn set<F>(&self, id: NodeId, compute: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.invalidate(id, Some(Arc::new(compute)));
    }

    /// Mark a node dirty so it recomputes with its current compute function.
    pub fn refresh(&self, id: NodeId) {
        self.invalidate(id, None);
    }

    fn invalidate(&self, id: NodeId, compute: Option<ComputeFn<T>>) {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) if !node.is_disposed() => {
                if let Some(compute) = compute {
                    node.set_compute(compute);
                }
                node.mark_dirty();
            }
            _ => return,
        }
        let marked = mark_changed(&mut nodes, id);
        trace!(node = id.raw(), observers = marked, "node invalidated");
    }

    /// Force a node's value. The node now always yields `value`; observers are
    /// dirtied if it differs from the previous one.
    pub fn set_value(&self, id: NodeId, value: T) {
        let mut nodes = self.nodes.lock();
        let changed = match nodes.get_mut(&id) {
            Some(node) if !node.is_disposed() => {
                let constant = value.clone();
                node.set_compute(Arc::new(move || constant.clone()));
                let changed = node
                    .value()
                    .map_or(true, |previous| !(self.equals)(previous, &value));
                node.replace_value(value);
                node.mark_clean();
                changed
            }
            _ => return,
        };
        if changed {
            dirty_observers(&mut nodes, id);
        }
    }

    /// Replace a node's compute function without dirtying anything.
    pub fn replace_compute_silently<F>(&self, id: NodeId, compute: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        if let Some(node) = self.nodes.lock().get_mut(&id) {
            if !node.is_disposed() {
                node.set_compute(Arc::new(compute));
            }
        }
    }

    /// Update a node's stored value in place without notifying observers.
    /// Returns whether the node had a value to update.
    pub fn write_silently(&self, id: NodeId, update: impl FnOnce(&mut T)) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id).and_then(|node| node.value_mut()) {
            Some(value) => {
                update(value);
                true
            }
            None => false,
        }
    }

    /// Mark a node dirty without touching its observers, so the next read
    /// recomputes it.
    pub fn mark_dirty_silently(&self, id: NodeId) {
        if let Some(node) = self.nodes.lock().get_mut(&id) {
            if !node.is_disposed() {
                node.mark_dirty();
            }
        }
    }

    /// Detach a node from all edges and make it inert. The node stays in the
    /// graph as a tombstone so late readers get a clean error.
    pub fn dispose(&self, id: NodeId) {
        let mut nodes = self.nodes.lock();
        detach(&mut nodes, id);
    }

    /// Dispose a node and drop it from the graph entirely.
    pub fn remove(&self, id: NodeId) {
        let mut nodes = self.nodes.lock();
        detach(&mut nodes, id);
        nodes.remove(&id);
    }

    /// Current dirty state of a node.
    pub fn state(&self, id: NodeId) -> Option<DirtyState> {
        self.nodes.lock().get(&id).map(Node::dirty_state)
    }

    /// Whether the node has been disposed (or removed).
    pub fn is_disposed(&self, id: NodeId) -> bool {
        self.nodes.lock().get(&id).map_or(true, Node::is_disposed)
    }

    /// Number of live observers of a node.
    pub fn observer_count(&self, id: NodeId) -> usize {
        self.nodes.lock().get(&id).map_or(0, |node| node.dependents().len())
    }

    /// Number of sources a node reads from.
    pub fn source_count(&self, id: NodeId) -> usize {
        self.nodes
            .lock()
            .get(&id)
            .map_or(0, |node| node.dependencies().len())
    }

    /// Total number of nodes, tombstones included.
    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Bring every non-clean node up to date, sources first. Returns the
    /// number of nodes visited.
    pub fn stabilize(&self) -> usize {
        let order = {
            let nodes = self.nodes.lock();
            let pending: Vec<NodeId> = nodes
                .values()
                .filter(|node| !node.is_disposed() && !node.is_clean())
                .map(Node::id)
                .collect();
            topological_sort(&nodes, pending)
        };

        for &id in &order {
            self.update_if_necessary(id);
        }

        trace!(visited = order.len(), "stabilized");
        order.len()
    }

    fn update_if_necessary(&self, id: NodeId) {
        let sources: Vec<NodeId> = {
            let nodes = self.nodes.lock();
            match nodes.get(&id) {
                Some(node) if !node.is_disposed() => match node.dirty_state() {
                    DirtyState::Clean => return,
                    DirtyState::Dirty => Vec::new(),
                    DirtyState::MaybeDirty => node.dependencies().iter().copied().collect(),
                },
                _ => return,
            }
        };

        for source in sources {
            self.update_if_necessary(source);
            if self.state(id) == Some(DirtyState::Dirty) {
                break;
            }
        }

        match self.state(id) {
            Some(DirtyState::Dirty) => self.recompute(id),
            Some(DirtyState::MaybeDirty) => {
                if let Some(node) = self.nodes.lock().get_mut(&id) {
                    node.mark_clean();
                }
            }
            _ => {}
        }
    }

    fn recompute(&self, id: NodeId) {
        let gate = match self.nodes.lock().get(&id) {
            Some(node) if !node.is_disposed() => node.gate(),
            _ => return,
        };
        let _computing = gate.lock();

        let (compute, version) = {
            let mut nodes = self.nodes.lock();
            let node = match nodes.get_mut(&id) {
                // Someone else recomputed while we waited.
                Some(node) if !node.is_disposed() && node.dirty_state() == DirtyState::Dirty => {
                    node
                }
                _ => return,
            };
            let (compute, version) = (node.compute_fn(), node.version());
            if node.kind() == NodeKind::Derived {
                let sources = node.take_dependencies();
                for source in sources {
                    if let Some(node) = nodes.get_mut(&source) {
                        node.remove_dependent(id);
                    }
                }
            }
            (compute, version)
        };
        let Some(compute) = compute else { return };

        let value = compute();

        let mut nodes = self.nodes.lock();
        let changed = match nodes.get_mut(&id) {
            Some(node) if !node.is_disposed() => {
                let changed = node
                    .value()
                    .map_or(true, |previous| !(self.equals)(previous, &value));
                node.replace_value(value);
                // Invalidated again while computing: stay dirty.
                if node.version() == version {
                    node.mark_clean();
                }
                changed
            }
            _ => return,
        };
        if changed {
            dirty_observers(&mut nodes, id);
        }
        trace!(node = id.raw(), changed, "recomputed");
    }
}

impl<T: Clone + Send + Sync + PartialEq + 'static> Default for ReactiveGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn link<T>(nodes: &mut HashMap<NodeId, Node<T>>, source: NodeId, observer: NodeId) -> bool {
    if source == observer {
        return false;
    }
    let live = |id: &NodeId| nodes.get(id).map_or(false, |node| !node.is_disposed());
    if !live(&source) || !live(&observer) {
        return false;
    }
    let mut added = false;
    if let Some(node) = nodes.get_mut(&source) {
        added = node.add_dependent(observer);
    }
    if let Some(node) = nodes.get_mut(&observer) {
        node.add_dependency(source);
    }
    if added {
        trace!(source = source.raw(), observer = observer.raw(), "edge added");
    }
    added
}

fn detach<T>(nodes: &mut HashMap<NodeId, Node<T>>, id: NodeId) {
    let Some(node) = nodes.get_mut(&id) else { return };
    let (sources, observers) = node.dispose();
    for source in sources {
        if let Some(node) = nodes.get_mut(&source) {
            node.remove_dependent(id);
        }
    }
    for observer in observers {
        if let Some(node) = nodes.get_mut(&observer) {
            node.remove_dependency(id);
        }
    }
}

/// Mark the direct observers of a changed node dirty and everything beyond
/// them maybe-dirty.
fn dirty_observers<T>(nodes: &mut HashMap<NodeId, Node<T>>, id: NodeId) {
    let observers: Vec<NodeId> = match nodes.get(&id) {
        Some(node) => node.dependents().iter().copied().collect(),
        None => return,
    };
    for observer in observers {
        if let Some(node) = nodes.get_mut(&observer) {
            node.mark_dirty();
        }
        mark_changed(nodes, observer);
    }
}

/// Propagate maybe-dirty to every transitive observer of `source_id`.
/// Returns how many nodes were visited.
fn mark_changed<T>(nodes: &mut HashMap<NodeId, Node<T>>, source_id: NodeId) -> usize {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();

    if let Some(source) = nodes.get(&source_id) {
        queue.extend(source.dependents().iter().copied());
    }

    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id) {
            continue;
        }
        if let Some(node) = nodes.get_mut(&node_id) {
            node.mark_maybe_dirty();
            queue.extend(node.dependents().iter().copied());
        }
    }

    visited.len()
}

/// Order `pending` so that sources come before their observers (Kahn).
/// Nodes caught in a cycle are left out and recompute on their next read.
fn topological_sort<T>(nodes: &HashMap<NodeId, Node<T>>, pending: Vec<NodeId>) -> Vec<NodeId> {
    let pending_set: HashSet<_> = pending.iter().copied().collect();
    let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
    let mut result = Vec::with_capacity(pending.len());
    let mut queue = VecDeque::new();

    for &node_id in &pending {
        if let Some(node) = nodes.get(&node_id) {
            let degree = node
                .dependencies()
                .iter()
                .filter(|d| pending_set.contains(d))
                .count();
            in_degree.insert(node_id, degree);
            if degree == 0 {
                queue.push_back(node_id);
            }
        }
    }

    while let Some(node_id) = queue.pop_front() {
        result.push(node_id);

        if let Some(node) = nodes.get(&node_id) {
            for dependent_id in node.dependents() {
                if let Some(degree) = in_degree.get_mut(dependent_id) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(*dependent_id);
                    }
                }
            }
        }
    }

    result
}
