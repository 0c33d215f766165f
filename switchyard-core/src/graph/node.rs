//! Graph Nodes
//!
//! This module defines the node types that live in the reactive graph.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Unique identifier for a node in the reactive graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of node in the reactive graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A memoized computation. Recomputed lazily when read, or during a
    /// stabilization pass.
    Derived,

    /// A side-effect-only computation. Run eagerly during stabilization and
    /// tolerant of being read after disposal.
    Effect,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// A transitive source changed. The direct sources must be brought up to
    /// date before we know whether this node has to recompute.
    MaybeDirty,

    /// The node definitely needs to recompute.
    Dirty,
}

pub(crate) type ComputeFn<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// A node in the reactive graph.
///
/// Edges are stored on both ends: `dependencies` are the nodes this node
/// reads from (sources), `dependents` the nodes that read from it
/// (observers). The graph keeps both lists consistent.
pub struct Node<T> {
    id: NodeId,
    kind: NodeKind,
    dirty: DirtyState,
    dependencies: HashSet<NodeId>,
    dependents: HashSet<NodeId>,
    compute: Option<ComputeFn<T>>,
    value: Option<T>,
    version: u64,
    disposed: bool,
    /// Held for the duration of a recompute so concurrent readers of the
    /// same dirty node run its compute once.
    gate: Arc<Mutex<()>>,
}

impl<T> Node<T> {
    pub(crate) fn new(kind: NodeKind, compute: ComputeFn<T>) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            dirty: match kind {
                NodeKind::Derived => DirtyState::Dirty, // computed on first read
                NodeKind::Effect => DirtyState::Clean,
            },
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
            compute: Some(compute),
            value: None,
            version: 0,
            disposed: false,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Get the current dirty state.
    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    /// Check if the node needs any processing.
    pub fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    /// Whether the node has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// The last computed value, if any.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Sources this node reads from.
    pub fn dependencies(&self) -> &HashSet<NodeId> {
        &self.dependencies
    }

    /// Observers that read from this node.
    pub fn dependents(&self) -> &HashSet<NodeId> {
        &self.dependents
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    pub(crate) fn mark_maybe_dirty(&mut self) {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
        self.version += 1;
    }

    /// Bumped every time the node is marked dirty. A recompute that started
    /// at an older version must not mark the node clean.
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn add_dependency(&mut self, node_id: NodeId) -> bool {
        self.dependencies.insert(node_id)
    }

    pub(crate) fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.remove(&node_id);
    }

    pub(crate) fn add_dependent(&mut self, node_id: NodeId) -> bool {
        self.dependents.insert(node_id)
    }

    pub(crate) fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.remove(&node_id);
    }

    /// Drop every source edge on this end. The caller removes the
    /// counterpart entries.
    pub(crate) fn take_dependencies(&mut self) -> HashSet<NodeId> {
        std::mem::take(&mut self.dependencies)
    }

    pub(crate) fn gate(&self) -> Arc<Mutex<()>> {
        self.gate.clone()
    }

    pub(crate) fn compute_fn(&self) -> Option<ComputeFn<T>> {
        self.compute.clone()
    }

    pub(crate) fn set_compute(&mut self, compute: ComputeFn<T>) {
        self.compute = Some(compute);
    }

    pub(crate) fn value_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    pub(crate) fn replace_value(&mut self, value: T) -> Option<T> {
        self.value.replace(value)
    }

    /// Make the node inert. Returns the edges it held so the graph can
    /// remove the counterpart entries.
    pub(crate) fn dispose(&mut self) -> (HashSet<NodeId>, HashSet<NodeId>) {
        self.disposed = true;
        self.compute = None;
        self.dirty = DirtyState::Clean;
        (
            std::mem::take(&mut self.dependencies),
            std::mem::take(&mut self.dependents),
        )
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dirty", &self.dirty)
            .field("dependencies", &self.dependencies.len())
            .field("dependents", &self.dependents.len())
            .field("has_value", &self.value.is_some())
            .field("disposed", &self.disposed)
            .finish()
    }
}
