//! Reactive Node Engine
//!
//! This module implements the dependency graph that backs the reactive cache.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are memoized computations (derived nodes) or side-effect-only
//!   computations (effects)
//! - Edges are dependencies: if A reads B, there is an edge from B to A
//!
//! When a node is refreshed, we traverse the graph to find every affected node
//! and mark it. Reads and stabilization passes then decide which marked nodes
//! actually need to recompute.
//!
//! The graph is centralized and indexed by node ID. Both forward
//! (dependencies) and reverse (dependents) edges are stored so it can be
//! walked in either direction.

mod effect;
mod node;
mod scheduler;

pub use effect::Subscription;
pub use node::{DirtyState, Node, NodeId, NodeKind};
pub use scheduler::ReactiveGraph;
