//! Request caches.
//!
//! [`RequestCache`] is the seam between the invokers and memoization. The
//! default strategy runs every call; [`ReactiveCache`] memoizes queries in a
//! reactive graph and refreshes them after writes.

mod hydration;
mod reactive;
mod stabilizer;
mod strategy;

pub use hydration::{extract_scripts, render_script, Snapshot};
pub use reactive::{CachedValue, PendingValue, ReactiveCache};
pub use stabilizer::DeferredStabilizer;
pub use strategy::{
    default_cache, DispatchInvoke, InvalidateTarget, Invoke, PassThroughCache, RequestCache,
    SharedCache,
};
