//! Switchyard Core
//!
//! Request routing for handler graphs. A request is a path of keys plus
//! positional JSON arguments. It is resolved against a tree of handler
//! records and runs with an ambient context that nested requests inherit.
//!
//! - `request`: descriptors, canonical cache keys and typed request builders
//! - `handlers`: handler records, composition and path resolution
//! - `context`: the ambient request context and dependency injection
//! - `transaction`: follow-up work tracking for writes
//! - `invokers`: `query`, `mutate`, `dispatch` and friends
//! - `cache`: pass-through and reactive request caches
//! - `graph`: the reactive node engine behind the reactive cache
//! - `transport`: HTTP mapping and streaming frames
//!
//! # Example
//!
//! ```rust,ignore
//! use switchyard_core::{Args, HandlerRecord, Invokers, ReactiveCache, Request};
//!
//! let counter = HandlerRecord::new()
//!     .cache(ReactiveCache::shared())
//!     .child(
//!         "Counter",
//!         HandlerRecord::new()
//!             .handler("getCount", |_args: Args| async move { Ok(load_count().await) })
//!             .handler("add", |args: Args| async move {
//!                 let amount: i64 = args.get(0)?;
//!                 Ok(store_add(amount).await)
//!             }),
//!     );
//!
//! let invokers = Invokers::new(counter);
//! let count: i64 = invokers.query(&Request::new(["Counter", "getCount"], vec![])).await?;
//! invokers.mutate(&Request::<i64>::new(["Counter", "add"], vec![2.into()])).await?;
//! // The mutation refreshed `["Counter", ..]`, so this reads the new value.
//! let count: i64 = invokers.query(&Request::new(["Counter", "getCount"], vec![])).await?;
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod handlers;
pub mod invokers;
pub mod request;
pub mod transaction;
pub mod transport;

pub use cache::{
    InvalidateTarget, PassThroughCache, ReactiveCache, RequestCache, SharedCache, Snapshot,
};
pub use config::{CacheConfig, EvictionPolicy, StabilizeMode};
pub use context::{inject, inject_path, no_cache, RequestContext, RequestKind, RequestOptions};
pub use error::{CoreError, Result};
pub use handlers::{Handler, HandlerNode, HandlerRecord};
pub use invokers::Invokers;
pub use request::{Args, CacheKey, Key, Request, RequestDescriptor};
pub use transaction::{transaction, Transaction, TransactionState};
