//! Request Descriptors
//!
//! A request is a hierarchical path plus positional JSON arguments. Its
//! identity for caching is the canonical serialization of both (see
//! [`CacheKey`]), never object identity.
//!
//! Typed requests ([`Request<T>`]) carry the handler's result type as a
//! phantom parameter; [`requests!`](crate::requests) generates typed builders
//! for a record's handlers.

mod descriptor;
mod key;

pub use descriptor::{to_arg, Args, Path, Request, RequestDescriptor, Transform, WireRequest};
pub use key::{canonical_json, CacheKey, Key};

pub(crate) use descriptor::dotted;
