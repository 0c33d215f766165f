//! Handler graph and resolution.

mod node;
mod resolver;

pub use node::{
    Handler, HandlerFuture, HandlerNode, HandlerRecord, InjectPayload, Injectable, OnInjectFn,
    UnwrapFn,
};
pub use resolver::{resolve, resolve_first_raw, RawMatch, Resolved, Target};
