//! Request descriptors: the unit of addressing.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use super::key::{CacheKey, Key};
use crate::context::{self, RequestContext};
use crate::error::{CoreError, Result};

/// A hierarchical request path. Most paths are two or three segments deep.
pub type Path = SmallVec<[Key; 4]>;

/// A step applied to a query or mutation result after it leaves the cache.
pub type Transform = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// An untyped request: a path plus positional JSON arguments.
///
/// A descriptor remembers the ambient context that was active when it was
/// built, so a request created inside a handler and invoked later still
/// resolves against its creator's scope when nothing fresher is active.
/// The snapshot does not take part in equality or serialization, and
/// neither do the [`select`](Self::select) transforms.
#[derive(Clone)]
pub struct RequestDescriptor {
    path: Path,
    args: Vec<Value>,
    transforms: Vec<Transform>,
    context: Option<Arc<RequestContext>>,
}

impl RequestDescriptor {
    /// Build a descriptor, capturing the current ambient context.
    pub fn new<I, K>(path: I, args: Vec<Value>) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            args,
            transforms: Vec::new(),
            context: context::current(),
        }
    }

    /// The same request with `transform` appended to its result transforms.
    ///
    /// Transforms run in order on the value handed back to the caller. The
    /// cache keeps the untransformed result, so requests that differ only in
    /// their selections share one entry.
    pub fn select<F>(&self, transform: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let mut selected = self.clone();
        selected.transforms.push(Arc::new(transform));
        selected
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Run the transforms over a result.
    pub fn apply_transforms(&self, value: Value) -> Result<Value> {
        self.transforms
            .iter()
            .try_fold(value, |value, transform| transform(value))
    }

    /// The request path.
    pub fn path(&self) -> &[Key] {
        &self.path
    }

    /// Positional arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Canonical cache identity of this request.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::for_request(&self.path, &self.args)
    }

    /// Path rendered as `a.b.c`, used in errors and log fields.
    pub fn dotted_path(&self) -> String {
        dotted(&self.path)
    }

    /// The context captured when this descriptor was built, if any.
    pub fn attached_context(&self) -> Option<&Arc<RequestContext>> {
        self.context.as_ref()
    }

    /// Replace the attached context snapshot.
    pub fn with_context(mut self, context: Option<Arc<RequestContext>>) -> Self {
        self.context = context;
        self
    }

    /// A copy without the context snapshot.
    pub fn detached(&self) -> Self {
        Self {
            path: self.path.clone(),
            args: self.args.clone(),
            transforms: self.transforms.clone(),
            context: None,
        }
    }

    /// Same arguments and snapshot, different path.
    pub fn with_path<I, K>(&self, path: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            args: self.args.clone(),
            transforms: self.transforms.clone(),
            context: self.context.clone(),
        }
    }

    /// Wire form `{ "type": [...], "payload": [...] }`.
    pub fn to_wire(&self) -> WireRequest {
        WireRequest {
            path: self.path.iter().map(|k| k.as_str().to_owned()).collect(),
            payload: self.args.clone(),
        }
    }

    /// Wire form as a JSON value; this is what topic listeners receive.
    pub fn to_wire_value(&self) -> Value {
        let WireRequest { path, payload } = self.to_wire();
        serde_json::json!({ "type": path, "payload": payload })
    }
}

impl PartialEq for RequestDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.cache_key() == other.cache_key()
    }
}

impl Eq for RequestDescriptor {}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("transforms", &self.transforms.len())
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl From<WireRequest> for RequestDescriptor {
    fn from(wire: WireRequest) -> Self {
        Self::new(wire.path, wire.payload)
    }
}

/// Serialized request as exchanged with transport collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    /// Request path.
    #[serde(rename = "type")]
    pub path: Vec<String>,
    /// Positional arguments.
    pub payload: Vec<Value>,
}

/// A descriptor tagged with the type its handler produces.
pub struct Request<T> {
    descriptor: RequestDescriptor,
    _result: PhantomData<fn() -> T>,
}

impl<T> Request<T> {
    /// Build a typed request, capturing the current ambient context.
    pub fn new<I, K>(path: I, args: Vec<Value>) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        RequestDescriptor::new(path, args).into()
    }

    /// Borrow the untyped descriptor.
    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    /// Take the untyped descriptor.
    pub fn into_descriptor(self) -> RequestDescriptor {
        self.descriptor
    }

    /// Map the result through `f` once it is available.
    ///
    /// ```rust,ignore
    /// let names: Request<Vec<String>> = Catalog::list().select(|items: Vec<Item>| {
    ///     items.into_iter().map(|item| item.name).collect()
    /// });
    /// ```
    pub fn select<U, F>(&self, f: F) -> Request<U>
    where
        T: DeserializeOwned + 'static,
        U: Serialize + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.descriptor
            .select(move |value| {
                let input: T = serde_json::from_value(value)?;
                Ok(serde_json::to_value(f(input))?)
            })
            .into()
    }
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            _result: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Request").field(&self.descriptor).finish()
    }
}

impl<T> From<RequestDescriptor> for Request<T> {
    fn from(descriptor: RequestDescriptor) -> Self {
        Self {
            descriptor,
            _result: PhantomData,
        }
    }
}

impl<T> From<Request<T>> for RequestDescriptor {
    fn from(request: Request<T>) -> Self {
        request.descriptor
    }
}

/// Positional handler arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// Wrap positional arguments.
    pub fn new(args: Vec<Value>) -> Self {
        Self(args)
    }

    /// Decode the argument at `index`.
    ///
    /// A missing argument decodes from `null`, so `Option<T>` parameters may be
    /// omitted by the caller.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|err| CoreError::Argument {
            index,
            message: err.to_string(),
        })
    }

    /// Raw argument at `index`.
    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Number of arguments supplied.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no arguments were supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take the raw arguments.
    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(args: Vec<Value>) -> Self {
        Self(args)
    }
}

/// Convert a typed argument for a request builder.
///
/// Types whose `Serialize` impl can fail (maps with non-string keys) are
/// encoded as `null` and the failure is logged.
pub fn to_arg<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "request argument is not representable as JSON");
        Value::Null
    })
}

pub(crate) fn dotted(path: &[Key]) -> String {
    path.iter()
        .map(Key::as_str)
        .collect::<Vec<_>>()
        .join(".")
}

/// Generate typed request builders for a handler record.
///
/// ```rust,ignore
/// switchyard_core::requests! {
///     pub struct Counter = "Counter" {
///         fn get_count() -> i64 = "getCount";
///         fn add(amount: i64) -> i64 = "add";
///     }
/// }
///
/// let request = Counter::add(2); // Request<i64> for ["Counter", "add"]
/// ```
#[macro_export]
macro_rules! requests {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident = $prefix:literal {
            $(
                $(#[$fmeta:meta])*
                fn $method:ident ( $( $arg:ident : $argty:ty ),* $(,)? ) -> $ret:ty = $key:literal ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $name {
            /// Path prefix shared by every request of this record.
            pub const PREFIX: &'static str = $prefix;

            $(
                $(#[$fmeta])*
                pub fn $method( $( $arg : $argty ),* ) -> $crate::Request<$ret> {
                    $crate::Request::new(
                        [$prefix, $key],
                        vec![ $( $crate::request::to_arg(&$arg) ),* ],
                    )
                }
            )*
        }
    };
}
