//! Task handlers and the name -> handler registry.
//!
//! `Handler` uses RPITIT, so it is not object-safe on its own. Dynamic
//! dispatch goes through a blanket impl:
//! 1. `HandlerDyn` is the object-safe twin with a boxed future
//! 2. every `T: Handler` gets `HandlerDyn` for free
//! 3. `BoxHandler` wraps `Arc<dyn HandlerDyn>` and delegates

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use flowstate_types::StatesError;

use crate::context::ExecutionContext;

/// A host-supplied function invoked by Task states (and by Map readers,
/// batchers and writers) under the name given in `Resource`.
pub trait Handler: Send + Sync + 'static {
    fn invoke(
        &self,
        input: Value,
        ctx: ExecutionContext,
    ) -> impl Future<Output = Result<Value, StatesError>> + Send;
}

/// Object-safe version of [`Handler`] with a boxed future.
pub trait HandlerDyn: Send + Sync {
    fn invoke_boxed(
        &self,
        input: Value,
        ctx: ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StatesError>> + Send + '_>>;
}

impl<T: Handler> HandlerDyn for T {
    fn invoke_boxed(
        &self,
        input: Value,
        ctx: ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StatesError>> + Send + '_>> {
        Box::pin(self.invoke(input, ctx))
    }
}

/// Type-erased, cheaply clonable handler.
#[derive(Clone)]
pub struct BoxHandler {
    inner: Arc<dyn HandlerDyn>,
}

impl BoxHandler {
    pub fn new<T: Handler>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn invoke(&self, input: Value, ctx: ExecutionContext) -> Result<Value, StatesError> {
        self.inner.invoke_boxed(input, ctx).await
    }
}

impl fmt::Debug for BoxHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxHandler")
    }
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StatesError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StatesError>> + Send + 'static,
{
    fn invoke(
        &self,
        input: Value,
        ctx: ExecutionContext,
    ) -> impl Future<Output = Result<Value, StatesError>> + Send {
        (self.f)(input, ctx)
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Name -> handler mapping, populated by the host before execution.
///
/// Clones share the underlying map; registering on a clone copies it first.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, BoxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Handler>(&mut self, name: impl Into<String>, handler: T) {
        Arc::make_mut(&mut self.handlers).insert(name.into(), BoxHandler::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StatesError>> + Send + 'static,
    {
        self.register(name, FnHandler::new(f));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: Handler>(mut self, name: impl Into<String>, handler: T) -> Self {
        self.register(name, handler);
        self
    }

    /// Builder-style [`register_fn`](Self::register_fn).
    pub fn with_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StatesError>> + Send + 'static,
    {
        self.register_fn(name, f);
        self
    }

    pub fn get(&self, name: &str) -> Option<BoxHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
