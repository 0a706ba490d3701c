//! The per-invocation request context passed through the middleware chain.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use bytes::Bytes;
use uuid::Uuid;

use crate::transport::Connection;

/// A type-keyed side-table for middleware-contributed request state.
///
/// The source language lets middleware bolt arbitrary fields onto a dynamic
/// request object; a statically typed target models that as one value per
/// concrete type rather than recreating a property bag (`spec.md` §9,
/// "Dynamic context bag"). A middleware that wants to stash a value calls
/// [`Extensions::insert`]; a later middleware or the handler reads it back
/// with [`Extensions::get`].
#[derive(Default)]
pub struct Extensions {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// An empty side-table.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Insert a value, replacing any existing value of the same type and
    /// returning it.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    /// Borrow the value of type `T`, if one was inserted.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    /// Mutably borrow the value of type `T`, if one was inserted.
    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut::<T>())
    }

    /// Remove and return the value of type `T`, if one was inserted.
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Per-invocation state passed to every middleware and the handler.
///
/// Allocated fresh for each inbound call (`spec.md` §3, "Lifetime: exactly
/// one invocation") and dropped once the chain returns.
pub struct RequestContext {
    /// The method name the peer invoked.
    pub method: String,
    /// The inbound payload. The encoding adapter middleware replaces this
    /// with the decoded form it produces; downstream middleware and the
    /// handler observe the mutation.
    pub value: Bytes,
    /// A handle to the connection the request arrived on.
    pub connection: Arc<dyn Connection>,
    /// A fresh UUIDv4 minted by the router for this invocation.
    pub request_id: Uuid,
    /// Middleware-contributed side-table.
    pub extensions: Extensions,
}

impl RequestContext {
    /// Build a new per-request context with a freshly minted request id.
    #[must_use]
    pub fn new(method: impl Into<String>, value: Bytes, connection: Arc<dyn Connection>) -> Self {
        Self {
            method: method.into(),
            value,
            connection,
            request_id: Uuid::new_v4(),
            extensions: Extensions::new(),
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("value_len", &self.value.len())
            .field("request_id", &self.request_id)
            .finish()
    }
}
