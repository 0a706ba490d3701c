//! The interface this crate requires of its host transport.
//!
//! Framing, stream multiplexing, connection establishment, and DHT lookup
//! are entirely the transport's concern (`spec.md` §1, "Out of scope").
//! This module defines only the narrow seam the router needs: a handle per
//! connection, a way to attach per-method responders to it, and a way to
//! bind a raw-bytes handler to a method name.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::{CoreError, RoutedError};

/// A handle to one peer connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The peer's remote host string, used by `rateLimit.byRemoteAddress`
    /// and `concurrentLimit.byRemoteAddress`.
    fn remote_address(&self) -> String;

    /// The peer's 32-byte static identity key, used by
    /// `rateLimit.byRemotePublicKey` and `concurrentLimit.byRemotePublicKey`.
    fn remote_public_key(&self) -> [u8; 32];

    /// Tear down the transport session, optionally citing the error that
    /// caused the teardown (used by the capability gate on verification
    /// failure).
    async fn destroy(&self, err: Option<CoreError>);

    /// Resolve once with the peer's handshake payload, emitted on the
    /// transport's `open(handshake)` event (`spec.md` §6). Resolves to
    /// `None` if the connection has no handshake to offer (no capability
    /// gate configured on the peer's side) or is torn down first.
    async fn handshake(&self) -> Option<Bytes>;
}

/// The handshake wiring a router may install on a freshly attached
/// connection.
#[derive(Clone, Debug)]
pub struct HandshakeEncoding {
    /// Bytes to send as this side's handshake payload on open.
    pub outbound: Bytes,
}

/// Options passed to [`Transport::attach_responder`].
#[derive(Clone, Debug)]
pub struct AttachOptions {
    /// The responder id the transport should register under. Defaults to
    /// the peer's remote public key (`spec.md` §4.G).
    pub id: [u8; 32],
    /// The handshake payload to emit on open, if a capability gate is
    /// configured.
    pub handshake: Option<HandshakeEncoding>,
}

/// A transport-level object that accepts `method name -> handler` bindings
/// for one connection.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Bind `handler` to `method`. Exactly one binding exists per method
    /// name on the responder; a second call for the same name replaces the
    /// first.
    async fn respond(
        &self,
        method: &str,
        handler: Arc<
            dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, RoutedError>> + Send + Sync,
        >,
    ) -> Result<(), CoreError>;
}

/// The multiplexed, length-delimited transport this crate is built on top
/// of.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attach a fresh [`Responder`] to `connection`.
    async fn attach_responder(
        &self,
        connection: Arc<dyn Connection>,
        options: AttachOptions,
    ) -> Result<Arc<dyn Responder>, CoreError>;
}

/// Test doubles for the transport traits, shared by this crate's own unit
/// and integration tests. Not part of the public API surface used by host
/// applications — a real host supplies its own transport.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::sync::{Arc, Mutex};

    use dashmap::DashMap;

    use super::{AttachOptions, Connection, CoreError, Responder, RoutedError, Transport};
    use crate::error::CoreError as Err;
    use bytes::Bytes;
    use futures::future::BoxFuture;

    /// A connection double with a fixed address and public key, and a
    /// record of whether it was destroyed.
    pub struct FakeConnection {
        address: String,
        public_key: [u8; 32],
        destroyed: Mutex<Option<Option<String>>>,
        handshake: Mutex<Option<Bytes>>,
    }

    impl FakeConnection {
        /// Build a connection double for `address`/`public_key`, with no
        /// handshake payload queued.
        #[must_use]
        pub fn new(address: impl Into<String>, public_key: [u8; 32]) -> Self {
            Self {
                address: address.into(),
                public_key,
                destroyed: Mutex::new(None),
                handshake: Mutex::new(None),
            }
        }

        /// Queue `payload` to be returned by the next [`Connection::handshake`] call.
        #[must_use]
        pub fn with_handshake(self, payload: Bytes) -> Self {
            *self.handshake.lock().unwrap_or_else(|poison| poison.into_inner()) = Some(payload);
            self
        }

        /// `true` once [`Connection::destroy`] has been called.
        #[must_use]
        pub fn was_destroyed(&self) -> bool {
            self.destroyed.lock().unwrap_or_else(|poison| poison.into_inner()).is_some()
        }
    }

    #[async_trait::async_trait]
    impl Connection for FakeConnection {
        fn remote_address(&self) -> String { self.address.clone() }

        fn remote_public_key(&self) -> [u8; 32] { self.public_key }

        async fn destroy(&self, err: Option<Err>) {
            let message = err.map(|e| e.to_string());
            let mut guard = self.destroyed.lock().unwrap_or_else(|poison| poison.into_inner());
            *guard = Some(message);
        }

        async fn handshake(&self) -> Option<Bytes> {
            self.handshake.lock().unwrap_or_else(|poison| poison.into_inner()).clone()
        }
    }

    type Handler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, RoutedError>> + Send + Sync>;

    /// A responder double that records bound handlers so tests can invoke
    /// them directly, simulating an inbound call arriving from the
    /// transport.
    #[derive(Default)]
    pub struct FakeResponder {
        handlers: DashMap<String, Handler>,
    }

    impl FakeResponder {
        /// A responder with no bound methods.
        #[must_use]
        pub fn new() -> Self { Self::default() }

        /// Invoke the handler bound to `method`, as the transport would on
        /// an inbound call. Panics in test code if no handler is bound;
        /// production code never calls this.
        ///
        /// # Panics
        ///
        /// Panics if no handler is bound for `method`.
        pub async fn call(&self, method: &str, payload: Bytes) -> Result<Bytes, RoutedError> {
            let handler = self
                .handlers
                .get(method)
                .unwrap_or_else(|| panic!("no handler bound for method {method:?}"))
                .clone();
            handler(payload).await
        }

        /// `true` if a handler is bound for `method`.
        #[must_use]
        pub fn has_method(&self, method: &str) -> bool { self.handlers.contains_key(method) }
    }

    #[async_trait::async_trait]
    impl Responder for FakeResponder {
        async fn respond(&self, method: &str, handler: Handler) -> Result<(), CoreError> {
            self.handlers.insert(method.to_owned(), handler);
            Ok(())
        }
    }

    /// A transport double that hands out a fresh [`FakeResponder`] per
    /// attach call.
    #[derive(Default)]
    pub struct FakeTransport {
        /// Handshake payloads observed on each attach, for assertions.
        pub attached: Mutex<Vec<AttachOptions>>,
        /// Every concrete responder handed out, in attach order, so tests
        /// can invoke bound handlers directly without downcasting the
        /// trait object the router sees.
        pub responders: Mutex<Vec<Arc<FakeResponder>>>,
    }

    impl FakeTransport {
        /// A transport double with no attach history.
        #[must_use]
        pub fn new() -> Self { Self::default() }

        /// The most recently handed-out responder, for tests that attach
        /// exactly one connection.
        #[must_use]
        pub fn last_responder(&self) -> Arc<FakeResponder> {
            self.responders
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .last()
                .expect("at least one attach call")
                .clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn attach_responder(
            &self,
            _connection: Arc<dyn Connection>,
            options: AttachOptions,
        ) -> Result<Arc<dyn Responder>, CoreError> {
            self.attached
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .push(options);
            let responder = Arc::new(FakeResponder::new());
            self.responders
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .push(responder.clone());
            Ok(responder)
        }
    }
}
