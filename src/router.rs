//! The router: method registry, lifecycle state machine, connection
//! attachment, and the per-request dispatch pipeline (`spec.md` §4.G).

use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    capability::CapabilityGate,
    codec::{Codec, RawCodec},
    context::RequestContext,
    error::{AggregateError, CoreError, RoutedError},
    metrics::{Counter, MetricsRegistry},
    middleware::{dispatch, open_in_order, Middleware, MiddlewareStack},
    transport::{AttachOptions, Connection, HandshakeEncoding, Responder, Transport},
};

/// A boxed, type-erased per-method terminal step: decode, invoke the
/// handler, encode (`spec.md` §4.G, pipeline step 4).
pub type HandlerFn =
    Arc<dyn for<'c> Fn(&'c mut RequestContext) -> BoxFuture<'c, Result<Bytes, CoreError>> + Send + Sync>;

/// `{request?, response?}` codecs for a method registration. Both default
/// to a raw pass-through (`spec.md` §3, "decoders default to a raw
/// pass-through").
pub struct MethodOptions<Req, Res> {
    /// Decodes the inbound payload into `Req`.
    pub request_encoding: Arc<dyn Codec<Req>>,
    /// Encodes the handler's `Res` into the outbound payload.
    pub response_encoding: Arc<dyn Codec<Res>>,
}

impl MethodOptions<Bytes, Bytes> {
    /// Raw pass-through in both directions.
    #[must_use]
    pub fn raw() -> Self {
        Self {
            request_encoding: Arc::new(RawCodec),
            response_encoding: Arc::new(RawCodec),
        }
    }
}

/// One registered method: its own middleware stack and its decode →
/// handler → encode terminal.
struct MethodRegistration {
    name: String,
    middleware: MiddlewareStack,
    terminal: HandlerFn,
}

/// A method handler: decoded request in, a boxed future of the typed
/// result out. Handlers return a boxed future directly (rather than an
/// opaque `impl Future`) so the future can borrow `ctx` for its own
/// duration without forcing a single concrete future type across every
/// invocation — the same constraint [`crate::middleware::Next`] solves for
/// the middleware chain.
pub trait Handler<Req, Res, E>: Send + Sync {
    /// Handle one decoded request.
    fn call<'c>(&self, request: Req, ctx: &'c mut RequestContext) -> BoxFuture<'c, Result<Res, E>>;
}

impl<Req, Res, E, F> Handler<Req, Res, E> for F
where
    F: for<'c> Fn(Req, &'c mut RequestContext) -> BoxFuture<'c, Result<Res, E>> + Send + Sync,
{
    fn call<'c>(&self, request: Req, ctx: &'c mut RequestContext) -> BoxFuture<'c, Result<Res, E>> {
        self(request, ctx)
    }
}

fn build_terminal<Req, Res, E, H>(options: MethodOptions<Req, Res>, handler: H) -> HandlerFn
where
    Req: Send + Sync + 'static,
    Res: Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
    H: Handler<Req, Res, E> + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |ctx: &mut RequestContext| {
        let request_encoding = options.request_encoding.clone();
        let response_encoding = options.response_encoding.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let req = request_encoding
                .decode(&ctx.value)
                .map_err(|cause| CoreError::decode("request payload", Some(cause)))?;
            let res = handler.call(req, ctx).await.map_err(CoreError::handler)?;
            response_encoding
                .encode(&res)
                .map_err(|cause| CoreError::encode("response payload", Some(cause)))
        }) as BoxFuture<'_, Result<Bytes, CoreError>>
    })
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

/// A callback invoked when a connection's capability handshake fails
/// verification (`spec.md` §4.F, the `capability-error` event).
pub type CapabilityErrorObserver = Arc<dyn Fn(Arc<dyn Connection>) + Send + Sync>;

/// The router. One instance per process-local endpoint (`spec.md` §3,
/// "process-local singleton-per-endpoint").
pub struct Router {
    state: AtomicU8,
    capability: Option<Arc<CapabilityGate>>,
    global: Mutex<MiddlewareStack>,
    registrations: Mutex<Vec<MethodRegistration>>,
    requests: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    handler_errors: Arc<AtomicU64>,
    metrics_requests: Mutex<Option<Arc<dyn Counter>>>,
    metrics_errors: Mutex<Option<Arc<dyn Counter>>>,
    metrics_handler_errors: Mutex<Option<Arc<dyn Counter>>>,
    capability_error_observer: Mutex<Option<CapabilityErrorObserver>>,
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

impl Router {
    /// A router with no capability gate configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(Lifecycle::New as u8),
            capability: None,
            global: Mutex::new(MiddlewareStack::new()),
            registrations: Mutex::new(Vec::new()),
            requests: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            handler_errors: Arc::new(AtomicU64::new(0)),
            metrics_requests: Mutex::new(None),
            metrics_errors: Mutex::new(None),
            metrics_handler_errors: Mutex::new(None),
            capability_error_observer: Mutex::new(None),
        }
    }

    /// A router requiring every attached connection to present a valid
    /// proof for `gate`'s capability (`spec.md` §4.F). Without this, all
    /// peers are accepted.
    #[must_use]
    pub fn with_capability(gate: CapabilityGate) -> Self {
        Self {
            capability: Some(Arc::new(gate)),
            ..Self::new()
        }
    }

    fn lock_poisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_registrable(&self) -> Result<(), CoreError> {
        if self.state.load(Ordering::SeqCst) == Lifecycle::New as u8 {
            Ok(())
        } else {
            Err(CoreError::router_not_ready(
                "use()/method() are only legal before open()",
            ))
        }
    }

    /// Append `middleware` to the global chain, run ahead of every
    /// method's own middleware (`spec.md` §4.G, "use(middleware)").
    ///
    /// # Errors
    ///
    /// Returns `ROUTER_NOT_READY` if the router has already left `new`
    /// (`spec.md` §9, resolving "whether `use()` is legal after `open()`"
    /// as no — see `DESIGN.md`).
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) -> Result<(), CoreError> {
        self.ensure_registrable()?;
        Self::lock_poisoned(&self.global).push(middleware);
        Ok(())
    }

    /// Register a method, its per-method middleware, and its handler.
    ///
    /// # Errors
    ///
    /// Returns `ROUTER_NOT_READY` if the router has already left `new`, or
    /// if `name` is already registered.
    pub fn method<Req, Res, E, H>(
        &self,
        name: impl Into<String>,
        options: MethodOptions<Req, Res>,
        middleware: Vec<Arc<dyn Middleware>>,
        handler: H,
    ) -> Result<(), CoreError>
    where
        Req: Send + Sync + 'static,
        Res: Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        H: Handler<Req, Res, E> + 'static,
    {
        self.ensure_registrable()?;
        let name = name.into();
        let mut registrations = Self::lock_poisoned(&self.registrations);
        if registrations.iter().any(|existing| existing.name == name) {
            return Err(CoreError::router_not_ready("method already registered"));
        }
        registrations.push(MethodRegistration {
            name,
            middleware: MiddlewareStack::from_vec(middleware),
            terminal: build_terminal(options, handler),
        });
        Ok(())
    }

    /// Transition `new -> opening -> open`, running global `onOpen` then
    /// each registration's `onOpen` in registration order. A failure rolls
    /// back the opened prefix and leaves the router `closed`.
    ///
    /// # Errors
    ///
    /// Returns `ROUTER_NOT_READY` if not in `new`, or the first `onOpen`
    /// failure encountered.
    pub async fn open(&self) -> Result<(), CoreError> {
        if self
            .state
            .compare_exchange(
                Lifecycle::New as u8,
                Lifecycle::Opening as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(CoreError::router_not_ready("router already opened"));
        }

        let global_snapshot = Self::lock_poisoned(&self.global).middlewares().to_vec();
        let registration_snapshots: Vec<Vec<Arc<dyn Middleware>>> = Self::lock_poisoned(&self.registrations)
            .iter()
            .map(|registration| registration.middleware.middlewares().to_vec())
            .collect();

        let mut participants: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(MiddlewareStack::from_vec(global_snapshot))];
        participants.extend(
            registration_snapshots
                .into_iter()
                .map(|snapshot| Arc::new(MiddlewareStack::from_vec(snapshot)) as Arc<dyn Middleware>),
        );

        if let Err(err) = open_in_order(&participants).await {
            self.state.store(Lifecycle::Closed as u8, Ordering::SeqCst);
            return Err(err);
        }

        self.state.store(Lifecycle::Open as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Transition `open -> closing -> closed`. Runs every registration's
    /// `onClose` in registration order, then the global `onClose`,
    /// aggregating all failures. Empties the registration map.
    ///
    /// # Errors
    ///
    /// Returns `ROUTER_CLOSED` if not in `open`, or an aggregate of every
    /// `onClose` failure observed.
    pub async fn close(&self) -> Result<(), CoreError> {
        if self
            .state
            .compare_exchange(
                Lifecycle::Open as u8,
                Lifecycle::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(CoreError::router_closed("router is not open"));
        }

        let registrations = std::mem::take(&mut *Self::lock_poisoned(&self.registrations));
        let mut aggregate = AggregateError::new();
        for registration in &registrations {
            if let Err(err) = registration.middleware.on_close().await {
                aggregate.push(err);
            }
        }
        if let Err(err) = Self::lock_poisoned(&self.global).on_close().await {
            aggregate.push(err);
        }

        self.state.store(Lifecycle::Closed as u8, Ordering::SeqCst);
        aggregate.into_result()
    }

    /// Bind every registered method to `connection` via `transport`.
    ///
    /// # Errors
    ///
    /// Returns `ROUTER_NOT_READY` unless the router is `open`,
    /// `ROUTER_CLOSED` if `closing`/`closed`, or whatever `transport`
    /// raises while attaching the responder.
    pub async fn attach(
        &self,
        connection: Arc<dyn Connection>,
        transport: &dyn Transport,
        responder_id: Option<[u8; 32]>,
    ) -> Result<Arc<dyn Responder>, CoreError> {
        let state = self.state.load(Ordering::SeqCst);
        if state == Lifecycle::Closing as u8 || state == Lifecycle::Closed as u8 {
            return Err(CoreError::router_closed("router is closing or closed"));
        }
        if state != Lifecycle::Open as u8 {
            return Err(CoreError::router_not_ready("router is not open"));
        }

        let handshake = self
            .capability
            .as_ref()
            .map(|gate| HandshakeEncoding { outbound: gate.install(connection.as_ref()) });
        let id = responder_id.unwrap_or_else(|| connection.remote_public_key());
        let responder = transport
            .attach_responder(connection.clone(), AttachOptions { id, handshake })
            .await?;

        if let Some(gate) = self.capability.clone() {
            self.spawn_capability_verification(gate, connection.clone());
        }

        let global_snapshot = Self::lock_poisoned(&self.global).middlewares().to_vec();
        for registration in Self::lock_poisoned(&self.registrations).iter() {
            let mut chain = global_snapshot.clone();
            chain.extend(registration.middleware.middlewares().iter().cloned());
            let chain: Arc<[Arc<dyn Middleware>]> = Arc::from(chain);

            let handler = self.build_responder_handler(
                registration.name.clone(),
                chain,
                registration.terminal.clone(),
                connection.clone(),
            );
            responder.respond(&registration.name, handler).await?;
        }

        Ok(responder)
    }

    fn spawn_capability_verification(&self, gate: Arc<CapabilityGate>, connection: Arc<dyn Connection>) {
        let observer = Self::lock_poisoned(&self.capability_error_observer).clone();
        tokio::spawn(async move {
            let verification = match connection.handshake().await {
                Some(frame) => gate.verify(connection.as_ref(), frame),
                None => Err(CoreError::capability_invalid("peer sent no handshake")),
            };
            if let Err(err) = verification {
                tracing::warn!(peer = %connection.remote_address(), %err, "capability handshake rejected");
                connection.destroy(Some(err)).await;
                if let Some(callback) = observer {
                    callback(connection);
                }
            }
        });
    }

    fn build_responder_handler(
        &self,
        method: String,
        chain: Arc<[Arc<dyn Middleware>]>,
        terminal: HandlerFn,
        connection: Arc<dyn Connection>,
    ) -> Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, RoutedError>> + Send + Sync> {
        let requests = self.requests.clone();
        let errors = self.errors.clone();
        let handler_errors = self.handler_errors.clone();
        let metrics_requests = Self::lock_poisoned(&self.metrics_requests).clone();
        let metrics_errors = Self::lock_poisoned(&self.metrics_errors).clone();
        let metrics_handler_errors = Self::lock_poisoned(&self.metrics_handler_errors).clone();

        Arc::new(move |payload: Bytes| {
            let call_chain = chain.clone();
            let call_terminal = terminal.clone();
            let call_connection = connection.clone();
            let call_method = method.clone();
            let call_requests = requests.clone();
            let call_errors = errors.clone();
            let call_handler_errors = handler_errors.clone();
            let call_metrics_requests = metrics_requests.clone();
            let call_metrics_errors = metrics_errors.clone();
            let call_metrics_handler_errors = metrics_handler_errors.clone();

            Box::pin(async move {
                call_requests.fetch_add(1, Ordering::Relaxed);
                if let Some(counter) = &call_metrics_requests {
                    counter.increment(1);
                }

                let mut ctx = RequestContext::new(call_method.clone(), payload, call_connection);
                let request_id = ctx.request_id;
                match dispatch(&call_chain, &mut ctx, &*call_terminal).await {
                    Ok(bytes) => Ok(bytes),
                    Err(err) => {
                        call_errors.fetch_add(1, Ordering::Relaxed);
                        if let Some(counter) = &call_metrics_errors {
                            counter.increment(1);
                        }
                        if err.is_handler_error() {
                            call_handler_errors.fetch_add(1, Ordering::Relaxed);
                            if let Some(counter) = &call_metrics_handler_errors {
                                counter.increment(1);
                            }
                        }
                        let routed = RoutedError::new(err, request_id);
                        tracing::warn!(
                            %request_id,
                            method = %call_method,
                            error = %routed.error,
                            "request failed"
                        );
                        Err(routed)
                    }
                }
            }) as BoxFuture<'static, Result<Bytes, RoutedError>>
        })
    }

    /// Register the router's own counters with `registry` and fan out
    /// `registerMetrics` to every middleware, global and per-method, in
    /// registration order (`spec.md` §4.B, §4.G).
    pub fn register_metrics(&self, registry: Arc<dyn MetricsRegistry>) {
        *Self::lock_poisoned(&self.metrics_requests) = Some(registry.counter("requests"));
        *Self::lock_poisoned(&self.metrics_errors) = Some(registry.counter("errors"));
        *Self::lock_poisoned(&self.metrics_handler_errors) = Some(registry.counter("handler_errors"));

        Self::lock_poisoned(&self.global).register_metrics(registry.as_ref());
        for registration in Self::lock_poisoned(&self.registrations).iter() {
            registration.middleware.register_metrics(registry.as_ref());
        }
    }

    /// Observe `capability-error` events: fired when a connection's
    /// handshake fails verification (`spec.md` §4.F, §6).
    pub fn on_capability_error(&self, observer: CapabilityErrorObserver) {
        *Self::lock_poisoned(&self.capability_error_observer) = Some(observer);
    }

    /// Total requests dispatched.
    #[must_use]
    pub fn requests(&self) -> u64 { self.requests.load(Ordering::Relaxed) }

    /// Total requests that raised any error.
    #[must_use]
    pub fn errors(&self) -> u64 { self.errors.load(Ordering::Relaxed) }

    /// Total requests whose error originated in the handler specifically.
    #[must_use]
    pub fn handler_errors(&self) -> u64 { self.handler_errors.load(Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
    use std::{
        fmt,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bytes::Bytes;
    use futures::future::BoxFuture;
    use rstest::rstest;

    use super::*;
    use crate::{
        capability::test_support::FixedProofProvider,
        codec::Utf8Codec,
        error::ErrorCode,
        limiter::rate::RateLimitMiddleware,
        metrics::test_support::TestRegistry,
        middleware::test_support::Tracer,
        transport::test_support::{FakeConnection, FakeTransport},
    };

    #[derive(Debug)]
    struct DemoError;

    impl fmt::Display for DemoError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("demo handler failure") }
    }

    impl std::error::Error for DemoError {}

    fn echo_handler() -> impl Handler<Bytes, Bytes, DemoError> {
        |req: Bytes, _ctx: &mut RequestContext| -> BoxFuture<'_, Result<Bytes, DemoError>> {
            Box::pin(async move { Ok(req) })
        }
    }

    #[rstest]
    fn registration_is_rejected_once_the_router_leaves_new() {
        let router = Router::new();
        router.method("echo", MethodOptions::raw(), Vec::new(), echo_handler()).expect("register");
        // Pretend the router already transitioned away from `new`.
        router.state.store(Lifecycle::Open as u8, Ordering::SeqCst);
        let err = router
            .method("late", MethodOptions::raw(), Vec::new(), echo_handler())
            .expect_err("method() after new must fail");
        assert_eq!(err.code(), ErrorCode::RouterNotReady);
        let err = router
            .use_middleware(Arc::new(Tracer::new("late", Arc::new(Mutex::new(Vec::new())))))
            .expect_err("use() after new must fail");
        assert_eq!(err.code(), ErrorCode::RouterNotReady);
    }

    #[rstest]
    fn duplicate_method_names_are_rejected() {
        let router = Router::new();
        router.method("echo", MethodOptions::raw(), Vec::new(), echo_handler()).expect("first registration");
        let err = router
            .method("echo", MethodOptions::raw(), Vec::new(), echo_handler())
            .expect_err("duplicate name rejected");
        assert_eq!(err.code(), ErrorCode::RouterNotReady);
    }

    #[rstest]
    #[tokio::test]
    async fn attach_fails_before_open() {
        let router = Router::new();
        let transport = FakeTransport::new();
        let conn: Arc<dyn Connection> = Arc::new(FakeConnection::new("peer:1", [1; 32]));
        let err = router.attach(conn, &transport, None).await.expect_err("not open yet");
        assert_eq!(err.code(), ErrorCode::RouterNotReady);
    }

    #[rstest]
    #[tokio::test]
    async fn attach_fails_after_close() {
        let router = Router::new();
        router.open().await.expect("opens with nothing registered");
        router.close().await.expect("closes cleanly");
        let transport = FakeTransport::new();
        let conn: Arc<dyn Connection> = Arc::new(FakeConnection::new("peer:1", [1; 32]));
        let err = router.attach(conn, &transport, None).await.expect_err("closed");
        assert_eq!(err.code(), ErrorCode::RouterClosed);
    }

    #[rstest]
    #[tokio::test]
    async fn registering_zero_methods_and_attaching_is_legal() {
        let router = Router::new();
        router.open().await.expect("opens");
        let transport = FakeTransport::new();
        let conn: Arc<dyn Connection> = Arc::new(FakeConnection::new("peer:1", [1; 32]));
        let _responder = router.attach(conn, &transport, None).await.expect("attach with no methods");
        assert!(!transport.last_responder().has_method("echo"));
    }

    #[rstest]
    #[tokio::test]
    async fn onion_trace_matches_global_then_method_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new();
        router.use_middleware(Arc::new(Tracer::new("g1", trace.clone()))).expect("use g1");
        router.use_middleware(Arc::new(Tracer::new("g2", trace.clone()))).expect("use g2");
        router
            .method(
                "echo",
                MethodOptions::raw(),
                vec![
                    Arc::new(Tracer::new("m1", trace.clone())),
                    Arc::new(Tracer::new("m2", trace.clone())),
                ],
                echo_handler(),
            )
            .expect("register echo");
        router.open().await.expect("opens");

        let transport = FakeTransport::new();
        let conn: Arc<dyn Connection> = Arc::new(FakeConnection::new("peer:1", [1; 32]));
        let _responder = router.attach(conn, &transport, None).await.expect("attach");
        let result = transport
            .last_responder()
            .call("echo", Bytes::from_static(b"foo"))
            .await
            .expect("echo succeeds");
        assert_eq!(result, Bytes::from_static(b"foo"));

        let observed = trace.lock().expect("lock").clone();
        assert_eq!(
            observed,
            vec!["g1:pre", "g2:pre", "m1:pre", "m2:pre", "m2:post", "m1:post", "g2:post", "g1:post"]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn decode_failure_counts_as_error_but_not_handler_error() {
        let router = Router::new();
        router
            .method(
                "greet",
                MethodOptions {
                    request_encoding: Arc::new(Utf8Codec) as Arc<dyn Codec<String>>,
                    response_encoding: Arc::new(RawCodec) as Arc<dyn Codec<Bytes>>,
                },
                Vec::new(),
                |_req: String, _ctx: &mut RequestContext| -> BoxFuture<'_, Result<Bytes, DemoError>> {
                    Box::pin(async move { Ok(Bytes::new()) })
                },
            )
            .expect("register greet");
        router.open().await.expect("opens");

        let transport = FakeTransport::new();
        let conn: Arc<dyn Connection> = Arc::new(FakeConnection::new("peer:1", [1; 32]));
        let _responder = router.attach(conn, &transport, None).await.expect("attach");
        let err = transport
            .last_responder()
            .call("greet", Bytes::from_static(&[0xFF, 0xFE]))
            .await
            .expect_err("invalid utf-8");
        assert_eq!(err.code(), ErrorCode::DecodeError);
        assert!(err.context.is_some());
        assert_eq!(router.errors(), 1);
        assert_eq!(router.handler_errors(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn handler_failure_counts_as_both_error_and_handler_error() {
        let router = Router::new();
        router
            .method(
                "boom",
                MethodOptions::raw(),
                Vec::new(),
                |_req: Bytes, _ctx: &mut RequestContext| -> BoxFuture<'_, Result<Bytes, DemoError>> {
                    Box::pin(async move { Err(DemoError) })
                },
            )
            .expect("register boom");
        router.open().await.expect("opens");

        let transport = FakeTransport::new();
        let conn: Arc<dyn Connection> = Arc::new(FakeConnection::new("peer:1", [1; 32]));
        let _responder = router.attach(conn, &transport, None).await.expect("attach");
        let err = transport.last_responder().call("boom", Bytes::new()).await.expect_err("handler fails");
        assert_eq!(err.code(), ErrorCode::HandlerError);
        assert!(err.context.is_some());
        assert_eq!(router.errors(), 1);
        assert_eq!(router.handler_errors(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn rate_limit_rejection_counts_as_error_but_not_handler_error() {
        let router = Router::new();
        router
            .method(
                "echo",
                MethodOptions::raw(),
                vec![Arc::new(RateLimitMiddleware::by_remote_public_key(1, Duration::from_secs(60)))],
                echo_handler(),
            )
            .expect("register echo");
        router.open().await.expect("opens");

        let transport = FakeTransport::new();
        let conn: Arc<dyn Connection> = Arc::new(FakeConnection::new("peer:1", [1; 32]));
        let _responder = router.attach(conn, &transport, None).await.expect("attach");
        let responder = transport.last_responder();
        responder.call("echo", Bytes::from_static(b"x")).await.expect("first request spends the only token");
        let err = responder
            .call("echo", Bytes::from_static(b"x"))
            .await
            .expect_err("second request has no tokens left");
        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(router.errors(), 1);
        assert_eq!(router.handler_errors(), 0);
        assert_eq!(router.requests(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn register_metrics_reaches_router_counters_and_middleware() {
        let router = Router::new();
        router
            .method(
                "echo",
                MethodOptions::raw(),
                vec![Arc::new(RateLimitMiddleware::by_remote_public_key(1, Duration::from_secs(60)))],
                echo_handler(),
            )
            .expect("register echo");
        router.open().await.expect("opens");

        let registry = Arc::new(TestRegistry::new());
        router.register_metrics(registry.clone());

        let transport = FakeTransport::new();
        let conn: Arc<dyn Connection> = Arc::new(FakeConnection::new("peer:1", [1; 32]));
        let _responder = router.attach(conn, &transport, None).await.expect("attach");
        let responder = transport.last_responder();
        let _ = responder.call("echo", Bytes::from_static(b"x")).await;
        let _ = responder.call("echo", Bytes::from_static(b"x")).await;

        assert_eq!(router.requests(), 2);
        assert_eq!(router.errors(), 1);
        assert_eq!(registry.value("requests"), 2);
        assert_eq!(registry.value("errors"), 1);
        assert_eq!(registry.value("rate_limiter.rejections"), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn matching_capability_handshake_leaves_the_connection_alive() {
        let provider = Arc::new(FixedProofProvider { proof: [3; 32] });
        let gate = CapabilityGate::new("ns", "K", provider);
        let router = Router::with_capability(gate);
        router.open().await.expect("opens");

        let frame = crate::capability::encode_handshake_frame(Some([3; 32]));
        let conn = Arc::new(FakeConnection::new("peer:1", [9; 32]).with_handshake(frame));
        let transport = FakeTransport::new();
        let _responder = router.attach(conn.clone(), &transport, None).await.expect("attach");

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(!conn.was_destroyed());
    }

    #[rstest]
    #[tokio::test]
    async fn mismatched_capability_handshake_destroys_the_connection_and_fires_the_event() {
        let provider = Arc::new(FixedProofProvider { proof: [3; 32] });
        let gate = CapabilityGate::new("ns", "K", provider);
        let router = Router::with_capability(gate);

        let observed: Arc<Mutex<Option<[u8; 32]>>> = Arc::new(Mutex::new(None));
        let observed_clone = observed.clone();
        router.on_capability_error(Arc::new(move |connection| {
            *observed_clone.lock().expect("lock") = Some(connection.remote_public_key());
        }));
        router.open().await.expect("opens");

        let frame = crate::capability::encode_handshake_frame(Some([9; 32]));
        let conn = Arc::new(FakeConnection::new("peer:1", [9; 32]).with_handshake(frame));
        let transport = FakeTransport::new();
        let _responder = router.attach(conn.clone(), &transport, None).await.expect("attach");

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(conn.was_destroyed());
        assert_eq!(*observed.lock().expect("lock"), Some([9; 32]));
    }
}
