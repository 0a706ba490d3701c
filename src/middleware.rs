//! Middleware composition algebra.
//!
//! A [`Middleware`] is a value with three hooks: `on_open`, `on_close`, and
//! `on_request`. Composition folds a sequence of middleware into a single
//! value that behaves like one onion layer per element — `spec.md` §4.B's
//! "Composed middleware — result of folding a sequence `[m0, ..., mn]` under
//! an associative combinator with identity as zero". [`MiddlewareStack`] is
//! that fold: the empty stack is the identity, and pushing an element is the
//! combinator. Wrapping every element in `Arc<dyn Middleware>` means a stack
//! can itself be composed into an outer stack, so the same fold implements
//! both the per-method request chain and the router's own lifecycle
//! orchestration.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    context::RequestContext,
    error::{AggregateError, CoreError},
    metrics::MetricsRegistry,
};

/// One layer of the onion.
///
/// All three hooks default to no-ops / pass-through, so a middleware that
/// only cares about requests need implement [`Middleware::on_request`]
/// alone.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Called once, in composition order, when the owning router opens.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the open sequence; already-opened
    /// middleware earlier in the sequence are rolled back via `on_close`.
    async fn on_open(&self) -> Result<(), CoreError> { Ok(()) }

    /// Called once, in reverse composition order, when the owning router
    /// closes. Every middleware's `on_close` runs regardless of earlier
    /// failures (`spec.md` §4.B, "Close order").
    ///
    /// # Errors
    ///
    /// Returns the teardown failure; the caller aggregates it with failures
    /// from other middleware rather than short-circuiting.
    async fn on_close(&self) -> Result<(), CoreError> { Ok(()) }

    /// Called once per request. The default forwards to `next` unchanged —
    /// the identity middleware.
    ///
    /// # Errors
    ///
    /// Propagates whatever `next` or this layer's own logic returns.
    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Bytes, CoreError> {
        next.call(ctx).await
    }

    /// Register any counters this middleware wants with `registry`. Called
    /// once per middleware, in composition order, by `registerMetrics`
    /// (`spec.md` §4.G). The default does nothing.
    fn register_metrics(&self, registry: &dyn MetricsRegistry) {
        let _ = registry;
    }
}

/// The terminal step of a request chain: decode, dispatch to the handler,
/// encode. Borrowed for the lifetime of one [`Next::call`], so it never
/// needs to be `'static`.
type Terminal<'a> =
    dyn for<'c> Fn(&'c mut RequestContext) -> BoxFuture<'c, Result<Bytes, CoreError>>
        + Send
        + Sync
        + 'a;

/// The remaining portion of a request chain, passed to each middleware's
/// `on_request`.
///
/// `Next` is a cursor over a borrowed slice plus a borrowed terminal step,
/// not an owned queue, so building one per request is allocation-free.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    index: usize,
    terminal: &'a Terminal<'a>,
}

impl<'a> Next<'a> {
    /// Build a cursor over `middlewares`, terminating in `terminal`.
    #[must_use]
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], terminal: &'a Terminal<'a>) -> Self {
        Self {
            middlewares,
            index: 0,
            terminal,
        }
    }

    /// Invoke the next layer: the middleware at the cursor, or the terminal
    /// step if the cursor has run off the end.
    ///
    /// # Errors
    ///
    /// Propagates whatever the next layer or the terminal step returns.
    pub async fn call(self, ctx: &mut RequestContext) -> Result<Bytes, CoreError> {
        match self.middlewares.get(self.index) {
            Some(mw) => {
                let next = Self {
                    middlewares: self.middlewares,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                mw.on_request(ctx, next).await
            }
            None => (self.terminal)(ctx).await,
        }
    }
}

/// Run `on_open` over `participants` in order, rolling back the opened
/// prefix in reverse order if one fails partway through (`spec.md` §4.B
/// invariant 3, "partial-open rollback").
///
/// # Errors
///
/// Returns the first failure encountered, after rollback has completed.
pub async fn open_in_order(participants: &[Arc<dyn Middleware>]) -> Result<(), CoreError> {
    for (opened, participant) in participants.iter().enumerate() {
        if let Err(err) = participant.on_open().await {
            for rollback in participants[..opened].iter().rev() {
                let _ = rollback.on_close().await;
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Run `on_close` over `participants` in reverse order, aggregating every
/// failure rather than stopping at the first (`spec.md` §4.B, "every
/// `onClose` call happens regardless of earlier failures").
///
/// # Errors
///
/// Returns an aggregate of every failure observed, if any.
pub async fn close_in_order(participants: &[Arc<dyn Middleware>]) -> Result<(), CoreError> {
    let mut aggregate = AggregateError::new();
    for participant in participants.iter().rev() {
        if let Err(err) = participant.on_close().await {
            aggregate.push(err);
        }
    }
    aggregate.into_result()
}

/// A sequence of middleware folded into a single [`Middleware`].
///
/// An empty stack is the identity element: `on_open`/`on_close` are no-ops
/// and `on_request` forwards straight to whatever outer `next` it was given.
/// Pushing elements implements the associative combinator from `spec.md`
/// §4.B; [`compose`] is the two-argument special case.
#[derive(Default)]
pub struct MiddlewareStack {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    /// The identity middleware: no middleware at all.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Build a stack from an already-ordered sequence.
    #[must_use]
    pub fn from_vec(middlewares: Vec<Arc<dyn Middleware>>) -> Self { Self { middlewares } }

    /// Append `middleware` to the end of the stack (`spec.md` §4.G, "use()
    /// appends to the router's global middleware list").
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) { self.middlewares.push(middleware); }

    /// The stack's middleware, in composition order.
    #[must_use]
    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] { &self.middlewares }

    /// `true` if no middleware has been pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.middlewares.is_empty() }
}

#[async_trait]
impl Middleware for MiddlewareStack {
    async fn on_open(&self) -> Result<(), CoreError> { open_in_order(&self.middlewares).await }

    async fn on_close(&self) -> Result<(), CoreError> { close_in_order(&self.middlewares).await }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Bytes, CoreError> {
        let terminal = move |ctx: &mut RequestContext| -> BoxFuture<'_, Result<Bytes, CoreError>> {
            Box::pin(next.call(ctx))
        };
        let inner = Next::new(&self.middlewares, &terminal);
        inner.call(ctx).await
    }

    fn register_metrics(&self, registry: &dyn MetricsRegistry) {
        for middleware in &self.middlewares {
            middleware.register_metrics(registry);
        }
    }
}

/// Compose two middleware into one, equivalent to `MiddlewareStack::from_vec(vec![a, b])`.
///
/// Request order is `a` then `b` then whatever `next` the composed value is
/// itself given; open order is `a` then `b`; close order is `b` then `a`
/// (`spec.md` §4.B).
#[must_use]
pub fn compose(a: Arc<dyn Middleware>, b: Arc<dyn Middleware>) -> Arc<dyn Middleware> {
    Arc::new(MiddlewareStack::from_vec(vec![a, b]))
}

/// Run a request through `middlewares`, terminating in `handler` if the
/// chain runs to completion without an earlier layer short-circuiting.
///
/// # Errors
///
/// Propagates whatever the chain or `handler` returns.
pub async fn dispatch<'a>(
    middlewares: &'a [Arc<dyn Middleware>],
    ctx: &mut RequestContext,
    handler: &'a Terminal<'a>,
) -> Result<Bytes, CoreError> {
    Next::new(middlewares, handler).call(ctx).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::{Middleware, Next};
    use crate::{context::RequestContext, error::CoreError};

    /// A middleware that records its own name at every hook invocation, for
    /// asserting on onion order in tests.
    pub struct Tracer {
        pub name: &'static str,
        pub trace: Arc<Mutex<Vec<String>>>,
        pub fail_open: bool,
        pub fail_close: bool,
    }

    impl Tracer {
        pub fn new(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                trace,
                fail_open: false,
                fail_close: false,
            }
        }

        fn record(&self, event: &str) {
            self.trace
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .push(format!("{}:{event}", self.name));
        }
    }

    #[async_trait]
    impl Middleware for Tracer {
        async fn on_open(&self) -> Result<(), CoreError> {
            self.record("open");
            if self.fail_open {
                return Err(CoreError::router_not_ready("tracer forced open failure"));
            }
            Ok(())
        }

        async fn on_close(&self) -> Result<(), CoreError> {
            self.record("close");
            if self.fail_close {
                return Err(CoreError::router_closed("tracer forced close failure"));
            }
            Ok(())
        }

        async fn on_request(
            &self,
            ctx: &mut RequestContext,
            next: Next<'_>,
        ) -> Result<Bytes, CoreError> {
            self.record("pre");
            let result = next.call(ctx).await;
            self.record("post");
            result
        }
    }

    /// A middleware counting how many times each hook fired.
    #[derive(Default)]
    pub struct Counter {
        pub opens: AtomicUsize,
        pub closes: AtomicUsize,
        pub requests: AtomicUsize,
    }

    #[async_trait]
    impl Middleware for Counter {
        async fn on_open(&self) -> Result<(), CoreError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_close(&self) -> Result<(), CoreError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_request(
            &self,
            ctx: &mut RequestContext,
            next: Next<'_>,
        ) -> Result<Bytes, CoreError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            next.call(ctx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use rstest::rstest;

    use super::{test_support::Tracer, *};
    use crate::{error::ErrorCode, transport::test_support::FakeConnection};

    fn echo_terminal<'a>() -> impl for<'c> Fn(&'c mut RequestContext) -> BoxFuture<'c, Result<Bytes, CoreError>>
           + Send
           + Sync
           + 'a {
        |ctx: &mut RequestContext| Box::pin(async move { Ok(ctx.value.clone()) })
    }

    fn ctx() -> RequestContext {
        let conn = Arc::new(FakeConnection::new("peer:1", [0; 32]));
        RequestContext::new("echo", Bytes::from_static(b"payload"), conn)
    }

    #[rstest]
    #[tokio::test]
    async fn empty_stack_is_the_identity() {
        let stack = MiddlewareStack::new();
        assert!(stack.is_empty());
        let terminal = echo_terminal();
        let mut context = ctx();
        let result = dispatch(stack.middlewares(), &mut context, &terminal)
            .await
            .expect("identity passes through");
        assert_eq!(result, Bytes::from_static(b"payload"));
    }

    #[rstest]
    #[tokio::test]
    async fn onion_order_is_left_to_right_pre_and_right_to_left_post() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Middleware> = Arc::new(Tracer::new("a", trace.clone()));
        let b: Arc<dyn Middleware> = Arc::new(Tracer::new("b", trace.clone()));
        let stack = MiddlewareStack::from_vec(vec![a, b]);
        let terminal = echo_terminal();
        let mut context = ctx();
        dispatch(stack.middlewares(), &mut context, &terminal)
            .await
            .expect("chain succeeds");

        let observed = trace.lock().expect("lock").clone();
        assert_eq!(observed, vec!["a:pre", "b:pre", "b:post", "a:post"]);
    }

    #[rstest]
    #[tokio::test]
    async fn compose_matches_two_element_stack() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Middleware> = Arc::new(Tracer::new("a", trace.clone()));
        let b: Arc<dyn Middleware> = Arc::new(Tracer::new("b", trace.clone()));
        let composed = compose(a, b);
        let terminal = echo_terminal();
        let mut context = ctx();
        let slice = [composed];
        dispatch(&slice, &mut context, &terminal)
            .await
            .expect("chain succeeds");
        let observed = trace.lock().expect("lock").clone();
        assert_eq!(observed, vec!["a:pre", "b:pre", "b:post", "a:post"]);
    }

    #[rstest]
    #[tokio::test]
    async fn open_rolls_back_the_opened_prefix_on_failure() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut first = Tracer::new("first", trace.clone());
        let mut second = Tracer::new("second", trace.clone());
        second.fail_open = true;
        let third = Tracer::new("third", trace.clone());
        first.fail_open = false;
        let participants: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(first), Arc::new(second), Arc::new(third)];

        let err = open_in_order(&participants).await.expect_err("second fails");
        assert_eq!(err.code(), ErrorCode::RouterNotReady);

        let observed = trace.lock().expect("lock").clone();
        // first opens, second fails to open, first rolls back. third never
        // opens because the sequence aborts at the first failure.
        assert_eq!(observed, vec!["first:open", "second:open", "first:close"]);
    }

    #[rstest]
    #[tokio::test]
    async fn close_runs_every_participant_and_aggregates_failures() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let first = Tracer::new("first", trace.clone());
        let mut second = Tracer::new("second", trace.clone());
        second.fail_close = true;
        let participants: Vec<Arc<dyn Middleware>> = vec![Arc::new(first), Arc::new(second)];

        let err = close_in_order(&participants).await.expect_err("second fails to close");
        assert_eq!(err.code(), ErrorCode::Aggregate);

        let observed = trace.lock().expect("lock").clone();
        assert_eq!(observed, vec!["second:close", "first:close"]);
    }
}
