//! Per-key in-flight concurrency limiter (`spec.md` §4.D).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};

use super::{public_key_string, remote_address_string};
use crate::{
    context::RequestContext,
    error::CoreError,
    metrics::{Counter, MetricsRegistry},
    middleware::{Middleware, Next},
    transport::Connection,
};

/// The per-key active-count gate.
///
/// Invariant (`spec.md` §3): `1 <= active <= capacity` for every resident
/// key; an absent key means zero in-flight requests.
pub struct ConcurrencyLimiterEngine {
    capacity: u32,
    active: DashMap<String, u32>,
    destroyed: AtomicBool,
    rejections: Mutex<Option<Arc<dyn Counter>>>,
}

impl ConcurrencyLimiterEngine {
    /// Build an idle engine admitting up to `capacity` concurrent
    /// in-flight requests per key.
    #[must_use]
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            active: DashMap::new(),
            destroyed: AtomicBool::new(false),
            rejections: Mutex::new(None),
        })
    }

    /// Attempt to admit one in-flight request for `key`.
    ///
    /// # Errors
    ///
    /// Returns `CONCURRENT_LIMIT_MIDDLEWARE_DESTROYED` if the engine was
    /// already destroyed.
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Result<Option<ActiveGuard>, CoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(CoreError::concurrent_limit_destroyed());
        }

        let mut admitted = false;
        self.active
            .entry(key.to_owned())
            .and_modify(|active| {
                if *active < self.capacity {
                    *active += 1;
                    admitted = true;
                }
            })
            .or_insert_with(|| {
                admitted = true;
                1
            });

        if !admitted {
            if let Some(counter) = self.rejections.lock().unwrap_or_else(std::sync::PoisonError::into_inner).as_ref() {
                counter.increment(1);
            }
            return Ok(None);
        }

        Ok(Some(ActiveGuard {
            engine: self.clone(),
            key: key.to_owned(),
        }))
    }

    /// Decrement and, if the count reaches zero, evict the key, under a
    /// single `Entry` so the read-decrement-and-maybe-remove sequence is
    /// atomic with respect to a concurrent `try_acquire` for the same key
    /// (`spec.md` §5, the concurrency limiter's isolation properties).
    fn release(&self, key: &str) {
        if let Entry::Occupied(mut occupied) = self.active.entry(key.to_owned()) {
            *occupied.get_mut() -= 1;
            if *occupied.get() == 0 {
                occupied.remove();
            }
        }
    }

    /// Mark the engine destroyed and drop all accounting state.
    ///
    /// # Errors
    ///
    /// Returns `CONCURRENT_LIMIT_MIDDLEWARE_DESTROYED` if already
    /// destroyed.
    pub fn destroy(&self) -> Result<(), CoreError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(CoreError::concurrent_limit_destroyed());
        }
        self.active.clear();
        Ok(())
    }

    /// The in-flight count for `key`, for tests asserting capacity
    /// invariants.
    #[must_use]
    pub fn active_count(&self, key: &str) -> u32 { self.active.get(key).map_or(0, |v| *v) }

    fn register_metrics(&self, registry: &dyn MetricsRegistry) {
        let counter = registry.counter("concurrent_limiter.rejections");
        *self.rejections.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(counter);
    }
}

/// Releases one slot of in-flight capacity when dropped.
///
/// Holding this for the duration of `next` and relying on `Drop` is this
/// crate's guaranteed-release mechanism (`spec.md` §5, "release is
/// scheduled on both success and failure of next") — released on both the
/// `Ok` and `Err` path of a request, and even on panic unwinding.
pub struct ActiveGuard {
    engine: Arc<ConcurrencyLimiterEngine>,
    key: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) { self.engine.release(&self.key); }
}

type KeyFn = Arc<dyn Fn(&dyn Connection) -> String + Send + Sync>;

/// Middleware wrapping a [`ConcurrencyLimiterEngine`] with a keying
/// strategy.
pub struct ConcurrentLimitMiddleware {
    engine: Arc<ConcurrencyLimiterEngine>,
    key_of: KeyFn,
}

impl ConcurrentLimitMiddleware {
    /// Key by the peer's remote host string.
    #[must_use]
    pub fn by_remote_address(capacity: u32) -> Self {
        Self {
            engine: ConcurrencyLimiterEngine::new(capacity),
            key_of: Arc::new(remote_address_string),
        }
    }

    /// Key by a base64 encoding of the peer's 32-byte identity key.
    #[must_use]
    pub fn by_remote_public_key(capacity: u32) -> Self {
        Self {
            engine: ConcurrencyLimiterEngine::new(capacity),
            key_of: Arc::new(public_key_string),
        }
    }

    /// The underlying engine, for direct inspection in tests.
    #[must_use]
    pub fn engine(&self) -> &Arc<ConcurrencyLimiterEngine> { &self.engine }
}

#[async_trait]
impl Middleware for ConcurrentLimitMiddleware {
    async fn on_close(&self) -> Result<(), CoreError> { self.engine.destroy() }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Bytes, CoreError> {
        let key = (self.key_of)(ctx.connection.as_ref());
        let Some(guard) = self.engine.try_acquire(&key)? else {
            return Err(CoreError::concurrent_limit_exceeded());
        };
        let result = next.call(ctx).await;
        drop(guard);
        result
    }

    fn register_metrics(&self, registry: &dyn MetricsRegistry) { self.engine.register_metrics(registry); }
}
