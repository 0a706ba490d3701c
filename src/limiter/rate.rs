//! Per-key token-bucket rate limiter (`spec.md` §4.C).

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::task::JoinHandle;

use super::{public_key_string, remote_address_string};
use crate::{
    context::RequestContext,
    error::CoreError,
    metrics::{Counter, MetricsRegistry},
    middleware::{Middleware, Next},
    transport::Connection,
};

/// The per-key token-bucket engine.
///
/// Invariant (`spec.md` §3): `0 <= tokens < capacity` for every resident
/// key; a key at full capacity is absent from the map entirely (the
/// eviction rule that keeps a quiescent engine's memory at zero).
pub struct RateLimiterEngine {
    capacity: u32,
    tokens: DashMap<String, u32>,
    destroyed: AtomicBool,
    max_resident_keys: Option<usize>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    rejections: Mutex<Option<Arc<dyn Counter>>>,
}

impl RateLimiterEngine {
    /// Build an engine refilling one token per resident key every
    /// `interval`, and spawn its shared ticker task.
    ///
    /// `max_resident_keys`, when set, bounds how many never-seen keys may
    /// become resident at once — an additive guard against a key-flooding
    /// peer (`spec.md` §9, "Per-key lazy maps"); it never changes behavior
    /// for keys already resident.
    #[must_use]
    pub fn start(capacity: u32, interval: Duration, max_resident_keys: Option<usize>) -> Arc<Self> {
        let engine = Arc::new(Self {
            capacity,
            tokens: DashMap::new(),
            destroyed: AtomicBool::new(false),
            max_resident_keys,
            ticker: Mutex::new(None),
            rejections: Mutex::new(None),
        });

        let weak = Arc::downgrade(&engine);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                engine.refill_tick();
            }
        });
        *engine.ticker.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        engine
    }

    fn refill_tick(&self) {
        self.tokens.retain(|_, tokens| {
            *tokens += 1;
            *tokens < self.capacity
        });
    }

    /// Attempt to admit one request for `key`.
    ///
    /// # Errors
    ///
    /// Returns `RATE_LIMIT_MIDDLEWARE_DESTROYED` if the engine was already
    /// destroyed.
    pub fn try_acquire(&self, key: &str) -> Result<bool, CoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(CoreError::rate_limit_destroyed());
        }

        // Read the resident count before taking the entry: `DashMap::len`
        // locks every shard, including the one the entry below holds
        // exclusively, so calling it while that guard is live deadlocks.
        let resident = self.tokens.len();

        let acquired = match self.tokens.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() == 0 {
                    false
                } else {
                    *occupied.get_mut() -= 1;
                    true
                }
            }
            Entry::Vacant(vacant) => {
                if self.max_resident_keys.is_some_and(|max| resident >= max) {
                    false
                } else {
                    vacant.insert(self.capacity - 1);
                    true
                }
            }
        };

        if !acquired {
            if let Some(counter) = self.rejections.lock().unwrap_or_else(std::sync::PoisonError::into_inner).as_ref() {
                counter.increment(1);
            }
        }

        Ok(acquired)
    }

    /// Stop the ticker and clear resident state.
    ///
    /// # Errors
    ///
    /// Returns `RATE_LIMIT_MIDDLEWARE_DESTROYED` if already destroyed.
    pub fn destroy(&self) -> Result<(), CoreError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(CoreError::rate_limit_destroyed());
        }
        self.tokens.clear();
        if let Some(handle) = self.ticker.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            handle.abort();
        }
        Ok(())
    }

    /// The number of keys currently resident. Exposed for tests asserting
    /// invariant 6 (eviction).
    #[must_use]
    pub fn resident_keys(&self) -> usize { self.tokens.len() }

    fn register_metrics(&self, registry: &dyn MetricsRegistry) {
        let counter = registry.counter("rate_limiter.rejections");
        *self.rejections.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(counter);
    }
}

impl Drop for RateLimiterEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

type KeyFn = Arc<dyn Fn(&dyn Connection) -> String + Send + Sync>;

/// Middleware wrapping a [`RateLimiterEngine`] with a keying strategy.
pub struct RateLimitMiddleware {
    engine: Arc<RateLimiterEngine>,
    key_of: KeyFn,
}

impl RateLimitMiddleware {
    /// Key by the peer's remote host string.
    #[must_use]
    pub fn by_remote_address(capacity: u32, interval: Duration) -> Self {
        Self::by_remote_address_with_ceiling(capacity, interval, None)
    }

    /// [`Self::by_remote_address`], additionally bounding resident keys.
    #[must_use]
    pub fn by_remote_address_with_ceiling(
        capacity: u32,
        interval: Duration,
        max_resident_keys: Option<usize>,
    ) -> Self {
        Self {
            engine: RateLimiterEngine::start(capacity, interval, max_resident_keys),
            key_of: Arc::new(remote_address_string),
        }
    }

    /// Key by a base64 encoding of the peer's 32-byte identity key.
    #[must_use]
    pub fn by_remote_public_key(capacity: u32, interval: Duration) -> Self {
        Self::by_remote_public_key_with_ceiling(capacity, interval, None)
    }

    /// [`Self::by_remote_public_key`], additionally bounding resident keys.
    #[must_use]
    pub fn by_remote_public_key_with_ceiling(
        capacity: u32,
        interval: Duration,
        max_resident_keys: Option<usize>,
    ) -> Self {
        Self {
            engine: RateLimiterEngine::start(capacity, interval, max_resident_keys),
            key_of: Arc::new(public_key_string),
        }
    }

    /// The underlying engine, for direct inspection in tests or explicit
    /// out-of-band destruction.
    #[must_use]
    pub fn engine(&self) -> &Arc<RateLimiterEngine> { &self.engine }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn on_close(&self) -> Result<(), CoreError> { self.engine.destroy() }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Bytes, CoreError> {
        let key = (self.key_of)(ctx.connection.as_ref());
        if self.engine.try_acquire(&key)? {
            next.call(ctx).await
        } else {
            Err(CoreError::rate_limit_exceeded())
        }
    }

    fn register_metrics(&self, registry: &dyn MetricsRegistry) { self.engine.register_metrics(registry); }
}
