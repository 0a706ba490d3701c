//! A minimal metrics seam.
//!
//! `spec.md` treats the metrics registry as an external collaborator (a
//! "generic Prometheus-style metrics registry", out of scope for this
//! crate). [`MetricsRegistry`] is the narrow trait the router and
//! middleware need: a way to obtain a named, monotonically increasing
//! counter. A real host wires this to its own registry; [`NoopRegistry`]
//! is supplied for hosts that don't care, and `TestRegistry` (behind
//! `test-support`) backs this crate's own tests.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A single monotonically increasing counter.
pub trait Counter: Send + Sync {
    /// Add `by` to the counter's value.
    fn increment(&self, by: u64);

    /// The counter's current value.
    fn value(&self) -> u64;
}

/// A source of named counters.
///
/// `registerMetrics` fans out to every middleware in registration order
/// (`spec.md` §4.B); each middleware that wants a counter calls
/// [`MetricsRegistry::counter`] with a name of its choosing. Naming is a
/// concern of the host application, per `spec.md` §4.G.
pub trait MetricsRegistry: Send + Sync {
    /// Obtain (creating if necessary) the counter named `name`.
    fn counter(&self, name: &str) -> Arc<dyn Counter>;
}

/// A counter backed by an [`AtomicU64`].
#[derive(Default)]
pub struct AtomicCounter(AtomicU64);

impl Counter for AtomicCounter {
    fn increment(&self, by: u64) { self.0.fetch_add(by, Ordering::Relaxed); }

    fn value(&self) -> u64 { self.0.load(Ordering::Relaxed) }
}

/// A registry that discards everything. The default for a router that has
/// not wired in real metrics.
#[derive(Default)]
pub struct NoopRegistry;

struct NoopCounter;

impl Counter for NoopCounter {
    fn increment(&self, _by: u64) {}

    fn value(&self) -> u64 { 0 }
}

impl MetricsRegistry for NoopRegistry {
    fn counter(&self, _name: &str) -> Arc<dyn Counter> { Arc::new(NoopCounter) }
}

/// An in-memory registry used by this crate's own tests to assert on
/// counter values. Not part of the public surface a host application is
/// expected to use in production.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use dashmap::DashMap;

    use super::{AtomicCounter, Counter, MetricsRegistry};
    use std::sync::Arc;

    /// A registry backed by a concurrent map of named [`AtomicCounter`]s.
    #[derive(Default)]
    pub struct TestRegistry {
        counters: DashMap<String, Arc<AtomicCounter>>,
    }

    impl TestRegistry {
        /// A fresh, empty registry.
        #[must_use]
        pub fn new() -> Self { Self::default() }

        /// The current value of `name`, or 0 if it was never touched.
        #[must_use]
        pub fn value(&self, name: &str) -> u64 {
            self.counters.get(name).map_or(0, |c| c.value())
        }
    }

    impl MetricsRegistry for TestRegistry {
        fn counter(&self, name: &str) -> Arc<dyn Counter> {
            self.counters
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(AtomicCounter::default()))
                .clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{test_support::TestRegistry, *};

    #[rstest]
    fn noop_registry_discards_increments() {
        let registry = NoopRegistry;
        let counter = registry.counter("requests");
        counter.increment(5);
        assert_eq!(counter.value(), 0);
    }

    #[rstest]
    fn test_registry_accumulates_by_name() {
        let registry = TestRegistry::new();
        registry.counter("requests").increment(2);
        registry.counter("requests").increment(3);
        registry.counter("errors").increment(1);
        assert_eq!(registry.value("requests"), 5);
        assert_eq!(registry.value("errors"), 1);
        assert_eq!(registry.value("never-touched"), 0);
    }
}
