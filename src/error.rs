//! Error taxonomy for the router core.
//!
//! Every failure surfaced by this crate is a [`CoreError`] variant. Each
//! variant carries a machine-readable code (its own discriminant via
//! [`CoreError::code`]), a human message, and — where it wraps a failure
//! from a lower layer — the original error as `source`.

use std::fmt;

use uuid::Uuid;

/// Stable, machine-readable error codes.
///
/// These mirror the codes a host application would match on to decide how
/// to respond to a peer (reject, retry elsewhere, disconnect).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// An operation requiring the router to be open was attempted earlier.
    RouterNotReady,
    /// An operation was attempted during or after `closing`.
    RouterClosed,
    /// The per-key token bucket had no tokens available.
    RateLimitExceeded,
    /// The rate limiter middleware was used after `destroy`.
    RateLimitMiddlewareDestroyed,
    /// The per-key concurrency gate was already at capacity.
    ConcurrentLimitExceeded,
    /// The concurrency limiter middleware was used after `destroy`.
    ConcurrentLimitMiddlewareDestroyed,
    /// The inbound payload failed to decode.
    DecodeError,
    /// The outbound payload failed to encode.
    EncodeError,
    /// The peer's capability handshake proof was missing or invalid.
    CapabilityInvalid,
    /// A handler raised an application-defined failure.
    HandlerError,
    /// Several errors occurred and were folded into one.
    Aggregate,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::RouterNotReady => "ROUTER_NOT_READY",
            Self::RouterClosed => "ROUTER_CLOSED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::RateLimitMiddlewareDestroyed => "RATE_LIMIT_MIDDLEWARE_DESTROYED",
            Self::ConcurrentLimitExceeded => "CONCURRENT_LIMIT_EXCEEDED",
            Self::ConcurrentLimitMiddlewareDestroyed => "CONCURRENT_LIMIT_MIDDLEWARE_DESTROYED",
            Self::DecodeError => "DECODE_ERROR",
            Self::EncodeError => "ENCODE_ERROR",
            Self::CapabilityInvalid => "CAPABILITY_INVALID",
            Self::HandlerError => "HANDLER_ERROR",
            Self::Aggregate => "AGGREGATE",
        };
        f.write_str(text)
    }
}

/// The crate's single error type.
///
/// There is one taxonomy, not a router-specific error and a separate
/// limiter-specific error: every failure that can leave the chain is a
/// `CoreError`, with `context` populated by the router at the point it
/// re-raises the error to the transport.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// `ROUTER_NOT_READY` / `ROUTER_CLOSED`.
    #[error("{code}: {message}")]
    Router {
        /// Which of the two lifecycle violations occurred.
        code: ErrorCode,
        /// Human-readable detail.
        message: &'static str,
    },
    /// `RATE_LIMIT_EXCEEDED` / `RATE_LIMIT_MIDDLEWARE_DESTROYED`.
    #[error("{code}: {message}")]
    RateLimit {
        /// Which rate-limit condition occurred.
        code: ErrorCode,
        /// Human-readable detail.
        message: &'static str,
    },
    /// `CONCURRENT_LIMIT_EXCEEDED` / `CONCURRENT_LIMIT_MIDDLEWARE_DESTROYED`.
    #[error("{code}: {message}")]
    ConcurrentLimit {
        /// Which concurrency-limit condition occurred.
        code: ErrorCode,
        /// Human-readable detail.
        message: &'static str,
    },
    /// The request codec failed to decode the inbound payload.
    #[error("DECODE_ERROR: {message}")]
    Decode {
        /// Human-readable detail.
        message: String,
        /// The underlying decode failure, if the codec produced one.
        #[source]
        cause: Option<Box<CoreError>>,
    },
    /// The response codec failed to encode the handler's result.
    #[error("ENCODE_ERROR: {message}")]
    Encode {
        /// Human-readable detail.
        message: String,
        /// The underlying encode failure, if the codec produced one.
        #[source]
        cause: Option<Box<CoreError>>,
    },
    /// The capability handshake failed verification.
    #[error("CAPABILITY_INVALID: {message}")]
    CapabilityInvalid {
        /// Human-readable detail.
        message: &'static str,
    },
    /// A handler-level failure, opaque to the router.
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Several errors folded into one, preserving order. Used solely on the
    /// close path.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl CoreError {
    /// The error's machine-readable [`ErrorCode`].
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Router { code, .. }
            | Self::RateLimit { code, .. }
            | Self::ConcurrentLimit { code, .. } => *code,
            Self::Decode { .. } => ErrorCode::DecodeError,
            Self::Encode { .. } => ErrorCode::EncodeError,
            Self::CapabilityInvalid { .. } => ErrorCode::CapabilityInvalid,
            Self::Handler(_) => ErrorCode::HandlerError,
            Self::Aggregate(_) => ErrorCode::Aggregate,
        }
    }

    /// Construct a `ROUTER_NOT_READY` error.
    #[must_use]
    pub const fn router_not_ready(message: &'static str) -> Self {
        Self::Router {
            code: ErrorCode::RouterNotReady,
            message,
        }
    }

    /// Construct a `ROUTER_CLOSED` error.
    #[must_use]
    pub const fn router_closed(message: &'static str) -> Self {
        Self::Router {
            code: ErrorCode::RouterClosed,
            message,
        }
    }

    /// Construct a `RATE_LIMIT_EXCEEDED` error.
    #[must_use]
    pub const fn rate_limit_exceeded() -> Self {
        Self::RateLimit {
            code: ErrorCode::RateLimitExceeded,
            message: "rate limit exceeded",
        }
    }

    /// Construct a `RATE_LIMIT_MIDDLEWARE_DESTROYED` error.
    #[must_use]
    pub const fn rate_limit_destroyed() -> Self {
        Self::RateLimit {
            code: ErrorCode::RateLimitMiddlewareDestroyed,
            message: "rate limit middleware destroyed",
        }
    }

    /// Construct a `CONCURRENT_LIMIT_EXCEEDED` error.
    #[must_use]
    pub const fn concurrent_limit_exceeded() -> Self {
        Self::ConcurrentLimit {
            code: ErrorCode::ConcurrentLimitExceeded,
            message: "concurrent limit exceeded",
        }
    }

    /// Construct a `CONCURRENT_LIMIT_MIDDLEWARE_DESTROYED` error.
    #[must_use]
    pub const fn concurrent_limit_destroyed() -> Self {
        Self::ConcurrentLimit {
            code: ErrorCode::ConcurrentLimitMiddlewareDestroyed,
            message: "concurrency limit middleware destroyed",
        }
    }

    /// Wrap a decode failure from a codec.
    #[must_use]
    pub fn decode(message: impl Into<String>, cause: Option<CoreError>) -> Self {
        Self::Decode {
            message: message.into(),
            cause: cause.map(Box::new),
        }
    }

    /// Wrap an encode failure from a codec.
    #[must_use]
    pub fn encode(message: impl Into<String>, cause: Option<CoreError>) -> Self {
        Self::Encode {
            message: message.into(),
            cause: cause.map(Box::new),
        }
    }

    /// Construct a `CAPABILITY_INVALID` error.
    #[must_use]
    pub const fn capability_invalid(message: &'static str) -> Self {
        Self::CapabilityInvalid { message }
    }

    /// Wrap an opaque handler failure.
    pub fn handler(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Handler(Box::new(err))
    }

    /// `true` for errors that originate in handler execution rather than in
    /// middleware, decoding, or encoding. Used to decide whether
    /// `handler_errors` should be incremented.
    #[must_use]
    pub const fn is_handler_error(&self) -> bool { matches!(self, Self::Handler(_)) }
}

/// Several errors folded into one, in the order they occurred.
///
/// Used solely on the close path: every `onClose` hook runs regardless of
/// earlier failures, and all failures are reported together at the end.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<CoreError>,
}

impl AggregateError {
    /// An aggregate with no errors. [`Self::into_result`] turns this into
    /// `Ok(())`.
    #[must_use]
    pub const fn new() -> Self { Self { errors: Vec::new() } }

    /// Append an error, flattening nested aggregates so the final aggregate
    /// is never nested.
    pub fn push(&mut self, error: CoreError) {
        match error {
            CoreError::Aggregate(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    /// `true` if no errors were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.errors.is_empty() }

    /// The recorded errors, in the order they occurred.
    #[must_use]
    pub fn errors(&self) -> &[CoreError] { &self.errors }

    /// Collapse to `Ok(())` if empty, or `Err(CoreError::Aggregate(self))`
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns the aggregate itself, wrapped, when it holds at least one
    /// error.
    pub fn into_result(self) -> Result<(), CoreError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{} error(s): {joined}", self.errors.len())
    }
}

impl std::error::Error for AggregateError {}

/// An error as it leaves the router, carrying the request id it occurred
/// under.
///
/// `CoreError` itself has no `context` field: only the router's outermost
/// catch knows the request id (per `spec.md` §7, "the router stamps
/// `err.context = requestId` at the outermost catch"), so that stamping is
/// modeled as wrapping rather than as a field every variant must carry. This
/// is the type that actually crosses the [`crate::transport::Responder`]
/// seam back to the transport, so the request id survives to whatever
/// surfaces the failure to the peer (`spec.md` §8 invariant 11).
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RoutedError {
    /// The underlying failure.
    #[source]
    pub error: CoreError,
    /// The request id the failure occurred under, when one exists. Absent
    /// only for failures raised outside any single request (e.g. during
    /// `open`/`close`).
    pub context: Option<Uuid>,
}

impl RoutedError {
    /// Stamp `error` with `request_id` as its context.
    #[must_use]
    pub const fn new(error: CoreError, request_id: Uuid) -> Self {
        Self {
            error,
            context: Some(request_id),
        }
    }

    /// The underlying error's machine-readable [`ErrorCode`].
    #[must_use]
    pub const fn code(&self) -> ErrorCode { self.error.code() }
}
