//! The payload-encoding adapter middleware.
//!
//! A reusable `Middleware` that decodes the inbound payload before calling
//! `next` and encodes whatever typed result comes back, built from the same
//! [`Codec`] trait the router uses for a method's own `requestEncoding` /
//! `responseEncoding` (`spec.md` §4.E). Registering a method with
//! `requestEncoding`/`responseEncoding` options gets you the router's own
//! built-in decode/encode step; this middleware exists for the same
//! behavior layered generically — e.g. applied globally, ahead of
//! method-specific concerns, or shared across several registrations that
//! want identical framing.
//!
//! Because the onion's `on_request` contract is uniform on `Bytes`, the
//! decoded value is handed to downstream layers through
//! [`RequestContext::extensions`] rather than by changing the static type
//! of `ctx.value` (`spec.md` §9, "Dynamic context bag" — the same
//! type-keyed side-table used everywhere else this crate needs a
//! middleware-contributed field).

use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    codec::Codec,
    context::RequestContext,
    error::CoreError,
    middleware::{Middleware, Next},
};

/// Configuration for [`EncodingMiddleware`]: the request codec, the
/// response codec, or both. Either may be omitted, in which case that side
/// of the payload passes through unchanged.
pub struct EncodingOptions<T> {
    /// Decodes `ctx.value` into `T` before `next` runs.
    pub request: Option<Arc<dyn Codec<T>>>,
    /// Encodes the downstream result back to bytes after `next` runs.
    pub response: Option<Arc<dyn Codec<T>>>,
}

impl<T> EncodingOptions<T> {
    /// No codecs configured: both directions pass through unchanged.
    #[must_use]
    pub fn none() -> Self {
        Self {
            request: None,
            response: None,
        }
    }
}

impl<T> Default for EncodingOptions<T> {
    fn default() -> Self { Self::none() }
}

/// Middleware that decodes the inbound payload and encodes the outbound
/// result, per `spec.md` §4.E.
///
/// `T` is the single decoded/encoded shape shared by both directions,
/// matching the round-trip law in `spec.md` §8 ("if `req` decodes to `r`
/// and the handler returns `r` and the same codec encodes `r` back to the
/// original bytes, the end-to-end transformation is the identity").
///
/// Response encoding reads the typed value from [`RequestContext::extensions`]
/// rather than from `next`'s `Bytes` return directly, since the onion's
/// `on_request` contract is uniform on `Bytes` and there is no other channel
/// for a typed value to cross it. A handler (or a downstream middleware)
/// that wants its result encoded by a configured response codec must stash
/// a `T` into `ctx.extensions` before returning; if the response codec is
/// configured but nothing stashed a `T`, that is a misconfiguration and this
/// middleware raises `ENCODE_ERROR` rather than silently passing the raw
/// bytes through.
pub struct EncodingMiddleware<T> {
    request: Option<Arc<dyn Codec<T>>>,
    response: Option<Arc<dyn Codec<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EncodingMiddleware<T> {
    /// Build the adapter from `options`.
    #[must_use]
    pub fn new(options: EncodingOptions<T>) -> Self {
        Self {
            request: options.request,
            response: options.response,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Middleware for EncodingMiddleware<T> {
    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Bytes, CoreError> {
        if let Some(codec) = &self.request {
            let decoded = codec
                .decode(&ctx.value)
                .map_err(|cause| CoreError::decode("request encoding adapter", Some(cause)))?;
            ctx.extensions.insert(decoded);
        }

        let result = next.call(ctx).await?;

        if let Some(codec) = &self.response {
            let Some(value) = ctx.extensions.get::<T>() else {
                return Err(CoreError::encode(
                    "response encoding adapter: no value stashed in extensions for next() to encode",
                    None,
                ));
            };
            return codec
                .encode(value)
                .map_err(|cause| CoreError::encode("response encoding adapter", Some(cause)));
        }

        Ok(result)
    }
}
