//! Request spans.

use tracing::Span;

use crate::context::Context;

/// Span wrapping one dispatch, carrying the request's correlation id.
pub fn request_span(ctx: &Context) -> Span {
    tracing::info_span!(
        "request",
        protocol = %ctx.protocol(),
        method = %ctx.method(),
        path = %ctx.path(),
        request_id = %ctx.request_id(),
    )
}
