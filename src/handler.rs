//! Request handling.
//!
//! [`handle`] runs one controller method behind its middleware chain. It
//! never formats errors: whatever fails propagates to the protocol adapter,
//! which knows how to report it on its own wire.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::Instrument;

use crate::app::Application;
use crate::binding::CompiledParams;
use crate::context::Context;
use crate::di::{Controller, Reply};
use crate::error::{RouterError, RouterResult};
use crate::middleware::{ComposedMiddleware, MiddlewareFuture, Terminal};
use crate::observability::{metrics, tracing::request_span};
use crate::routing::RouteEntry;

/// Invoke `method` on `controller` through `composed`.
///
/// Arguments come from `precomputed` when given, otherwise from binding
/// `params` against the context once every middleware has run. A reply
/// value becomes the response body unless a middleware or the controller
/// already set one.
pub async fn handle(
    app: &Arc<Application>,
    ctx: Context,
    controller: Option<Arc<dyn Controller>>,
    method: &str,
    params: Option<Arc<CompiledParams>>,
    precomputed: Option<Vec<Value>>,
    composed: Option<&ComposedMiddleware>,
) -> RouterResult<Context> {
    let Some(controller) = controller else {
        return Err(RouterError::ControllerNotFound(ctx.path().to_string()));
    };

    let app = Arc::clone(app);
    let method: Arc<str> = Arc::from(method);
    let terminal: Terminal = Arc::new(move |mut ctx: Context| -> MiddlewareFuture {
        let app = Arc::clone(&app);
        let controller = Arc::clone(&controller);
        let method = Arc::clone(&method);
        let params = params.clone();
        let precomputed = precomputed.clone();
        Box::pin(async move {
            let args = match (precomputed, params) {
                (Some(args), _) => args,
                (None, Some(params)) => params.bind(&mut ctx, app.decoder(), app.body_options()).await?,
                (None, None) => Vec::new(),
            };
            match controller.invoke(&method, args, &mut ctx).await? {
                Reply::Error(error) => return Err(error),
                Reply::Value(value) => {
                    if ctx.body().is_none() {
                        ctx.set_body(value);
                    }
                }
                Reply::Empty => {}
            }
            Ok(ctx)
        })
    });

    match composed {
        Some(chain) if !chain.is_empty() => chain.run(ctx, terminal).await,
        _ => terminal(ctx).await,
    }
}

/// Resolve the entry's controller and run it inside a request span,
/// recording the outcome.
pub async fn dispatch_route(app: &Arc<Application>, entry: &RouteEntry, ctx: Context) -> RouterResult<Context> {
    let start = Instant::now();
    let span = request_span(&ctx);
    let controller = app.container().resolve(&entry.controller, &ctx);
    if controller.is_none() {
        tracing::warn!(controller = %entry.controller, path = %entry.path, "Route controller is not registered");
    }

    let result = handle(
        app,
        ctx,
        controller,
        &entry.method,
        Some(Arc::clone(&entry.params)),
        None,
        entry.middleware.as_ref(),
    )
    .instrument(span.clone())
    .await;

    let status = match &result {
        Ok(ctx) => ctx.status().as_u16(),
        Err(error) => {
            span.in_scope(|| tracing::debug!(%error, status = error.status().as_u16(), "Dispatch failed"));
            error.status().as_u16()
        }
    };
    metrics::record_request(&entry.protocol.to_string(), &entry.path, status, start);
    result
}
