//! Request payload decoding.
//!
//! The body is decoded at most once per request and cached on the context,
//! no matter how many parameters read from it.

use std::sync::Arc;

use axum::http::header::CONTENT_TYPE;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use crate::context::{insert_multi, Context, ParsedBody};
use crate::error::{RouterError, RouterResult};

/// Options handed to the decoder.
#[derive(Debug, Clone, Copy)]
pub struct BodyOptions {
    /// Largest accepted raw body in bytes.
    pub limit: usize,
}

impl Default for BodyOptions {
    fn default() -> Self {
        Self { limit: 1024 * 1024 }
    }
}

/// Turns a context's raw body into structured data.
pub trait PayloadDecoder: Send + Sync + 'static {
    fn parse_body<'a>(
        &'a self,
        ctx: &'a Context,
        options: &'a BodyOptions,
    ) -> BoxFuture<'a, RouterResult<ParsedBody>>;

    /// Path parameters merged over the query string.
    fn parse_query(&self, ctx: &Context) -> Value {
        ctx.merged_query()
    }
}

/// JSON, url-encoded form and plain-text decoder.
///
/// Multipart bodies are rejected; file parameters need a decoder that
/// fills [`ParsedBody::files`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPayloadDecoder;

impl DefaultPayloadDecoder {
    fn decode(ctx: &Context, options: &BodyOptions) -> RouterResult<ParsedBody> {
        let raw = ctx.raw_body();
        if raw.len() > options.limit {
            return Err(RouterError::Payload(format!(
                "body of {} bytes exceeds limit of {} bytes",
                raw.len(),
                options.limit
            )));
        }
        if raw.is_empty() {
            return Ok(ParsedBody::new(Value::Object(Map::new())));
        }

        let content_type = ctx
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase());

        let body = match content_type.as_deref() {
            Some(ct) if ct == "application/json" || ct.ends_with("+json") => {
                serde_json::from_slice(raw).map_err(|e| RouterError::Payload(e.to_string()))?
            }
            Some("application/x-www-form-urlencoded") => {
                let mut form = Map::new();
                for (key, value) in url::form_urlencoded::parse(raw) {
                    insert_multi(&mut form, key.into_owned(), Value::String(value.into_owned()));
                }
                Value::Object(form)
            }
            Some(ct) if ct.starts_with("multipart/") => {
                return Err(RouterError::Payload("multipart bodies are not supported".into()));
            }
            Some(ct) if ct.starts_with("text/") => {
                Value::String(String::from_utf8_lossy(raw).into_owned())
            }
            _ => serde_json::from_slice(raw)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned())),
        };
        Ok(ParsedBody::new(body))
    }
}

impl PayloadDecoder for DefaultPayloadDecoder {
    fn parse_body<'a>(
        &'a self,
        ctx: &'a Context,
        options: &'a BodyOptions,
    ) -> BoxFuture<'a, RouterResult<ParsedBody>> {
        Box::pin(async move { Self::decode(ctx, options) })
    }
}

/// Decoded body of `ctx`, decoding and caching it on first use.
pub async fn ensure_body(
    ctx: &mut Context,
    decoder: &dyn PayloadDecoder,
    options: &BodyOptions,
) -> RouterResult<Arc<ParsedBody>> {
    if let Some(parsed) = ctx.parsed_body() {
        return Ok(Arc::clone(parsed));
    }
    let parsed = Arc::new(decoder.parse_body(ctx, options).await?);
    ctx.set_parsed_body(Arc::clone(&parsed));
    Ok(parsed)
}
