//! Compiled route entries.

use std::fmt;
use std::sync::Arc;

use crate::binding::CompiledParams;
use crate::context::Protocol;
use crate::middleware::ComposedMiddleware;

/// A controller method bound to one protocol path.
///
/// Built while loading a router and never modified afterwards.
#[derive(Clone)]
pub struct RouteEntry {
    pub protocol: Protocol,
    /// HTTP route, socket event path, `/Service/Method` or GraphQL field.
    pub path: String,
    pub verb: String,
    pub controller: String,
    pub method: String,
    pub params: Arc<CompiledParams>,
    /// Chain composed at load time; `None` when the route has no middleware.
    pub middleware: Option<ComposedMiddleware>,
    /// Scoped instance ids registered for this route.
    pub middleware_ids: Vec<String>,
}

impl RouteEntry {
    /// `VERB path`, unique within one router.
    pub fn key(&self) -> String {
        format!("{} {}", self.verb, self.path)
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("protocol", &self.protocol)
            .field("path", &self.path)
            .field("verb", &self.verb)
            .field("controller", &self.controller)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("middleware", &self.middleware_ids)
            .finish()
    }
}
