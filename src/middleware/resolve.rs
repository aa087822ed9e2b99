//! Merging of controller-level and method-level middleware declarations.

use serde_json::{Map, Value};

use crate::middleware::condition::Condition;
use crate::middleware::core::MiddlewareRef;

/// A middleware attached to a controller or a single method.
#[derive(Debug, Clone)]
pub struct MiddlewareDecl {
    pub name: String,
    pub handler: MiddlewareRef,
    pub priority: Option<i32>,
    /// `Some(false)` on a method entry disables a controller-level entry with
    /// the same handler.
    pub enabled: Option<bool>,
    pub conditions: Vec<Condition>,
    pub metadata: Map<String, Value>,
}

impl MiddlewareDecl {
    pub fn new(name: impl Into<String>, handler: MiddlewareRef) -> Self {
        Self {
            name: name.into(),
            handler,
            priority: None,
            enabled: None,
            conditions: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Method-level entry that turns off a controller-level middleware.
    pub fn disable(name: impl Into<String>, handler: MiddlewareRef) -> Self {
        Self::new(name, handler).enabled(false)
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn is_disable(&self) -> bool {
        self.enabled == Some(false)
    }
}

/// Resolve the middleware for one route.
///
/// Method-level disables only remove entries the controller declared; every
/// other method-level entry is added, replacing a controller entry with the
/// same handler in place. The result holds each handler once, ordered by
/// descending priority with declaration order kept among ties. Missing
/// priorities become `default_priority`.
pub fn resolve_route_middleware(
    controller: &[MiddlewareDecl],
    method: &[MiddlewareDecl],
    default_priority: i32,
) -> Vec<MiddlewareDecl> {
    let mut resolved: Vec<MiddlewareDecl> = Vec::with_capacity(controller.len() + method.len());
    for decl in controller {
        if decl.is_disable() {
            tracing::debug!(middleware = %decl.name, "Ignoring disabled controller-level middleware");
            continue;
        }
        if !resolved.iter().any(|d| d.handler.same_as(&decl.handler)) {
            resolved.push(decl.clone());
        }
    }

    for decl in method {
        let existing = resolved
            .iter()
            .position(|d| d.handler.same_as(&decl.handler));
        match (decl.is_disable(), existing) {
            (true, Some(pos)) => {
                resolved.remove(pos);
            }
            (true, None) => {
                tracing::warn!(
                    middleware = %decl.name,
                    "Method disables a middleware its controller never declared"
                );
            }
            (false, Some(pos)) => resolved[pos] = decl.clone(),
            (false, None) => resolved.push(decl.clone()),
        }
    }

    for decl in &mut resolved {
        decl.priority.get_or_insert(default_priority);
        decl.enabled = Some(true);
    }
    resolved.sort_by(|a, b| b.priority.cmp(&a.priority));
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::middleware::core::Next;

    fn noop() -> MiddlewareRef {
        MiddlewareRef::from_fn(|ctx: Context, next: Next| next.run(ctx))
    }

    fn names(decls: &[MiddlewareDecl]) -> Vec<&str> {
        decls.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn method_disable_removes_controller_entry() {
        let (a, b, c) = (noop(), noop(), noop());
        let controller = [MiddlewareDecl::new("A", a.clone()), MiddlewareDecl::new("B", b)];
        let method = [MiddlewareDecl::disable("A", a), MiddlewareDecl::new("C", c)];

        let resolved = resolve_route_middleware(&controller, &method, 50);
        assert_eq!(names(&resolved), ["B", "C"]);
        assert!(resolved.iter().all(|d| d.priority == Some(50)));
    }

    #[test]
    fn disabling_undeclared_middleware_is_a_no_op() {
        let (a, b) = (noop(), noop());
        let controller = [MiddlewareDecl::new("A", a)];
        let method = [MiddlewareDecl::disable("B", b)];
        let resolved = resolve_route_middleware(&controller, &method, 50);
        assert_eq!(names(&resolved), ["A"]);
    }

    #[test]
    fn method_entry_replaces_same_handler() {
        let a = noop();
        let controller = [MiddlewareDecl::new("A", a.clone()).priority(10)];
        let method = [MiddlewareDecl::new("A-override", a).priority(90)];
        let resolved = resolve_route_middleware(&controller, &method, 50);
        assert_eq!(names(&resolved), ["A-override"]);
        assert_eq!(resolved[0].priority, Some(90));
    }

    #[test]
    fn duplicates_collapse_and_order_by_priority() {
        let (a, b, c) = (noop(), noop(), noop());
        let controller = [
            MiddlewareDecl::new("A", a.clone()).priority(10),
            MiddlewareDecl::new("A-again", a),
            MiddlewareDecl::new("B", b),
        ];
        let method = [MiddlewareDecl::new("C", c).priority(90)];
        let resolved = resolve_route_middleware(&controller, &method, 50);
        assert_eq!(names(&resolved), ["C", "B", "A"]);
    }
}
