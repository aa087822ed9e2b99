//! Turning controller metadata into route entries.

use std::sync::Arc;

use crate::app::Application;
use crate::binding::{compile_params, CompileOptions};
use crate::di::ControllerClass;
use crate::error::RouterResult;
use crate::metadata::{ControllerMetadata, MethodMetadata};
use crate::middleware::manager::scoped_instance_id;
use crate::middleware::{resolve_route_middleware, ExecutionContext, MiddlewareConfig};
use crate::routing::entry::RouteEntry;

/// Build one entry per method of `class`.
///
/// Route middleware is resolved, registered under route-scoped instance ids
/// and composed here, once. Parameter pipelines are compiled against the
/// container's DTO classes. `path_of` decides the protocol-specific path.
pub fn build_routes<F>(app: &Arc<Application>, class: &ControllerClass, path_of: F) -> RouterResult<Vec<RouteEntry>>
where
    F: Fn(&ControllerMetadata, &MethodMetadata) -> String,
{
    let controller = &class.metadata;
    let settings = &app.config().middleware;
    let mut entries = Vec::with_capacity(controller.methods.len());

    for method in &controller.methods {
        let path = path_of(controller, method);

        let decls = resolve_route_middleware(&controller.middleware, &method.middleware, settings.route_priority);
        let mut ids = Vec::with_capacity(decls.len());
        for decl in decls {
            let mut config = MiddlewareConfig::new(decl.name, decl.handler)
                .priority(decl.priority.unwrap_or(settings.route_priority))
                .scoped(path.as_str(), method.verb.as_str());
            let base = scoped_instance_id(&config.name, &path, &method.verb);
            if ids.contains(&base) {
                let ordinal = ids.iter().filter(|id| id.starts_with(base.as_str())).count();
                tracing::warn!(
                    middleware = %config.name,
                    path = %path,
                    "Distinct middleware share a name on one route"
                );
                config = config.instance_id(format!("{base}~{ordinal}"));
            }
            config.conditions = decl.conditions;
            config.metadata = decl.metadata;
            ids.push(app.middleware().register(config)?);
        }

        let middleware = if ids.is_empty() {
            None
        } else {
            let exec = ExecutionContext {
                protocol: controller.protocol,
                route: path.clone(),
                method: method.verb.clone(),
            };
            Some(app.middleware().compose(&ids, &exec))
        };

        let params = compile_params(
            &method.params,
            method.dto_check,
            app.container().dtos(),
            CompileOptions::default(),
        )?;
        tracing::debug!(
            controller = %controller.identifier,
            method = %method.name,
            verb = %method.verb,
            path = %path,
            shape = ?params.shape(),
            middleware = ids.len(),
            "Route compiled"
        );

        entries.push(RouteEntry {
            protocol: controller.protocol,
            path,
            verb: method.verb.clone(),
            controller: controller.identifier.clone(),
            method: method.name.clone(),
            params: Arc::new(params),
            middleware,
            middleware_ids: ids,
        });
    }
    Ok(entries)
}

/// Prefix joined with the method path.
pub fn prefixed_path(controller: &ControllerMetadata, method: &MethodMetadata) -> String {
    crate::metadata::join_path(&controller.prefix, &method.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, Protocol};
    use crate::di::{Controller, Reply};
    use crate::metadata::ParamMetadata;
    use crate::middleware::{MiddlewareDecl, MiddlewareRef, Next};
    use crate::binding::ParamShape;
    use futures_util::future::BoxFuture;
    use serde_json::Value;

    struct Nop;

    impl Controller for Nop {
        fn invoke<'a>(&'a self, _: &'a str, _: Vec<Value>, _: &'a mut Context) -> BoxFuture<'a, RouterResult<Reply>> {
            Box::pin(async { Ok(Reply::Empty) })
        }
    }

    fn noop() -> MiddlewareRef {
        MiddlewareRef::from_fn(|ctx: Context, next: Next| next.run(ctx))
    }

    #[test]
    fn registers_scoped_middleware_once_per_route() {
        let app = Arc::new(Application::default());
        let (auth, audit) = (noop(), noop());
        let metadata = ControllerMetadata::new("users", "/users")
            .middleware(MiddlewareDecl::new("auth", auth.clone()))
            .route(
                MethodMetadata::get("list", "/")
                    .param(ParamMetadata::query("page").number())
                    .middleware(MiddlewareDecl::new("audit", audit).priority(90)),
            )
            .route(MethodMetadata::get("open", "/open").middleware(MiddlewareDecl::disable("auth", auth)));
        let class = ControllerClass::singleton(metadata, Arc::new(Nop));

        let entries = build_routes(&app, &class, prefixed_path).unwrap();
        assert_eq!(entries.len(), 2);

        let list = &entries[0];
        assert_eq!(list.path, "/users");
        assert_eq!(list.middleware_ids, vec!["audit@/users#GET", "auth@/users#GET"]);
        assert_eq!(list.middleware.as_ref().map(|m| m.len()), Some(2));
        assert_eq!(list.params.shape(), ParamShape::SingleSimple);

        let open = &entries[1];
        assert_eq!(open.path, "/users/open");
        assert!(open.middleware.is_none());
        assert_eq!(app.middleware().len(), 2);
    }

    #[tokio::test]
    async fn same_named_middleware_keep_separate_instances() {
        use std::sync::Mutex;

        let app = Arc::new(Application::default());
        let trail = Arc::new(Mutex::new(Vec::new()));
        let tagged = |tag: &'static str| {
            let trail = Arc::clone(&trail);
            MiddlewareRef::from_fn(move |ctx: Context, next: Next| {
                trail.lock().unwrap().push(tag);
                next.run(ctx)
            })
        };
        let metadata = ControllerMetadata::new("users", "/users")
            .middleware(MiddlewareDecl::new("log", tagged("controller-log")).priority(20))
            .route(MethodMetadata::get("list", "/").middleware(MiddlewareDecl::new("log", tagged("method-log")).priority(10)));
        let class = ControllerClass::singleton(metadata, Arc::new(Nop));

        let entries = build_routes(&app, &class, prefixed_path).unwrap();
        let list = &entries[0];
        assert_eq!(list.middleware_ids, vec!["log@/users#GET", "log@/users#GET~1"]);
        assert_eq!(app.middleware().len(), 2);

        let terminal: crate::middleware::Terminal =
            Arc::new(|ctx: Context| -> crate::middleware::MiddlewareFuture { Box::pin(async move { Ok(ctx) }) });
        let chain = list.middleware.as_ref().unwrap();
        chain.run(Context::new(Protocol::Http, "GET", "/users"), terminal).await.unwrap();
        assert_eq!(*trail.lock().unwrap(), vec!["controller-log", "method-log"]);
    }

    #[test]
    fn unknown_dto_fails_the_load() {
        let app = Arc::new(Application::default());
        let metadata = ControllerMetadata::new("users", "/users")
            .route(MethodMetadata::post("create", "/").param(ParamMetadata::dto("CreateUser")));
        let class = ControllerClass::singleton(metadata, Arc::new(Nop));
        assert!(build_routes(&app, &class, prefixed_path).is_err());
    }
}
