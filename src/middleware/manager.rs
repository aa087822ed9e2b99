//! Middleware registry and composition.
//!
//! # Responsibilities
//! - Register middleware instances under unique, route-scoped identifiers
//! - Look instances up by id, by name, or by route and verb
//! - Compose a set of instances into one continuation chain
//! - Own the condition caches and their periodic pressure check

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::config::MiddlewareSettings;
use crate::context::{Context, Protocol};
use crate::error::{RouterError, RouterResult};
use crate::middleware::condition::{Condition, ConditionCache};
use crate::middleware::core::{ComposedMiddleware, Middleware, MiddlewareFuture, MiddlewareRef, Next};

/// Registration request for a middleware instance.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub name: String,
    /// Explicit instance id; derived from name, route and verb when unset.
    pub instance_id: Option<String>,
    pub handler: MiddlewareRef,
    /// Higher runs first. Falls back to the manager default when unset.
    pub priority: Option<i32>,
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    pub metadata: Map<String, Value>,
    pub route: Option<String>,
    pub method: Option<String>,
}

impl MiddlewareConfig {
    pub fn new(name: impl Into<String>, handler: MiddlewareRef) -> Self {
        Self {
            name: name.into(),
            instance_id: None,
            handler,
            priority: None,
            enabled: true,
            conditions: Vec::new(),
            metadata: Map::new(),
            route: None,
            method: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
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

    /// Scope the instance to a route and verb.
    pub fn scoped(mut self, route: impl Into<String>, method: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self.method = Some(method.into().to_ascii_uppercase());
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }
}

/// A registered middleware instance.
pub struct MiddlewareInstance {
    pub instance_id: String,
    pub name: String,
    pub handler: MiddlewareRef,
    pub priority: i32,
    pub conditions: Arc<[Condition]>,
    pub metadata: Map<String, Value>,
    pub route: Option<String>,
    pub method: Option<String>,
    enabled: AtomicBool,
}

impl MiddlewareInstance {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for MiddlewareInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareInstance")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.is_enabled())
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

/// Where a composition is happening, for diagnostics.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub protocol: Protocol,
    pub route: String,
    pub method: String,
}

/// Derive the id of an instance scoped to a route and verb.
pub fn scoped_instance_id(name: &str, route: &str, method: &str) -> String {
    format!("{name}@{route}#{}", method.to_ascii_uppercase())
}

/// Runs the wrapped middleware only when all its conditions hold.
struct ConditionalMiddleware {
    inner: Arc<dyn Middleware>,
    conditions: Arc<[Condition]>,
    cache: Arc<ConditionCache>,
}

impl Middleware for ConditionalMiddleware {
    fn call(&self, ctx: Context, next: Next) -> MiddlewareFuture {
        if self.cache.matches_all(&self.conditions, &ctx) {
            self.inner.call(ctx, next)
        } else {
            next.run(ctx)
        }
    }
}

/// Process-wide middleware registry, constructed once per application.
pub struct MiddlewareManager {
    instances: DashMap<String, Arc<MiddlewareInstance>>,
    cache: Arc<ConditionCache>,
    settings: MiddlewareSettings,
    sequence: AtomicU64,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl MiddlewareManager {
    pub fn new(settings: MiddlewareSettings) -> Self {
        Self {
            instances: DashMap::new(),
            cache: Arc::new(ConditionCache::new(&settings)),
            settings,
            sequence: AtomicU64::new(0),
            maintenance: Mutex::new(None),
        }
    }

    /// Store a middleware instance and return its id.
    pub fn register(&self, config: MiddlewareConfig) -> RouterResult<String> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(RouterError::config("middleware name must not be empty"));
        }
        for condition in &config.conditions {
            condition.validate()?;
        }

        let instance_id = match (&config.instance_id, &config.route) {
            (Some(id), _) => id.clone(),
            (None, Some(route)) => {
                scoped_instance_id(name, route, config.method.as_deref().unwrap_or("ALL"))
            }
            (None, None) => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                format!("{name}_{nanos}_{seq}")
            }
        };

        let instance = Arc::new(MiddlewareInstance {
            instance_id: instance_id.clone(),
            name: name.to_string(),
            handler: config.handler,
            priority: config.priority.unwrap_or(self.settings.default_priority),
            conditions: Arc::from(config.conditions),
            metadata: config.metadata,
            route: config.route,
            method: config.method,
            enabled: AtomicBool::new(config.enabled),
        });

        if self.instances.insert(instance_id.clone(), instance).is_some() {
            tracing::debug!(instance_id = %instance_id, "Middleware instance replaced");
        } else {
            tracing::debug!(instance_id = %instance_id, "Middleware registered");
        }
        Ok(instance_id)
    }

    /// Remove one instance by id, or every instance sharing a name.
    ///
    /// Returns the number of instances removed.
    pub fn unregister(&self, name_or_id: &str) -> usize {
        if self.instances.remove(name_or_id).is_some() {
            tracing::debug!(instance_id = %name_or_id, "Middleware unregistered");
            return 1;
        }
        let before = self.instances.len();
        self.instances.retain(|_, instance| instance.name != name_or_id);
        let removed = before - self.instances.len();
        if removed > 0 {
            tracing::debug!(name = %name_or_id, removed, "Middleware instances unregistered");
        }
        removed
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<MiddlewareInstance>> {
        self.instances.get(instance_id).map(|r| Arc::clone(r.value()))
    }

    /// Every instance registered under `name`.
    pub fn instances_by_name(&self, name: &str) -> Vec<Arc<MiddlewareInstance>> {
        let mut found: Vec<_> = self
            .instances
            .iter()
            .filter(|r| r.value().name == name)
            .map(|r| Arc::clone(r.value()))
            .collect();
        found.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        found
    }

    /// Look an instance up by logical name and route.
    ///
    /// Tries the derived instance id first, then scans route/method fields.
    pub fn get_middleware_by_route(
        &self,
        name: &str,
        route: &str,
        method: &str,
    ) -> Option<Arc<MiddlewareInstance>> {
        if let Some(found) = self.get(&scoped_instance_id(name, route, method)) {
            return Some(found);
        }
        self.instances
            .iter()
            .find(|r| {
                let instance = r.value();
                instance.name == name
                    && instance.route.as_deref() == Some(route)
                    && instance
                        .method
                        .as_deref()
                        .map_or(true, |m| m.eq_ignore_ascii_case(method))
            })
            .map(|r| Arc::clone(r.value()))
    }

    /// Enable or disable an instance. Affects subsequent compositions.
    pub fn set_enabled(&self, instance_id: &str, enabled: bool) -> bool {
        match self.instances.get(instance_id) {
            Some(instance) => {
                instance.enabled.store(enabled, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Fold the given instances into a single chain.
    ///
    /// Missing and disabled instances are skipped. The rest run in descending
    /// priority, ties keeping the order they were passed in.
    pub fn compose(&self, instance_ids: &[String], exec: &ExecutionContext) -> ComposedMiddleware {
        let mut selected: Vec<Arc<MiddlewareInstance>> = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            match self.get(id) {
                Some(instance) if instance.is_enabled() => selected.push(instance),
                Some(_) => tracing::debug!(instance_id = %id, route = %exec.route, "Skipping disabled middleware"),
                None => tracing::debug!(instance_id = %id, route = %exec.route, "Skipping unknown middleware"),
            }
        }
        // Stable: equal priorities keep registration order.
        selected.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut chain: Vec<Arc<dyn Middleware>> = Vec::with_capacity(selected.len());
        let mut ids = Vec::with_capacity(selected.len());
        for instance in selected {
            let handler = instance.handler.as_middleware();
            if instance.conditions.is_empty() {
                chain.push(handler);
            } else {
                chain.push(Arc::new(ConditionalMiddleware {
                    inner: handler,
                    conditions: Arc::clone(&instance.conditions),
                    cache: Arc::clone(&self.cache),
                }));
            }
            ids.push(instance.instance_id.clone());
        }

        tracing::debug!(
            protocol = %exec.protocol,
            route = %exec.route,
            method = %exec.method,
            chain = ?ids,
            "Middleware composed"
        );
        ComposedMiddleware::new(chain, ids)
    }

    pub fn condition_cache(&self) -> &Arc<ConditionCache> {
        &self.cache
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance counts per name, for diagnostics.
    pub fn summary(&self) -> HashMap<String, usize> {
        let mut summary = HashMap::new();
        for r in self.instances.iter() {
            *summary.entry(r.value().name.clone()).or_insert(0) += 1;
        }
        summary
    }

    /// Start the periodic cache pressure check. Requires a tokio runtime.
    pub fn start_maintenance(&self) {
        let mut slot = self.maintenance.lock().expect("maintenance mutex poisoned");
        if slot.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime, condition cache maintenance not started");
            return;
        };
        let cache = Arc::clone(&self.cache);
        let period = Duration::from_secs(self.settings.cache_check_interval_secs.max(1));
        *slot = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.check_cache_pressure();
            }
        }));
        tracing::debug!(interval_secs = period.as_secs(), "Condition cache maintenance started");
    }

    /// Stop maintenance and clear every cache. Safe to call repeatedly.
    pub fn destroy(&self) {
        if let Some(handle) = self
            .maintenance
            .lock()
            .expect("maintenance mutex poisoned")
            .take()
        {
            handle.abort();
        }
        self.cache.clear();
    }

    /// Drop every registration. Used for test isolation.
    pub fn clear(&self) {
        self.instances.clear();
        self.cache.clear();
    }
}

impl Drop for MiddlewareManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.maintenance.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl fmt::Debug for MiddlewareManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareManager")
            .field("instances", &self.instances.len())
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(label: &'static str) -> MiddlewareRef {
        MiddlewareRef::from_fn(move |mut ctx: Context, next: Next| async move {
            let mut trail = ctx.take_body().unwrap_or_else(|| json!([]));
            if let Value::Array(items) = &mut trail {
                items.push(json!(label));
            }
            ctx.set_body(trail);
            next.run(ctx).await
        })
    }

    fn exec() -> ExecutionContext {
        ExecutionContext {
            protocol: Protocol::Http,
            route: "/items".into(),
            method: "GET".into(),
        }
    }

    async fn run(composed: &ComposedMiddleware, ctx: Context) -> Value {
        let terminal: crate::middleware::core::Terminal =
            Arc::new(|ctx: Context| -> MiddlewareFuture { Box::pin(async move { Ok(ctx) }) });
        let mut ctx = composed.run(ctx, terminal).await.unwrap();
        ctx.take_body().unwrap_or_else(|| json!([]))
    }

    #[test]
    fn register_rejects_empty_name() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        let err = manager
            .register(MiddlewareConfig::new("  ", recorder("x")))
            .unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
    }

    #[test]
    fn register_rejects_invalid_patterns() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        let config = MiddlewareConfig::new("auth", recorder("x"))
            .condition(Condition::path_matches("(oops"));
        assert!(manager.register(config).is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn instance_ids_are_scoped_or_unique() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        let scoped = manager
            .register(MiddlewareConfig::new("auth", recorder("a")).scoped("/items", "get"))
            .unwrap();
        assert_eq!(scoped, "auth@/items#GET");

        let first = manager.register(MiddlewareConfig::new("log", recorder("l"))).unwrap();
        let second = manager.register(MiddlewareConfig::new("log", recorder("l"))).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("log_"));
        assert_eq!(manager.get(&first).unwrap().priority, 500);
    }

    #[test]
    fn unregister_by_id_or_name() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        let a = manager
            .register(MiddlewareConfig::new("auth", recorder("a")).scoped("/a", "GET"))
            .unwrap();
        manager
            .register(MiddlewareConfig::new("auth", recorder("a")).scoped("/b", "GET"))
            .unwrap();
        manager
            .register(MiddlewareConfig::new("log", recorder("l")).scoped("/a", "GET"))
            .unwrap();

        assert_eq!(manager.unregister(&a), 1);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.unregister("auth"), 1);
        assert_eq!(manager.unregister("auth"), 0);
        assert_eq!(manager.summary().get("log"), Some(&1));
    }

    #[test]
    fn lookup_by_route_falls_back_to_scan() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        manager
            .register(MiddlewareConfig::new("auth", recorder("a")).scoped("/items", "GET"))
            .unwrap();
        manager
            .register(
                MiddlewareConfig::new("audit", recorder("b"))
                    .scoped("/items", "post")
                    .instance_id("custom-audit"),
            )
            .unwrap();

        let direct = manager.get_middleware_by_route("auth", "/items", "get").unwrap();
        assert_eq!(direct.instance_id, "auth@/items#GET");

        let scanned = manager.get_middleware_by_route("audit", "/items", "POST").unwrap();
        assert_eq!(scanned.instance_id, "custom-audit");

        assert!(manager.get_middleware_by_route("audit", "/other", "POST").is_none());
    }

    #[tokio::test]
    async fn compose_orders_by_priority_stably() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        let mut ids = Vec::new();
        for (label, priority) in [("p10", 10), ("p50a", 50), ("p50b", 50), ("p90", 90)] {
            ids.push(
                manager
                    .register(MiddlewareConfig::new(label, recorder(label)).priority(priority))
                    .unwrap(),
            );
        }
        let composed = manager.compose(&ids, &exec());
        let trail = run(&composed, Context::new(Protocol::Http, "GET", "/items")).await;
        assert_eq!(trail, json!(["p90", "p50a", "p50b", "p10"]));
    }

    #[tokio::test]
    async fn compose_skips_disabled_and_unknown() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        let on = manager.register(MiddlewareConfig::new("on", recorder("on"))).unwrap();
        let off = manager
            .register(MiddlewareConfig::new("off", recorder("off")).enabled(false))
            .unwrap();
        let toggled = manager.register(MiddlewareConfig::new("t", recorder("t"))).unwrap();
        assert!(manager.set_enabled(&toggled, false));

        let composed = manager.compose(&[on.clone(), off, toggled, "ghost".into()], &exec());
        assert_eq!(composed.instance_ids(), &[on]);
    }

    #[tokio::test]
    async fn conditional_middleware_is_skipped_when_unmatched() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        let id = manager
            .register(
                MiddlewareConfig::new("admin-only", recorder("admin"))
                    .condition(Condition::path_equals("/admin/*")),
            )
            .unwrap();
        let composed = manager.compose(&[id], &exec());

        let trail = run(&composed, Context::new(Protocol::Http, "GET", "/admin/users")).await;
        assert_eq!(trail, json!(["admin"]));
        let trail = run(&composed, Context::new(Protocol::Http, "GET", "/public")).await;
        assert_eq!(trail, json!([]));
    }

    #[tokio::test]
    async fn maintenance_starts_once_and_destroy_clears() {
        let manager = MiddlewareManager::new(MiddlewareSettings::default());
        manager.start_maintenance();
        manager.start_maintenance();
        let cache = manager.condition_cache();
        cache.matches(
            &Condition::path_equals("/x"),
            &Context::new(Protocol::Http, "GET", "/x"),
        );
        assert_eq!(cache.stats().exact, 1);

        manager.destroy();
        manager.destroy();
        assert_eq!(cache.stats().exact, 0);
    }
}
