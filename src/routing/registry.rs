//! Protocol router registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::app::Application;
use crate::context::Protocol;
use crate::di::ControllerClass;
use crate::error::{RouterError, RouterResult};
use crate::routing::entry::RouteEntry;

/// One protocol's adapter between route entries and its transport.
pub trait ProtocolRouter: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn protocol(&self) -> Protocol;

    /// Compile and install routes for `controllers`. Returns how many
    /// entries were added.
    fn load_router(&self, app: &Arc<Application>, controllers: &[Arc<ControllerClass>]) -> RouterResult<usize>;

    fn routes(&self) -> Vec<Arc<RouteEntry>>;

    /// Release protocol-level state such as open streams.
    fn cleanup(&self);
}

/// Remember the application a router was first loaded with. Loading it
/// again with a different application is a configuration error.
pub(crate) fn bind_application(
    slot: &OnceLock<Arc<Application>>,
    app: &Arc<Application>,
    router: &str,
) -> RouterResult<()> {
    let bound = slot.get_or_init(|| Arc::clone(app));
    if Arc::ptr_eq(bound, app) {
        Ok(())
    } else {
        Err(RouterError::config(format!(
            "{router} router is already loaded with another application"
        )))
    }
}

/// Named set of protocol routers sharing one application.
pub struct RouterRegistry {
    app: Arc<Application>,
    routers: RwLock<BTreeMap<String, Arc<dyn ProtocolRouter>>>,
    cleaned: AtomicBool,
}

impl RouterRegistry {
    pub fn new(app: Arc<Application>) -> Self {
        Self {
            app,
            routers: RwLock::new(BTreeMap::new()),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn app(&self) -> &Arc<Application> {
        &self.app
    }

    pub fn set_router(&self, name: impl Into<String>, router: Arc<dyn ProtocolRouter>) {
        let name = name.into();
        if self
            .routers
            .write()
            .expect("router registry lock poisoned")
            .insert(name.clone(), router)
            .is_some()
        {
            tracing::warn!(router = %name, "Router replaced");
        }
    }

    pub fn get_router(&self, name: &str) -> Option<Arc<dyn ProtocolRouter>> {
        self.routers
            .read()
            .expect("router registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Registered router names, sorted.
    pub fn list_router(&self) -> Vec<String> {
        self.routers
            .read()
            .expect("router registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Load every router with the controllers speaking its protocol.
    pub fn load_router(&self, controllers: &[Arc<ControllerClass>]) -> RouterResult<usize> {
        let routers: Vec<Arc<dyn ProtocolRouter>> = self
            .routers
            .read()
            .expect("router registry lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut total = 0;
        for router in routers {
            let matching: Vec<Arc<ControllerClass>> = controllers
                .iter()
                .filter(|c| c.metadata.protocol == router.protocol())
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }
            let loaded = router.load_router(&self.app, &matching)?;
            tracing::info!(router = router.name(), controllers = matching.len(), routes = loaded, "Router loaded");
            total += loaded;
        }
        Ok(total)
    }

    /// Load every controller registered in the application's container.
    pub fn load_registered(&self) -> RouterResult<usize> {
        let container = self.app.container();
        let controllers: Vec<Arc<ControllerClass>> = container
            .controller_ids()
            .iter()
            .filter_map(|id| container.get_class(id))
            .collect();
        self.load_router(&controllers)
    }

    /// Clean up every router, then the application. Only the first call
    /// does anything; returns whether this call did.
    pub async fn cleanup(&self) -> bool {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            tracing::debug!("Router cleanup already ran");
            return false;
        }
        let routers: Vec<Arc<dyn ProtocolRouter>> = self
            .routers
            .read()
            .expect("router registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for router in routers {
            router.cleanup();
            tracing::debug!(router = router.name(), "Router cleaned up");
        }
        self.app.cleanup().await;
        tracing::info!("Router cleanup complete");
        true
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RouterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterRegistry")
            .field("routers", &self.list_router())
            .field("cleaned", &self.is_cleaned_up())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ControllerMetadata;
    use crate::di::{Controller, Reply};
    use crate::context::Context;
    use futures_util::future::BoxFuture;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    struct Nop;

    impl Controller for Nop {
        fn invoke<'a>(&'a self, _: &'a str, _: Vec<Value>, _: &'a mut Context) -> BoxFuture<'a, RouterResult<Reply>> {
            Box::pin(async { Ok(Reply::Empty) })
        }
    }

    #[derive(Default)]
    struct Counting {
        loaded: AtomicUsize,
        cleanups: AtomicUsize,
    }

    impl ProtocolRouter for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn protocol(&self) -> Protocol {
            Protocol::WebSocket
        }

        fn load_router(&self, _app: &Arc<Application>, controllers: &[Arc<ControllerClass>]) -> RouterResult<usize> {
            self.loaded.fetch_add(controllers.len(), Ordering::SeqCst);
            Ok(controllers.len())
        }

        fn routes(&self) -> Vec<Arc<RouteEntry>> {
            Vec::new()
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn class(id: &str, protocol: Protocol) -> Arc<ControllerClass> {
        Arc::new(ControllerClass::singleton(
            ControllerMetadata::new(id, "/").protocol(protocol),
            Arc::new(Nop),
        ))
    }

    #[tokio::test]
    async fn loads_matching_protocols_and_cleans_up_once() {
        let registry = RouterRegistry::new(Arc::new(Application::default()));
        let router = Arc::new(Counting::default());
        registry.set_router("ws", router.clone());
        assert_eq!(registry.list_router(), vec!["ws".to_string()]);

        let loaded = registry
            .load_router(&[class("chat", Protocol::WebSocket), class("users", Protocol::Http)])
            .unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(router.loaded.load(Ordering::SeqCst), 1);

        assert!(registry.cleanup().await);
        assert!(!registry.cleanup().await);
        assert_eq!(router.cleanups.load(Ordering::SeqCst), 1);
        assert!(registry.is_cleaned_up());
    }

    #[test]
    fn routers_stay_bound_to_their_first_application() {
        let slot = OnceLock::new();
        let first = Arc::new(Application::default());
        bind_application(&slot, &first, "http").unwrap();
        bind_application(&slot, &first, "http").unwrap();

        let other = Arc::new(Application::default());
        let err = bind_application(&slot, &other, "http").unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
        assert!(Arc::ptr_eq(slot.get().unwrap(), &first));
    }
}
