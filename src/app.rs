//! The application root.
//!
//! Everything request handling shares lives here and is built explicitly at
//! startup: no process-wide singletons. Tests construct as many independent
//! applications as they like.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::binding::{BodyOptions, DefaultPayloadDecoder, PayloadDecoder};
use crate::config::RouterConfig;
use crate::di::Container;
use crate::error::RouterResult;
use crate::middleware::MiddlewareManager;
use crate::rpc::StreamManager;

/// Something holding outbound state that must be released on shutdown,
/// such as a connection pool or a batch processor.
pub trait Resource: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn release(&self) -> BoxFuture<'_, RouterResult<()>>;
}

pub struct Application {
    config: RouterConfig,
    container: Container,
    middleware: MiddlewareManager,
    decoder: Arc<dyn PayloadDecoder>,
    body_options: BodyOptions,
    streams: Arc<StreamManager>,
    resources: Mutex<Vec<Arc<dyn Resource>>>,
}

impl Application {
    pub fn new(config: RouterConfig) -> Self {
        Self::with_decoder(config, Arc::new(DefaultPayloadDecoder))
    }

    pub fn with_decoder(config: RouterConfig, decoder: Arc<dyn PayloadDecoder>) -> Self {
        let middleware = MiddlewareManager::new(config.middleware.clone());
        let streams = Arc::new(StreamManager::new(config.rpc.clone()));
        let body_options = BodyOptions {
            limit: config.server.body_limit_bytes,
        };
        Self {
            config,
            container: Container::new(),
            middleware,
            decoder,
            body_options,
            streams,
            resources: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn middleware(&self) -> &MiddlewareManager {
        &self.middleware
    }

    pub fn decoder(&self) -> &dyn PayloadDecoder {
        self.decoder.as_ref()
    }

    pub fn body_options(&self) -> &BodyOptions {
        &self.body_options
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.request_timeout_secs)
    }

    /// Attach a resource released by [`Application::cleanup`].
    pub fn register_resource(&self, resource: Arc<dyn Resource>) {
        tracing::debug!(resource = resource.name(), "Resource registered");
        self.resources
            .lock()
            .expect("resource list mutex poisoned")
            .push(resource);
    }

    pub fn resource_count(&self) -> usize {
        self.resources.lock().expect("resource list mutex poisoned").len()
    }

    /// Tear down shared state. A failing step is logged and the rest still
    /// runs.
    pub async fn cleanup(&self) {
        self.middleware.destroy();

        let ended = self.streams.cleanup();
        if ended > 0 {
            tracing::info!(streams = ended, "Ended active streams");
        }

        let resources: Vec<Arc<dyn Resource>> = self
            .resources
            .lock()
            .expect("resource list mutex poisoned")
            .drain(..)
            .collect();
        for resource in resources {
            if let Err(error) = resource.release().await {
                tracing::error!(resource = resource.name(), %error, "Failed to release resource");
            }
        }
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("controllers", &self.container.controller_ids())
            .field("middleware", &self.middleware.len())
            .field("active_streams", &self.streams.active_count())
            .field("resources", &self.resource_count())
            .finish()
    }
}
