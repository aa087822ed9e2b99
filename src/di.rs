//! Minimal controller container.
//!
//! Holds controller classes (metadata plus a factory) and compiled DTO
//! classes. Controller instances are produced per request by the factory.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::binding::dto::{CompiledDto, DtoClass, DtoRegistry};
use crate::context::Context;
use crate::error::{RouterError, RouterResult};
use crate::metadata::ControllerMetadata;

/// What a controller method produced.
#[derive(Debug)]
pub enum Reply {
    Value(Value),
    /// Nothing to write; the method may have set the body itself.
    Empty,
    /// An error handed back instead of raised. Re-raised by the handler.
    Error(RouterError),
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl From<RouterError> for Reply {
    fn from(error: RouterError) -> Self {
        Reply::Error(error)
    }
}

/// An application controller.
///
/// `invoke` dispatches on the method name declared in the controller's
/// [`ControllerMetadata`], receiving the bound arguments in index order.
pub trait Controller: Send + Sync + 'static {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: Vec<Value>,
        ctx: &'a mut Context,
    ) -> BoxFuture<'a, RouterResult<Reply>>;
}

type Factory = Arc<dyn Fn(&Context) -> Arc<dyn Controller> + Send + Sync>;

/// A registered controller: its metadata and how to get an instance.
#[derive(Clone)]
pub struct ControllerClass {
    pub metadata: Arc<ControllerMetadata>,
    factory: Factory,
}

impl ControllerClass {
    pub fn new<F>(metadata: ControllerMetadata, factory: F) -> Self
    where
        F: Fn(&Context) -> Arc<dyn Controller> + Send + Sync + 'static,
    {
        Self {
            metadata: Arc::new(metadata),
            factory: Arc::new(factory),
        }
    }

    /// Every request shares `instance`.
    pub fn singleton(metadata: ControllerMetadata, instance: Arc<dyn Controller>) -> Self {
        Self::new(metadata, move |_| Arc::clone(&instance))
    }

    pub fn identifier(&self) -> &str {
        &self.metadata.identifier
    }
}

impl fmt::Debug for ControllerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerClass")
            .field("identifier", &self.metadata.identifier)
            .field("methods", &self.metadata.methods.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Container {
    classes: DashMap<String, Arc<ControllerClass>>,
    dtos: DtoRegistry,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_controller(&self, class: ControllerClass) -> RouterResult<()> {
        let id = class.identifier().trim().to_string();
        if id.is_empty() {
            return Err(RouterError::config("controller identifier must not be empty"));
        }
        if self.classes.insert(id.clone(), Arc::new(class)).is_some() {
            tracing::warn!(controller = %id, "Controller re-registered");
        }
        Ok(())
    }

    pub fn get_class(&self, identifier: &str) -> Option<Arc<ControllerClass>> {
        self.classes.get(identifier).map(|r| Arc::clone(r.value()))
    }

    pub fn get_instance(&self, class: &ControllerClass, ctx: &Context) -> Arc<dyn Controller> {
        (class.factory)(ctx)
    }

    /// Instance of the controller registered as `identifier`, if any.
    pub fn resolve(&self, identifier: &str, ctx: &Context) -> Option<Arc<dyn Controller>> {
        self.get_class(identifier)
            .map(|class| self.get_instance(&class, ctx))
    }

    pub fn register_dto(&self, class: DtoClass) -> RouterResult<()> {
        self.dtos.register(class)
    }

    pub fn get_dto(&self, identifier: &str) -> Option<Arc<CompiledDto>> {
        self.dtos.get(identifier)
    }

    pub fn dtos(&self) -> &DtoRegistry {
        &self.dtos
    }

    pub fn controller_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.classes.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.classes.clear();
        self.dtos.clear();
    }
}
