//! Explicit controller, method and parameter metadata.
//!
//! Controllers describe their routes once at bootstrap with these builders;
//! the route builder compiles them into parameter pipelines and middleware
//! chains.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::binding::validate::ValidationRule;
use crate::context::{Context, Protocol};
use crate::middleware::MiddlewareDecl;

/// Where a parameter's raw value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Query,
    Body,
    Header,
    Path,
    File,
    Custom,
}

impl ParamSource {
    /// Body and file parameters need the decoded payload.
    pub fn needs_body(self) -> bool {
        matches!(self, ParamSource::Body | ParamSource::File)
    }
}

/// Declared primitive type, selecting the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamType {
    #[default]
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// A validation rule, given directly or by name.
#[derive(Debug, Clone)]
pub enum RuleSpec {
    Rule(ValidationRule),
    /// Resolved when the method is compiled; unknown names are rejected.
    Named(String),
}

/// User-supplied extractor for [`ParamSource::Custom`].
#[derive(Clone)]
pub struct CustomExtractor(pub Arc<dyn Fn(&Context) -> Option<Value> + Send + Sync>);

impl fmt::Debug for CustomExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomExtractor")
    }
}

/// One parameter of a controller method.
#[derive(Debug, Clone)]
pub struct ParamMetadata {
    pub index: usize,
    pub name: String,
    pub source: ParamSource,
    /// Key within the source. `None` binds the whole source object.
    pub key: Option<String>,
    pub param_type: ParamType,
    /// DTO class identifier, for parameters bound to a declared class.
    pub dto: Option<String>,
    pub rules: Vec<RuleSpec>,
    /// Replaces the rule's own message on failure.
    pub message: Option<String>,
    /// Substituted only when the source has no value at all.
    pub default: Option<Value>,
    pub extractor: Option<CustomExtractor>,
}

impl ParamMetadata {
    fn keyed(source: ParamSource, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            index: 0,
            name: key.clone(),
            source,
            key: Some(key),
            param_type: ParamType::String,
            dto: None,
            rules: Vec::new(),
            message: None,
            default: None,
            extractor: None,
        }
    }

    pub fn query(key: impl Into<String>) -> Self {
        Self::keyed(ParamSource::Query, key)
    }

    pub fn path(key: impl Into<String>) -> Self {
        Self::keyed(ParamSource::Path, key)
    }

    /// Header names are matched case-insensitively.
    pub fn header(key: impl Into<String>) -> Self {
        let mut meta = Self::keyed(ParamSource::Header, key);
        meta.key = meta.key.map(|k| k.to_ascii_lowercase());
        meta
    }

    pub fn body(key: impl Into<String>) -> Self {
        Self::keyed(ParamSource::Body, key)
    }

    pub fn file(key: impl Into<String>) -> Self {
        Self::keyed(ParamSource::File, key)
    }

    /// The whole decoded body, instantiated as the named DTO class.
    pub fn dto(class: impl Into<String>) -> Self {
        let class = class.into();
        let mut meta = Self::keyed(ParamSource::Body, class.clone());
        meta.key = None;
        meta.param_type = ParamType::Object;
        meta.dto = Some(class);
        meta
    }

    pub fn custom<F>(name: impl Into<String>, extractor: F) -> Self
    where
        F: Fn(&Context) -> Option<Value> + Send + Sync + 'static,
    {
        let mut meta = Self::keyed(ParamSource::Custom, name);
        meta.key = None;
        meta.extractor = Some(CustomExtractor(Arc::new(extractor)));
        meta
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Bind the whole source object instead of a single key.
    pub fn whole_source(mut self) -> Self {
        self.key = None;
        self
    }

    pub fn of_type(mut self, param_type: ParamType) -> Self {
        self.param_type = param_type;
        self
    }

    pub fn number(self) -> Self {
        self.of_type(ParamType::Number)
    }

    pub fn boolean(self) -> Self {
        self.of_type(ParamType::Boolean)
    }

    pub fn array(self) -> Self {
        self.of_type(ParamType::Array)
    }

    pub fn object(self) -> Self {
        self.of_type(ParamType::Object)
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(RuleSpec::Rule(rule));
        self
    }

    pub fn rule_named(mut self, name: impl Into<String>) -> Self {
        self.rules.push(RuleSpec::Named(name.into()));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_validated(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn is_dto(&self) -> bool {
        self.dto.is_some()
    }
}

/// One routable controller method.
#[derive(Debug, Clone)]
pub struct MethodMetadata {
    /// Method name passed to [`crate::di::Controller::invoke`].
    pub name: String,
    /// HTTP verb, socket event, RPC method or GraphQL operation type.
    pub verb: String,
    /// Path relative to the controller prefix.
    pub path: String,
    pub params: Vec<ParamMetadata>,
    pub middleware: Vec<MiddlewareDecl>,
    /// Validate DTO parameters structurally before handing them over.
    pub dto_check: bool,
}

impl MethodMetadata {
    pub fn new(verb: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            verb: verb.into().to_ascii_uppercase(),
            path: path.into(),
            params: Vec::new(),
            middleware: Vec::new(),
            dto_check: false,
        }
    }

    pub fn get(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new("GET", name, path)
    }

    pub fn post(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new("POST", name, path)
    }

    pub fn put(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new("PUT", name, path)
    }

    pub fn patch(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new("PATCH", name, path)
    }

    pub fn delete(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new("DELETE", name, path)
    }

    /// WebSocket event handled at `path`.
    pub fn message(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new("MESSAGE", name, path)
    }

    /// RPC method; the controller prefix names the service.
    pub fn rpc(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new("RPC", name.clone(), name)
    }

    /// GraphQL query root field.
    pub fn query(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new("QUERY", name.clone(), name)
    }

    /// GraphQL mutation root field.
    pub fn mutation(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new("MUTATION", name.clone(), name)
    }

    /// Append a parameter at the next argument index.
    pub fn param(mut self, mut param: ParamMetadata) -> Self {
        param.index = self.params.len();
        self.params.push(param);
        self
    }

    pub fn middleware(mut self, decl: MiddlewareDecl) -> Self {
        self.middleware.push(decl);
        self
    }

    pub fn dto_check(mut self, enabled: bool) -> Self {
        self.dto_check = enabled;
        self
    }
}

/// Everything the routers need to know about one controller.
#[derive(Debug, Clone)]
pub struct ControllerMetadata {
    pub identifier: String,
    pub prefix: String,
    pub protocol: Protocol,
    pub middleware: Vec<MiddlewareDecl>,
    pub methods: Vec<MethodMetadata>,
}

impl ControllerMetadata {
    pub fn new(identifier: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            prefix: prefix.into(),
            protocol: Protocol::Http,
            middleware: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn middleware(mut self, decl: MiddlewareDecl) -> Self {
        self.middleware.push(decl);
        self
    }

    pub fn route(mut self, method: MethodMetadata) -> Self {
        self.methods.push(method);
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodMetadata> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Join a prefix and a relative path into one normalized path.
pub fn join_path(prefix: &str, path: &str) -> String {
    let segments: Vec<&str> = prefix
        .split('/')
        .chain(path.split('/'))
        .filter(|s| !s.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}
