//! Declared data-transfer classes for body parameters.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::binding::convert::{self, Converter};
use crate::binding::validate::{compile_validator, CompiledValidator, ValidationRule};
use crate::error::{RouterError, RouterResult};
use crate::metadata::{ParamType, RuleSpec};

/// One declared field of a DTO class.
#[derive(Debug, Clone)]
pub struct DtoField {
    pub name: String,
    pub field_type: ParamType,
    pub rules: Vec<RuleSpec>,
    pub required: bool,
    pub default: Option<Value>,
}

impl DtoField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: ParamType::String,
            rules: Vec::new(),
            required: false,
            default: None,
        }
    }

    pub fn of_type(mut self, field_type: ParamType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(RuleSpec::Rule(rule));
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A named class a body parameter can be instantiated as.
#[derive(Debug, Clone)]
pub struct DtoClass {
    pub identifier: String,
    pub fields: Vec<DtoField>,
}

impl DtoClass {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: DtoField) -> Self {
        self.fields.push(field);
        self
    }

    /// Compile converters and validators for every field.
    pub fn compile(&self) -> RouterResult<CompiledDto> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            fields.push(CompiledField {
                name: field.name.clone(),
                converter: convert::converter_for(field.field_type),
                validator: compile_validator(&field.rules, None)?,
                required: field.required,
                default: field.default.clone(),
            });
        }
        Ok(CompiledDto {
            identifier: self.identifier.clone(),
            fields,
        })
    }
}

struct CompiledField {
    name: String,
    converter: Option<Converter>,
    validator: Option<CompiledValidator>,
    required: bool,
    default: Option<Value>,
}

/// A DTO class ready for per-request instantiation.
pub struct CompiledDto {
    identifier: String,
    fields: Vec<CompiledField>,
}

impl CompiledDto {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Build an instance from a raw payload.
    ///
    /// Unchecked mode converts declared fields where it can and leaves
    /// everything else as received. Checked mode requires an object, enforces
    /// `required` and runs every field validator.
    pub fn instantiate(&self, raw: Option<Value>, checked: bool) -> Result<Value, String> {
        let mut map = match raw {
            Some(Value::Object(map)) => map,
            Some(other) if !checked => return Ok(other),
            None if !checked => return Ok(Value::Null),
            _ => return Err(format!("{} expects an object", self.identifier)),
        };

        for field in &self.fields {
            let value = map.remove(&field.name).or_else(|| field.default.clone());
            let value = match convert::apply(field.converter, value.clone()) {
                Ok(converted) => converted,
                Err(reason) if checked => return Err(format!("{}: {reason}", field.name)),
                Err(_) => value,
            };
            if checked {
                if field.required && value.as_ref().map_or(true, Value::is_null) {
                    return Err(format!("{} is required", field.name));
                }
                if let Some(validator) = &field.validator {
                    validator
                        .validate(value.as_ref())
                        .map_err(|reason| format!("{}: {reason}", field.name))?;
                }
            }
            if let Some(value) = value {
                map.insert(field.name.clone(), value);
            }
        }
        Ok(Value::Object(map))
    }
}

impl fmt::Debug for CompiledDto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledDto")
            .field("identifier", &self.identifier)
            .field("fields", &self.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

/// Compiled DTO classes by identifier.
#[derive(Debug, Default)]
pub struct DtoRegistry {
    classes: DashMap<String, Arc<CompiledDto>>,
}

impl DtoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class: DtoClass) -> RouterResult<()> {
        let compiled = class.compile()?;
        self.classes.insert(class.identifier, Arc::new(compiled));
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<CompiledDto>> {
        self.classes.get(identifier).map(|r| Arc::clone(r.value()))
    }

    pub fn resolve(&self, identifier: &str) -> RouterResult<Arc<CompiledDto>> {
        self.get(identifier)
            .ok_or_else(|| RouterError::config(format!("DTO class '{identifier}' is not registered")))
    }

    pub fn clear(&self) {
        self.classes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_dto() -> CompiledDto {
        DtoClass::new("CreateUser")
            .field(DtoField::new("email").required().rule(ValidationRule::IsEmail))
            .field(DtoField::new("age").of_type(ParamType::Number).rule(ValidationRule::Min(0.0)))
            .field(DtoField::new("role").default_value("member"))
            .compile()
            .unwrap()
    }

    #[test]
    fn checked_instantiation_converts_and_validates() {
        let dto = user_dto();
        let value = dto
            .instantiate(Some(json!({"email": "a@b.io", "age": "31", "extra": true})), true)
            .unwrap();
        assert_eq!(value, json!({"email": "a@b.io", "age": 31, "role": "member", "extra": true}));

        assert_eq!(
            dto.instantiate(Some(json!({"age": 3})), true).unwrap_err(),
            "email is required"
        );
        assert!(dto.instantiate(Some(json!({"email": "nope"})), true).is_err());
        assert!(dto.instantiate(Some(json!([1])), true).is_err());
    }

    #[test]
    fn unchecked_instantiation_never_fails() {
        let dto = user_dto();
        let value = dto
            .instantiate(Some(json!({"email": "nope", "age": "old"})), false)
            .unwrap();
        assert_eq!(value, json!({"email": "nope", "age": "old", "role": "member"}));
        assert_eq!(dto.instantiate(Some(json!("raw")), false).unwrap(), json!("raw"));
        assert_eq!(dto.instantiate(None, false).unwrap(), Value::Null);
    }

    #[test]
    fn registry_resolves_registered_classes() {
        let registry = DtoRegistry::new();
        registry.register(DtoClass::new("Empty")).unwrap();
        assert_eq!(registry.resolve("Empty").unwrap().identifier(), "Empty");
        assert!(matches!(registry.resolve("Missing"), Err(RouterError::Config(_))));
    }
}
