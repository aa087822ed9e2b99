//! Parameter validation rules, compiled into closures once per parameter.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::error::{RouterError, RouterResult};
use crate::metadata::RuleSpec;

/// Predicate backing [`ValidationRule::Custom`].
#[derive(Clone)]
pub struct RulePredicate(pub Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl fmt::Debug for RulePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RulePredicate")
    }
}

/// A single validation constraint.
///
/// Every rule except `Required` accepts a missing or `null` value.
#[derive(Debug, Clone)]
pub enum ValidationRule {
    Required,
    NotEmpty,
    IsEmail,
    IsNumber,
    IsInt,
    IsBoolean,
    Min(f64),
    Max(f64),
    Length { min: Option<usize>, max: Option<usize> },
    Pattern(String),
    In(Vec<Value>),
    Custom(String, RulePredicate),
}

impl ValidationRule {
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        ValidationRule::Custom(name.into(), RulePredicate(Arc::new(predicate)))
    }

    /// Parse a rule by name, e.g. `required`, `isEmail`, `min:3`, `length:2,8`.
    pub fn from_name(spec: &str) -> Option<Self> {
        let (name, arg) = match spec.split_once(':') {
            Some((name, arg)) => (name, Some(arg.trim())),
            None => (spec, None),
        };
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        let rule = match (normalized.as_str(), arg) {
            ("required", None) => ValidationRule::Required,
            ("notempty", None) => ValidationRule::NotEmpty,
            ("isemail" | "email", None) => ValidationRule::IsEmail,
            ("isnumber" | "number", None) => ValidationRule::IsNumber,
            ("isint" | "int" | "integer", None) => ValidationRule::IsInt,
            ("isboolean" | "boolean", None) => ValidationRule::IsBoolean,
            ("min", Some(n)) => ValidationRule::Min(n.parse().ok()?),
            ("max", Some(n)) => ValidationRule::Max(n.parse().ok()?),
            ("length", Some(bounds)) => {
                let (min, max) = bounds.split_once(',').unwrap_or((bounds, ""));
                ValidationRule::Length {
                    min: parse_bound(min)?,
                    max: parse_bound(max)?,
                }
            }
            ("pattern" | "matches", Some(pattern)) => ValidationRule::Pattern(pattern.to_string()),
            ("in", Some(values)) => ValidationRule::In(
                values
                    .split(',')
                    .map(|v| Value::String(v.trim().to_string()))
                    .collect(),
            ),
            _ => return None,
        };
        Some(rule)
    }
}

fn parse_bound(raw: &str) -> Option<Option<usize>> {
    let raw = raw.trim();
    if raw.is_empty() {
        Some(None)
    } else {
        raw.parse().ok().map(Some)
    }
}

type Check = Box<dyn Fn(Option<&Value>) -> Result<(), String> + Send + Sync>;

/// The rule list of one parameter, compiled.
pub struct CompiledValidator {
    checks: Vec<Check>,
    message: Option<String>,
}

impl CompiledValidator {
    pub fn validate(&self, value: Option<&Value>) -> Result<(), String> {
        for check in &self.checks {
            if let Err(reason) = check(value) {
                return Err(self.message.clone().unwrap_or(reason));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

impl fmt::Debug for CompiledValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledValidator")
            .field("checks", &self.checks.len())
            .field("message", &self.message)
            .finish()
    }
}

/// Compile a rule list. Returns `None` when there is nothing to check.
///
/// Unknown rule names and invalid patterns are configuration errors.
pub fn compile_validator(
    rules: &[RuleSpec],
    message: Option<&str>,
) -> RouterResult<Option<CompiledValidator>> {
    if rules.is_empty() {
        return Ok(None);
    }
    let mut checks = Vec::with_capacity(rules.len());
    for spec in rules {
        let rule = match spec {
            RuleSpec::Rule(rule) => rule.clone(),
            RuleSpec::Named(name) => ValidationRule::from_name(name)
                .ok_or_else(|| RouterError::config(format!("unknown validation rule '{name}'")))?,
        };
        checks.push(compile_rule(rule)?);
    }
    Ok(Some(CompiledValidator {
        checks,
        message: message.map(str::to_string),
    }))
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Skip missing and null values, check the rest with `f`.
fn optional<F>(f: F) -> Check
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
{
    Box::new(move |value: Option<&Value>| match present(value) {
        Some(v) => f(v),
        None => Ok(()),
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn compile_rule(rule: ValidationRule) -> RouterResult<Check> {
    let check = match rule {
        ValidationRule::Required => Box::new(|value: Option<&Value>| match present(value) {
            Some(_) => Ok(()),
            None => Err("value is required".to_string()),
        }) as Check,
        ValidationRule::NotEmpty => optional(|v| {
            let empty = match v {
                Value::String(s) => s.trim().is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                _ => false,
            };
            if empty {
                Err("value must not be empty".to_string())
            } else {
                Ok(())
            }
        }),
        ValidationRule::IsEmail => {
            let email = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")
                .map_err(|e| RouterError::config(e.to_string()))?;
            optional(move |v| match v.as_str() {
                Some(s) if email.is_match(s) => Ok(()),
                _ => Err("value must be an email address".to_string()),
            })
        }
        ValidationRule::IsNumber => optional(|v| match as_number(v) {
            Some(_) => Ok(()),
            None => Err("value must be a number".to_string()),
        }),
        ValidationRule::IsInt => optional(|v| {
            let integral = match v {
                Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
                Value::String(s) => s.trim().parse::<i64>().is_ok(),
                _ => false,
            };
            if integral {
                Ok(())
            } else {
                Err("value must be an integer".to_string())
            }
        }),
        ValidationRule::IsBoolean => optional(|v| match v {
            Value::Bool(_) => Ok(()),
            Value::String(s) if s == "true" || s == "false" => Ok(()),
            _ => Err("value must be a boolean".to_string()),
        }),
        ValidationRule::Min(min) => optional(move |v| match as_number(v) {
            Some(n) if n >= min => Ok(()),
            _ => Err(format!("value must be at least {min}")),
        }),
        ValidationRule::Max(max) => optional(move |v| match as_number(v) {
            Some(n) if n <= max => Ok(()),
            _ => Err(format!("value must be at most {max}")),
        }),
        ValidationRule::Length { min, max } => optional(move |v| {
            let len = match v {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                _ => return Err("value has no length".to_string()),
            };
            if min.is_some_and(|m| len < m) || max.is_some_and(|m| len > m) {
                Err(match (min, max) {
                    (Some(min), Some(max)) => format!("length must be between {min} and {max}"),
                    (Some(min), None) => format!("length must be at least {min}"),
                    (None, Some(max)) => format!("length must be at most {max}"),
                    (None, None) => unreachable!(),
                })
            } else {
                Ok(())
            }
        }),
        ValidationRule::Pattern(pattern) => {
            let regex = Regex::new(&pattern)
                .map_err(|e| RouterError::config(format!("invalid pattern '{pattern}': {e}")))?;
            optional(move |v| match v.as_str() {
                Some(s) if regex.is_match(s) => Ok(()),
                _ => Err(format!("value must match {pattern}")),
            })
        }
        ValidationRule::In(allowed) => optional(move |v| {
            if allowed.contains(v) {
                Ok(())
            } else {
                Err("value is not one of the allowed values".to_string())
            }
        }),
        ValidationRule::Custom(name, predicate) => optional(move |v| {
            if (predicate.0)(v) {
                Ok(())
            } else {
                Err(format!("value failed {name}"))
            }
        }),
    };
    Ok(check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(rules: Vec<ValidationRule>) -> CompiledValidator {
        let specs: Vec<RuleSpec> = rules.into_iter().map(RuleSpec::Rule).collect();
        compile_validator(&specs, None).unwrap().unwrap()
    }

    #[test]
    fn named_rules_resolve() {
        assert!(matches!(ValidationRule::from_name("isEmail"), Some(ValidationRule::IsEmail)));
        assert!(matches!(ValidationRule::from_name("not_empty"), Some(ValidationRule::NotEmpty)));
        assert!(matches!(ValidationRule::from_name("min:3"), Some(ValidationRule::Min(n)) if n == 3.0));
        assert!(matches!(
            ValidationRule::from_name("length:2,"),
            Some(ValidationRule::Length { min: Some(2), max: None })
        ));
        assert!(ValidationRule::from_name("bogus").is_none());
        assert!(ValidationRule::from_name("min:x").is_none());
    }

    #[test]
    fn unknown_named_rule_fails_compilation() {
        let err = compile_validator(&[RuleSpec::Named("isUnicorn".into())], None).unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
    }

    #[test]
    fn empty_rule_list_compiles_to_nothing() {
        assert!(compile_validator(&[], None).unwrap().is_none());
    }

    #[test]
    fn only_required_rejects_missing_values() {
        let v = compile(vec![ValidationRule::IsEmail, ValidationRule::Min(1.0)]);
        assert!(v.validate(None).is_ok());
        assert!(v.validate(Some(&Value::Null)).is_ok());

        let required = compile(vec![ValidationRule::Required]);
        assert!(required.validate(None).is_err());
        assert!(required.validate(Some(&Value::Null)).is_err());
        assert!(required.validate(Some(&json!(0))).is_ok());
    }

    #[test]
    fn rules_check_values() {
        let v = compile(vec![ValidationRule::IsInt, ValidationRule::Min(1.0), ValidationRule::Max(10.0)]);
        assert!(v.validate(Some(&json!(5))).is_ok());
        assert!(v.validate(Some(&json!("7"))).is_ok());
        assert!(v.validate(Some(&json!(0))).is_err());
        assert!(v.validate(Some(&json!(2.5))).is_err());

        let email = compile(vec![ValidationRule::IsEmail]);
        assert!(email.validate(Some(&json!("a@b.io"))).is_ok());
        assert!(email.validate(Some(&json!("nope"))).is_err());

        let choice = compile(vec![ValidationRule::In(vec![json!("asc"), json!("desc")])]);
        assert!(choice.validate(Some(&json!("asc"))).is_ok());
        assert!(choice.validate(Some(&json!("up"))).is_err());

        let len = compile(vec![ValidationRule::Length { min: Some(2), max: Some(3) }]);
        assert!(len.validate(Some(&json!("ab"))).is_ok());
        assert!(len.validate(Some(&json!([1, 2, 3, 4]))).is_err());
    }

    #[test]
    fn custom_message_replaces_rule_message() {
        let specs = [RuleSpec::Rule(ValidationRule::custom("even", |v| v.as_i64().is_some_and(|n| n % 2 == 0)))];
        let v = compile_validator(&specs, Some("must be even")).unwrap().unwrap();
        assert_eq!(v.validate(Some(&json!(3))).unwrap_err(), "must be even");
        assert!(v.validate(Some(&json!(4))).is_ok());
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let specs = [RuleSpec::Rule(ValidationRule::Pattern("(".into()))];
        assert!(compile_validator(&specs, None).is_err());
    }
}
