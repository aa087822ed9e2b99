//! Type converters selected once per parameter by declared type.

use serde_json::{Number, Value};

use crate::metadata::ParamType;

/// Converts a raw extracted value to the declared type.
pub type Converter = fn(Value) -> Result<Value, String>;

/// Converter for `ty`, or `None` when values pass through untouched.
pub fn converter_for(ty: ParamType) -> Option<Converter> {
    match ty {
        ParamType::String => None,
        ParamType::Number => Some(to_number),
        ParamType::Boolean => Some(to_boolean),
        ParamType::Array => Some(to_array),
        ParamType::Object => Some(to_object),
    }
}

/// Apply an optional converter to an optional value. `null` is never converted.
pub fn apply(converter: Option<Converter>, value: Option<Value>) -> Result<Option<Value>, String> {
    match (converter, value) {
        (Some(convert), Some(v)) if !v.is_null() => convert(v).map(Some),
        (_, value) => Ok(value),
    }
}

fn to_number(value: Value) -> Result<Value, String> {
    match value {
        Value::Number(_) => Ok(value),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                return Ok(Value::Number(int.into()));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{s}' is not a number"))
        }
        Value::Bool(b) => Ok(Value::Number(u8::from(b).into())),
        other => Err(format!("cannot convert {} to a number", kind(&other))),
    }
}

fn to_boolean(value: Value) -> Result<Value, String> {
    match value {
        Value::Bool(_) => Ok(value),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 1.0 => Ok(Value::Bool(true)),
            Some(f) if f == 0.0 => Ok(Value::Bool(false)),
            _ => Err(format!("{n} is not a boolean")),
        },
        other => Err(format!("cannot convert {} to a boolean", kind(&other))),
    }
}

fn to_array(value: Value) -> Result<Value, String> {
    match value {
        Value::Array(_) => Ok(value),
        Value::String(s) if s.is_empty() => Ok(Value::Array(Vec::new())),
        Value::String(s) => Ok(Value::Array(
            s.split(',')
                .map(|item| Value::String(item.trim().to_string()))
                .collect(),
        )),
        other => Ok(Value::Array(vec![other])),
    }
}

fn to_object(value: Value) -> Result<Value, String> {
    match value {
        Value::Object(_) => Ok(value),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed @ Value::Object(_)) => Ok(parsed),
            _ => Err("value is not a JSON object".to_string()),
        },
        other => Err(format!("cannot convert {} to an object", kind(&other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
