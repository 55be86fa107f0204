//! Model parameter schemas
//!
//! Each model declares the parameters it accepts. Caller input is checked
//! once against that schema: values are coerced to the declared type,
//! numbers are clamped into range, enums must match, required parameters
//! must be present. Undeclared keys are dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::ProviderError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterType {
    String {
        #[serde(default)]
        max_length: Option<usize>,
    },
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Boolean,
    Enum {
        values: Vec<String>,
    },
    Url,
    UrlList {
        #[serde(default)]
        max_items: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Validate and normalise `input` against `schema`
pub fn validate(
    schema: &[ParameterSpec],
    input: &Map<String, Value>,
) -> Result<Map<String, Value>, ProviderError> {
    let mut output = Map::new();

    for spec in schema {
        let raw = match input.get(&spec.name) {
            Some(Value::Null) | None => spec.default.as_ref(),
            Some(value) => Some(value),
        };

        let Some(raw) = raw else {
            if spec.required {
                return Err(ProviderError::invalid_parameter(&spec.name, "is required"));
            }
            continue;
        };

        let value = coerce(spec, raw)?;
        output.insert(spec.name.clone(), value);
    }

    for key in input.keys().filter(|k| !schema.iter().any(|s| &s.name == *k)) {
        tracing::debug!(parameter = %key, "Dropping undeclared parameter");
    }

    Ok(output)
}

fn coerce(spec: &ParameterSpec, raw: &Value) -> Result<Value, ProviderError> {
    let name = spec.name.as_str();
    match &spec.param_type {
        ParameterType::String { max_length } => {
            let text = match raw {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(ProviderError::invalid_parameter(name, "expected a string")),
            };
            if spec.required && text.trim().is_empty() {
                return Err(ProviderError::invalid_parameter(name, "must not be empty"));
            }
            if let Some(max) = max_length {
                if text.chars().count() > *max {
                    return Err(ProviderError::invalid_parameter(
                        name,
                        format!("exceeds {} characters", max),
                    ));
                }
            }
            Ok(Value::String(text))
        }
        ParameterType::Integer { min, max } => {
            let mut n = as_integer(raw)
                .ok_or_else(|| ProviderError::invalid_parameter(name, "expected an integer"))?;
            if let Some(min) = min {
                n = n.max(*min);
            }
            if let Some(max) = max {
                n = n.min(*max);
            }
            Ok(Value::from(n))
        }
        ParameterType::Number { min, max } => {
            let mut n = as_number(raw)
                .ok_or_else(|| ProviderError::invalid_parameter(name, "expected a number"))?;
            if let Some(min) = min {
                n = n.max(*min);
            }
            if let Some(max) = max {
                n = n.min(*max);
            }
            Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| ProviderError::invalid_parameter(name, "is not finite"))
        }
        ParameterType::Boolean => match raw {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            _ => Err(ProviderError::invalid_parameter(name, "expected a boolean")),
        },
        ParameterType::Enum { values } => {
            let text = match raw {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return Err(ProviderError::invalid_parameter(name, "expected a string")),
            };
            if values.iter().any(|v| v == &text) {
                Ok(Value::String(text))
            } else {
                Err(ProviderError::invalid_parameter(
                    name,
                    format!("must be one of: {}", values.join(", ")),
                ))
            }
        }
        ParameterType::Url => match raw {
            Value::String(s) if is_http_url(s) => Ok(Value::String(s.clone())),
            _ => Err(ProviderError::invalid_parameter(name, "expected an http(s) url")),
        },
        ParameterType::UrlList { max_items } => {
            let items: Vec<&Value> = match raw {
                Value::Array(items) => items.iter().collect(),
                Value::String(_) => vec![raw],
                _ => return Err(ProviderError::invalid_parameter(name, "expected a list of urls")),
            };
            if spec.required && items.is_empty() {
                return Err(ProviderError::invalid_parameter(name, "must not be empty"));
            }
            if let Some(max) = max_items {
                if items.len() > *max {
                    return Err(ProviderError::invalid_parameter(
                        name,
                        format!("accepts at most {} urls", max),
                    ));
                }
            }
            let mut urls = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) if is_http_url(s) => urls.push(Value::String(s.clone())),
                    _ => {
                        return Err(ProviderError::invalid_parameter(
                            name,
                            "expected a list of http(s) urls",
                        ))
                    }
                }
            }
            Ok(Value::Array(urls))
        }
    }
}

fn as_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_number(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_http_url(s: &str) -> bool {
    let rest = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.starts_with('/'))
}
