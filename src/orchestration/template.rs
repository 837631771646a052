//! `{{...}}` placeholders in declarative step arguments and result fields.
//!
//! Roots: `inputs.<name>`, `steps.<id>[.<field>|.<index>]...` and `run.id`.
//! A string that is exactly one placeholder takes the referenced JSON value
//! as is; anything else interpolates text. Missing fields resolve to `null`.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder in `{template}`")]
    Unterminated { template: String },
    #[error("empty placeholder in `{template}`")]
    Empty { template: String },
    #[error("unknown reference `{path}`")]
    UnknownReference { path: String },
    #[error("reference `{path}` points at step `{step}`, which has not run yet")]
    StepNotReached { path: String, step: String },
}

/// Values visible to placeholders. Skipped steps are present with `null`.
#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    pub run_id: &'a str,
    pub inputs: &'a Map<String, Value>,
    pub steps: &'a BTreeMap<String, Value>,
}

pub fn render_value(value: &Value, scope: &TemplateScope<'_>) -> Result<Value, TemplateError> {
    match value {
        Value::String(template) => render_string(template, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut rendered = Map::new();
            for (key, field) in fields {
                rendered.insert(key.clone(), render_value(field, scope)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

pub fn render_string(template: &str, scope: &TemplateScope<'_>) -> Result<Value, TemplateError> {
    if let Some(path) = whole_placeholder(template) {
        return lookup(path, template, scope);
    }
    render_text(template, scope).map(Value::String)
}

/// Interpolates every placeholder as text.
pub fn render_text(template: &str, scope: &TemplateScope<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Unterminated {
                template: template.to_string(),
            });
        };
        let value = lookup(after[..end].trim(), template, scope)?;
        out.push_str(&as_text(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Truthiness used by step conditions and gate flags.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

fn whole_placeholder(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn lookup(path: &str, template: &str, scope: &TemplateScope<'_>) -> Result<Value, TemplateError> {
    if path.is_empty() {
        return Err(TemplateError::Empty {
            template: template.to_string(),
        });
    }
    let mut segments = path.split('.');
    let root = segments.next().unwrap_or_default();
    match root {
        "inputs" => {
            let Some(name) = segments.next() else {
                return Ok(Value::Object(scope.inputs.clone()));
            };
            let value = scope.inputs.get(name).cloned().unwrap_or(Value::Null);
            Ok(traverse(value, segments))
        }
        "steps" => {
            let Some(step) = segments.next() else {
                return Err(TemplateError::UnknownReference {
                    path: path.to_string(),
                });
            };
            let Some(value) = scope.steps.get(step) else {
                return Err(TemplateError::StepNotReached {
                    path: path.to_string(),
                    step: step.to_string(),
                });
            };
            Ok(traverse(value.clone(), segments))
        }
        "run" => match (segments.next(), segments.next()) {
            (Some("id"), None) => Ok(Value::String(scope.run_id.to_string())),
            _ => Err(TemplateError::UnknownReference {
                path: path.to_string(),
            }),
        },
        _ => Err(TemplateError::UnknownReference {
            path: path.to_string(),
        }),
    }
}

fn traverse<'s>(mut value: Value, segments: impl Iterator<Item = &'s str>) -> Value {
    for segment in segments {
        value = match value {
            Value::Object(mut fields) => fields.remove(segment).unwrap_or(Value::Null),
            Value::Array(mut items) => match segment.parse::<usize>() {
                Ok(index) if index < items.len() => items.swap_remove(index),
                _ => Value::Null,
            },
            _ => Value::Null,
        };
    }
    value
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
