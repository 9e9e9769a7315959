//! Template resolution for request values.
//!
//! Placeholders use `{{path.to.value}}` syntax. The leading path segment is
//! either `global` (flattened environment variables) or the id of a case that
//! already executed this run. Resolution fails closed: unknown references
//! substitute empty rather than erroring, so templated bodies may reference
//! optional fields.

use serde_json::{Map, Value};

use crate::model::{EnvVariable, RecordsMap};

/// Immutable resolution context, built once per case from the environment's
/// globals and the run's records. Later cases never observe mutation.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    root: Value,
}

impl ResolveContext {
    pub fn new(global: &[EnvVariable], records: &RecordsMap) -> Self {
        let mut globals = Map::new();
        for var in global {
            if !var.name.is_empty() {
                globals.insert(var.name.clone(), Value::String(var.value.clone()));
            }
        }

        let mut root = Map::new();
        root.insert("global".to_string(), Value::Object(globals));
        for (id, record) in records {
            root.insert(
                id.to_string(),
                serde_json::to_value(record).unwrap_or(Value::Null),
            );
        }

        Self {
            root: Value::Object(root),
        }
    }

    /// Resolve one templated value. A string that is exactly one placeholder
    /// substitutes the referenced JSON value with its type preserved; anything
    /// else interpolates placeholders as strings. Arrays and objects resolve
    /// recursively.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_str(&self, input: &str) -> Value {
        if let Some(path) = exact_placeholder(input.trim()) {
            return self.lookup(path.trim()).cloned().unwrap_or(Value::Null);
        }
        Value::String(self.interpolate(input))
    }

    /// Interpolate every placeholder in `input` as its string rendering.
    /// Unresolved references render empty; an unterminated `{{` is left as-is.
    pub fn interpolate(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    out.push_str(&self.render(after[..end].trim()));
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    return out;
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn render(&self, path: &str) -> String {
        match self.lookup(path) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Walk a dotted path through the context; numeric segments index arrays.
    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn exact_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}
