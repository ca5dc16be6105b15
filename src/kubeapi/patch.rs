//! JSON Patch (RFC 6902) and JSON Merge Patch (RFC 7386) builders

use kube::api::Patch;
use serde_json::{Map, Value};

use crate::error::Result;

/// Escape one reference token of a JSON Pointer (RFC 6901)
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Build a JSON Pointer from unescaped path segments
pub fn pointer(path: &[&str]) -> String {
    let escaped: Vec<String> = path.iter().map(|t| escape_token(t)).collect();
    format!("/{}", escaped.join("/"))
}

/// Builder for an RFC 6902 JSON Patch document
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Json6902 {
    ops: Vec<Value>,
}

impl Json6902 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an `add` operation
    pub fn add(&mut self, path: &[&str], value: impl Into<Value>) -> &mut Self {
        self.push("add", path, Some(value.into()))
    }

    /// Append a `remove` operation
    pub fn remove(&mut self, path: &[&str]) -> &mut Self {
        self.push("remove", path, None)
    }

    /// Append a `replace` operation
    pub fn replace(&mut self, path: &[&str], value: impl Into<Value>) -> &mut Self {
        self.push("replace", path, Some(value.into()))
    }

    fn push(&mut self, op: &str, path: &[&str], value: Option<Value>) -> &mut Self {
        let mut operation = Map::new();
        operation.insert("op".into(), Value::from(op));
        operation.insert("path".into(), Value::from(pointer(path)));
        if let Some(value) = value {
            operation.insert("value".into(), value);
        }
        self.ops.push(Value::Object(operation));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Operations as a JSON array
    pub fn to_value(&self) -> Value {
        Value::Array(self.ops.clone())
    }

    /// Serialized patch document
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.ops)?)
    }

    /// Patch ready to send through `Api::patch`
    pub fn to_patch(&self) -> Result<Patch<()>> {
        let patch: json_patch::Patch = serde_json::from_value(self.to_value())?;
        Ok(Patch::Json(patch))
    }
}

/// Builder for an RFC 7386 JSON Merge Patch document
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Merge7386 {
    doc: Map<String, Value>,
}

impl Merge7386 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value at `path`, creating intermediate objects
    pub fn add(&mut self, path: &[&str], value: impl Into<Value>) -> &mut Self {
        self.set(path, value.into());
        self
    }

    /// Remove the member at `path`
    pub fn remove(&mut self, path: &[&str]) -> &mut Self {
        self.set(path, Value::Null);
        self
    }

    fn set(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };

        let mut current = &mut self.doc;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(map) = entry else {
                return;
            };
            current = map;
        }
        current.insert(last.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }

    /// Patch document as a JSON value
    pub fn to_value(&self) -> Value {
        Value::Object(self.doc.clone())
    }

    /// Serialized patch document
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.doc)?)
    }

    /// Patch ready to send through `Api::patch`
    pub fn to_patch(&self) -> Patch<Value> {
        Patch::Merge(self.to_value())
    }
}
