// Schemaless documents with dotted-path access

use crate::error::{Result, ShelfError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved key holding a document's identifier inside its collection.
pub const ID_FIELD: &str = "__id";

/// A stored document: an ordered JSON object that always carries `__id` once saved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Document::default()
    }

    /// Wrap a JSON value. Only objects are documents.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Document { fields }),
            other => Err(ShelfError::Validation(format!(
                "Document must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID_FIELD).and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.fields
            .insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    /// Read a value by dotted path (`profile.address.city`, `tags.0`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write a value by dotted path, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ShelfError::Validation(format!("Invalid document path '{path}'")));
        }

        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| ShelfError::Validation("Empty document path".into()))?;

        let mut map = &mut self.fields;
        for segment in parents {
            let entry = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            map = entry.as_object_mut().ok_or_else(|| {
                ShelfError::Validation(format!("Cannot descend into '{segment}'"))
            })?;
        }
        map.insert(last.to_string(), value.into());
        Ok(())
    }

    /// Remove a value by dotted path. Returns the removed value, if any.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let (parent, last) = match path.rsplit_once('.') {
            Some((parent, last)) => (Some(parent), last),
            None => (None, path),
        };
        let map = match parent {
            None => &mut self.fields,
            Some(parent) => {
                let mut current = &mut self.fields;
                for segment in parent.split('.') {
                    current = current.get_mut(segment)?.as_object_mut()?;
                }
                current
            }
        };
        map.remove(last)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Encode to the JSON text stored in a collection table.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    /// Decode the JSON text stored in a collection table.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Document::from_value(value)
    }
}

impl TryFrom<Value> for Document {
    type Error = ShelfError;

    fn try_from(value: Value) -> Result<Self> {
        Document::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
