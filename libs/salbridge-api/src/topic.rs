use serde::{Deserialize, Serialize};

use crate::error::SampleError;
use crate::id::TopicId;

/// Topic cardinality class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    /// Periodic, high-rate state samples. Last-value-wins under load.
    Telemetry,
    /// Rare notifications (alarms, state transitions).
    Event,
}

/// Semantic type of a field. The bridge only checks the value shape,
/// units and ranges belong to the display layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int,
    UInt,
    Float,
    String,
    Array,
    /// No shape check.
    Any,
}

impl FieldType {
    pub fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::Bool => value.is_boolean(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::UInt => value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::String => value.is_string(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

/// A single declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self { name: name.into(), field_type }
    }
}

/// Declared topic. Immutable once declared.
///
/// Field order in `fields` is the order the controller documents them in;
/// samples may carry extra fields (private SAL stamps) which are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub id: TopicId,
    pub kind: TopicKind,
    pub fields: Vec<FieldSpec>,
    /// Priority samples are never coalesced or dropped.
    pub priority: bool,
}

impl TopicSpec {
    pub fn telemetry(id: TopicId, fields: Vec<FieldSpec>) -> Self {
        Self { id, kind: TopicKind::Telemetry, fields, priority: false }
    }

    pub fn event(id: TopicId, fields: Vec<FieldSpec>) -> Self {
        Self { id, kind: TopicKind::Event, fields, priority: true }
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Check that every declared field is present with the declared shape.
    pub fn check(&self, fields: &serde_json::Map<String, serde_json::Value>) -> Result<(), SampleError> {
        for spec in &self.fields {
            match fields.get(&spec.name) {
                None => {
                    return Err(SampleError::MissingField {
                        topic: self.id.to_string(),
                        field: spec.name.clone(),
                    });
                }
                Some(value) if !spec.field_type.accepts(value) => {
                    return Err(SampleError::FieldType {
                        topic: self.id.to_string(),
                        field: spec.name.clone(),
                        expected: spec.field_type,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
