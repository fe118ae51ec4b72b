//! Dynamically-structured observation payloads.
//!
//! The shape of a stream's records is described once, at registration, by
//! a [`DataComponent`] tree; every observation then carries a [`DataBlock`]
//! value tree matching that shape. The storage layer treats both as opaque
//! payloads: it never interprets results, and the stream's
//! [`RecordEncoding`] descriptor only matters to wire-level consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A typed observation value: a tagged tree of scalars and composites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataBlock {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Time(DateTime<Utc>),
    /// Fixed sequence of named fields, in schema order.
    Record(Vec<DataBlock>),
    /// Homogeneous repetition of one element shape.
    Array(Vec<DataBlock>),
}

impl DataBlock {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataBlock::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DataBlock::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            DataBlock::Double(v) => Some(*v),
            DataBlock::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataBlock::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Field of a record block by position.
    pub fn field(&self, index: usize) -> Option<&DataBlock> {
        match self {
            DataBlock::Record(fields) | DataBlock::Array(fields) => fields.get(index),
            _ => None,
        }
    }
}

/// Schema tree for a stream's records. Scalar components carry a name, an
/// optional unit of measure and an optional observable definition URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataComponent {
    Bool {
        name: String,
        definition: Option<String>,
    },
    Count {
        name: String,
        definition: Option<String>,
    },
    Quantity {
        name: String,
        uom: Option<String>,
        definition: Option<String>,
    },
    Text {
        name: String,
        definition: Option<String>,
    },
    Time {
        name: String,
        definition: Option<String>,
    },
    Record {
        name: String,
        fields: Vec<DataComponent>,
    },
    Vector {
        name: String,
        reference_frame: Option<String>,
        coordinates: Vec<DataComponent>,
    },
}

impl DataComponent {
    pub fn name(&self) -> &str {
        match self {
            DataComponent::Bool { name, .. }
            | DataComponent::Count { name, .. }
            | DataComponent::Quantity { name, .. }
            | DataComponent::Text { name, .. }
            | DataComponent::Time { name, .. }
            | DataComponent::Record { name, .. }
            | DataComponent::Vector { name, .. } => name,
        }
    }

    /// Shorthand for a plain scalar quantity.
    pub fn quantity(name: &str, uom: &str) -> Self {
        DataComponent::Quantity {
            name: name.to_string(),
            uom: Some(uom.to_string()),
            definition: None,
        }
    }
}

/// How a stream's records are encoded on the wire. Opaque to storage;
/// kept so registry consumers can reconstruct external representations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordEncoding {
    Binary,
    Text {
        token_separator: String,
        block_separator: String,
    },
}

impl Default for RecordEncoding {
    fn default() -> Self {
        RecordEncoding::Binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_accessors() {
        assert_eq!(DataBlock::Double(1.5).as_double(), Some(1.5));
        assert_eq!(DataBlock::Int(3).as_double(), Some(3.0));
        assert_eq!(DataBlock::Text("x".into()).as_double(), None);
        assert_eq!(DataBlock::Bool(true).as_bool(), Some(true));
    }

    #[test]
    fn test_record_field_access() {
        let block = DataBlock::Record(vec![DataBlock::Double(21.5), DataBlock::Int(7)]);
        assert_eq!(block.field(0).and_then(|f| f.as_double()), Some(21.5));
        assert_eq!(block.field(2), None);
    }

    #[test]
    fn test_component_names() {
        let schema = DataComponent::Record {
            name: "sample".to_string(),
            fields: vec![DataComponent::quantity("temp", "Cel")],
        };
        assert_eq!(schema.name(), "sample");
    }
}
