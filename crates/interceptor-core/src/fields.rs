//! Data-driven payload codec driven by the catalog's field layouts.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::{Packet, encode_string};

/// Primitive field tags as supplied by the message catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Int,
    Short,
    Byte,
    Boolean,
    Double,
    String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i32),
    Short(i16),
    Byte(u8),
    Boolean(bool),
    Double(f64),
    String(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),

    #[error("layout expects {expected} fields, got {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("field {index} should be {expected:?}, got {found:?}")]
    LayoutMismatch {
        index: usize,
        expected: FieldKind,
        found: FieldKind,
    },
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Short(_) => FieldKind::Short,
            FieldValue::Byte(_) => FieldKind::Byte,
            FieldValue::Boolean(_) => FieldKind::Boolean,
            FieldValue::Double(_) => FieldKind::Double,
            FieldValue::String(_) => FieldKind::String,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FieldError> {
        match self {
            FieldValue::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            FieldValue::Short(v) => out.extend_from_slice(&v.to_be_bytes()),
            FieldValue::Byte(v) => out.push(*v),
            FieldValue::Boolean(v) => out.push(u8::from(*v)),
            FieldValue::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
            FieldValue::String(v) => out.extend_from_slice(&encode_string(v)?),
        }
        Ok(())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Short(v) => write!(f, "{v}"),
            FieldValue::Byte(v) => write!(f, "{v}"),
            FieldValue::Boolean(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "{v}"),
        }
    }
}

/// Reads one field at `pos`, returning it with the offset just past it.
pub(crate) fn read_field(packet: &Packet, kind: FieldKind, pos: usize) -> Option<(FieldValue, usize)> {
    let (value, width) = match kind {
        FieldKind::Int => (FieldValue::Int(packet.read_at(pos)?), 4),
        FieldKind::Short => (FieldValue::Short(packet.read_at(pos)?), 2),
        FieldKind::Byte => (FieldValue::Byte(packet.read_at(pos)?), 1),
        FieldKind::Boolean => (FieldValue::Boolean(packet.read_at(pos)?), 1),
        FieldKind::Double => (FieldValue::Double(packet.read_at(pos)?), 8),
        FieldKind::String => {
            let len = usize::from(packet.read_at::<u16>(pos)?);
            (FieldValue::String(packet.read_string_at(pos)?), 2 + len)
        }
    };
    Some((value, pos + width))
}

impl Packet {
    /// Decodes the whole attached layout from offset 0. The cursor is untouched.
    pub fn decode_fields(&self) -> Option<Vec<FieldValue>> {
        let layout = self.field_layout()?;
        let mut pos = 0usize;
        let mut values = Vec::with_capacity(layout.len());
        for kind in layout {
            let (value, next) = read_field(self, *kind, pos)?;
            values.push(value);
            pos = next;
        }
        Some(values)
    }

    /// Rewrites the payload from `values`, checked against the attached layout if any.
    pub fn encode_fields(&mut self, values: &[FieldValue]) -> Result<(), FieldError> {
        if let Some(layout) = self.field_layout() {
            if layout.len() != values.len() {
                return Err(FieldError::FieldCount {
                    expected: layout.len(),
                    found: values.len(),
                });
            }
            for (index, (expected, value)) in layout.iter().zip(values).enumerate() {
                if *expected != value.kind() {
                    return Err(FieldError::LayoutMismatch {
                        index,
                        expected: *expected,
                        found: value.kind(),
                    });
                }
            }
        }

        let mut payload = Vec::new();
        for value in values {
            value.encode_into(&mut payload)?;
        }
        self.replace_payload(payload);
        Ok(())
    }
}
