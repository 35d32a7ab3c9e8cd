use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A single cell value copied out of a native cursor row.
///
/// Values are decoded eagerly when a row is fetched so they stay readable
/// after the originating cursor advances. Geometry cells keep the driver's
/// byte representation unless a geometry decoder replaces them with a
/// richer form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int32(i32),
    Int64(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Geometry(Vec<u8>),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Int32(_) => "INT32",
            Self::Int64(_) => "INT64",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::Blob(_) => "BLOB",
            Self::Geometry(_) => "GEOMETRY",
            Self::Timestamp(_) => "TIMESTAMP",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(i) => Some(i64::from(*i)),
            Self::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(i) => Some(f64::from(*i)),
            Self::Int64(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) | Self::Geometry(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int32(i) => write!(f, "{}", i),
            Self::Int64(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Self::Geometry(b) => write!(f, "<geometry, {} bytes>", b.len()),
            Self::Timestamp(t) => write!(f, "{}", t),
        }
    }
}

/// Column data types as reported by the native describe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellType {
    Int32,
    Int64,
    Float,
    Text,
    Blob,
    Geometry,
    Timestamp,
}

impl CellType {
    /// Whether a decoded value is acceptable for a column of this type.
    /// NULL is compatible with every type; nullability is a column
    /// property, not a type property.
    pub fn is_compatible(&self, value: &CellValue) -> bool {
        match (self, value) {
            (_, CellValue::Null) => true,
            (Self::Int32, CellValue::Int32(_)) => true,
            (Self::Int64, CellValue::Int32(_) | CellValue::Int64(_)) => true,
            (Self::Float, CellValue::Float(_) | CellValue::Int32(_) | CellValue::Int64(_)) => true,
            (Self::Text, CellValue::Text(_)) => true,
            (Self::Blob, CellValue::Blob(_)) => true,
            (Self::Geometry, CellValue::Geometry(_) | CellValue::Blob(_)) => true,
            (Self::Timestamp, CellValue::Timestamp(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int32 => "INT32",
            Self::Int64 => "INT64",
            Self::Float => "FLOAT",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
            Self::Geometry => "GEOMETRY",
            Self::Timestamp => "TIMESTAMP",
        };
        write!(f, "{}", name)
    }
}
