//! Column types and value checks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A cell value. Rows carry JSON values so revision files can express them directly.
pub type Value = serde_json::Value;

/// A single row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Column data types understood by the engine.
///
/// In revision files a type is written as a string: `integer`, `bigint`,
/// `float`, `text`, `boolean`, `timestamp`, `json` or `enum(<type name>)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInt,
    /// Double precision float.
    Float,
    /// UTF-8 text.
    Text,
    /// Boolean value.
    Boolean,
    /// Timestamp, stored as an RFC 3339 string.
    Timestamp,
    /// Arbitrary JSON document.
    Json,
    /// A value of a named enumerated type.
    Enum(String),
}

impl ColumnType {
    /// Create an enum column type.
    pub fn enumeration(name: impl Into<String>) -> Self {
        ColumnType::Enum(name.into())
    }

    /// Name of the enumerated type this column uses, if any.
    pub fn enum_name(&self) -> Option<&str> {
        match self {
            ColumnType::Enum(name) => Some(name),
            _ => None,
        }
    }

    /// Check a non-null value against this type.
    ///
    /// `enum_values` is consulted for enum columns; an unknown enum type
    /// accepts nothing.
    pub fn accepts(&self, value: &Value, enum_values: Option<&[String]>) -> bool {
        match self {
            ColumnType::Integer => value
                .as_i64()
                .map(|v| i32::try_from(v).is_ok())
                .unwrap_or(false),
            ColumnType::BigInt => value.is_i64() || value.is_u64(),
            ColumnType::Float => value.is_number(),
            ColumnType::Text => value.is_string(),
            ColumnType::Boolean => value.is_boolean(),
            ColumnType::Timestamp => value
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
            ColumnType::Json => true,
            ColumnType::Enum(_) => match (value.as_str(), enum_values) {
                (Some(v), Some(values)) => values.iter().any(|allowed| allowed == v),
                _ => false,
            },
        }
    }

    /// PostgreSQL spelling of the type.
    pub fn sql_name(&self) -> String {
        match self {
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Float => "DOUBLE PRECISION".to_string(),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Timestamp => "TIMESTAMPTZ".to_string(),
            ColumnType::Json => "JSONB".to_string(),
            ColumnType::Enum(name) => name.clone(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Float => write!(f, "float"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Timestamp => write!(f, "timestamp"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Enum(name) => write!(f, "enum({})", name),
        }
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("enum(").and_then(|r| r.strip_suffix(')')) {
            let name = inner.trim();
            if name.is_empty() {
                return Err("enum type name cannot be empty".to_string());
            }
            return Ok(ColumnType::Enum(name.to_string()));
        }

        match s.to_ascii_lowercase().as_str() {
            "integer" | "int" => Ok(ColumnType::Integer),
            "bigint" => Ok(ColumnType::BigInt),
            "float" | "double" => Ok(ColumnType::Float),
            "text" | "string" => Ok(ColumnType::Text),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "timestamp" => Ok(ColumnType::Timestamp),
            "json" => Ok(ColumnType::Json),
            other => Err(format!("unknown column type '{}'", other)),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

/// Canonical key for a primary-key value.
///
/// Strings sort lexically; numbers are zero-padded so integer keys keep
/// numeric order when scanned.
pub fn row_key(value: &Value) -> String {
    match value {
        Value::String(s) => format!("s:{}", s),
        Value::Number(n) => match n.as_i64() {
            Some(i) if i >= 0 => format!("n:{:020}", i),
            Some(i) => format!("m:{:020}", i64::MAX.wrapping_add(i).wrapping_add(1)),
            None => format!("f:{}", n),
        },
        other => format!("j:{}", other),
    }
}
