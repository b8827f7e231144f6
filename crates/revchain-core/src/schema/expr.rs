//! Row-level value expressions used by backfills and staging copies.

use super::types::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while evaluating an expression against a row.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// The row has no such column.
    #[error("column '{0}' not present in row")]
    MissingColumn(String),

    /// A mapped column held a value with no mapping and no default.
    #[error("no mapping for value {value} of column '{column}'")]
    Unmapped {
        /// Source column.
        column: String,
        /// The offending value.
        value: String,
    },
}

/// A value expression evaluated per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// A constant.
    Literal {
        /// The value.
        value: Value,
    },
    /// The value of a column in the source row.
    Column {
        /// Column name.
        name: String,
    },
    /// Translate a column's value through a lookup table.
    ///
    /// Values without an entry fall back to `default`; without a default the
    /// evaluation fails rather than silently dropping data. NULL passes through.
    Map {
        /// Source column.
        column: String,
        /// Lookup table keyed by the source value's text form.
        mapping: BTreeMap<String, Value>,
        /// Fallback for unmapped values.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    /// The first non-null value.
    Coalesce {
        /// Candidate expressions, in order.
        exprs: Vec<Expr>,
    },
}

impl Expr {
    /// A literal expression.
    pub fn literal(value: Value) -> Self {
        Expr::Literal { value }
    }

    /// A column reference.
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column { name: name.into() }
    }

    /// A value mapping over a column.
    pub fn map<K, V>(column: impl Into<String>, mapping: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Expr::Map {
            column: column.into(),
            mapping: mapping
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            default: None,
        }
    }

    /// Set the fallback for a [`Expr::Map`]; no effect on other variants.
    pub fn with_default(mut self, value: Value) -> Self {
        if let Expr::Map { default, .. } = &mut self {
            *default = Some(value);
        }
        self
    }

    /// Evaluate against a row.
    pub fn evaluate(&self, row: &Row) -> Result<Value, ExprError> {
        match self {
            Expr::Literal { value } => Ok(value.clone()),
            Expr::Column { name } => row
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::MissingColumn(name.clone())),
            Expr::Map {
                column,
                mapping,
                default,
            } => {
                let source = row
                    .get(column)
                    .ok_or_else(|| ExprError::MissingColumn(column.clone()))?;
                if source.is_null() {
                    return Ok(Value::Null);
                }
                let key = value_text(source);
                match mapping.get(&key).or(default.as_ref()) {
                    Some(mapped) => Ok(mapped.clone()),
                    None => Err(ExprError::Unmapped {
                        column: column.clone(),
                        value: key,
                    }),
                }
            }
            Expr::Coalesce { exprs } => {
                for expr in exprs {
                    let value = expr.evaluate(row)?;
                    if !value.is_null() {
                        return Ok(value);
                    }
                }
                Ok(Value::Null)
            }
        }
    }

    /// Columns of the source row this expression reads.
    pub fn referenced_columns(&self) -> Vec<&str> {
        match self {
            Expr::Literal { .. } => Vec::new(),
            Expr::Column { name } => vec![name.as_str()],
            Expr::Map { column, .. } => vec![column.as_str()],
            Expr::Coalesce { exprs } => exprs.iter().flat_map(|e| e.referenced_columns()).collect(),
        }
    }
}

/// Text form of a value, as used for mapping keys.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_map_translates_and_passes_null() {
        let expr = Expr::map("section", [("warm_up", "warmup"), ("main_lift", "main")]);

        let translated = expr.evaluate(&row(&[("section", json!("warm_up"))])).unwrap();
        assert_eq!(translated, json!("warmup"));

        let null = expr.evaluate(&row(&[("section", Value::Null)])).unwrap();
        assert!(null.is_null());
    }

    #[test]
    fn test_map_without_default_rejects_unknown_values() {
        let expr = Expr::map("section", [("warm_up", "warmup")]);
        let err = expr.evaluate(&row(&[("section", json!("finisher"))])).unwrap_err();
        assert_eq!(
            err,
            ExprError::Unmapped {
                column: "section".to_string(),
                value: "finisher".to_string()
            }
        );

        let fallback = expr.with_default(json!("accessory"));
        assert_eq!(
            fallback.evaluate(&row(&[("section", json!("finisher"))])).unwrap(),
            json!("accessory")
        );
    }

    #[test]
    fn test_coalesce() {
        let expr = Expr::Coalesce {
            exprs: vec![Expr::column("role"), Expr::literal(json!("main"))],
        };
        assert_eq!(expr.evaluate(&row(&[("role", Value::Null)])).unwrap(), json!("main"));
        assert_eq!(
            expr.evaluate(&row(&[("role", json!("warmup"))])).unwrap(),
            json!("warmup")
        );
        assert_eq!(expr.referenced_columns(), vec!["role"]);
    }

    #[test]
    fn test_missing_column() {
        let err = Expr::column("nope").evaluate(&Row::new()).unwrap_err();
        assert_eq!(err, ExprError::MissingColumn("nope".to_string()));
    }
}
