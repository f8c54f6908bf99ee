//! Column value types and the rules that turn raw attribute values into stored values.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::sql::Dialect;
use crate::error::ProjectionError;
use crate::model::AttributeValue;

/// Logical type of a mirrored column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Uuid,
    Boolean,
    Timestamp,
    Decimal { precision: u8, scale: u8 },
    Double,
    Integer,
    BigInt,
    /// Variable-length text; `None` means unbounded.
    Text { max_length: Option<u32> },
}

impl ValueType {
    /// Storage type string for the given target dialect.
    pub fn sql_type(&self, dialect: Dialect) -> String {
        match (dialect, self) {
            (Dialect::Postgres, ValueType::Uuid) => "uuid".to_string(),
            (Dialect::Postgres, ValueType::Boolean) => "boolean".to_string(),
            (Dialect::Postgres, ValueType::Timestamp) => "timestamptz".to_string(),
            (Dialect::Postgres, ValueType::Decimal { precision, scale }) => {
                format!("numeric({}, {})", precision, scale)
            }
            (Dialect::Postgres, ValueType::Double) => "double precision".to_string(),
            (Dialect::Postgres, ValueType::Integer) => "integer".to_string(),
            (Dialect::Postgres, ValueType::BigInt) => "bigint".to_string(),
            (Dialect::Postgres, ValueType::Text { max_length: Some(n) }) => {
                format!("varchar({})", n)
            }
            (Dialect::Postgres, ValueType::Text { max_length: None }) => "text".to_string(),

            // SQLite stores uuids and timestamps as text; the declared names only set affinity.
            (Dialect::Sqlite, ValueType::Uuid) => "TEXT".to_string(),
            (Dialect::Sqlite, ValueType::Boolean) => "BOOLEAN".to_string(),
            (Dialect::Sqlite, ValueType::Timestamp) => "DATETIME".to_string(),
            (Dialect::Sqlite, ValueType::Decimal { precision, scale }) => {
                format!("DECIMAL({}, {})", precision, scale)
            }
            (Dialect::Sqlite, ValueType::Double) => "REAL".to_string(),
            (Dialect::Sqlite, ValueType::Integer) => "INTEGER".to_string(),
            (Dialect::Sqlite, ValueType::BigInt) => "BIGINT".to_string(),
            (Dialect::Sqlite, ValueType::Text { max_length: Some(n) }) => {
                format!("VARCHAR({})", n)
            }
            (Dialect::Sqlite, ValueType::Text { max_length: None }) => "TEXT".to_string(),
        }
    }
}

/// How a column's stored value is derived from its source attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRule {
    /// Store the raw value as is.
    Passthrough,
    /// Amount of a monetary value.
    MoneyAmount,
    /// Numeric code of an option set value.
    OptionCode,
    /// Target id of an entity reference.
    ReferenceId,
    /// Target entity type name of an entity reference.
    ReferenceType,
    /// Id of the first party in a party list.
    FirstParty,
}

/// A value ready to be written to the target store.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Decimal(Decimal),
    Double(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Applies `rule` to a raw attribute value for a column of type `value_type`.
///
/// Absent and null attributes project to `SqlValue::Null`.
pub fn project_value(
    column: &str,
    value_type: ValueType,
    rule: ValueRule,
    raw: Option<&AttributeValue>,
) -> Result<SqlValue, ProjectionError> {
    let raw = match raw {
        None | Some(AttributeValue::Null) => return Ok(SqlValue::Null),
        Some(raw) => raw,
    };

    let projected = match (rule, raw) {
        (ValueRule::MoneyAmount, AttributeValue::Money(m)) => Some(SqlValue::Decimal(m.amount)),
        (ValueRule::OptionCode, AttributeValue::OptionSet(o)) => Some(SqlValue::Int(o.value)),
        (ValueRule::ReferenceId, AttributeValue::EntityReference(r)) => Some(SqlValue::Uuid(r.id)),
        (ValueRule::ReferenceType, AttributeValue::EntityReference(r)) => {
            Some(SqlValue::Text(r.logical_name.clone()))
        }
        (ValueRule::FirstParty, AttributeValue::PartyList(parties)) => Some(
            parties
                .first()
                .map(|p| SqlValue::Uuid(p.id))
                .unwrap_or(SqlValue::Null),
        ),
        (ValueRule::FirstParty, AttributeValue::EntityReference(r)) => Some(SqlValue::Uuid(r.id)),
        (ValueRule::Passthrough, raw) => passthrough(value_type, raw),
        _ => None,
    };

    projected.ok_or_else(|| ProjectionError::ValueMismatch {
        column: column.to_string(),
        expected: expected_shape(value_type, rule),
        found: raw.kind(),
    })
}

fn passthrough(value_type: ValueType, raw: &AttributeValue) -> Option<SqlValue> {
    match (value_type, raw) {
        (ValueType::Boolean, AttributeValue::Boolean(b)) => Some(SqlValue::Bool(*b)),
        (ValueType::Timestamp, AttributeValue::DateTime(t)) => Some(SqlValue::Timestamp(*t)),
        (ValueType::Decimal { .. }, AttributeValue::Decimal(d)) => Some(SqlValue::Decimal(*d)),
        (ValueType::Double, AttributeValue::Double(f)) => Some(SqlValue::Double(*f)),
        (ValueType::Integer, AttributeValue::Integer(v)) => Some(SqlValue::Int(*v)),
        (ValueType::BigInt, AttributeValue::BigInt(v)) => Some(SqlValue::BigInt(*v)),
        (ValueType::BigInt, AttributeValue::Integer(v)) => Some(SqlValue::BigInt(i64::from(*v))),
        (ValueType::Uuid, AttributeValue::Guid(u)) => Some(SqlValue::Uuid(*u)),
        (ValueType::Text { .. }, AttributeValue::String(s)) => Some(SqlValue::Text(s.clone())),
        _ => None,
    }
}

fn expected_shape(value_type: ValueType, rule: ValueRule) -> &'static str {
    match rule {
        ValueRule::MoneyAmount => "money",
        ValueRule::OptionCode => "option set",
        ValueRule::ReferenceId | ValueRule::ReferenceType => "entity reference",
        ValueRule::FirstParty => "party list",
        ValueRule::Passthrough => match value_type {
            ValueType::Uuid => "guid",
            ValueType::Boolean => "boolean",
            ValueType::Timestamp => "datetime",
            ValueType::Decimal { .. } => "decimal",
            ValueType::Double => "double",
            ValueType::Integer => "integer",
            ValueType::BigInt => "bigint",
            ValueType::Text { .. } => "string",
        },
    }
}
