//! Schema projection: derives a mirrored table from remote attribute metadata.
//!
//! A mapping is a pure function of the metadata. Each attribute type always
//! yields the same column shape:
//!
//! | Attribute type | Columns |
//! |---|---|
//! | primary id | `Id` |
//! | Boolean | 1 boolean |
//! | DateTime | 1 timestamp |
//! | Decimal | 1 numeric(38, 10) |
//! | Double | 1 double |
//! | Integer | 1 integer |
//! | Money | 1 numeric(19, 4), amount only |
//! | Picklist / State / Status | 1 integer, option code |
//! | Uniqueidentifier | 1 uuid |
//! | BigInt | 1 bigint |
//! | String / Memo | 1 text sized from `MaxLength` |
//! | Lookup / Owner / Customer | `<name>` uuid + `<name>_entitytype` text |
//! | EntityName | 1 text(128) |
//! | PartyList | 1 uuid, first party |
//!
//! Virtual and derived attributes are skipped.

pub mod sql;
pub mod value;

use std::collections::HashSet;

use uuid::Uuid;

use crate::error::ProjectionError;
use crate::metadata::{AttributeMetadata, AttributeType, EntityMetadata};
use crate::model::{AttributeValue, Entity};

pub use sql::{validate_identifier, Dialect};
pub use value::{project_value, SqlValue, ValueRule, ValueType};

/// Canonical primary key column, whatever the source calls its id attribute.
pub const ID_COLUMN: &str = "Id";
/// Set when a row is first inserted.
pub const FIRST_SYNCED_COLUMN: &str = "FirstSyncedOn";
/// Set on every upsert of a row.
pub const LAST_SYNCED_COLUMN: &str = "LastSyncedOn";

/// `MaxLength` value the source uses for text without a length limit.
pub const UNBOUNDED_LENGTH: i32 = -1;
/// Length of the entity type discriminator columns.
pub const ENTITY_NAME_LENGTH: u32 = 128;
/// Suffix of the discriminator column that accompanies every reference column.
pub const ENTITY_TYPE_SUFFIX: &str = "_entitytype";

const MONEY: ValueType = ValueType::Decimal {
    precision: 19,
    scale: 4,
};
const DECIMAL: ValueType = ValueType::Decimal {
    precision: 38,
    scale: 10,
};
const ENTITY_NAME: ValueType = ValueType::Text {
    max_length: Some(ENTITY_NAME_LENGTH),
};

/// One target column derived from a source attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub name: String,
    pub value_type: ValueType,
    pub rule: ValueRule,
}

impl ColumnMapping {
    fn new(name: impl Into<String>, value_type: ValueType, rule: ValueRule) -> Self {
        Self {
            name: name.into(),
            value_type,
            rule,
        }
    }

    pub fn project_value(&self, raw: Option<&AttributeValue>) -> Result<SqlValue, ProjectionError> {
        value::project_value(&self.name, self.value_type, self.rule, raw)
    }
}

/// A source attribute and the columns it projects into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeColumnMapping {
    pub attribute: String,
    pub attribute_type: AttributeType,
    pub columns: Vec<ColumnMapping>,
}

/// The projected relational schema of one source entity type.
///
/// Built once at startup; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMapping {
    pub entity_type: String,
    pub table_name: String,
    pub primary_id_attribute: String,
    pub attributes: Vec<AttributeColumnMapping>,
}

/// An entity projected into target column order (excluding `Id` and the sync timestamps).
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedRow {
    pub id: Uuid,
    pub values: Vec<SqlValue>,
}

impl EntityMapping {
    /// Data columns in table order.
    pub fn columns(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.attributes.iter().flat_map(|a| a.columns.iter())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns().map(|c| c.name.as_str())
    }

    pub fn column_count(&self) -> usize {
        self.columns().count()
    }

    /// Source attributes to request from the change feed, primary id first.
    pub fn source_attributes(&self) -> Vec<String> {
        std::iter::once(self.primary_id_attribute.clone())
            .chain(self.attributes.iter().map(|a| a.attribute.clone()))
            .collect()
    }

    /// Projects an entity's attributes into this mapping's column shape.
    pub fn project_entity(&self, entity: &Entity) -> Result<ProjectedRow, ProjectionError> {
        let mut values = Vec::with_capacity(self.column_count());
        for attribute in &self.attributes {
            let raw = entity.get(&attribute.attribute);
            for column in &attribute.columns {
                values.push(column.project_value(raw)?);
            }
        }
        Ok(ProjectedRow {
            id: entity.id,
            values,
        })
    }

    pub fn create_table_statement(&self, dialect: Dialect) -> String {
        sql::create_table(self, dialect)
    }

    /// Merge from `staging_table` into the target, keyed by `Id`.
    pub fn merge_statement(&self, dialect: Dialect, staging_table: &str) -> String {
        sql::merge(self, dialect, staging_table)
    }

    pub fn staging_table_statement(&self, dialect: Dialect, staging_table: &str) -> String {
        sql::staging_table(self, dialect, staging_table)
    }

    /// Single-row parameterized upsert; parameters are `Id`, data columns, first and last sync time.
    pub fn upsert_statement(&self, dialect: Dialect) -> String {
        sql::upsert(self, dialect)
    }

    pub fn delete_statement(&self, dialect: Dialect, id_count: usize) -> String {
        sql::delete(self, dialect, id_count)
    }
}

/// Derives the mirrored table for one entity type.
///
/// Fails with `UnsupportedAttributeType` when an attribute has no projection rule.
pub fn project(metadata: &EntityMetadata) -> Result<EntityMapping, ProjectionError> {
    validate_identifier(&metadata.logical_name)?;

    if metadata.attribute(&metadata.primary_id_attribute).is_none() {
        return Err(ProjectionError::MissingPrimaryId {
            entity: metadata.logical_name.clone(),
            attribute: metadata.primary_id_attribute.clone(),
        });
    }

    let mut seen: HashSet<String> = [ID_COLUMN, FIRST_SYNCED_COLUMN, LAST_SYNCED_COLUMN]
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();

    let mut attributes = Vec::new();
    for attribute in &metadata.attributes {
        if attribute.logical_name == metadata.primary_id_attribute || attribute.is_computed() {
            continue;
        }

        let columns = project_attribute(&metadata.logical_name, attribute)?;
        for column in &columns {
            validate_identifier(&column.name)?;
            // SQLite compares identifiers case-insensitively, so we do too.
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(ProjectionError::DuplicateColumn {
                    table: metadata.logical_name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        attributes.push(AttributeColumnMapping {
            attribute: attribute.logical_name.clone(),
            attribute_type: attribute.attribute_type,
            columns,
        });
    }

    Ok(EntityMapping {
        entity_type: metadata.logical_name.clone(),
        table_name: metadata.logical_name.clone(),
        primary_id_attribute: metadata.primary_id_attribute.clone(),
        attributes,
    })
}

fn project_attribute(
    entity: &str,
    attribute: &AttributeMetadata,
) -> Result<Vec<ColumnMapping>, ProjectionError> {
    let name = attribute.logical_name.as_str();
    let single = |value_type: ValueType,
                  rule: ValueRule|
     -> Result<Vec<ColumnMapping>, ProjectionError> {
        Ok(vec![ColumnMapping::new(name, value_type, rule)])
    };

    match attribute.attribute_type {
        AttributeType::Boolean => single(ValueType::Boolean, ValueRule::Passthrough),
        AttributeType::DateTime => single(ValueType::Timestamp, ValueRule::Passthrough),
        AttributeType::Decimal => single(DECIMAL, ValueRule::Passthrough),
        AttributeType::Double => single(ValueType::Double, ValueRule::Passthrough),
        AttributeType::Integer => single(ValueType::Integer, ValueRule::Passthrough),
        AttributeType::Money => single(MONEY, ValueRule::MoneyAmount),
        AttributeType::Picklist | AttributeType::State | AttributeType::Status => {
            single(ValueType::Integer, ValueRule::OptionCode)
        }
        AttributeType::Uniqueidentifier => single(ValueType::Uuid, ValueRule::Passthrough),
        AttributeType::BigInt => single(ValueType::BigInt, ValueRule::Passthrough),
        AttributeType::String | AttributeType::Memo => single(
            ValueType::Text {
                max_length: text_length(attribute.max_length),
            },
            ValueRule::Passthrough,
        ),
        AttributeType::Lookup | AttributeType::Owner | AttributeType::Customer => Ok(vec![
            ColumnMapping::new(name, ValueType::Uuid, ValueRule::ReferenceId),
            ColumnMapping::new(
                format!("{}{}", name, ENTITY_TYPE_SUFFIX),
                ENTITY_NAME,
                ValueRule::ReferenceType,
            ),
        ]),
        AttributeType::EntityName => single(ENTITY_NAME, ValueRule::Passthrough),
        AttributeType::PartyList => single(ValueType::Uuid, ValueRule::FirstParty),
        AttributeType::CalendarRules
        | AttributeType::ManagedProperty
        | AttributeType::Virtual
        | AttributeType::Unknown => Err(ProjectionError::UnsupportedAttributeType {
            entity: entity.to_string(),
            attribute: name.to_string(),
            kind: attribute.attribute_type,
        }),
    }
}

fn text_length(max_length: Option<i32>) -> Option<u32> {
    match max_length {
        Some(UNBOUNDED_LENGTH) | None => None,
        Some(n) if n <= 0 => None,
        Some(n) => Some(n as u32),
    }
}
