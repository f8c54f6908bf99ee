//! Source entity values and the change batches the feed delivers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// A monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
}

/// A selected option of a picklist, state or status attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSetValue {
    pub value: i32,
}

/// A reference to another entity (lookup, owner, customer, activity party).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReference {
    pub id: Uuid,
    pub logical_name: String,
}

impl EntityReference {
    pub fn new(logical_name: impl Into<String>, id: Uuid) -> Self {
        Self {
            id,
            logical_name: logical_name.into(),
        }
    }
}

/// A raw attribute value as read from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Boolean(bool),
    Integer(i32),
    BigInt(i64),
    Decimal(Decimal),
    Double(f64),
    Money(Money),
    OptionSet(OptionSetValue),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    String(String),
    EntityReference(EntityReference),
    /// Activity parties; the first entry is the primary party.
    PartyList(Vec<EntityReference>),
}

impl AttributeValue {
    /// Short shape name used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Null => "null",
            AttributeValue::Boolean(_) => "boolean",
            AttributeValue::Integer(_) => "integer",
            AttributeValue::BigInt(_) => "bigint",
            AttributeValue::Decimal(_) => "decimal",
            AttributeValue::Double(_) => "double",
            AttributeValue::Money(_) => "money",
            AttributeValue::OptionSet(_) => "option set",
            AttributeValue::DateTime(_) => "datetime",
            AttributeValue::Guid(_) => "guid",
            AttributeValue::String(_) => "string",
            AttributeValue::EntityReference(_) => "entity reference",
            AttributeValue::PartyList(_) => "party list",
        }
    }
}

/// The full current state of one source entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub logical_name: String,
    pub id: Uuid,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Entity {
    pub fn new(logical_name: impl Into<String>, id: Uuid) -> Self {
        Self {
            logical_name: logical_name.into(),
            id,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, attribute: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(attribute.into(), value);
        self
    }

    pub fn get(&self, attribute: &str) -> Option<&AttributeValue> {
        self.attributes.get(attribute)
    }
}

/// One entry of a change feed page.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeItem {
    NewOrUpdated(Entity),
    RemovedOrDeleted(Uuid),
    /// An entry the feed could not classify; rejected by the consumer.
    Unrecognized { kind: String },
}

/// Opaque change feed position. Only the feed that issued it interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of changes for a single entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub entity_type: String,
    pub items: Vec<ChangeItem>,
}

/// A page split into the two change kinds, preserving feed order within each.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedChanges {
    pub upserts: Vec<Entity>,
    pub deletes: Vec<Uuid>,
}

impl ChangeBatch {
    pub fn new(entity_type: impl Into<String>, items: Vec<ChangeItem>) -> Self {
        Self {
            entity_type: entity_type.into(),
            items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Splits the page into upserts and deletes.
    ///
    /// Fails on the first item the feed could not classify; that is a contract
    /// violation by the feed and the whole page is rejected.
    pub fn classify(self) -> Result<ClassifiedChanges, SyncError> {
        let mut changes = ClassifiedChanges::default();
        for item in self.items {
            match item {
                ChangeItem::NewOrUpdated(entity) => changes.upserts.push(entity),
                ChangeItem::RemovedOrDeleted(id) => changes.deletes.push(id),
                ChangeItem::Unrecognized { kind } => {
                    return Err(SyncError::UnexpectedChangeType {
                        entity: self.entity_type,
                        kind,
                    });
                }
            }
        }
        Ok(changes)
    }
}
