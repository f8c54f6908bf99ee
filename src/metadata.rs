//! Remote entity metadata as reported by the source store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Declared type of a source attribute.
///
/// Names match the source's attribute type codes so the metadata endpoint
/// deserializes straight into this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    Boolean,
    Customer,
    DateTime,
    Decimal,
    Double,
    Integer,
    Lookup,
    Memo,
    Money,
    Owner,
    PartyList,
    Picklist,
    State,
    Status,
    String,
    Uniqueidentifier,
    CalendarRules,
    Virtual,
    BigInt,
    ManagedProperty,
    EntityName,
    /// A type code this build does not recognize.
    #[serde(other)]
    Unknown,
}

/// Metadata for a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeMetadata {
    pub logical_name: String,
    pub attribute_type: AttributeType,
    /// Declared maximum length for text attributes.
    #[serde(default)]
    pub max_length: Option<i32>,
    /// Set when the attribute is derived from another attribute.
    #[serde(default)]
    pub attribute_of: Option<String>,
}

impl AttributeMetadata {
    pub fn new(logical_name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            logical_name: logical_name.into(),
            attribute_type,
            max_length: None,
            attribute_of: None,
        }
    }

    pub fn with_max_length(mut self, max_length: i32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_attribute_of(mut self, parent: impl Into<String>) -> Self {
        self.attribute_of = Some(parent.into());
        self
    }

    /// Virtual and derived attributes have no storage of their own and are never mirrored.
    pub fn is_computed(&self) -> bool {
        self.attribute_type == AttributeType::Virtual || self.attribute_of.is_some()
    }
}

/// Metadata describing one source entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntityMetadata {
    pub logical_name: String,
    /// Collection name used by the source's data endpoints.
    #[serde(default)]
    pub entity_set_name: Option<String>,
    pub primary_id_attribute: String,
    #[serde(default)]
    pub change_tracking_enabled: bool,
    #[serde(default)]
    pub attributes: Vec<AttributeMetadata>,
}

impl EntityMetadata {
    pub fn attribute(&self, logical_name: &str) -> Option<&AttributeMetadata> {
        self.attributes
            .iter()
            .find(|a| a.logical_name == logical_name)
    }
}

/// Supplies entity metadata from the remote store.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn get_entity_metadata(&self, entity_type: &str) -> Result<EntityMetadata, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_metadata_from_json() {
        let json = r#"{
            "LogicalName": "firstname",
            "AttributeType": "String",
            "MaxLength": 50,
            "AttributeOf": null
        }"#;
        let attr: AttributeMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(attr.logical_name, "firstname");
        assert_eq!(attr.attribute_type, AttributeType::String);
        assert_eq!(attr.max_length, Some(50));
        assert!(!attr.is_computed());
    }

    #[test]
    fn test_unknown_attribute_type() {
        let json = r#"{"LogicalName": "x", "AttributeType": "Hologram"}"#;
        let attr: AttributeMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(attr.attribute_type, AttributeType::Unknown);
    }

    #[test]
    fn test_is_computed() {
        assert!(AttributeMetadata::new("v", AttributeType::Virtual).is_computed());
        assert!(AttributeMetadata::new("owneridname", AttributeType::String)
            .with_attribute_of("ownerid")
            .is_computed());
        assert!(!AttributeMetadata::new("ownerid", AttributeType::Owner).is_computed());
    }
}
