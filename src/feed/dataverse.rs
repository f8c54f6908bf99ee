//! Dataverse Web API client: entity metadata and change tracking.
//!
//! Changes are read with `Prefer: odata.track-changes`. A session follows
//! `@odata.nextLink` until the last page, whose `@odata.deltaLink` is the
//! position the next session resumes from. That link is persisted only once
//! the last page has been acknowledged.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{ChangeFeed, ChangePages, ChangeRequest, WatermarkStore};
use crate::error::SourceError;
use crate::metadata::{AttributeMetadata, AttributeType, EntityMetadata, MetadataProvider};
use crate::model::{
    AttributeValue, ChangeBatch, ChangeItem, Entity, EntityReference, Money, OptionSetValue,
    Watermark,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PAGE_SIZE: u32 = 5000;

const LOOKUP_LOGICAL_NAME: &str = "Microsoft.Dynamics.CRM.lookuplogicalname";
const ODATA_CONTEXT: &str = "@odata.context";
const DELETED_ENTITY: &str = "$deletedEntity";
const DELETED_REASON: &str = "deleted";

const METADATA_SELECT: &str = "LogicalName,EntitySetName,PrimaryIdAttribute,ChangeTrackingEnabled";

/// HTTP plumbing shared by the client and its change sessions.
#[derive(Debug, Clone)]
struct Connection {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl Connection {
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
        prefer: Option<&str>,
    ) -> Result<T, SourceError> {
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(prefer) = prefer {
            request = request.header("Prefer", prefer);
        }
        if let Some(token) = &self.access_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(response.json().await?)
    }
}

/// Extracts `error.message` from an OData error body, falling back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

pub struct DataverseClient {
    connection: Connection,
    watermarks: WatermarkStore,
    page_size: u32,
    metadata: RwLock<HashMap<String, Arc<EntityMetadata>>>,
}

impl DataverseClient {
    /// Creates a client for the Web API rooted at `base_url`
    /// (e.g. `https://org.crm.dynamics.com/api/data/v9.2`).
    pub fn new(
        base_url: &str,
        access_token: Option<String>,
        watermarks: WatermarkStore,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            connection: Connection {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                access_token,
            },
            watermarks,
            page_size: DEFAULT_PAGE_SIZE,
            metadata: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    /// Metadata for an entity type, fetched once and cached.
    async fn entity_metadata(&self, entity_type: &str) -> Result<Arc<EntityMetadata>, SourceError> {
        if let Some(cached) = self.metadata.read().await.get(entity_type) {
            return Ok(Arc::clone(cached));
        }

        // The name is interpolated into the URL.
        if crate::schema::validate_identifier(entity_type).is_err() {
            return Err(SourceError::UnknownEntity(entity_type.to_string()));
        }

        let url = format!(
            "{}/EntityDefinitions(LogicalName='{}')",
            self.connection.base_url, entity_type
        );
        let query = vec![
            ("$select".to_string(), METADATA_SELECT.to_string()),
            ("$expand".to_string(), "Attributes".to_string()),
        ];
        let metadata: EntityMetadata = match self.connection.get_json(&url, &query, None).await {
            Err(SourceError::Api { status: 404, .. }) => {
                return Err(SourceError::UnknownEntity(entity_type.to_string()))
            }
            other => other?,
        };
        debug!(
            entity = entity_type,
            attributes = metadata.attributes.len(),
            "Fetched entity metadata"
        );

        let metadata = Arc::new(metadata);
        self.metadata
            .write()
            .await
            .insert(entity_type.to_string(), Arc::clone(&metadata));
        Ok(metadata)
    }
}

#[async_trait]
impl MetadataProvider for DataverseClient {
    async fn get_entity_metadata(&self, entity_type: &str) -> Result<EntityMetadata, SourceError> {
        Ok(self.entity_metadata(entity_type).await?.as_ref().clone())
    }
}

#[async_trait]
impl ChangeFeed for DataverseClient {
    async fn get_changes(
        &self,
        request: ChangeRequest,
    ) -> Result<Box<dyn ChangePages>, SourceError> {
        let metadata = self.entity_metadata(&request.entity_type).await?;
        let entity_set = metadata.entity_set_name.clone().ok_or_else(|| {
            SourceError::parse(format!(
                "entity '{}' has no entity set name",
                request.entity_type
            ))
        })?;

        let columns = request.columns.unwrap_or_else(|| default_columns(&metadata));
        let page_size = request.page_size.unwrap_or(self.page_size).max(1);
        let prefer = format!(
            "odata.track-changes,odata.maxpagesize={},odata.include-annotations=\"{}\"",
            page_size, LOOKUP_LOGICAL_NAME
        );

        let since = match request.since {
            Some(watermark) => Some(watermark),
            None => self
                .watermarks
                .load(&request.scope_key, &request.entity_type)?,
        };
        let first = match since {
            Some(delta) => (delta.as_str().to_string(), Vec::new()),
            None => (
                format!(
                    "{}/{}",
                    self.connection.base_url,
                    urlencoding::encode(&entity_set)
                ),
                vec![("$select".to_string(), select_clause(&metadata, &columns))],
            ),
        };

        Ok(Box::new(DataversePages {
            connection: self.connection.clone(),
            watermarks: self.watermarks.clone(),
            scope_key: request.scope_key,
            metadata,
            columns,
            prefer,
            next: Some(first),
            pending_delta: None,
        }))
    }
}

struct DataversePages {
    connection: Connection,
    watermarks: WatermarkStore,
    scope_key: String,
    metadata: Arc<EntityMetadata>,
    columns: Vec<String>,
    prefer: String,
    next: Option<(String, Vec<(String, String)>)>,
    /// Delta link of the last page, saved when that page is acknowledged.
    pending_delta: Option<Watermark>,
}

impl DataversePages {
    fn save_delta(&self, delta: &Watermark) -> Result<(), SourceError> {
        self.watermarks
            .save(&self.scope_key, &self.metadata.logical_name, delta)?;
        debug!(
            scope = %self.scope_key,
            entity = %self.metadata.logical_name,
            "Advanced change tracking watermark"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ChangePage {
    #[serde(default)]
    value: Vec<Map<String, Value>>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[async_trait]
impl ChangePages for DataversePages {
    async fn next_page(&mut self) -> Result<Option<ChangeBatch>, SourceError> {
        if let Some(delta) = self.pending_delta.take() {
            self.save_delta(&delta)?;
        }

        while let Some((url, query)) = self.next.take() {
            let page: ChangePage = self
                .connection
                .get_json(&url, &query, Some(self.prefer.as_str()))
                .await?;
            if let Some(next) = page.next_link {
                self.next = Some((next, Vec::new()));
            }
            let delta = page.delta_link.map(Watermark::new);

            let items = page
                .value
                .iter()
                .map(|row| decode_item(&self.metadata, &self.columns, row))
                .collect::<Result<Vec<_>, _>>()?;

            if items.is_empty() {
                // Nothing to hand out, so nothing to wait for.
                if let Some(delta) = delta {
                    self.save_delta(&delta)?;
                }
                continue;
            }

            self.pending_delta = delta;
            return Ok(Some(ChangeBatch::new(
                self.metadata.logical_name.clone(),
                items,
            )));
        }

        Ok(None)
    }
}

fn is_lookup(attribute_type: AttributeType) -> bool {
    matches!(
        attribute_type,
        AttributeType::Lookup | AttributeType::Customer | AttributeType::Owner
    )
}

/// Whether the Web API can return this attribute in a `$select`.
fn is_selectable(attribute_type: AttributeType) -> bool {
    !matches!(
        attribute_type,
        AttributeType::PartyList
            | AttributeType::CalendarRules
            | AttributeType::ManagedProperty
            | AttributeType::Virtual
            | AttributeType::Unknown
    )
}

fn lookup_property(name: &str) -> String {
    format!("_{}_value", name)
}

/// Primary id followed by every stored attribute.
fn default_columns(metadata: &EntityMetadata) -> Vec<String> {
    std::iter::once(metadata.primary_id_attribute.clone())
        .chain(
            metadata
                .attributes
                .iter()
                .filter(|a| a.logical_name != metadata.primary_id_attribute && !a.is_computed())
                .map(|a| a.logical_name.clone()),
        )
        .collect()
}

fn select_clause(metadata: &EntityMetadata, columns: &[String]) -> String {
    let mut select = vec![metadata.primary_id_attribute.clone()];
    for column in columns {
        if *column == metadata.primary_id_attribute {
            continue;
        }
        match metadata.attribute(column) {
            Some(a) if is_lookup(a.attribute_type) => select.push(lookup_property(column)),
            Some(a) if is_selectable(a.attribute_type) => select.push(column.clone()),
            _ => {}
        }
    }
    select.join(",")
}

fn decode_item(
    metadata: &EntityMetadata,
    columns: &[String],
    row: &Map<String, Value>,
) -> Result<ChangeItem, SourceError> {
    let context = row.get(ODATA_CONTEXT).and_then(Value::as_str).unwrap_or("");
    if context.contains(DELETED_ENTITY) {
        let id = parse_uuid("id", row.get("id"))?;
        return Ok(match row.get("reason").and_then(Value::as_str) {
            Some(DELETED_REASON) => ChangeItem::RemovedOrDeleted(id),
            other => ChangeItem::Unrecognized {
                kind: other.unwrap_or("unknown").to_string(),
            },
        });
    }
    if context.contains("$deletedLink") || context.contains("$link") {
        return Ok(ChangeItem::Unrecognized {
            kind: "link".to_string(),
        });
    }

    let id = parse_uuid(
        &metadata.primary_id_attribute,
        row.get(&metadata.primary_id_attribute),
    )?;
    let mut entity = Entity::new(metadata.logical_name.clone(), id);
    for column in columns {
        if *column == metadata.primary_id_attribute {
            continue;
        }
        let Some(attribute) = metadata.attribute(column) else {
            continue;
        };
        if let Some(value) = decode_attribute(attribute, row)? {
            entity.attributes.insert(column.clone(), value);
        }
    }
    Ok(ChangeItem::NewOrUpdated(entity))
}

fn parse_uuid(name: &str, value: Option<&Value>) -> Result<Uuid, SourceError> {
    value
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| SourceError::parse(format!("'{}' is not a guid", name)))
}

fn mismatch(name: &str, value: &Value) -> SourceError {
    SourceError::parse(format!("attribute '{}' has unexpected value {}", name, value))
}

/// Decodes one attribute; `None` when the row does not carry it.
/// Parses an RFC 3339 timestamp, or a `yyyy-MM-dd` date (DateOnly behavior) as midnight UTC.
fn as_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

fn decode_attribute(
    attribute: &AttributeMetadata,
    row: &Map<String, Value>,
) -> Result<Option<AttributeValue>, SourceError> {
    let name = attribute.logical_name.as_str();

    if is_lookup(attribute.attribute_type) {
        let property = lookup_property(name);
        return match row.get(&property) {
            None => Ok(None),
            Some(Value::Null) => Ok(Some(AttributeValue::Null)),
            Some(value) => {
                let id = parse_uuid(&property, Some(value))?;
                let annotation = format!("{}@{}", property, LOOKUP_LOGICAL_NAME);
                let target = row
                    .get(&annotation)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SourceError::parse(format!("lookup '{}' has no target type", name))
                    })?;
                Ok(Some(AttributeValue::EntityReference(EntityReference::new(
                    target, id,
                ))))
            }
        };
    }

    if !is_selectable(attribute.attribute_type) {
        return Ok(None);
    }
    let value = match row.get(name) {
        None => return Ok(None),
        Some(Value::Null) => return Ok(Some(AttributeValue::Null)),
        Some(value) => value,
    };

    let decoded = match attribute.attribute_type {
        AttributeType::Boolean => value.as_bool().map(AttributeValue::Boolean),
        AttributeType::Integer => as_i32(value).map(AttributeValue::Integer),
        AttributeType::BigInt => value.as_i64().map(AttributeValue::BigInt),
        AttributeType::Double => value.as_f64().map(AttributeValue::Double),
        AttributeType::Decimal => as_decimal(value).map(AttributeValue::Decimal),
        AttributeType::Money => as_decimal(value).map(|amount| AttributeValue::Money(Money { amount })),
        AttributeType::Picklist | AttributeType::State | AttributeType::Status => {
            as_i32(value).map(|code| AttributeValue::OptionSet(OptionSetValue { value: code }))
        }
        AttributeType::DateTime => value
            .as_str()
            .and_then(as_datetime)
            .map(AttributeValue::DateTime),
        AttributeType::Uniqueidentifier => value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(AttributeValue::Guid),
        AttributeType::String | AttributeType::Memo | AttributeType::EntityName => value
            .as_str()
            .map(|s| AttributeValue::String(s.to_string())),
        _ => return Ok(None),
    };

    decoded.map(Some).ok_or_else(|| mismatch(name, value))
}

fn as_i32(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|v| i32::try_from(v).ok())
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const API: &str = "/api/data/v9.2";

    fn contact_metadata_json() -> Value {
        json!({
            "@odata.context": "https://org.example/api/data/v9.2/$metadata#EntityDefinitions",
            "LogicalName": "contact",
            "EntitySetName": "contacts",
            "PrimaryIdAttribute": "contactid",
            "ChangeTrackingEnabled": true,
            "Attributes": [
                {"LogicalName": "contactid", "AttributeType": "Uniqueidentifier", "AttributeOf": null},
                {"@odata.type": "#Microsoft.Dynamics.CRM.StringAttributeMetadata",
                 "LogicalName": "fullname", "AttributeType": "String", "MaxLength": 160, "AttributeOf": null},
                {"LogicalName": "parentcustomerid", "AttributeType": "Customer", "AttributeOf": null},
                {"LogicalName": "parentcustomeridname", "AttributeType": "String", "MaxLength": 100,
                 "AttributeOf": "parentcustomerid"},
                {"LogicalName": "birthdate", "AttributeType": "DateTime", "AttributeOf": null},
                {"LogicalName": "creditlimit", "AttributeType": "Money", "AttributeOf": null},
                {"LogicalName": "statecode", "AttributeType": "State", "AttributeOf": null},
                {"LogicalName": "donotemail", "AttributeType": "Boolean", "AttributeOf": null}
            ]
        })
    }

    async fn setup() -> (MockServer, DataverseClient, TempDir) {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let client = DataverseClient::new(
            &format!("{}{}", server.uri(), API),
            Some("secret-token".to_string()),
            WatermarkStore::new(temp_dir.path()),
        )
        .unwrap()
        .with_page_size(2);

        Mock::given(method("GET"))
            .and(path_regex(r"EntityDefinitions\(LogicalName='contact'\)$"))
            .and(query_param("$expand", "Attributes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(contact_metadata_json()))
            .mount(&server)
            .await;

        (server, client, temp_dir)
    }

    #[tokio::test]
    async fn test_metadata_is_fetched_once() {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let client = DataverseClient::new(
            &format!("{}{}/", server.uri(), API),
            None,
            WatermarkStore::new(temp_dir.path()),
        )
        .unwrap();
        Mock::given(method("GET"))
            .and(path_regex(r"EntityDefinitions\(LogicalName='contact'\)$"))
            .and(query_param("$select", METADATA_SELECT))
            .respond_with(ResponseTemplate::new(200).set_body_json(contact_metadata_json()))
            .expect(1)
            .mount(&server)
            .await;

        let first = client.get_entity_metadata("contact").await.unwrap();
        let second = client.get_entity_metadata("contact").await.unwrap();

        assert_eq!(first, second);
        assert!(first.change_tracking_enabled);
        assert_eq!(first.entity_set_name.as_deref(), Some("contacts"));
        assert_eq!(first.attribute("fullname").unwrap().max_length, Some(160));
        assert!(first.attribute("parentcustomeridname").unwrap().is_computed());
    }

    #[tokio::test]
    async fn test_unknown_entity() {
        let (server, client, _dir) = setup().await;
        Mock::given(method("GET"))
            .and(path_regex(r"EntityDefinitions\(LogicalName='lead'\)$"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "0x80060888", "message": "Resource not found"}
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            client.get_entity_metadata("lead").await,
            Err(SourceError::UnknownEntity(name)) if name == "lead"
        ));
        assert!(matches!(
            client.get_entity_metadata("x') or ('1").await,
            Err(SourceError::UnknownEntity(_))
        ));
    }

    #[tokio::test]
    async fn test_change_session_decodes_pages_and_saves_delta_on_ack() {
        let (server, client, _dir) = setup().await;
        let first_id = Uuid::new_v4();
        let account = Uuid::new_v4();
        let removed = Uuid::new_v4();
        let next_link = format!("{}{}/contacts?$skiptoken=page2", server.uri(), API);
        let delta_link = format!("{}{}/contacts?$deltatoken=919042", server.uri(), API);

        Mock::given(method("GET"))
            .and(path(format!("{}/contacts", API)))
            .and(query_param(
                "$select",
                "contactid,fullname,_parentcustomerid_value,birthdate,creditlimit,statecode,donotemail",
            ))
            .and(header("Authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@odata.context": "https://org.example/api/data/v9.2/$metadata#contacts",
                "value": [
                    {
                        "contactid": first_id.to_string(),
                        "fullname": "Amy Jones",
                        "_parentcustomerid_value": account.to_string(),
                        "_parentcustomerid_value@Microsoft.Dynamics.CRM.lookuplogicalname": "account",
                        "birthdate": "1990-05-17T00:00:00Z",
                        "creditlimit": 1500.25,
                        "statecode": 0,
                        "donotemail": false
                    },
                    {
                        "contactid": Uuid::new_v4().to_string(),
                        "fullname": null,
                        "_parentcustomerid_value": null,
                        "birthdate": null,
                        "creditlimit": null,
                        "statecode": 1,
                        "donotemail": true
                    }
                ],
                "@odata.nextLink": next_link
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("{}/contacts", API)))
            .and(query_param("$skiptoken", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {
                        "@odata.context": "https://org.example/api/data/v9.2/$metadata#contacts/$deletedEntity",
                        "id": removed.to_string(),
                        "reason": "deleted"
                    }
                ],
                "@odata.deltaLink": delta_link
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut pages = client
            .get_changes(ChangeRequest::new("default", "contact"))
            .await
            .unwrap();

        let first = pages.next_page().await.unwrap().unwrap();
        assert_eq!(first.entity_type, "contact");
        assert_eq!(first.items.len(), 2);
        match &first.items[0] {
            ChangeItem::NewOrUpdated(entity) => {
                assert_eq!(entity.id, first_id);
                assert_eq!(
                    entity.get("fullname"),
                    Some(&AttributeValue::String("Amy Jones".to_string()))
                );
                assert_eq!(
                    entity.get("parentcustomerid"),
                    Some(&AttributeValue::EntityReference(EntityReference::new(
                        "account", account
                    )))
                );
                assert_eq!(
                    entity.get("creditlimit"),
                    Some(&AttributeValue::Money(Money {
                        amount: Decimal::new(150025, 2)
                    }))
                );
                assert_eq!(
                    entity.get("statecode"),
                    Some(&AttributeValue::OptionSet(OptionSetValue { value: 0 }))
                );
                assert_eq!(entity.get("donotemail"), Some(&AttributeValue::Boolean(false)));
                assert!(matches!(
                    entity.get("birthdate"),
                    Some(AttributeValue::DateTime(_))
                ));
            }
            other => panic!("expected an upsert, got {:?}", other),
        }
        match &first.items[1] {
            ChangeItem::NewOrUpdated(entity) => {
                assert_eq!(entity.get("fullname"), Some(&AttributeValue::Null));
                assert_eq!(entity.get("parentcustomerid"), Some(&AttributeValue::Null));
            }
            other => panic!("expected an upsert, got {:?}", other),
        }

        let second = pages.next_page().await.unwrap().unwrap();
        assert_eq!(second.items, vec![ChangeItem::RemovedOrDeleted(removed)]);
        // The last page is not acknowledged yet.
        assert!(client
            .watermarks()
            .load("default", "contact")
            .unwrap()
            .is_none());

        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(
            client.watermarks().load("default", "contact").unwrap(),
            Some(Watermark::new(delta_link))
        );

        let requests = server.received_requests().await.unwrap();
        let change_request = requests
            .iter()
            .find(|r| r.url.path().ends_with("/contacts"))
            .unwrap();
        assert_eq!(
            change_request.headers.get("prefer").unwrap().to_str().unwrap(),
            "odata.track-changes,odata.maxpagesize=2,\
             odata.include-annotations=\"Microsoft.Dynamics.CRM.lookuplogicalname\""
        );
    }

    #[tokio::test]
    async fn test_next_session_resumes_from_delta_link() {
        let (server, client, _dir) = setup().await;
        let delta_link = format!("{}{}/contacts?$deltatoken=100", server.uri(), API);
        client
            .watermarks()
            .save("default", "contact", &Watermark::new(delta_link))
            .unwrap();

        Mock::given(method("GET"))
            .and(path(format!("{}/contacts", API)))
            .and(query_param("$deltatoken", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [],
                "@odata.deltaLink": format!("{}{}/contacts?$deltatoken=101", server.uri(), API)
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut pages = client
            .get_changes(ChangeRequest::new("default", "contact"))
            .await
            .unwrap();
        assert!(pages.next_page().await.unwrap().is_none());

        // An empty final page moves the watermark immediately.
        let stored = client.watermarks().load("default", "contact").unwrap().unwrap();
        assert!(stored.as_str().ends_with("$deltatoken=101"));
    }

    #[test]
    fn test_unknown_removal_reason_is_unrecognized() {
        let metadata: EntityMetadata = serde_json::from_value(contact_metadata_json()).unwrap();
        let id = Uuid::new_v4();
        let row = json!({
            "@odata.context": "https://org.example/api/data/v9.2/$metadata#contacts/$deletedEntity",
            "id": id.to_string(),
            "reason": "changed"
        });
        let item = decode_item(
            &metadata,
            &default_columns(&metadata),
            row.as_object().unwrap(),
        )
        .unwrap();
        assert_eq!(
            item,
            ChangeItem::Unrecognized {
                kind: "changed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_message() {
        let (server, client, _dir) = setup().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/contacts", API)))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": "0x80044352", "message": "Change tracking is not enabled"}
            })))
            .mount(&server)
            .await;

        let mut pages = client
            .get_changes(ChangeRequest::new("default", "contact"))
            .await
            .unwrap();
        match pages.next_page().await {
            Err(SourceError::Api { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Change tracking is not enabled");
            }
            other => panic!("expected Api error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let attribute = AttributeMetadata::new("numberofchildren", AttributeType::Integer);
        let row = json!({"numberofchildren": "three"});
        let err = decode_attribute(&attribute, row.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));
    }

    #[test]
    fn test_decode_date_only_as_midnight_utc() {
        use chrono::TimeZone;

        let attribute = AttributeMetadata::new("birthdate", AttributeType::DateTime);
        let row = json!({"birthdate": "1990-05-17"});
        let value = decode_attribute(&attribute, row.as_object().unwrap()).unwrap();
        assert_eq!(
            value,
            Some(AttributeValue::DateTime(
                Utc.with_ymd_and_hms(1990, 5, 17, 0, 0, 0).unwrap()
            ))
        );

        let row = json!({"birthdate": "2024-03-01T09:30:00Z"});
        let value = decode_attribute(&attribute, row.as_object().unwrap()).unwrap();
        assert_eq!(
            value,
            Some(AttributeValue::DateTime(
                Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
            ))
        );

        let row = json!({"birthdate": "17/05/1990"});
        assert!(decode_attribute(&attribute, row.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_decimal_from_json_number() {
        assert_eq!(as_decimal(&json!(12.5)), Some(Decimal::new(125, 1)));
        assert_eq!(as_decimal(&json!(7)), Some(Decimal::new(7, 0)));
        assert_eq!(as_decimal(&json!("0.10")), Some(Decimal::new(10, 2)));
        assert_eq!(as_decimal(&json!(true)), None);
    }
}
