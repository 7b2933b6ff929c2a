//! Wire envelope for events stored on a log backend.
//!
//! A record is a payload plus a header block, both JSON:
//!
//! - the payload holds only the `value` of a `PropertyChanged` event (`{}` for
//!   the other kinds);
//! - the headers carry `type`, `resourceTypeName`, `entityId`, `userId` and
//!   `timestamp`, plus `propertyName` and `valueTypeName` for `PropertyChanged`.
//!
//! Decoding reconstructs the event kind from the `type` header alone, so the
//! payload serializer never needs to know about event kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{EnvelopeError, EventStoreResult};
use crate::event::{Event, EventKind, PropertyChange};
use crate::types::{PropertyPath, ResourceTypeName, Timestamp, UserId};

/// `type` header value for `Created` events.
pub const CREATED_EVENT_TYPE: &str = "entitystore.CreatedEvent";
/// `type` header value for `PropertyChanged` events.
pub const PROPERTY_CHANGED_EVENT_TYPE: &str = "entitystore.PropertyChangedEvent";
/// `type` header value for `Deleted` events.
pub const DELETED_EVENT_TYPE: &str = "entitystore.DeletedEvent";

/// An encoded event as stored by a log backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Unique id of the record.
    pub event_id: Uuid,
    /// The `type` header, duplicated for backends that index by event type.
    pub event_type: String,
    /// JSON payload.
    pub data: Vec<u8>,
    /// JSON header block.
    pub metadata: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Headers {
    #[serde(rename = "type")]
    event_type: String,
    resource_type_name: ResourceTypeName,
    entity_id: i32,
    user_id: UserId,
    timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    property_name: Option<PropertyPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value_type_name: Option<String>,
}

/// Encodes `event` into a record with a fresh UUIDv7 id.
pub fn encode(event: &Event) -> EventStoreResult<RawRecord> {
    let (event_type, payload, property_name, value_type_name) = match &event.kind {
        EventKind::Created => (CREATED_EVENT_TYPE, Value::Object(serde_json::Map::new()), None, None),
        EventKind::Deleted => (DELETED_EVENT_TYPE, Value::Object(serde_json::Map::new()), None, None),
        EventKind::PropertyChanged(change) => (
            PROPERTY_CHANGED_EVENT_TYPE,
            change.value.clone(),
            Some(change.property_path.clone()),
            Some(change.value_type_name.clone()),
        ),
    };

    let headers = Headers {
        event_type: event_type.to_string(),
        resource_type_name: event.resource_type_name.clone(),
        entity_id: event.entity_id,
        user_id: event.user_id.clone(),
        timestamp: event.timestamp,
        property_name,
        value_type_name,
    };

    Ok(RawRecord {
        event_id: Uuid::now_v7(),
        event_type: event_type.to_string(),
        data: serde_json::to_vec(&payload)?,
        metadata: serde_json::to_vec(&headers)?,
    })
}

/// Decodes a record back into an event.
pub fn decode(record: &RawRecord) -> Result<Event, EnvelopeError> {
    let headers: Headers = serde_json::from_slice(&record.metadata)
        .map_err(|error| EnvelopeError::MalformedHeaders(error.to_string()))?;

    let kind = match headers.event_type.as_str() {
        CREATED_EVENT_TYPE => EventKind::Created,
        DELETED_EVENT_TYPE => EventKind::Deleted,
        PROPERTY_CHANGED_EVENT_TYPE => {
            let property_path = headers
                .property_name
                .ok_or(EnvelopeError::MissingHeader("propertyName"))?;
            let value_type_name = headers
                .value_type_name
                .ok_or(EnvelopeError::MissingHeader("valueTypeName"))?;
            let value = serde_json::from_slice(&record.data)
                .map_err(|error| EnvelopeError::MalformedPayload(error.to_string()))?;
            EventKind::PropertyChanged(PropertyChange {
                property_path,
                value,
                value_type_name,
            })
        }
        other => return Err(EnvelopeError::UnknownEventType(other.to_string())),
    };

    Ok(Event {
        resource_type_name: headers.resource_type_name,
        entity_id: headers.entity_id,
        user_id: headers.user_id,
        timestamp: headers.timestamp,
        kind,
    })
}
