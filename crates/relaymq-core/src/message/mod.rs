//! Message envelope published to the outbox.
//!
//! An envelope names its [`Event`], optionally carries the correlation id of
//! the request that produced it, and holds any number of event-specific
//! fields. The wire form is a flat JSON object:
//!
//! ```json
//! {"event": "order_created", "request_id": "req-1", "order_id": 42}
//! ```
//!
//! `request_id` is omitted when absent. Event-specific fields are added
//! through typed extension traits such as [`OrderMessage`].

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    context::{RequestContext, REQUEST_ID_KEY},
    error::{CoreError, Result},
    event::Event,
};

mod order;

pub use order::{OrderMessage, ORDER_ID_KEY};

const EVENT_KEY: &str = "event";

/// Serializable payload stored in every queue row.
///
/// The same envelope is written once per subscribed consumer when an event is
/// published; consumers receive a decoded copy on each delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Message {
    /// Creates an envelope for `event` with no fields.
    pub fn new(event: impl Into<Event>) -> Self {
        Self { event: event.into(), request_id: None, fields: Map::new() }
    }

    /// Event this envelope announces.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Correlation id stamped at encode time.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Stamps the correlation id of the producing context into the envelope.
    ///
    /// A context without an id leaves any id already present untouched.
    #[must_use]
    pub fn encode(mut self, ctx: &RequestContext) -> Self {
        if let Some(request_id) = ctx.request_id() {
            self.request_id = Some(request_id.to_owned());
        }
        self
    }

    /// Adds an event-specific field.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when `key` collides with an envelope
    /// key, or `CoreError::Serialization` when `value` cannot be represented
    /// as JSON.
    pub fn with_field<T: Serialize>(mut self, key: &str, value: T) -> Result<Self> {
        if key == EVENT_KEY || key == REQUEST_ID_KEY {
            return Err(CoreError::InvalidInput(format!("'{key}' is a reserved envelope key")));
        }
        self.fields.insert(key.to_owned(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Reads an event-specific field, `Ok(None)` when it is absent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` when the field exists but does not
    /// decode as `T`.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.fields
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(CoreError::from)
    }

    /// All event-specific fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serializes the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` for malformed input or a missing
    /// `event` key.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub(crate) fn insert_raw(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_owned(), value);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_id_omitted_when_absent() {
        let message = Message::new(Event::ORDER_CREATED);
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(value, json!({ "event": "order_created" }));
    }

    #[test]
    fn encode_stamps_request_id() {
        let ctx = RequestContext::new().with_request_id("req-7");
        let message = Message::new(Event::ORDER_CREATED).encode(&ctx);

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "order_created", "request_id": "req-7" }));
    }

    #[test]
    fn encode_without_id_keeps_existing_stamp() {
        let stamped = Message::new(Event::ORDER_CREATED)
            .encode(&RequestContext::new().with_request_id("req-1"));
        let restamped = stamped.encode(&RequestContext::new());

        assert_eq!(restamped.request_id(), Some("req-1"));
    }

    #[test]
    fn unknown_keys_land_in_fields() {
        let message =
            Message::from_json(r#"{"event":"invoice_paid","invoice":"inv-9","amount":1200}"#)
                .unwrap();

        assert_eq!(message.event(), &Event::new("invoice_paid"));
        assert_eq!(message.request_id(), None);
        assert_eq!(message.field::<String>("invoice").unwrap().as_deref(), Some("inv-9"));
        assert_eq!(message.field::<u32>("amount").unwrap(), Some(1200));
        assert_eq!(message.field::<u32>("missing").unwrap(), None);
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let err = Message::new(Event::ORDER_CREATED).with_field("event", "other").unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        let err =
            Message::new(Event::ORDER_CREATED).with_field(REQUEST_ID_KEY, "spoofed").unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn missing_event_fails_to_decode() {
        let err = Message::from_json(r#"{"order_id":1}"#).unwrap_err();
        assert!(matches!(err, CoreError::Serialization(_)));
    }

    #[test]
    fn mistyped_field_reports_serialization_error() {
        let message = Message::new(Event::ORDER_CREATED).with_field("count", "three").unwrap();
        assert!(message.field::<i64>("count").is_err());
    }
}
