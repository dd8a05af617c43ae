use serde_json::Value;

use super::Message;

/// Envelope key holding the order identifier.
pub const ORDER_ID_KEY: &str = "order_id";

/// Typed accessors for order events.
///
/// # Example
///
/// ```
/// use relaymq_core::{Event, Message, OrderMessage, RequestContext};
///
/// let ctx = RequestContext::new().with_request_id("req-1");
/// let message = Message::new(Event::ORDER_CREATED).with_order_id(42).encode(&ctx);
///
/// assert_eq!(message.order_id(), Some(42));
/// assert_eq!(message.request_id(), Some("req-1"));
/// ```
pub trait OrderMessage {
    /// Attaches the order this event concerns.
    #[must_use]
    fn with_order_id(self, order_id: i64) -> Self;

    /// Order identifier, if the envelope carries a valid one.
    fn order_id(&self) -> Option<i64>;
}

impl OrderMessage for Message {
    fn with_order_id(mut self, order_id: i64) -> Self {
        self.insert_raw(ORDER_ID_KEY, Value::from(order_id));
        self
    }

    fn order_id(&self) -> Option<i64> {
        self.fields().get(ORDER_ID_KEY).and_then(Value::as_i64)
    }
}
