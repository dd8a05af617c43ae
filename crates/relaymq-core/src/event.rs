//! Event names that producers publish and consumers subscribe to.

use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

/// Named event kind.
///
/// Two events are equal iff their names are equal. Well-known events are
/// exposed as associated constants; any other name can be built at runtime
/// with [`Event::new`].
///
/// # Example
///
/// ```
/// use relaymq_core::Event;
///
/// assert_eq!(Event::ORDER_CREATED, Event::new("order_created"));
/// assert_eq!(Event::ORDER_CREATED.to_string(), "order_created");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Cow<'static, str>);

impl Event {
    /// An order was created and is awaiting payment.
    pub const ORDER_CREATED: Event = Event::from_static("order_created");

    /// Creates an event from a name known at compile time.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Creates an event from a runtime name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The event name as written into message envelopes.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Event {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn static_and_owned_names_compare_equal() {
        let owned = Event::new(String::from("order_created"));
        assert_eq!(owned, Event::ORDER_CREATED);

        let mut set = HashSet::new();
        set.insert(Event::ORDER_CREATED);
        assert!(set.contains(&owned));
    }

    #[test]
    fn serializes_as_bare_string() {
        let json = serde_json::to_string(&Event::ORDER_CREATED).unwrap();
        assert_eq!(json, "\"order_created\"");

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Event::ORDER_CREATED);
    }
}
