//! Startup-time registry of consumers.
//!
//! The registry is assembled once with a [`RegistryBuilder`] while the
//! process boots and is immutable afterwards. It is shared by the publisher
//! and the delivery engine through an `Arc`.

use std::{collections::HashMap, sync::Arc};

use relaymq_core::Event;
use tracing::debug;

use crate::{
    consumer::Consumer,
    error::{DeliveryError, Result},
};

/// Collects consumers during startup.
///
/// Registering two consumers under one name is a fatal configuration error;
/// bootstrap code propagates it and the process does not start.
#[derive(Default)]
pub struct RegistryBuilder {
    consumers: Vec<Arc<dyn Consumer>>,
}

impl RegistryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DuplicateConsumer` if a consumer with the same
    /// name is already registered, or `DeliveryError::ConfigurationError` for
    /// an empty name.
    pub fn register<C: Consumer>(&mut self, consumer: C) -> Result<&mut Self> {
        self.register_arc(Arc::new(consumer))
    }

    /// Adds a shared consumer.
    ///
    /// # Errors
    ///
    /// Same as [`RegistryBuilder::register`].
    pub fn register_arc(&mut self, consumer: Arc<dyn Consumer>) -> Result<&mut Self> {
        let name = consumer.name();
        if name.trim().is_empty() {
            return Err(DeliveryError::configuration("consumer name must not be empty"));
        }
        if self.consumers.iter().any(|existing| existing.name() == name) {
            return Err(DeliveryError::duplicate_consumer(name));
        }

        debug!(consumer = name, event = %consumer.event(), "consumer registered");
        self.consumers.push(consumer);
        Ok(self)
    }

    /// Freezes the registry.
    pub fn build(self) -> ConsumerRegistry {
        let mut by_name = HashMap::with_capacity(self.consumers.len());
        let mut by_event: HashMap<Event, Vec<Arc<dyn Consumer>>> = HashMap::new();

        for consumer in self.consumers {
            by_event.entry(consumer.event()).or_default().push(consumer.clone());
            by_name.insert(consumer.name().to_owned(), consumer);
        }

        ConsumerRegistry { by_name, by_event }
    }
}

/// Read-only mapping of consumer names and event subscriptions.
pub struct ConsumerRegistry {
    by_name: HashMap<String, Arc<dyn Consumer>>,
    by_event: HashMap<Event, Vec<Arc<dyn Consumer>>>,
}

impl ConsumerRegistry {
    /// Starts a new registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Looks a consumer up by the name stored in a queue row.
    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn Consumer>> {
        self.by_name.get(name)
    }

    /// Consumers subscribed to `event`, in registration order.
    pub fn subscribers(&self, event: &Event) -> &[Arc<dyn Consumer>] {
        self.by_event.get(event).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of registered consumers.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no consumer is registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Registered consumer names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry").field("consumers", &self.names()).finish()
    }
}
