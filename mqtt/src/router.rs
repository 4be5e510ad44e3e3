//! Inbound message routing and session callbacks.
//!
//! A [`Router`] holds per-subscription handlers keyed by topic filter.
//! Messages no route claims fall through to the default `on_message`
//! callback of [`Callbacks`].

use crate::error::{Error, Result};
use crate::topic;
use crate::types::QoS;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// MQTT message received from a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// QoS level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Packet ID (for QoS > 0).
    pub packet_id: Option<u16>,
}

impl Message {
    /// Create a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            packet_id: None,
        }
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<&rumqttc::Publish> for Message {
    fn from(publish: &rumqttc::Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: QoS::from(publish.qos),
            retain: publish.retain,
            packet_id: (publish.pkid != 0).then_some(publish.pkid),
        }
    }
}

/// Handler trait for processing MQTT messages.
///
/// Handlers run on the network loop and must return quickly.
pub trait Handler: Send + Sync {
    /// Handle an incoming MQTT message.
    fn handle_message(&self, msg: &Message) -> Result<()>;
}

/// Handler function type.
pub type HandlerFunc = dyn Fn(&Message) -> Result<()> + Send + Sync;

struct FnHandler {
    f: Box<HandlerFunc>,
}

impl Handler for FnHandler {
    fn handle_message(&self, msg: &Message) -> Result<()> {
        (self.f)(msg)
    }
}

struct Route {
    filter: String,
    handler: Arc<dyn Handler>,
}

/// Per-subscription message router.
#[derive(Default)]
pub struct Router {
    routes: RwLock<Vec<Route>>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the given filter.
    pub fn handle(&self, filter: &str, handler: Arc<dyn Handler>) -> Result<()> {
        topic::validate_filter(filter)?;
        self.routes.write().push(Route {
            filter: filter.to_string(),
            handler,
        });
        Ok(())
    }

    /// Register a handler function for the given filter.
    ///
    /// # Example
    ///
    /// ```
    /// use pubsub_mqtt::Router;
    ///
    /// let router = Router::new();
    /// router.handle_func("device/+/state", |msg| {
    ///     println!("Received: {:?}", msg.payload);
    ///     Ok(())
    /// }).unwrap();
    /// ```
    pub fn handle_func<F>(&self, filter: &str, f: F) -> Result<()>
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        self.handle(filter, Arc::new(FnHandler { f: Box::new(f) }))
    }

    /// Remove every handler registered for exactly this filter.
    pub fn remove(&self, filter: &str) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.filter != filter);
        before - routes.len()
    }

    /// Whether any handler is registered for a filter matching `topic`.
    pub fn has_handlers(&self, topic: &str) -> bool {
        self.routes
            .read()
            .iter()
            .any(|r| topic::matches(&r.filter, topic))
    }

    /// Route a message to every matching handler.
    ///
    /// Returns `Err(NoHandlerFound)` when no route claims the message.
    pub fn route(&self, msg: &Message) -> Result<()> {
        let handlers: Vec<Arc<dyn Handler>> = self
            .routes
            .read()
            .iter()
            .filter(|r| topic::matches(&r.filter, &msg.topic))
            .map(|r| r.handler.clone())
            .collect();

        if handlers.is_empty() {
            return Err(Error::NoHandlerFound(msg.topic.clone()));
        }

        for handler in handlers {
            handler.handle_message(msg)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let filters: Vec<String> = self.routes.read().iter().map(|r| r.filter.clone()).collect();
        f.debug_struct("Router").field("filters", &filters).finish()
    }
}

type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;
type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
type ConnectionLostCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Session event callbacks, injected when the session starts.
#[derive(Clone, Default)]
pub struct Callbacks {
    on_message: Option<MessageCallback>,
    on_connect: Option<ConnectCallback>,
    on_connection_lost: Option<ConnectionLostCallback>,
}

impl Callbacks {
    /// Callbacks that do nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default handler for messages no route claims.
    pub fn with_on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Set the callback fired on every CONNACK.
    pub fn with_on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Set the callback fired when an established connection drops.
    pub fn with_on_connection_lost<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_connection_lost = Some(Arc::new(f));
        self
    }

    pub(crate) fn connected(&self) {
        if let Some(f) = &self.on_connect {
            f();
        }
    }

    pub(crate) fn connection_lost(&self, err: &Error) {
        if let Some(f) = &self.on_connection_lost {
            f(err);
        }
    }

    /// Hand a message to the router, then to `on_message` if unclaimed.
    pub(crate) fn deliver(&self, router: &Router, msg: &Message) {
        match router.route(msg) {
            Ok(()) => {}
            Err(Error::NoHandlerFound(_)) => match &self.on_message {
                Some(f) => f(msg),
                None => debug!(topic = %msg.topic, "dropping unhandled message"),
            },
            Err(e) => debug!(topic = %msg.topic, error = %e, "handler error"),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_message", &self.on_message.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_connection_lost", &self.on_connection_lost.is_some())
            .finish()
    }
}
