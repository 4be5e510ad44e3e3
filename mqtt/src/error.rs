//! Error types for the MQTT session.

use std::time::Duration;

use thiserror::Error;

use crate::types::SessionState;

/// Error type for MQTT session operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Broker URL could not be parsed.
    #[error("mqtt: invalid broker url: {0}")]
    InvalidBrokerUrl(String),

    /// Invalid topic filter.
    #[error("mqtt: invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    /// Invalid topic name for publishing.
    #[error("mqtt: invalid topic name: {0}")]
    InvalidTopicName(String),

    /// Connection could not be established.
    #[error("mqtt: connection error: {0}")]
    Connection(String),

    /// No CONNACK within the connect timeout.
    #[error("mqtt: no connack after {0:?}")]
    ConnectTimeout(Duration),

    /// Operation requires a connected session.
    #[error("mqtt: session is {0}, not connected")]
    NotConnected(SessionState),

    /// Broker answered SUBACK with a failure return code.
    #[error("mqtt: broker rejected subscription to {0}")]
    SubscribeRejected(String),

    /// Subscribe request could not be queued.
    #[error("mqtt: subscribe error: {0}")]
    Subscribe(#[source] rumqttc::ClientError),

    /// Unsubscribe request could not be queued.
    #[error("mqtt: unsubscribe error: {0}")]
    Unsubscribe(#[source] rumqttc::ClientError),

    /// Publish request could not be queued.
    #[error("mqtt: publish error: {0}")]
    Publish(#[source] rumqttc::ClientError),

    /// No acknowledgment within the ack timeout.
    #[error("mqtt: no acknowledgment after {0:?}")]
    AckTimeout(Duration),

    /// Transport dropped after the session was established.
    #[error("mqtt: connection lost: {0}")]
    ConnectionLost(String),

    /// No handler claimed an inbound message.
    #[error("mqtt: no handler found for topic: {0}")]
    NoHandlerFound(String),

    /// Handler error.
    #[error("mqtt: handler error: {0}")]
    Handler(String),

    /// Connection error from rumqttc.
    #[error("mqtt connection error: {0}")]
    ConnectionError(#[from] rumqttc::ConnectionError),
}

/// Result type for MQTT operations.
pub type Result<T> = std::result::Result<T, Error>;
