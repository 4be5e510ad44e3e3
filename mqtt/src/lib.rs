//! MQTT publish/subscribe session library.
//!
//! This crate wraps rumqttc's connection, subscription and publish APIs in a
//! session whose calls wait for the matching broker acknowledgment, and
//! drives a subscribe-then-publish workflow on top of it.
//!
//! # Example - Workflow
//!
//! ```no_run
//! use pubsub_mqtt::{
//!     BrokerAddr, Callbacks, ConnectionConfig, MqttConnector, Scheme, Workflow, WorkflowConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connection = ConnectionConfig::new(
//!         BrokerAddr::new(Scheme::Tls, "broker.example.com"),
//!         "demo-client",
//!     )
//!     .with_credentials("user", "password");
//!
//!     let callbacks = Callbacks::new()
//!         .with_on_message(|msg| println!("{}: {:?}", msg.topic, msg.payload_str()));
//!
//!     let report = Workflow::new(WorkflowConfig::default())
//!         .run(&MqttConnector, &connection, callbacks)
//!         .await?;
//!     println!("published {}", report.published);
//!     Ok(())
//! }
//! ```
//!
//! # Example - Client
//!
//! ```no_run
//! use pubsub_mqtt::{Dialer, OutboundMessage, QoS};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> pubsub_mqtt::Result<()> {
//!     let conn = Dialer::new().dial("mqtt://127.0.0.1:1883").await?;
//!
//!     conn.subscribe("response/#", QoS::AtLeastOnce).await?;
//!     conn.publish(OutboundMessage::new("test/topic", "hello")).await?;
//!
//!     conn.disconnect(Duration::from_millis(250)).await;
//!     Ok(())
//! }
//! ```

mod ack;
mod client;
mod clock;
mod config;
mod error;
mod router;
#[cfg(test)]
mod tests;
pub mod topic;
mod types;
mod workflow;

pub use client::{Conn, Dialer, MqttConnector, dial};
pub use clock::{Clock, TokioClock};
pub use config::{BrokerAddr, ConnectionConfig, Scheme, WorkflowConfig};
pub use error::{Error, Result};
pub use router::{Callbacks, Handler, HandlerFunc, Message, Router};
pub use types::{OutboundMessage, QoS, ReconnectPolicy, SessionState};
pub use workflow::{Connector, RunReport, Session, Workflow, WorkflowError};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::{
        Callbacks, Conn, ConnectionConfig, Connector, Dialer, Error, Message, MqttConnector,
        OutboundMessage, QoS, Result, Session, SessionState, Workflow, WorkflowConfig,
    };
}
