//! Subscribe-then-publish session workflow.
//!
//! [`Workflow::run`] drives one session end to end:
//!
//! ```text
//! connect -> subscribe(topic) -> publish x count (paced) -> disconnect(grace)
//! ```
//!
//! Every step waits for its acknowledgment before the next one starts, so
//! publishes leave in sequence order and never before the SUBACK. Once a
//! session exists it is always disconnected, whatever happened in between.

use crate::clock::{Clock, TokioClock};
use crate::config::{ConnectionConfig, WorkflowConfig};
use crate::error::{Error, Result};
use crate::router::Callbacks;
use crate::types::{OutboundMessage, QoS, SessionState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// A live session the workflow issues commands on.
#[async_trait]
pub trait Session: Send + Sync {
    /// Subscribe and wait for the SUBACK.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Publish and wait for completion.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Best-effort graceful disconnect.
    async fn disconnect(&self, grace: Duration);

    /// Current session state.
    fn state(&self) -> SessionState;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Connect and wait for the handshake to finish.
    async fn connect(&self, config: &ConnectionConfig, callbacks: Callbacks)
    -> Result<Self::Session>;
}

/// Failure of one workflow phase.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// The session could not be established.
    #[error("connect failed: {0}")]
    Connect(#[source] Error),

    /// The subscription was rejected or not acknowledged.
    #[error("subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: Error,
    },

    /// A publish could not be sent or was not acknowledged.
    #[error("publish of message {sequence} failed: {source}")]
    Publish {
        sequence: usize,
        #[source]
        source: Error,
    },
}

impl WorkflowError {
    /// Name of the phase that failed.
    pub fn phase(&self) -> &'static str {
        match self {
            WorkflowError::Connect(_) => "connect",
            WorkflowError::Subscribe { .. } => "subscribe",
            WorkflowError::Publish { .. } => "publish",
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Messages published and acknowledged.
    pub published: usize,
    /// Time from connect to disconnect.
    pub elapsed: Duration,
}

/// Session workflow driver.
pub struct Workflow {
    config: WorkflowConfig,
    clock: Arc<dyn Clock>,
}

impl Workflow {
    /// Create a workflow paced by tokio timers.
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            clock: Arc::new(TokioClock),
        }
    }

    /// Replace the clock used for pacing.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Workflow parameters.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run the workflow once.
    pub async fn run<C>(
        &self,
        connector: &C,
        connection: &ConnectionConfig,
        callbacks: Callbacks,
    ) -> std::result::Result<RunReport, WorkflowError>
    where
        C: Connector + ?Sized,
    {
        let session = connector
            .connect(connection, callbacks)
            .await
            .map_err(|e| {
                error!(broker = %connection.broker, error = %e, "failed to connect");
                WorkflowError::Connect(e)
            })?;

        let started = self.clock.now();
        let outcome = self.exchange(&session).await;

        session.disconnect(self.config.disconnect_grace).await;

        let published = outcome?;
        Ok(RunReport {
            published,
            elapsed: self.clock.now() - started,
        })
    }

    async fn exchange<S>(&self, session: &S) -> std::result::Result<usize, WorkflowError>
    where
        S: Session + ?Sized,
    {
        let cfg = &self.config;

        session
            .subscribe(&cfg.topic, cfg.subscribe_qos)
            .await
            .map_err(|source| {
                error!(topic = %cfg.topic, error = %source, "failed to subscribe");
                WorkflowError::Subscribe {
                    topic: cfg.topic.clone(),
                    source,
                }
            })?;
        info!(topic = %cfg.topic, "subscribed to topic");

        for sequence in 0..cfg.count {
            if session.state() != SessionState::Connected {
                warn!(state = %session.state(), sequence, "session no longer connected");
            }

            let payload = cfg.payload(sequence);
            let message = OutboundMessage::new(cfg.topic.as_str(), payload.clone())
                .with_qos(cfg.publish_qos)
                .with_retain(cfg.retain);

            session.publish(message).await.map_err(|source| {
                error!(topic = %cfg.topic, sequence, error = %source, "failed to publish");
                WorkflowError::Publish { sequence, source }
            })?;
            info!(topic = %cfg.topic, payload = %payload, "published");

            self.clock.sleep(cfg.interval).await;
        }

        Ok(cfg.count)
    }
}
