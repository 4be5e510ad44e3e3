//! MQTT session implementation using rumqttc.
//!
//! Provides a client for connecting to MQTT brokers with:
//! - CONNACK, SUBACK and PUBACK waits bounded by timeouts
//! - Message routing via Router and session callbacks
//! - Optional reconnection with subscription restore

use crate::ack::{AckReceiver, AckTracker, Kind, Request};
use crate::config::{BrokerAddr, ConnectionConfig, Scheme};
use crate::error::{Error, Result};
use crate::router::{Callbacks, Handler, Message, Router};
use crate::topic;
use crate::types::{OutboundMessage, QoS, ReconnectPolicy, SessionState};
use crate::workflow::{Connector, Session};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// MQTT client dialer.
///
/// Contains all options to establish an MQTT session.
pub struct Dialer {
    /// Client ID (defaults to random UUID).
    pub id: Option<String>,
    /// Username and password.
    pub credentials: Option<(String, String)>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Clean session flag.
    pub clean_session: bool,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Acknowledgment timeout for subscribe and publish.
    pub ack_timeout: Duration,
    /// Behavior after the transport drops.
    pub reconnect: ReconnectPolicy,
    /// Per-subscription handlers.
    pub router: Option<Arc<Router>>,
    /// Session callbacks.
    pub callbacks: Callbacks,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            id: None,
            credentials: None,
            keep_alive: Duration::from_secs(20),
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::Never,
            router: None,
            callbacks: Callbacks::default(),
        }
    }
}

impl Dialer {
    /// Create a new dialer with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dialer carrying every option of `config` except the broker.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let credentials = config
            .username
            .clone()
            .map(|u| (u, config.password.clone().unwrap_or_default()));

        Self {
            id: Some(config.client_id.clone()).filter(|id| !id.is_empty()),
            credentials,
            keep_alive: config.keep_alive,
            clean_session: config.clean_session,
            connect_timeout: config.connect_timeout,
            ack_timeout: config.ack_timeout,
            reconnect: config.reconnect,
            ..Self::default()
        }
    }

    /// Set the client ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set username and password.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Set the keep-alive interval.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the acknowledgment timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the message router.
    pub fn with_router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Set the session callbacks.
    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Connect to the broker at the given URL.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pubsub_mqtt::{Dialer, QoS};
    ///
    /// #[tokio::main]
    /// async fn main() -> pubsub_mqtt::Result<()> {
    ///     let conn = Dialer::new().dial("mqtt://127.0.0.1:1883").await?;
    ///     conn.subscribe("topic/test", QoS::AtLeastOnce).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn dial(self, addr: &str) -> Result<Conn> {
        let broker = BrokerAddr::parse(addr)?;
        self.connect(&broker).await
    }

    /// Connect to the broker and wait for its CONNACK.
    pub async fn connect(self, broker: &BrokerAddr) -> Result<Conn> {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut mqtt_options = MqttOptions::new(&id, &broker.host, broker.port);
        mqtt_options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(self.clean_session);

        if let Some((username, password)) = &self.credentials {
            mqtt_options.set_credentials(username, password);
        }

        if broker.scheme == Scheme::Tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);
        let (state, _) = watch::channel(SessionState::Connecting);

        let shared = Arc::new(Shared {
            state,
            acks: Mutex::new(AckTracker::default()),
            subscriptions: Mutex::new(Vec::new()),
            router: self.router.unwrap_or_else(|| Arc::new(Router::new())),
            callbacks: self.callbacks,
        });

        info!(broker = %broker, client_id = %id, "connecting to MQTT broker");

        let (connected_tx, connected_rx) = oneshot::channel();
        let handle = tokio::spawn(run_event_loop(
            shared.clone(),
            client.clone(),
            event_loop,
            connected_tx,
            self.reconnect,
        ));

        let outcome = match tokio::time::timeout(self.connect_timeout, connected_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection(
                "event loop stopped before connack".to_string(),
            )),
            Err(_) => Err(Error::ConnectTimeout(self.connect_timeout)),
        };

        if let Err(e) = outcome {
            handle.abort();
            shared.set_state(SessionState::Disconnected);
            return Err(e);
        }

        Ok(Conn {
            client,
            shared,
            ack_timeout: self.ack_timeout,
            send_lock: tokio::sync::Mutex::new(()),
            event_loop: Mutex::new(Some(handle)),
        })
    }
}

/// State shared between the connection handle and its event loop task.
struct Shared {
    state: watch::Sender<SessionState>,
    acks: Mutex<AckTracker>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    router: Arc<Router>,
    callbacks: Callbacks,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "session state changed");
        }
    }

    fn restore_subscriptions(&self, client: &AsyncClient) {
        let subs = self.subscriptions.lock().clone();
        let mut acks = self.acks.lock();
        for (topic, qos) in subs {
            acks.enqueue_untracked(Request::Subscribe {
                topic: topic.clone(),
            });
            if let Err(e) = client.try_subscribe(&topic, qos.into()) {
                acks.cancel_last();
                error!(topic = %topic, error = %e, "resubscribe failed");
            }
        }
    }

    fn connection_lost(&self, reason: String) {
        error!(error = %reason, "connection lost");
        self.set_state(SessionState::Disconnected);
        self.acks.lock().connection_lost(&reason);
        self.callbacks.connection_lost(&Error::ConnectionLost(reason));
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    client: AsyncClient,
    mut event_loop: EventLoop,
    connected_tx: oneshot::Sender<Result<()>>,
    reconnect: ReconnectPolicy,
) {
    let mut connected_tx = Some(connected_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to MQTT broker");
                if connected_tx.is_none() {
                    shared.restore_subscriptions(&client);
                }
                shared.set_state(SessionState::Connected);
                shared.callbacks.connected();
                if let Some(tx) = connected_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, "received message");
                let msg = Message::from(&publish);
                shared.callbacks.deliver(&shared.router, &msg);
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                debug!(pkid = suback.pkid, "subscription acknowledged");
                shared
                    .acks
                    .lock()
                    .on_suback(suback.pkid, &suback.return_codes);
            }
            Ok(Event::Incoming(Packet::UnsubAck(unsuback))) => {
                shared.acks.lock().on_unsuback(unsuback.pkid);
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                debug!(pkid = puback.pkid, "publish acknowledged");
                shared.acks.lock().on_puback(puback.pkid);
            }
            Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                shared.acks.lock().on_pubcomp(pubcomp.pkid);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker sent disconnect");
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.acks.lock().on_outgoing(Kind::Subscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                shared.acks.lock().on_outgoing(Kind::Unsubscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.acks.lock().on_outgoing(Kind::Publish, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = connected_tx.take() {
                    error!(error = %e, "connect failed");
                    let _ = tx.send(Err(Error::ConnectionError(e)));
                    break;
                }

                if shared.state() == SessionState::Disconnecting {
                    debug!(error = %e, "transport closed while disconnecting");
                    break;
                }

                shared.connection_lost(e.to_string());

                match reconnect {
                    ReconnectPolicy::Never => break,
                    ReconnectPolicy::FixedDelay(delay) => {
                        info!(?delay, "reconnecting");
                        tokio::time::sleep(delay).await;
                        shared.set_state(SessionState::Connecting);
                    }
                }
            }
        }
    }

    shared.acks.lock().fail_all("session closed");
    if shared.state() != SessionState::Disconnecting {
        shared.set_state(SessionState::Disconnected);
    }
}

/// MQTT connection.
pub struct Conn {
    client: AsyncClient,
    shared: Arc<Shared>,
    ack_timeout: Duration,
    send_lock: tokio::sync::Mutex<()>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Conn {
    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Receiver that observes every state change, including connection loss.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Get the message router.
    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }

    /// Active subscriptions.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.shared.subscriptions.lock().clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            SessionState::Connected => Ok(()),
            state => Err(Error::NotConnected(state)),
        }
    }

    async fn wait_ack(&self, rx: AckReceiver) -> Result<()> {
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost("session closed".to_string())),
            Err(_) => Err(Error::AckTimeout(self.ack_timeout)),
        }
    }

    /// Subscribe to a topic filter and wait for the SUBACK.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        topic::validate_filter(topic)?;
        self.ensure_connected()?;

        let rx = {
            let _guard = self.send_lock.lock().await;
            let rx = self.shared.acks.lock().enqueue(Request::Subscribe {
                topic: topic.to_string(),
            });
            if let Err(e) = self.client.subscribe(topic, qos.into()).await {
                self.shared.acks.lock().cancel_last();
                return Err(Error::Subscribe(e));
            }
            rx
        };

        self.wait_ack(rx).await?;

        let mut subs = self.shared.subscriptions.lock();
        subs.retain(|(t, _)| t != topic);
        subs.push((topic.to_string(), qos));
        info!(topic, ?qos, "subscribed");
        Ok(())
    }

    /// Subscribe and route matching messages to `handler` instead of the
    /// default `on_message` callback.
    pub async fn subscribe_with_handler(
        &self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        self.shared.router.handle(topic, handler)?;
        if let Err(e) = self.subscribe(topic, qos).await {
            self.shared.router.remove(topic);
            return Err(e);
        }
        Ok(())
    }

    /// Unsubscribe from a topic filter and wait for the UNSUBACK.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        topic::validate_filter(topic)?;
        self.ensure_connected()?;

        let rx = {
            let _guard = self.send_lock.lock().await;
            let rx = self.shared.acks.lock().enqueue(Request::Unsubscribe {
                topic: topic.to_string(),
            });
            if let Err(e) = self.client.unsubscribe(topic).await {
                self.shared.acks.lock().cancel_last();
                return Err(Error::Unsubscribe(e));
            }
            rx
        };

        self.wait_ack(rx).await?;

        self.shared.subscriptions.lock().retain(|(t, _)| t != topic);
        self.shared.router.remove(topic);
        info!(topic, "unsubscribed");
        Ok(())
    }

    /// Publish a message and wait for its completion.
    ///
    /// QoS 0 completes once the packet is written, QoS 1 on PUBACK and
    /// QoS 2 on PUBCOMP.
    pub async fn publish(&self, msg: OutboundMessage) -> Result<()> {
        topic::validate_name(&msg.topic)?;
        self.ensure_connected()?;

        let rx = {
            let _guard = self.send_lock.lock().await;
            let rx = self
                .shared
                .acks
                .lock()
                .enqueue(Request::Publish { qos: msg.qos });
            if let Err(e) = self
                .client
                .publish_bytes(msg.topic.as_str(), msg.qos.into(), msg.retain, msg.payload)
                .await
            {
                self.shared.acks.lock().cancel_last();
                return Err(Error::Publish(e));
            }
            rx
        };

        self.wait_ack(rx).await
    }

    /// Publish a payload to a topic with QoS 0.
    pub async fn write_to_topic(&self, payload: &[u8], topic: &str) -> Result<()> {
        self.publish(OutboundMessage::new(topic, payload.to_vec()))
            .await
    }

    /// Send DISCONNECT and wait up to `grace` for in-flight packets to
    /// flush before the transport is closed.
    ///
    /// Best effort: never fails, and later calls do nothing.
    pub async fn disconnect(&self, grace: Duration) {
        let Some(mut handle) = self.event_loop.lock().take() else {
            return;
        };

        self.shared.set_state(SessionState::Disconnecting);

        let flushed = tokio::time::timeout(grace, async {
            if let Err(e) = self.client.disconnect().await {
                debug!(error = %e, "disconnect request not queued");
            }
            let _ = (&mut handle).await;
        })
        .await;

        if flushed.is_err() {
            warn!(?grace, "disconnect grace period elapsed, closing transport");
            handle.abort();
        }

        self.shared.acks.lock().fail_all("session closed");
        self.shared.set_state(SessionState::Disconnected);
        info!("disconnected from MQTT broker");
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Session for Conn {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        Conn::subscribe(self, topic, qos).await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        Conn::publish(self, message).await
    }

    async fn disconnect(&self, grace: Duration) {
        Conn::disconnect(self, grace).await
    }

    fn state(&self) -> SessionState {
        Conn::state(self)
    }
}

/// Opens sessions with [`Dialer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

#[async_trait]
impl Connector for MqttConnector {
    type Session = Conn;

    async fn connect(&self, config: &ConnectionConfig, callbacks: Callbacks) -> Result<Conn> {
        Dialer::from_config(config)
            .with_callbacks(callbacks)
            .connect(&config.broker)
            .await
    }
}

/// Connect to an MQTT broker with default options.
///
/// This is a convenience function equivalent to `Dialer::new().dial(addr)`.
pub async fn dial(addr: &str) -> Result<Conn> {
    Dialer::new().dial(addr).await
}
