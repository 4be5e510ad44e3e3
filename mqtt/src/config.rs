//! Connection and workflow configuration.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{QoS, ReconnectPolicy};

/// Transport scheme used to reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    #[default]
    Tls,
}

impl Scheme {
    /// Port used when the broker URL has none.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "mqtt" | "tcp" => Some(Scheme::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Scheme::Tls),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Tcp => f.write_str("tcp"),
            Scheme::Tls => f.write_str("tls"),
        }
    }
}

/// Broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    /// Create an address, using the scheme's default port.
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port: scheme.default_port(),
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Parse a broker URL such as `tls://broker.example.com:8883`.
    ///
    /// Accepted schemes: `mqtt`, `tcp` (plain) and `mqtts`, `ssl`, `tls`.
    pub fn parse(addr: &str) -> Result<Self> {
        let url = url::Url::parse(addr)
            .map_err(|e| Error::InvalidBrokerUrl(format!("{addr}: {e}")))?;

        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| {
            Error::InvalidBrokerUrl(format!("{addr}: unsupported scheme {}", url.scheme()))
        })?;

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(Error::InvalidBrokerUrl(format!("{addr}: missing host"))),
        };

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self { scheme, host, port })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Everything needed to open a session. Immutable once the session starts.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Broker address.
    pub broker: BrokerAddr,
    /// Client ID; empty means a random UUID is used.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Clean session flag.
    pub clean_session: bool,
    /// Upper bound on the wait for CONNACK.
    pub connect_timeout: Duration,
    /// Upper bound on each SUBACK / PUBACK wait.
    pub ack_timeout: Duration,
    /// Behavior after the transport drops.
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    /// Create a config for the given broker with default timeouts.
    pub fn new(broker: BrokerAddr, client_id: impl Into<String>) -> Self {
        Self {
            broker,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(20),
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::Never,
        }
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the connect timeout.
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
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("broker", &self.broker.to_string())
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("connect_timeout", &self.connect_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Parameters of the subscribe-then-publish run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Topic subscribed to and published on.
    pub topic: String,
    /// QoS of the subscription.
    pub subscribe_qos: QoS,
    /// QoS of every publish.
    pub publish_qos: QoS,
    /// Retain flag of every publish.
    pub retain: bool,
    /// Number of messages to publish.
    pub count: usize,
    /// Pause after each publish.
    pub interval: Duration,
    /// How long disconnect waits for in-flight deliveries.
    pub disconnect_grace: Duration,
    /// Payload text before the sequence number.
    pub payload_prefix: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            topic: "topic/test".to_string(),
            subscribe_qos: QoS::AtLeastOnce,
            publish_qos: QoS::AtMostOnce,
            retain: false,
            count: 10,
            interval: Duration::from_secs(1),
            disconnect_grace: Duration::from_millis(250),
            payload_prefix: "Message".to_string(),
        }
    }
}

impl WorkflowConfig {
    /// Payload of the message with the given sequence number.
    pub fn payload(&self, sequence: usize) -> String {
        format!("{} {}", self.payload_prefix, sequence)
    }
}
