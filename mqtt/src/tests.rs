//! End-to-end tests against an embedded rumqttd broker.
//!
//! Each test starts its own broker on a fresh port, so they can run in
//! parallel.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{
    BrokerAddr, Callbacks, ConnectionConfig, Dialer, Error, MqttConnector, OutboundMessage, QoS,
    ReconnectPolicy, Scheme, SessionState, Workflow, WorkflowConfig, WorkflowError,
};

type AuthHandler = Arc<
    dyn Fn(String, String, String) -> Pin<Box<dyn Future<Output = bool> + Send + 'static>>
        + Send
        + Sync,
>;

/// Find an available port for testing.
fn find_available_port() -> u16 {
    static PORT: AtomicUsize = AtomicUsize::new(18700);
    PORT.fetch_add(1, Ordering::SeqCst) as u16
}

fn rumqttd_config(addr: SocketAddr, auth: Option<AuthHandler>) -> rumqttd::Config {
    use rumqttd::{Config, ConnectionSettings, RouterConfig, ServerSettings};

    let mut servers = HashMap::new();
    servers.insert(
        "tcp".to_string(),
        ServerSettings {
            name: "tcp".to_string(),
            listen: addr,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 60000,
                max_payload_size: 1024 * 1024,
                max_inflight_count: 100,
                auth: None,
                external_auth: auth,
                dynamic_filters: false,
            },
        },
    );

    Config {
        id: 0,
        router: RouterConfig {
            max_connections: 1000,
            max_outgoing_packet_count: 200,
            max_segment_size: 1024 * 1024,
            max_segment_count: 10,
            ..Default::default()
        },
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        console: None,
        bridge: None,
        cluster: None,
    }
}

/// Start a broker and return the address clients should use.
async fn start_broker(auth: Option<AuthHandler>) -> BrokerAddr {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let port = find_available_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let mut broker = rumqttd::Broker::new(rumqttd_config(addr, auth));
    std::thread::spawn(move || {
        broker.start().unwrap();
    });

    // Wait for broker to start
    tokio::time::sleep(Duration::from_millis(200)).await;

    BrokerAddr::new(Scheme::Tcp, "127.0.0.1").with_port(port)
}

fn connection(broker: &BrokerAddr, client_id: &str) -> ConnectionConfig {
    ConnectionConfig::new(broker.clone(), client_id)
        .with_connect_timeout(Duration::from_secs(5))
        .with_ack_timeout(Duration::from_secs(5))
}

/// Collects payloads delivered to `on_message`.
fn collector() -> (Callbacks, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let callbacks = Callbacks::new().with_on_message(move |msg| {
        seen_clone
            .lock()
            .push(msg.payload_str().unwrap_or("<binary>").to_string());
    });
    (callbacks, seen)
}

async fn wait_for(seen: &Mutex<Vec<String>>, n: usize) {
    for _ in 0..100 {
        if seen.lock().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_workflow_publishes_sequence_after_subscribe() {
    let broker = start_broker(None).await;

    let (observer_callbacks, seen) = collector();
    let observer = Dialer::from_config(&connection(&broker, "observer"))
        .with_callbacks(observer_callbacks)
        .connect(&broker)
        .await
        .unwrap();
    observer
        .subscribe("topic/test", QoS::AtLeastOnce)
        .await
        .unwrap();

    let connects = Arc::new(AtomicUsize::new(0));
    let connects_clone = connects.clone();
    let callbacks = Callbacks::new().with_on_connect(move || {
        connects_clone.fetch_add(1, Ordering::SeqCst);
    });

    let config = WorkflowConfig {
        count: 3,
        interval: Duration::ZERO,
        ..WorkflowConfig::default()
    };
    let report = Workflow::new(config)
        .run(&MqttConnector, &connection(&broker, "publisher"), callbacks)
        .await
        .unwrap();

    assert_eq!(report.published, 3);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    wait_for(&seen, 3).await;
    assert_eq!(
        *seen.lock(),
        vec![
            "Message 0".to_string(),
            "Message 1".to_string(),
            "Message 2".to_string()
        ]
    );

    observer.disconnect(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn test_session_receives_own_messages() {
    let broker = start_broker(None).await;

    let (callbacks, seen) = collector();
    let conn = Dialer::from_config(&connection(&broker, "loopback"))
        .with_callbacks(callbacks)
        .connect(&broker)
        .await
        .unwrap();
    assert_eq!(conn.state(), SessionState::Connected);

    conn.subscribe("topic/test", QoS::AtLeastOnce).await.unwrap();
    assert_eq!(
        conn.subscriptions(),
        vec![("topic/test".to_string(), QoS::AtLeastOnce)]
    );

    conn.publish(OutboundMessage::new("topic/test", "hello").with_qos(QoS::AtLeastOnce))
        .await
        .unwrap();

    wait_for(&seen, 1).await;
    assert_eq!(*seen.lock(), vec!["hello".to_string()]);

    conn.disconnect(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn test_subscription_handler_claims_messages() {
    let broker = start_broker(None).await;

    let (callbacks, fallback) = collector();
    let conn = Dialer::from_config(&connection(&broker, "routed"))
        .with_callbacks(callbacks)
        .connect(&broker)
        .await
        .unwrap();

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let claimed_clone = claimed.clone();
    conn.router()
        .handle_func("alerts/#", move |msg| {
            claimed_clone.lock().push(msg.topic.clone());
            Ok(())
        })
        .unwrap();
    conn.subscribe("alerts/#", QoS::AtLeastOnce).await.unwrap();
    conn.subscribe("topic/test", QoS::AtLeastOnce).await.unwrap();

    conn.write_to_topic(b"fire", "alerts/kitchen").await.unwrap();
    conn.write_to_topic(b"Message 0", "topic/test").await.unwrap();

    wait_for(&fallback, 1).await;
    assert_eq!(*fallback.lock(), vec!["Message 0".to_string()]);
    assert_eq!(*claimed.lock(), vec!["alerts/kitchen".to_string()]);

    conn.unsubscribe("alerts/#").await.unwrap();
    assert!(!conn.router().has_handlers("alerts/kitchen"));

    conn.disconnect(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn test_commands_rejected_after_disconnect() {
    let broker = start_broker(None).await;

    let conn = Dialer::from_config(&connection(&broker, "closing"))
        .connect(&broker)
        .await
        .unwrap();
    let states = conn.watch_state();

    conn.disconnect(Duration::from_millis(250)).await;
    assert_eq!(conn.state(), SessionState::Disconnected);
    assert!(states.has_changed().unwrap_or(true));

    // A second disconnect is a no-op.
    conn.disconnect(Duration::from_millis(250)).await;

    let err = conn
        .publish(OutboundMessage::new("topic/test", "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected(SessionState::Disconnected)));

    let err = conn.subscribe("topic/test", QoS::AtLeastOnce).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));
}

#[tokio::test]
async fn test_invalid_topics_rejected_locally() {
    let broker = start_broker(None).await;

    let conn = Dialer::from_config(&connection(&broker, "validator"))
        .connect(&broker)
        .await
        .unwrap();

    let err = conn.subscribe("topic/#/bad", QoS::AtMostOnce).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTopicFilter(_)));

    let err = conn
        .publish(OutboundMessage::new("topic/+", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTopicName(_)));

    conn.disconnect(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn test_authentication() {
    let auth: AuthHandler = Arc::new(
        |_client_id: String,
         user: String,
         pass: String|
         -> Pin<Box<dyn Future<Output = bool> + Send + 'static>> {
            Box::pin(async move { user == "admin" && pass == "secret" })
        },
    );
    let broker = start_broker(Some(auth)).await;

    let config = WorkflowConfig {
        count: 1,
        interval: Duration::ZERO,
        ..WorkflowConfig::default()
    };

    let good = connection(&broker, "authed").with_credentials("admin", "secret");
    let report = Workflow::new(config.clone())
        .run(&MqttConnector, &good, Callbacks::new())
        .await
        .unwrap();
    assert_eq!(report.published, 1);

    let bad = connection(&broker, "intruder").with_credentials("admin", "wrong");
    let err = Workflow::new(config)
        .run(&MqttConnector, &bad, Callbacks::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Connect(_)));
}

#[tokio::test]
async fn test_unreachable_broker_fails_connect_phase() {
    let broker = BrokerAddr::new(Scheme::Tcp, "127.0.0.1").with_port(1);

    let err = Workflow::new(WorkflowConfig::default())
        .run(&MqttConnector, &connection(&broker, "nobody"), Callbacks::new())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), "connect");
}

// Raw-socket broker for transport faults rumqttd cannot produce on demand.

/// Fault injected on the first connection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    /// Answer the first SUBSCRIBE, then close the socket.
    DropAfterSuback,
    /// Close the socket on the first PUBLISH without acknowledging it.
    DropOnPublish,
}

struct FakeBroker {
    addr: BrokerAddr,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeBroker {
    async fn start(suback_code: u8, fault: Fault) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_clone = log.clone();
        tokio::spawn(async move {
            let mut conn = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let fault = if conn == 0 { fault } else { Fault::None };
                tokio::spawn(serve_fake(conn, stream, suback_code, fault, log_clone.clone()));
                conn += 1;
            }
        });

        Self {
            addr: BrokerAddr::new(Scheme::Tcp, "127.0.0.1").with_port(port),
            log,
        }
    }

    fn seen(&self, event: &str) -> bool {
        self.log.lock().iter().any(|e| e == event)
    }

    fn count(&self, prefix: &str) -> usize {
        self.log.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;

    // Remaining length (variable length encoding)
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn read_str(buf: &[u8]) -> (String, usize) {
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    (String::from_utf8_lossy(&buf[2..2 + len]).into_owned(), 2 + len)
}

async fn serve_fake(
    conn: usize,
    mut stream: TcpStream,
    suback_code: u8,
    fault: Fault,
    log: Arc<Mutex<Vec<String>>>,
) {
    while let Ok((header, body)) = read_packet(&mut stream).await {
        let reply = match header >> 4 {
            1 => {
                log.lock().push(format!("c{conn} connect"));
                vec![0x20, 0x02, 0x00, 0x00]
            }
            3 => {
                let qos = (header >> 1) & 0x03;
                let (_, topic_len) = read_str(&body);
                let (pkid, payload) = if qos > 0 {
                    (Some([body[topic_len], body[topic_len + 1]]), &body[topic_len + 2..])
                } else {
                    (None, &body[topic_len..])
                };
                log.lock().push(format!(
                    "c{conn} publish {}",
                    String::from_utf8_lossy(payload)
                ));
                if fault == Fault::DropOnPublish {
                    log.lock().push(format!("c{conn} dropped"));
                    return;
                }
                match pkid {
                    Some([hi, lo]) => vec![0x40, 0x02, hi, lo],
                    None => Vec::new(),
                }
            }
            8 => {
                let (filter, _) = read_str(&body[2..]);
                log.lock().push(format!("c{conn} subscribe {filter}"));
                vec![0x90, 0x03, body[0], body[1], suback_code]
            }
            10 => vec![0xB0, 0x02, body[0], body[1]],
            12 => vec![0xD0, 0x00],
            14 => {
                log.lock().push(format!("c{conn} disconnect"));
                return;
            }
            _ => Vec::new(),
        };

        if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
            return;
        }

        if header >> 4 == 8 && fault == Fault::DropAfterSuback {
            log.lock().push(format!("c{conn} dropped"));
            return;
        }
    }
}

async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

fn loss_counter() -> (Callbacks, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let connects = Arc::new(AtomicUsize::new(0));
    let losses = Arc::new(AtomicUsize::new(0));
    let connects_clone = connects.clone();
    let losses_clone = losses.clone();
    let callbacks = Callbacks::new()
        .with_on_connect(move || {
            connects_clone.fetch_add(1, Ordering::SeqCst);
        })
        .with_on_connection_lost(move |err| {
            if matches!(err, Error::ConnectionLost(_)) {
                losses_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
    (callbacks, connects, losses)
}

#[tokio::test]
async fn test_connection_loss_without_reconnect() {
    let broker = FakeBroker::start(0x01, Fault::DropAfterSuback).await;
    let (callbacks, connects, losses) = loss_counter();

    let conn = Dialer::from_config(&connection(&broker.addr, "dropped"))
        .with_callbacks(callbacks)
        .connect(&broker.addr)
        .await
        .unwrap();
    let mut states = conn.watch_state();

    conn.subscribe("topic/test", QoS::AtLeastOnce).await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == SessionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    // No second report and no redial.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(losses.load(Ordering::SeqCst), 1);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(conn.state(), SessionState::Disconnected);
    assert!(!broker.seen("c1 connect"));

    let err = conn
        .publish(OutboundMessage::new("topic/test", "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected(SessionState::Disconnected)));

    conn.disconnect(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn test_connection_loss_fails_pending_publish() {
    let broker = FakeBroker::start(0x01, Fault::DropOnPublish).await;
    let (callbacks, _, losses) = loss_counter();

    let conn = Dialer::from_config(&connection(&broker.addr, "pending"))
        .with_callbacks(callbacks)
        .connect(&broker.addr)
        .await
        .unwrap();

    let err = conn
        .publish(OutboundMessage::new("topic/test", "Message 0").with_qos(QoS::AtLeastOnce))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)), "got {err}");
    assert!(wait_until(|| losses.load(Ordering::SeqCst) == 1).await);

    conn.disconnect(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let broker = FakeBroker::start(0x01, Fault::DropAfterSuback).await;
    let (callbacks, connects, losses) = loss_counter();

    let config = connection(&broker.addr, "redial")
        .with_reconnect(ReconnectPolicy::FixedDelay(Duration::from_millis(100)));
    let conn = Dialer::from_config(&config)
        .with_callbacks(callbacks)
        .connect(&broker.addr)
        .await
        .unwrap();

    conn.subscribe("topic/test", QoS::AtLeastOnce).await.unwrap();

    assert!(wait_until(|| broker.seen("c0 dropped")).await);
    assert!(wait_until(|| broker.seen("c1 subscribe topic/test")).await);
    assert!(wait_until(|| conn.state() == SessionState::Connected).await);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(losses.load(Ordering::SeqCst), 1);
    assert_eq!(
        conn.subscriptions(),
        vec![("topic/test".to_string(), QoS::AtLeastOnce)]
    );

    conn.publish(OutboundMessage::new("topic/test", "after reconnect").with_qos(QoS::AtLeastOnce))
        .await
        .unwrap();
    assert!(broker.seen("c1 publish after reconnect"));

    conn.disconnect(Duration::from_millis(250)).await;
    assert!(wait_until(|| broker.seen("c1 disconnect")).await);
}

#[tokio::test]
async fn test_rejected_subscription_sends_no_publishes() {
    let broker = FakeBroker::start(0x80, Fault::None).await;

    let config = WorkflowConfig {
        count: 3,
        interval: Duration::ZERO,
        ..WorkflowConfig::default()
    };
    let err = Workflow::new(config)
        .run(&MqttConnector, &connection(&broker.addr, "rejected"), Callbacks::new())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), "subscribe");
    match err {
        WorkflowError::Subscribe { topic, source } => {
            assert_eq!(topic, "topic/test");
            assert!(matches!(source, Error::SubscribeRejected(_)));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(wait_until(|| broker.seen("c0 disconnect")).await);
    assert!(broker.seen("c0 subscribe topic/test"));
    assert_eq!(broker.count("c0 publish"), 0);
}
