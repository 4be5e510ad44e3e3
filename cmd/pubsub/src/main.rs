//! pubsub - connects to an MQTT broker, subscribes to a topic, publishes a
//! numbered sequence of messages to it and disconnects.

use anyhow::{Context, Result};
use clap::Parser;
use pubsub_cli::Config;
use pubsub_mqtt::{Callbacks, MqttConnector, Workflow};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Subscribe to a topic, publish a paced message sequence to it, disconnect.
///
/// Settings are read from ~/.pubsub/config.yaml, then MQTT_* environment
/// variables, then the flags below.
#[derive(Parser, Debug)]
#[command(name = "pubsub")]
#[command(about = "MQTT subscribe/publish session driver")]
#[command(version)]
struct Cli {
    /// Config file (default is ~/.pubsub/config.yaml)
    #[arg(long)]
    config: Option<String>,

    /// Broker URL, e.g. tls://broker.example.com:8883
    #[arg(short, long)]
    broker: Option<String>,

    /// Client identifier (must be unique per broker)
    #[arg(long)]
    client_id: Option<String>,

    /// Topic to subscribe and publish to
    #[arg(short, long)]
    topic: Option<String>,

    /// Number of messages to publish
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Pause after each publish, in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(broker) = &self.broker {
            cfg.broker.url = broker.clone();
        }
        if let Some(id) = &self.client_id {
            cfg.broker.client_id = id.clone();
        }
        if let Some(topic) = &self.topic {
            cfg.workflow.topic = topic.clone();
        }
        if let Some(count) = self.count {
            cfg.workflow.count = count;
        }
        if let Some(ms) = self.interval_ms {
            cfg.workflow.interval_ms = ms;
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn callbacks() -> Callbacks {
    Callbacks::new()
        .with_on_connect(|| info!("connected"))
        .with_on_message(|msg| match msg.payload_str() {
            Some(text) => info!(topic = %msg.topic, payload = %text, "message received"),
            None => info!(topic = %msg.topic, bytes = msg.payload.len(), "message received"),
        })
        .with_on_connection_lost(|err| warn!(error = %err, "connection lost"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut cfg = pubsub_cli::load_config(cli.config.as_deref()).context("load config")?;
    cfg.apply_env().context("apply environment")?;
    cli.apply(&mut cfg);

    let connection = cfg.connection_config().context("broker settings")?;
    let workflow = cfg.workflow_config();
    info!(
        broker = %connection.broker,
        client_id = %connection.client_id,
        topic = %workflow.topic,
        count = workflow.count,
        "starting"
    );

    match Workflow::new(workflow)
        .run(&MqttConnector, &connection, callbacks())
        .await
    {
        Ok(report) => {
            info!(
                published = report.published,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "done"
            );
            Ok(())
        }
        Err(err) => {
            let phase = err.phase();
            error!(phase, error = %err, "workflow aborted");
            Err(anyhow::Error::new(err).context(format!("{phase} phase failed")))
        }
    }
}
