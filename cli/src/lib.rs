//! Configuration loading for the pubsub command.
//!
//! Settings come from a YAML file, `MQTT_*` environment variables and
//! command line flags, in increasing order of precedence.

pub mod config;

pub use config::{BrokerSection, Config, ConfigError, WorkflowSection, load_config, load_from};
