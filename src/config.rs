// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! `BrokerConfig` carries everything the subscriber layer needs to know about
//! the broker: where it lives, how queue names are prefixed, which exchanges
//! and queues exist, and whether they should be asserted at startup. It is
//! immutable once loaded and shared behind an `Arc`.
//!
//! Configuration can be built in code or loaded with [`BrokerConfig::load`],
//! which reads an optional file and overlays `BROKER__*` environment
//! variables, e.g. `BROKER__URL` or `BROKER__QUEUE_PREFIX`.

use crate::{errors::AmqpError, exchange::ExchangeDeclaration, queue::QueueDeclaration};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::fmt::Display;
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_CONNECTION_NAME: &str = "amqp-subscriber";
pub const ENV_PREFIX: &str = "BROKER";
/// Time given to each consumer to settle its in-flight message at shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Severity used when reporting broker connection problems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Emits `msg` with the error attached at this severity.
    pub fn log(&self, err: &dyn Display, msg: &str) {
        let err = err.to_string();
        match self {
            LogLevel::Error => error!(error = err, "{}", msg),
            LogLevel::Warn => warn!(error = err, "{}", msg),
            LogLevel::Info => info!(error = err, "{}", msg),
            LogLevel::Debug => debug!(error = err, "{}", msg),
            LogLevel::Trace => trace!(error = err, "{}", msg),
        }
    }
}

fn default_connection_name() -> String {
    DEFAULT_CONNECTION_NAME.to_owned()
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    #[serde(default)]
    pub queue_prefix: Option<String>,
    #[serde(default)]
    pub exchanges: Vec<ExchangeDeclaration>,
    #[serde(default)]
    pub queues: Vec<QueueDeclaration>,
    /// Declare every configured exchange and queue during startup
    #[serde(default)]
    pub assert: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    /// Apply the prefetch limit to the whole channel instead of each consumer
    #[serde(default)]
    pub prefetch_global: bool,
    /// Milliseconds to wait for each cancelled consumer to finish at shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl BrokerConfig {
    pub fn new(url: &str) -> BrokerConfig {
        BrokerConfig {
            url: url.to_owned(),
            queue_prefix: None,
            exchanges: vec![],
            queues: vec![],
            assert: false,
            log_level: LogLevel::default(),
            connection_name: default_connection_name(),
            prefetch_count: default_prefetch_count(),
            prefetch_global: false,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    /// Loads the configuration from `path` (optional) and the environment.
    ///
    /// Environment variables win over the file. Nested keys use a double
    /// underscore, e.g. `BROKER__LOG_LEVEL=warn`.
    pub fn load(path: &str) -> Result<BrokerConfig, AmqpError> {
        debug!("loading broker configuration...");

        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let cfg = match builder.build() {
            Err(err) => {
                error!(error = err.to_string(), "failure to read configuration");
                Err(AmqpError::ConfigError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        cfg.try_deserialize::<BrokerConfig>().map_err(|err| {
            error!(error = err.to_string(), "failure to deserialize configuration");
            AmqpError::ConfigError(err.to_string())
        })
    }

    pub fn queue_prefix(mut self, prefix: &str) -> Self {
        self.queue_prefix = Some(prefix.to_owned());
        self
    }

    pub fn exchange(mut self, exchange: ExchangeDeclaration) -> Self {
        self.exchanges.push(exchange);
        self
    }

    pub fn queue(mut self, queue: QueueDeclaration) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn assert(mut self) -> Self {
        self.assert = true;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn prefetch(mut self, count: u16, global: bool) -> Self {
        self.prefetch_count = count;
        self.prefetch_global = global;
        self
    }

    pub fn shutdown_timeout(mut self, timeout_ms: u64) -> Self {
        self.shutdown_timeout_ms = timeout_ms;
        self
    }

    /// Finds the queue declaration with the given logical name.
    pub fn queue_declaration(&self, name: &str) -> Option<&QueueDeclaration> {
        self.queues.iter().find(|queue| queue.name == name)
    }
}
