// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Assertion
//!
//! Declares the configured exchanges and queues on the broker. Queues may
//! carry companions:
//! - a retry queue (`{queue}-retry`) that holds rejected messages for a
//!   delay before dead-lettering them back to the main queue
//! - a dead letter queue (`{queue}-dlq`) receiving rejected messages when no
//!   retry queue is configured
//!
//! Assertion never stops at the first failure: every declaration is
//! attempted and the failures are returned to the caller.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDeclaration,
    name_resolver::NameResolver,
    queue::{self, QueueDeclaration, QueueOptions},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Exchanges and queues to declare, in declaration order.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    resolver: Arc<NameResolver>,
    pub(crate) exchanges: Vec<ExchangeDeclaration>,
    pub(crate) queues: Vec<QueueDeclaration>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn BrokerChannel>, resolver: Arc<NameResolver>) -> AmqpTopology {
        AmqpTopology {
            channel,
            resolver,
            exchanges: vec![],
            queues: vec![],
        }
    }

    pub fn exchange(mut self, def: &ExchangeDeclaration) -> Self {
        self.exchanges.push(def.clone());
        self
    }

    pub fn queue(mut self, def: &QueueDeclaration) -> Self {
        self.queues.push(def.clone());
        self
    }

    /// Declares every exchange, then every queue with its companions.
    pub async fn install(&self) -> Vec<AmqpError> {
        let mut failures = self.install_exchanges().await;
        failures.extend(self.install_queues().await);

        debug!(failures = failures.len(), "topology asserted");
        failures
    }

    async fn install_exchanges(&self) -> Vec<AmqpError> {
        let mut failures = vec![];

        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            match self.channel.assert_exchange(exch).await {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = %exch.name,
                        "error to declare the exchange"
                    );
                    failures.push(err);
                }
                _ => debug!("exchange: {} was created", exch.name),
            }
        }

        failures
    }

    async fn install_queues(&self) -> Vec<AmqpError> {
        let mut failures = vec![];

        for def in &self.queues {
            let name = self.resolver.resolve_prefix(&def.name);
            debug!("creating queue: {}", name);

            let mut options = def.options.clone();

            if let Some(retry) = &def.retry {
                let retry_name = queue::retry_name(&name);
                let args = [
                    (AMQP_HEADERS_DEAD_LETTER_EXCHANGE, json!("")),
                    (AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, json!(name)),
                    (AMQP_HEADERS_MESSAGE_TTL, json!(retry.ttl)),
                ];

                match self.declare_companion(&retry_name, def, &args).await {
                    Err(err) => failures.push(err),
                    _ => dead_letter_to(&mut options, &retry_name),
                }
            }

            if def.dlq {
                let dlq_name = queue::dlq_name(&name);

                match self.declare_companion(&dlq_name, def, &[]).await {
                    Err(err) => failures.push(err),
                    _ if def.retry.is_none() => dead_letter_to(&mut options, &dlq_name),
                    _ => {}
                }
            }

            if let Some(ttl) = def.ttl {
                argument(&mut options, AMQP_HEADERS_MESSAGE_TTL, json!(ttl));
            }

            if let Some(max_length) = def.max_length {
                argument(&mut options, AMQP_HEADERS_MAX_LENGTH, json!(max_length));
            }

            if let Some(max_length_bytes) = def.max_length_bytes {
                argument(
                    &mut options,
                    AMQP_HEADERS_MAX_LENGTH_BYTES,
                    json!(max_length_bytes),
                );
            }

            match self.channel.assert_queue(&name, &options).await {
                Err(err) => {
                    error!(error = err.to_string(), queue = %name, "error to declare the queue");
                    failures.push(err);
                }
                _ => debug!("queue: {} was created", name),
            }
        }

        failures
    }

    /// Declares a retry or dead letter queue with the durability of its
    /// main queue.
    async fn declare_companion(
        &self,
        name: &str,
        def: &QueueDeclaration,
        args: &[(&str, Value)],
    ) -> Result<(), AmqpError> {
        let mut options = QueueOptions {
            durable: def.options.durable,
            exclusive: def.options.exclusive,
            auto_delete: def.options.auto_delete,
            ..QueueOptions::default()
        };
        for (key, value) in args {
            argument(&mut options, key, value.clone());
        }

        self.channel
            .assert_queue(name, &options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = name, "failure to declare companion queue");
                err
            })
    }
}

fn argument(options: &mut QueueOptions, key: &str, value: Value) {
    options.arguments.insert(key.to_owned(), value);
}

fn dead_letter_to(options: &mut QueueOptions, queue: &str) {
    argument(options, AMQP_HEADERS_DEAD_LETTER_EXCHANGE, json!(""));
    argument(options, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, json!(queue));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockBrokerChannel, config::BrokerConfig};
    use mockall::Sequence;

    fn topology(channel: MockBrokerChannel, cfg: &BrokerConfig) -> AmqpTopology {
        let resolver = Arc::new(NameResolver::new(Arc::new(cfg.clone())));
        let mut topology = AmqpTopology::new(Arc::new(channel), resolver);
        for exch in &cfg.exchanges {
            topology = topology.exchange(exch);
        }
        for queue in &cfg.queues {
            topology = topology.queue(queue);
        }
        topology
    }

    #[tokio::test]
    async fn exchanges_are_declared_before_queues() {
        let cfg = BrokerConfig::new("amqp://localhost")
            .queue_prefix("svc")
            .queue(QueueDeclaration::new("orders").durable())
            .queue(QueueDeclaration::new("shared").ignore_prefix())
            .exchange(ExchangeDeclaration::new("events").topic());

        let mut seq = Sequence::new();
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_exchange()
            .withf(|def| def.name == "events")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_assert_queue()
            .withf(|name, options| name == "svc-orders" && options.durable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        channel
            .expect_assert_queue()
            .withf(|name, _| name == "shared")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        assert!(topology(channel, &cfg).install().await.is_empty());
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_assertion() {
        let cfg = BrokerConfig::new("amqp://localhost")
            .exchange(ExchangeDeclaration::new("broken"))
            .exchange(ExchangeDeclaration::new("events"))
            .queue(QueueDeclaration::new("a"))
            .queue(QueueDeclaration::new("b"));

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_exchange()
            .times(2)
            .returning(|def| match def.name.as_str() {
                "broken" => Err(AmqpError::DeclareExchangeError(def.name.clone())),
                _ => Ok(()),
            });
        channel
            .expect_assert_queue()
            .times(2)
            .returning(|name, _| match name {
                "a" => Err(AmqpError::DeclareQueueError(name.to_owned())),
                _ => Ok(()),
            });

        let failures = topology(channel, &cfg).install().await;

        assert_eq!(
            failures,
            vec![
                AmqpError::DeclareExchangeError("broken".to_owned()),
                AmqpError::DeclareQueueError("a".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn retry_queue_receives_dead_letters() {
        let cfg = BrokerConfig::new("amqp://localhost").queue_prefix("svc").queue(
            QueueDeclaration::new("jobs")
                .durable()
                .with_retry(5000)
                .with_dlq()
                .ttl(60000)
                .max_length(100),
        );

        let mut seq = Sequence::new();
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_queue()
            .withf(|name, options| {
                name == "svc-jobs-retry"
                    && options.durable
                    && options.arguments.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                        == Some(&json!("svc-jobs"))
                    && options.arguments.get(AMQP_HEADERS_MESSAGE_TTL) == Some(&json!(5000))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        channel
            .expect_assert_queue()
            .withf(|name, options| name == "svc-jobs-dlq" && options.arguments.is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        channel
            .expect_assert_queue()
            .withf(|name, options| {
                name == "svc-jobs"
                    && options.arguments.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE) == Some(&json!(""))
                    && options.arguments.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                        == Some(&json!("svc-jobs-retry"))
                    && options.arguments.get(AMQP_HEADERS_MESSAGE_TTL) == Some(&json!(60000))
                    && options.arguments.get(AMQP_HEADERS_MAX_LENGTH) == Some(&json!(100))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        assert!(topology(channel, &cfg).install().await.is_empty());
    }

    #[tokio::test]
    async fn dlq_receives_dead_letters_without_retry() {
        let cfg = BrokerConfig::new("amqp://localhost").queue(QueueDeclaration::new("jobs").with_dlq());

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_queue()
            .withf(|name, _| name == "jobs-dlq")
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_assert_queue()
            .withf(|name, options| {
                name == "jobs"
                    && options.arguments.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                        == Some(&json!("jobs-dlq"))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        assert!(topology(channel, &cfg).install().await.is_empty());
    }

    #[tokio::test]
    async fn failed_companion_is_not_referenced() {
        let cfg = BrokerConfig::new("amqp://localhost").queue(QueueDeclaration::new("jobs").with_dlq());

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_queue()
            .withf(|name, _| name == "jobs-dlq")
            .times(1)
            .returning(|name, _| Err(AmqpError::DeclareQueueError(name.to_owned())));
        channel
            .expect_assert_queue()
            .withf(|name, options| name == "jobs" && options.arguments.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));

        let failures = topology(channel, &cfg).install().await;

        assert_eq!(failures, vec![AmqpError::DeclareQueueError("jobs-dlq".to_owned())]);
    }
}
