// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module owns the broker connection and the single channel shared by
//! every consumer and publisher. The [`BrokerChannel`] trait is the narrow set
//! of channel primitives the rest of the crate relies on; [`AmqpChannel`]
//! implements it on top of `lapin`.
//!
//! `lapin::Channel` serialises frames internally, so the shared channel can be
//! used from many tasks at once without an extra lock.

use crate::{
    config::BrokerConfig, consumer::ConsumeOptions, errors::AmqpError,
    exchange::ExchangeDeclaration, message::Delivery, queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Channel primitives used by the subscriber layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares an exchange.
    async fn assert_exchange(&self, def: &ExchangeDeclaration) -> Result<(), AmqpError>;

    /// Declares a queue with its wire name.
    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange with the given routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer on a queue. Acknowledgments are manual.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Stops a consumer; its delivery stream ends once the broker confirms.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Publishes a payload. An empty exchange targets the queue named by
    /// the routing key.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError>;

    /// Sets the QoS limit of unacknowledged deliveries.
    async fn prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError>;
}

/// `lapin` backed implementation of [`BrokerChannel`].
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> AmqpChannel {
        AmqpChannel { channel }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_exchange(&self, def: &ExchangeDeclaration) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.options.durable,
                    auto_delete: def.options.auto_delete,
                    internal: def.options.internal,
                    nowait: false,
                },
                def.options.field_table(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = %def.name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                options.field_table(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: false,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        // publisher confirms are not awaited
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the queue");
                Err(AmqpError::DeleteQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }
}

/// Owns the broker connection and the single shared channel.
pub struct ConnectionManager {
    connection: Connection,
    channel: Arc<dyn BrokerChannel>,
}

impl ConnectionManager {
    /// Connects to the broker and opens the shared channel.
    ///
    /// A single attempt is made. On failure the error is logged at the
    /// configured severity and `None` is returned so the hosting process
    /// keeps running without messaging.
    pub async fn connect(cfg: &BrokerConfig) -> Option<ConnectionManager> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let connection = match Connection::connect(&cfg.url, options).await {
            Ok(c) => c,
            Err(err) => {
                cfg.log_level.log(&err, "failure to connect");
                return None;
            }
        };
        debug!("amqp connected");

        let level = cfg.log_level;
        connection.on_error(move |err| level.log(&err, "amqp connection error"));

        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(c) => AmqpChannel::new(c),
            Err(err) => {
                cfg.log_level.log(&err, "error to create the channel");
                return None;
            }
        };

        if let Err(err) = channel
            .prefetch(cfg.prefetch_count, cfg.prefetch_global)
            .await
        {
            cfg.log_level.log(&err, "error to configure the channel qos");
            return None;
        }
        debug!("channel created");

        Some(ConnectionManager {
            connection,
            channel: Arc::new(channel),
        })
    }

    /// Lends the shared channel.
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    /// Closes the connection. Failures are logged only.
    pub async fn close(&self) {
        if let Err(err) = self.connection.close(200, "shutdown").await {
            error!(error = err.to_string(), "error to close the connection");
        }
    }
}
