// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes JSON payloads either to a queue (through the default
//! exchange, after name resolution) or to an exchange with a routing key. The
//! current OpenTelemetry context is propagated in the message headers.
//!
//! Publishing is fire-and-forget: publisher confirms are not awaited.

use crate::{
    channel::BrokerChannel, errors::AmqpError, name_resolver::NameResolver,
    otel::RabbitMQTracePropagator, subscription::ReplyDescriptor,
};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::{global, Context};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode marking a message as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Header values accepted by [`PublishOptions`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
}

/// Per-message publishing options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub headers: HashMap<String, HeaderValue>,
    pub msg_type: Option<String>,
    pub persistent: bool,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds
    pub expiration: Option<String>,
}

impl PublishOptions {
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn expiration(mut self, ttl_ms: u64) -> Self {
        self.expiration = Some(ttl_ms.to_string());
        self
    }
}

/// Sends payloads to queues and exchanges over the shared channel.
pub struct MessagePublisher {
    channel: Arc<dyn BrokerChannel>,
    resolver: Arc<NameResolver>,
}

impl MessagePublisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - The shared broker channel
    /// * `resolver` - Resolver used to turn queue tokens into wire names
    ///
    /// # Returns
    /// A new MessagePublisher instance
    pub fn new(channel: Arc<dyn BrokerChannel>, resolver: Arc<NameResolver>) -> MessagePublisher {
        MessagePublisher { channel, resolver }
    }

    /// Sends `payload` to the queue named by `queue`, a token or a logical
    /// name, through the default exchange.
    ///
    /// # Parameters
    /// * `queue` - Token or logical name of the target queue
    /// * `payload` - Value serialized to JSON as the message body
    /// * `options` - Per-message headers and properties
    ///
    /// # Returns
    /// Ok(()) once the message was handed to the channel, or AmqpError on
    /// serialization or publishing failure
    pub async fn send_to_queue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let queue_name = self.resolver.resolve(queue);
        let data = serialize(payload)?;

        debug!(queue = %queue_name, "sending message to queue");
        self.channel
            .publish("", &queue_name, &data, self.properties(options))
            .await
    }

    /// Publishes `payload` to an exchange. Exchange names are used verbatim.
    ///
    /// # Parameters
    /// * `exchange` - Name of the target exchange
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Value serialized to JSON as the message body
    /// * `options` - Per-message headers and properties
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn publish_to_exchange<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let data = serialize(payload)?;

        debug!(exchange, routing_key, "publishing message to exchange");
        self.channel
            .publish(exchange, routing_key, &data, self.properties(options))
            .await
    }

    /// Forwards a handler result to its declared reply target.
    ///
    /// # Returns
    /// `AmqpError::UnknownQueueToken` when the target token is not configured,
    /// otherwise the outcome of the publish
    pub async fn send_reply<T: Serialize + ?Sized>(
        &self,
        target: &ReplyDescriptor,
        payload: &T,
    ) -> Result<(), AmqpError> {
        match target {
            ReplyDescriptor::Queue(queue) => {
                let queue_name = self.resolver.resolve_ref(queue)?;
                let data = serialize(payload)?;

                debug!(queue = %queue_name, "sending reply to queue");
                self.channel
                    .publish("", &queue_name, &data, self.properties(&PublishOptions::default()))
                    .await
            }
            ReplyDescriptor::Exchange {
                exchange,
                routing_key,
            } => {
                self.publish_to_exchange(exchange, routing_key, payload, &PublishOptions::default())
                    .await
            }
        }
    }

    fn properties(&self, options: &PublishOptions) -> BasicProperties {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(
                &Context::current(),
                &mut RabbitMQTracePropagator::new(&mut btree),
            )
        });

        btree_map(&options.headers, &mut btree);

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));

        if let Some(msg_type) = &options.msg_type {
            props = props.with_type(ShortString::from(msg_type.clone()));
        }
        if options.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        if let Some(id) = &options.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(reply_to) = &options.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.clone()));
        }
        if let Some(expiration) = &options.expiration {
            props = props.with_expiration(ShortString::from(expiration.clone()));
        }

        props
    }
}

fn serialize<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::SerializePayloadError(err.to_string())
    })
}

/// Converts the option headers into AMQP values.
fn btree_map(hash_map: &HashMap<String, HeaderValue>, btree: &mut BTreeMap<ShortString, AMQPValue>) {
    for (key, value) in hash_map {
        let amqp_value = match value.clone() {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }
}
