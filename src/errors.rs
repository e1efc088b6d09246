// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Two families of errors live here. `AmqpError` covers every broker-level
//! operation (connection, channel, topology, consume, publish) as well as
//! configuration problems detected at startup. `ConsumeError` is what a
//! message callback or subscriber handler returns; its variant decides
//! whether the dispatch envelope acks or nacks the delivery.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The payload could not be serialized to JSON
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error receiving a delivery from the consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A subscriber or reply references a queue token that is not configured
    #[error("queue token `{0}` is not configured")]
    UnknownQueueToken(String),

    /// The configuration sources could not be loaded
    #[error("failure to load configuration: {0}")]
    ConfigError(String),
}

/// Failure returned by a message callback.
///
/// Only [`ConsumeError::Nack`] causes the delivery to be negatively
/// acknowledged. Every other variant is logged and the delivery is acked,
/// so a message that keeps failing never loops on the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    /// Explicit request to nack the delivery.
    ///
    /// With `requeue` the broker redelivers the message, without it the
    /// message is dropped or dead-lettered according to the queue arguments.
    #[error("message rejected: {reason}")]
    Nack { reason: String, requeue: bool },

    /// The body was not valid JSON but a bound parameter needs its content
    #[error("failure to parse message content: {0}")]
    ParseFailed(String),

    /// Any other failure raised while handling the message
    #[error("handler failure: {0}")]
    Handler(String),
}

impl ConsumeError {
    /// Nacks the delivery and asks the broker to requeue it.
    pub fn nack<T: ToString>(reason: T) -> Self {
        Self::Nack {
            reason: reason.to_string(),
            requeue: true,
        }
    }

    /// Nacks the delivery without requeue, sending it to the dead-letter
    /// exchange when the queue has one.
    pub fn reject<T: ToString>(reason: T) -> Self {
        Self::Nack {
            reason: reason.to_string(),
            requeue: false,
        }
    }

    /// Generic handler failure; the delivery is logged and acked.
    pub fn handler<T: ToString>(message: T) -> Self {
        Self::Handler(message.to_string())
    }

    /// Tells whether the delivery will be negatively acknowledged.
    pub fn is_nack(&self) -> bool {
        matches!(self, Self::Nack { .. })
    }
}

impl From<serde_json::Error> for ConsumeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Handler(err.to_string())
    }
}
