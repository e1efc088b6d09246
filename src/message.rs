// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Incoming deliveries and the values a consumer callback works with.

use crate::subscription::ReplyDescriptor;
use lapin::{protocol::basic::AMQPProperties, types::FieldTable};
use serde_json::Value;

/// A message handed to a consumer by the broker.
///
/// The delivery tag identifies the in-flight message on the channel; it must
/// be acked or nacked exactly once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: AMQPProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: &[u8]) -> Delivery {
        Delivery {
            delivery_tag,
            data: data.to_vec(),
            ..Delivery::default()
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.properties = self.properties.with_headers(headers);
        self
    }

    /// Headers of the message, empty when the publisher sent none.
    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    /// Parses the body as JSON.
    pub fn content(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Body of a delivery as seen by a consumer callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The body parsed as JSON
    Json(Value),
    /// The body was not valid JSON and is passed through untouched
    Raw(Vec<u8>),
}

impl Payload {
    pub(crate) fn parse(delivery: &Delivery) -> Payload {
        match delivery.content() {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(delivery.data.clone()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }
}

/// A message to publish once the delivery that produced it has been acked.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub target: ReplyDescriptor,
    pub payload: Value,
}

impl Reply {
    pub fn new(target: ReplyDescriptor, payload: Value) -> Reply {
        Reply { target, payload }
    }
}
