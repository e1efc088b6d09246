// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! This module provides the types used to declare and reference queues.
//! A [`QueueDeclaration`] is what the configuration carries for every queue
//! known ahead of time; it may expose a stable token so application code can
//! refer to the queue without knowing its wire name. A [`QueueRef`] is how
//! subscribers and replies point at a queue. Declarations can also request a
//! Dead Letter Queue (DLQ) and a retry queue, which are asserted alongside the
//! main queue.

use crate::arguments;
use lapin::types::FieldTable;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Reference to a queue, either through its configured token or its
/// literal logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueRef {
    Token(String),
    Name(String),
}

impl QueueRef {
    pub fn token(token: &str) -> Self {
        QueueRef::Token(token.to_owned())
    }

    pub fn name(name: &str) -> Self {
        QueueRef::Name(name.to_owned())
    }
}

/// Broker-level options used when a queue is declared.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, serde_json::Value>,
}

impl QueueOptions {
    pub(crate) fn field_table(&self) -> FieldTable {
        arguments::field_table(&self.arguments)
    }
}

/// Delay applied by the retry queue before a rejected message returns to
/// its main queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Time in milliseconds a message waits in the retry queue
    pub ttl: i32,
}

/// Definition of a queue known at configuration time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub ignore_prefix: bool,
    #[serde(default)]
    pub options: QueueOptions,
    #[serde(default)]
    pub ttl: Option<i32>,
    #[serde(default)]
    pub max_length: Option<i32>,
    #[serde(default)]
    pub max_length_bytes: Option<i32>,
    #[serde(default)]
    pub dlq: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl QueueDeclaration {
    /// Creates a new queue declaration with the given logical name.
    ///
    /// By default the queue is non-durable, non-exclusive, has no token and
    /// receives the global prefix.
    pub fn new(name: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: name.to_owned(),
            ..QueueDeclaration::default()
        }
    }

    /// Exposes the queue under a stable token.
    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_owned());
        self
    }

    /// Never applies the global prefix to this queue.
    pub fn ignore_prefix(mut self) -> Self {
        self.ignore_prefix = true;
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.options.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.options.exclusive = true;
        self
    }

    pub fn argument(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.arguments.insert(key.to_owned(), value);
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) named after the queue with a "-dlq"
    /// suffix. Rejected messages land there unless a retry queue is set.
    pub fn with_dlq(mut self) -> Self {
        self.dlq = true;
        self
    }

    /// Adds a retry queue named after the queue with a "-retry" suffix.
    /// Rejected messages wait `ttl` milliseconds there, then return to the
    /// main queue.
    pub fn with_retry(mut self, ttl: i32) -> Self {
        self.retry = Some(RetryPolicy { ttl });
        self
    }
}

pub(crate) fn dlq_name(wire_name: &str) -> String {
    format!("{}-dlq", wire_name)
}

pub(crate) fn retry_name(wire_name: &str) -> String {
    format!("{}-retry", wire_name)
}
