// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! Exchanges are the routing entities of the broker. This module defines the
//! supported exchange kinds and the declaration the configuration carries for
//! each exchange that should be asserted at startup.

use crate::arguments;
use lapin::types::FieldTable;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges a declaration may request.
///
/// - Direct: exact match of routing keys
/// - Fanout: every bound queue regardless of routing keys
/// - Topic: wildcard pattern matching of routing keys
/// - Headers: header values instead of routing keys
/// - Match: the AMQP `match` type, passed to the broker verbatim
/// - XMessageDelayed: delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Match,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Match => lapin::ExchangeKind::Custom("match".to_owned()),
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Options sent along with an exchange declaration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: BTreeMap<String, serde_json::Value>,
}

impl ExchangeOptions {
    pub(crate) fn field_table(&self) -> FieldTable {
        arguments::field_table(&self.arguments)
    }
}

/// An exchange the broker should have before subscribers are wired.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExchangeDeclaration {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub options: ExchangeOptions,
}

impl ExchangeDeclaration {
    /// Creates a new direct exchange declaration with the given name.
    pub fn new(name: &str) -> ExchangeDeclaration {
        ExchangeDeclaration {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            options: ExchangeOptions::default(),
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed exchange routing like `inner` once the delay expires.
    ///
    /// This requires the x-delayed-message plugin to be installed on the broker.
    pub fn delayed(mut self, inner: ExchangeKind) -> Self {
        let inner = match inner {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            _ => "direct",
        };
        self.kind = ExchangeKind::XMessageDelayed;
        self.options.arguments.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            serde_json::Value::from(inner),
        );
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.options.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.options.internal = true;
        self
    }

    pub fn argument(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.arguments.insert(key.to_owned(), value);
        self
    }
}
