// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Name Resolution
//!
//! Application code refers to queues by token or by logical name; the broker
//! only knows wire names. The resolver maps one to the other using the
//! configured tokens, the global prefix and each declaration's
//! `ignore_prefix` flag. It performs no I/O and never fails for literal names.

use crate::{config::BrokerConfig, errors::AmqpError, queue::QueueRef};
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NameResolver {
    config: Arc<BrokerConfig>,
    tokens: HashMap<String, String>,
}

impl NameResolver {
    pub fn new(config: Arc<BrokerConfig>) -> NameResolver {
        let tokens = config
            .queues
            .iter()
            .filter_map(|queue| {
                queue
                    .token
                    .as_ref()
                    .map(|token| (token.clone(), queue.name.clone()))
            })
            .collect();

        NameResolver { config, tokens }
    }

    /// Resolves a token or literal logical name to its wire name.
    pub fn resolve(&self, name_or_token: &str) -> String {
        let logical = self
            .tokens
            .get(name_or_token)
            .map(String::as_str)
            .unwrap_or(name_or_token);

        self.resolve_prefix(logical)
    }

    /// Applies the global prefix to a logical name unless its declaration
    /// opts out.
    pub fn resolve_prefix(&self, logical: &str) -> String {
        let ignore = self
            .config
            .queue_declaration(logical)
            .map(|queue| queue.ignore_prefix)
            .unwrap_or(false);

        match &self.config.queue_prefix {
            Some(prefix) if !ignore => format!("{}-{}", prefix, logical),
            _ => logical.to_owned(),
        }
    }

    /// Resolves a queue reference. A token must be configured.
    ///
    /// # Returns
    /// The wire name, or `AmqpError::UnknownQueueToken`
    pub fn resolve_ref(&self, queue: &QueueRef) -> Result<String, AmqpError> {
        match queue {
            QueueRef::Token(token) => match self.tokens.get(token) {
                Some(logical) => Ok(self.resolve_prefix(logical)),
                None => Err(AmqpError::UnknownQueueToken(token.clone())),
            },
            QueueRef::Name(name) => Ok(self.resolve(name)),
        }
    }

    pub fn has_token(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    /// Generates a fresh wire name for an ephemeral queue.
    pub fn ephemeral(&self) -> String {
        self.resolve_prefix(&Uuid::new_v4().to_string())
    }
}
