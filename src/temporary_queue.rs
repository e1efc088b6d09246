// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Bookkeeping for queues generated at runtime.

use crate::{channel::BrokerChannel, errors::AmqpError};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Tracks ephemeral queues so they can be deleted at shutdown.
///
/// This registry is the only component that deletes those queues.
pub struct TemporaryQueueRegistry {
    channel: Arc<dyn BrokerChannel>,
    registry: Mutex<HashSet<String>>,
}

impl TemporaryQueueRegistry {
    /// Creates an empty registry deleting queues through `channel`.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> TemporaryQueueRegistry {
        TemporaryQueueRegistry {
            channel,
            registry: Mutex::new(HashSet::default()),
        }
    }

    /// Records a queue name. Registering the same name twice is a no-op.
    pub async fn register(&self, queue_name: &str) {
        if self.registry.lock().await.insert(queue_name.to_owned()) {
            debug!(queue = queue_name, "temporary queue registered");
        }
    }

    /// Tells whether `queue_name` is awaiting deletion.
    pub async fn contains(&self, queue_name: &str) -> bool {
        self.registry.lock().await.contains(queue_name)
    }

    /// Number of queues awaiting deletion.
    pub async fn len(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Deletes every registered queue.
    ///
    /// A failed deletion does not stop the sweep; each failure is logged and
    /// returned with the queue name.
    ///
    /// # Returns
    /// The queues that could not be deleted, with the error of each attempt
    pub async fn teardown(&self) -> Vec<(String, AmqpError)> {
        let queues: Vec<String> = self.registry.lock().await.drain().collect();
        let mut failures = vec![];

        for queue in queues {
            debug!(queue = %queue, "deleting temporary queue");
            if let Err(err) = self.channel.delete_queue(&queue).await {
                error!(error = err.to_string(), queue = %queue, "failure to delete temporary queue");
                failures.push((queue, err));
            }
        }

        failures
    }
}
