// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! The registry wires the whole layer together. On [`start`] it validates
//! the registered subscribers, connects, optionally asserts the configured
//! topology and starts one consumer per subscriber. On [`shutdown`] it
//! cancels the consumers, deletes the ephemeral queues and closes the
//! connection.
//!
//! A broker that cannot be reached does not fail the startup: the registry
//! enters [`RegistryState::Degraded`] and the channel-dependent components
//! stay unavailable.
//!
//! [`start`]: SubscriptionRegistry::start
//! [`shutdown`]: SubscriptionRegistry::shutdown

use crate::{
    channel::{BrokerChannel, ConnectionManager},
    config::BrokerConfig,
    consumer::{self, ConsumeOptions, ConsumerCallback, ConsumerHandle, MessageConsumer},
    errors::AmqpError,
    message::Reply,
    name_resolver::NameResolver,
    publisher::MessagePublisher,
    subscription::{ReplyDescriptor, Subscriber, SubscriptionDescriptor},
    temporary_queue::TemporaryQueueRegistry,
    topology::AmqpTopology,
};
use futures_util::future::join_all;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Lifecycle of a [`SubscriptionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Connecting,
    TopologyAsserted,
    Dispatching,
    /// The broker was unreachable; nothing is consumed or published
    Degraded,
    Destroyed,
}

struct Components {
    channel: Arc<dyn BrokerChannel>,
    temporary: Arc<TemporaryQueueRegistry>,
    publisher: Arc<MessagePublisher>,
    consumer: Arc<MessageConsumer>,
}

pub struct SubscriptionRegistry {
    config: Arc<BrokerConfig>,
    resolver: Arc<NameResolver>,
    subscribers: Vec<Subscriber>,
    state: RegistryState,
    connection: Option<ConnectionManager>,
    components: Option<Components>,
    handles: Vec<ConsumerHandle>,
}

impl SubscriptionRegistry {
    /// Creates an unstarted registry.
    ///
    /// # Parameters
    /// * `config` - Broker configuration, shared read-only afterwards
    ///
    /// # Returns
    /// A registry in the `Uninitialized` state
    pub fn new(config: BrokerConfig) -> SubscriptionRegistry {
        let config = Arc::new(config);

        SubscriptionRegistry {
            resolver: Arc::new(NameResolver::new(config.clone())),
            config,
            subscribers: vec![],
            state: RegistryState::Uninitialized,
            connection: None,
            components: None,
            handles: vec![],
        }
    }

    /// Registers a subscriber to start with the registry.
    pub fn subscriber(mut self, subscriber: Subscriber) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    pub fn resolver(&self) -> Arc<NameResolver> {
        self.resolver.clone()
    }

    /// `None` until the registry started with a reachable broker.
    pub fn publisher(&self) -> Option<Arc<MessagePublisher>> {
        self.components.as_ref().map(|c| c.publisher.clone())
    }

    /// `None` until the registry started with a reachable broker.
    pub fn consumer(&self) -> Option<Arc<MessageConsumer>> {
        self.components.as_ref().map(|c| c.consumer.clone())
    }

    /// Queues consumed by the registered subscribers.
    pub fn queues(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.queue.as_str()).collect()
    }

    /// Validates the subscribers, connects and starts consuming.
    ///
    /// Only a configuration error fails the startup. Connection failures
    /// leave the registry degraded.
    pub async fn start(&mut self) -> Result<(), AmqpError> {
        self.validate()?;

        self.state = RegistryState::Connecting;
        self.connection = ConnectionManager::connect(&self.config).await;
        let channel = self.connection.as_ref().map(|c| c.channel());

        self.start_with_channel(channel).await
    }

    /// Starts the registry on an already opened channel. `None` stands for
    /// an unreachable broker.
    ///
    /// # Parameters
    /// * `channel` - The shared broker channel, if any
    ///
    /// # Returns
    /// Ok(()) unless a subscriber declaration is invalid
    pub async fn start_with_channel(
        &mut self,
        channel: Option<Arc<dyn BrokerChannel>>,
    ) -> Result<(), AmqpError> {
        if !matches!(
            self.state,
            RegistryState::Uninitialized | RegistryState::Connecting
        ) {
            warn!(state = ?self.state, "subscription registry already started");
            return Ok(());
        }

        self.validate()?;

        let Some(channel) = channel else {
            warn!("broker unavailable, subscribers will not be started");
            self.state = RegistryState::Degraded;
            return Ok(());
        };

        let temporary = Arc::new(TemporaryQueueRegistry::new(channel.clone()));
        let publisher = Arc::new(MessagePublisher::new(channel.clone(), self.resolver.clone()));
        let consumer = Arc::new(MessageConsumer::new(
            channel.clone(),
            self.resolver.clone(),
            temporary.clone(),
            publisher.clone(),
        ));

        if self.config.assert {
            self.assert_topology(channel.clone()).await;
            self.state = RegistryState::TopologyAsserted;
        }

        for subscriber in &self.subscribers {
            match self.register(&channel, &consumer, subscriber).await {
                Ok(handle) => {
                    debug!(
                        subscriber = %subscriber.name,
                        queue = %handle.queue,
                        "subscriber registered"
                    );
                    self.handles.push(handle);
                }
                Err(err) => error!(
                    error = err.to_string(),
                    subscriber = %subscriber.name,
                    "failure to register the subscriber"
                ),
            }
        }

        self.components = Some(Components {
            channel,
            temporary,
            publisher,
            consumer,
        });
        self.state = RegistryState::Dispatching;

        Ok(())
    }

    /// Blocks until every consumer stopped.
    ///
    /// The consumers stay registered, so the returned future may be dropped
    /// (e.g. raced against a termination signal) and [`shutdown`] still
    /// cancels all of them.
    ///
    /// # Returns
    /// Ok(()) or the last consumer task failure
    ///
    /// [`shutdown`]: SubscriptionRegistry::shutdown
    pub async fn consume_blocking(&mut self) -> Result<(), AmqpError> {
        let mut result = Ok(());
        for res in join_all(self.handles.iter_mut().map(ConsumerHandle::wait)).await {
            if let Err(err) = res {
                result = Err(err);
            }
        }

        result
    }

    /// Shuts the registry down:
    /// 1. Cancels every consumer so no new delivery is accepted
    /// 2. Waits, up to `shutdown_timeout_ms` per consumer, for the handlers
    ///    already running to finish and settle their message
    /// 3. Deletes the ephemeral queues
    /// 4. Closes the connection
    ///
    /// # Returns
    /// The ephemeral queues that could not be deleted
    pub async fn shutdown(&mut self) -> Vec<(String, AmqpError)> {
        if self.state == RegistryState::Destroyed {
            return vec![];
        }

        let mut failures = vec![];

        if let Some(components) = self.components.take() {
            for handle in &self.handles {
                debug!(consumer_tag = %handle.consumer_tag, "cancelling consumer");
                if let Err(err) = components.channel.cancel(&handle.consumer_tag).await {
                    error!(
                        error = err.to_string(),
                        consumer_tag = %handle.consumer_tag,
                        "failure to cancel the consumer"
                    );
                }
            }

            self.drain_consumers().await;
            failures = components.temporary.teardown().await;
        }
        self.handles.clear();

        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }

        self.state = RegistryState::Destroyed;
        debug!("subscription registry destroyed");

        failures
    }

    async fn drain_consumers(&mut self) {
        let grace = Duration::from_millis(self.config.shutdown_timeout_ms);

        for handle in self.handles.iter_mut() {
            let consumer_tag = handle.consumer_tag.clone();
            if timeout(grace, handle.wait()).await.is_err() {
                warn!(consumer_tag = %consumer_tag, "consumer did not stop in time");
            }
        }
    }

    /// Every queue token referenced by a subscriber must be configured and
    /// every parameter index must be in range.
    fn validate(&self) -> Result<(), AmqpError> {
        for subscriber in &self.subscribers {
            if let Err(err) = subscriber.bindings.validate() {
                error!(
                    error = err.to_string(),
                    subscriber = %subscriber.name,
                    "invalid subscriber declaration"
                );
                return Err(err);
            }

            let reply = match &subscriber.reply {
                Some(ReplyDescriptor::Queue(queue)) => Some(queue),
                _ => None,
            };

            for queue in subscriber.subscription.queue_ref().into_iter().chain(reply) {
                if let Err(err) = self.resolver.resolve_ref(queue) {
                    error!(
                        error = err.to_string(),
                        subscriber = %subscriber.name,
                        "invalid subscriber declaration"
                    );
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    async fn assert_topology(&self, channel: Arc<dyn BrokerChannel>) {
        let mut topology = AmqpTopology::new(channel, self.resolver.clone());
        for exch in &self.config.exchanges {
            topology = topology.exchange(exch);
        }
        for queue in &self.config.queues {
            topology = topology.queue(queue);
        }

        let failures = topology.install().await;
        if !failures.is_empty() {
            warn!(failures = failures.len(), "topology partially asserted");
        }
    }

    async fn register(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        consumer: &MessageConsumer,
        subscriber: &Subscriber,
    ) -> Result<ConsumerHandle, AmqpError> {
        let callback = subscriber_callback(subscriber);
        let options = ConsumeOptions::default();

        match &subscriber.subscription {
            SubscriptionDescriptor::Queue(queue) => {
                let queue_name = self.resolver.resolve_ref(queue)?;
                consumer.consume_resolved(&queue_name, callback, options).await
            }
            SubscriptionDescriptor::Exchange {
                exchange,
                routing_key,
                queue: Some(queue),
            } => {
                let queue_name = self.resolver.resolve_ref(queue)?;
                channel.bind_queue(&queue_name, exchange, routing_key).await?;
                consumer.consume_resolved(&queue_name, callback, options).await
            }
            SubscriptionDescriptor::Exchange {
                exchange,
                routing_key,
                queue: None,
            } => {
                consumer
                    .consume_from_exchange(exchange, routing_key, callback, options)
                    .await
            }
            SubscriptionDescriptor::Temporary => {
                consumer.consume_temporary_queue(callback, options).await
            }
        }
    }
}

/// Adapts a subscriber to the consumer callback: projects the delivery into
/// the handler arguments and turns the handler output into a reply.
fn subscriber_callback(subscriber: &Subscriber) -> ConsumerCallback {
    let name = subscriber.name.clone();
    let handler = subscriber.handler.clone();
    let bindings = subscriber.bindings.clone();
    let target = subscriber.reply.clone();

    consumer::callback(move |_, delivery| {
        let name = name.clone();
        let handler = handler.clone();
        let bindings = bindings.clone();
        let target = target.clone();

        async move {
            let args = bindings.project(&delivery)?;

            debug!(subscriber = %name, "invoking handler");
            let output = handler.handle(args).await?;

            Ok(reply(target, output))
        }
    })
}

fn reply(target: Option<ReplyDescriptor>, output: Option<Value>) -> Option<Reply> {
    match (target, output) {
        (Some(target), Some(payload)) if !payload.is_null() => Some(Reply::new(target, payload)),
        _ => None,
    }
}
