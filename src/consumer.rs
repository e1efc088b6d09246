// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module subscribes callbacks to queues and runs the dispatch envelope
//! around every delivery:
//! 1. Opens a trace span parented by the context found in the headers
//! 2. Parses the body as JSON, falling back to the raw bytes
//! 3. Invokes the callback
//! 4. Acks on success, nacks on [`ConsumeError::Nack`], and acks on any other
//!    failure so a poison message never loops on the queue
//! 5. Publishes the callback's reply, only once the ack went through
//!
//! Every consumer gets its own task that processes deliveries in order;
//! distinct consumers run concurrently on the shared channel.

use crate::{
    channel::BrokerChannel,
    errors::{AmqpError, ConsumeError},
    message::{Delivery, Payload, Reply},
    name_resolver::NameResolver,
    otel,
    publisher::MessagePublisher,
    queue::QueueOptions,
    temporary_queue::TemporaryQueueRegistry,
};
use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Callback invoked for every delivery of a consumer.
///
/// `Ok(Some(reply))` publishes the reply after the ack.
pub type ConsumerCallback = Arc<
    dyn Fn(Payload, Delivery) -> BoxFuture<'static, Result<Option<Reply>, ConsumeError>>
        + Send
        + Sync,
>;

/// Wraps an async closure into a [`ConsumerCallback`].
pub fn callback<F, Fut>(f: F) -> ConsumerCallback
where
    F: Fn(Payload, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Reply>, ConsumeError>> + Send + 'static,
{
    Arc::new(move |payload, delivery| f(payload, delivery).boxed())
}

/// Broker-level options of a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Generated from the queue name when absent
    pub consumer_tag: Option<String>,
    pub exclusive: bool,
    pub no_local: bool,
}

impl ConsumeOptions {
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// A running consumer.
pub struct ConsumerHandle {
    pub queue: String,
    pub consumer_tag: String,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the delivery loop to end, which happens once the consumer
    /// is cancelled or the channel closes.
    ///
    /// Dropping the returned future before it completes keeps the handle
    /// usable; waiting again on a finished consumer returns immediately.
    ///
    /// # Returns
    /// Ok(()) when the loop ended, or `AmqpError::InternalError` when the
    /// consumer task failed
    pub async fn wait(&mut self) -> Result<(), AmqpError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };

        let result = task.await;
        self.task = None;

        result.map_err(|err| {
            error!(error = err.to_string(), queue = %self.queue, "consumer task failure");
            AmqpError::InternalError
        })
    }

    /// Consumes the handle and waits for the delivery loop to end.
    pub async fn join(mut self) -> Result<(), AmqpError> {
        self.wait().await
    }
}

pub struct MessageConsumer {
    channel: Arc<dyn BrokerChannel>,
    resolver: Arc<NameResolver>,
    temporary: Arc<TemporaryQueueRegistry>,
    publisher: Arc<MessagePublisher>,
}

impl MessageConsumer {
    /// Creates a new consumer.
    ///
    /// # Parameters
    /// * `channel` - The shared broker channel
    /// * `resolver` - Resolver for queue tokens and ephemeral names
    /// * `temporary` - Registry recording the ephemeral queues to delete
    /// * `publisher` - Publisher used to forward callback replies
    ///
    /// # Returns
    /// A new MessageConsumer instance
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        resolver: Arc<NameResolver>,
        temporary: Arc<TemporaryQueueRegistry>,
        publisher: Arc<MessagePublisher>,
    ) -> MessageConsumer {
        MessageConsumer {
            channel,
            resolver,
            temporary,
            publisher,
        }
    }

    /// Consumes the queue named by `queue`, a token or a logical name.
    ///
    /// # Parameters
    /// * `queue` - Token or logical name of the queue
    /// * `callback` - Invoked for every delivery
    /// * `options` - Consumer tag and broker flags
    ///
    /// # Returns
    /// A handle on the running consumer or AmqpError if the broker refused it
    pub async fn consume_queue(
        &self,
        queue: &str,
        callback: ConsumerCallback,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        let queue_name = self.resolver.resolve(queue);
        self.consume_resolved(&queue_name, callback, options).await
    }

    /// Consumes an ephemeral queue bound to `exchange` with `routing_key`.
    /// The queue is deleted at shutdown.
    ///
    /// The queue is declared and registered for deletion before it is bound,
    /// so a failed binding still leaves it to the teardown.
    ///
    /// # Returns
    /// A handle on the running consumer or AmqpError on the first failing
    /// step
    pub async fn consume_from_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        callback: ConsumerCallback,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        let queue_name = self.declare_temporary().await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue_name, exchange, routing_key
        );
        self.channel
            .bind_queue(&queue_name, exchange, routing_key)
            .await?;

        self.consume_resolved(&queue_name, callback, options).await
    }

    /// Consumes a fresh ephemeral queue with no binding.
    pub async fn consume_temporary_queue(
        &self,
        callback: ConsumerCallback,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        let queue_name = self.declare_temporary().await?;
        self.consume_resolved(&queue_name, callback, options).await
    }

    /// Consumes a queue by its wire name.
    pub async fn consume_resolved(
        &self,
        queue_name: &str,
        callback: ConsumerCallback,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        let consumer_tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}.{}", queue_name, Uuid::new_v4().simple()));

        let mut deliveries = self
            .channel
            .consume(queue_name, &consumer_tag, &options)
            .await?;
        debug!(queue = queue_name, consumer_tag = %consumer_tag, "consumer started");

        let channel = self.channel.clone();
        let publisher = self.publisher.clone();
        let queue = queue_name.to_owned();

        let task = tokio::spawn({
            let queue = queue.clone();
            async move {
                let tracer = global::tracer(otel::CONSUMER_TRACER);

                while let Some(result) = deliveries.next().await {
                    match result {
                        Ok(delivery) => {
                            if let Err(err) = dispatch(
                                &tracer,
                                &queue,
                                delivery,
                                &callback,
                                channel.as_ref(),
                                &publisher,
                            )
                            .await
                            {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        }

                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }

                debug!(queue = %queue, "consumer stopped");
            }
        });

        Ok(ConsumerHandle {
            queue,
            consumer_tag,
            task: Some(task),
        })
    }

    async fn declare_temporary(&self) -> Result<String, AmqpError> {
        let queue_name = self.resolver.ephemeral();

        debug!("creating temporary queue: {}", queue_name);
        self.channel
            .assert_queue(&queue_name, &temporary_options())
            .await?;
        self.temporary.register(&queue_name).await;

        Ok(queue_name)
    }
}

/// Ephemeral queues are auto-deleted by the broker once their last consumer
/// goes away, so a process that dies before shutdown leaves nothing behind.
fn temporary_options() -> QueueOptions {
    QueueOptions {
        auto_delete: true,
        ..QueueOptions::default()
    }
}

/// Runs the callback and turns a panic into a handler failure.
async fn invoke(
    callback: &ConsumerCallback,
    payload: Payload,
    delivery: Delivery,
) -> Result<Option<Reply>, ConsumeError> {
    AssertUnwindSafe(async move { callback(payload, delivery).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ConsumeError::handler(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    match (panic.downcast_ref::<&str>(), panic.downcast_ref::<String>()) {
        (Some(msg), _) => format!("handler panicked: {}", msg),
        (_, Some(msg)) => format!("handler panicked: {}", msg),
        _ => "handler panicked".to_owned(),
    }
}

/// Runs the callback for one delivery and settles it exactly once.
pub(crate) async fn dispatch(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: Delivery,
    callback: &ConsumerCallback,
    channel: &dyn BrokerChannel,
    publisher: &MessagePublisher,
) -> Result<(), AmqpError> {
    let (_ctx, mut span) = otel::new_span(&delivery, tracer, queue);
    let delivery_tag = delivery.delivery_tag;

    debug!(
        "received: {} - exchange: {} - routing key: {}",
        delivery_tag, delivery.exchange, delivery.routing_key,
    );

    let payload = Payload::parse(&delivery);
    match invoke(callback, payload, delivery).await {
        Ok(reply) => {
            debug!("message successfully processed");
            if let Err(err) = channel.ack(delivery_tag).await {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Err(err);
            }
            span.set_status(Status::Ok);

            let Some(reply) = reply else {
                return Ok(());
            };

            if let Err(err) = publisher.send_reply(&reply.target, &reply.payload).await {
                error!(error = err.to_string(), "error to publish the reply");
                span.record_error(&err);
                return Err(err);
            }
            Ok(())
        }

        Err(ConsumeError::Nack { reason, requeue }) => {
            warn!(reason = %reason, requeue, "message rejected by the handler");
            match channel.nack(delivery_tag, requeue).await {
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to nack msg"),
                    });
                    Err(err)
                }
                _ => {
                    span.set_status(Status::Error {
                        description: Cow::from("msg was rejected"),
                    });
                    Ok(())
                }
            }
        }

        Err(err) => {
            error!(
                error = err.to_string(),
                "failure to handle msg, removing message from queue"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });

            channel.ack(delivery_tag).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockBrokerChannel,
        config::BrokerConfig,
        queue::{QueueDeclaration, QueueRef},
        subscription::ReplyDescriptor,
    };
    use futures_util::stream;
    use mockall::Sequence;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn consumer(channel: MockBrokerChannel) -> (MessageConsumer, Arc<TemporaryQueueRegistry>) {
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let resolver = Arc::new(NameResolver::new(Arc::new(
            BrokerConfig::new("amqp://localhost")
                .queue_prefix("svc")
                .queue(QueueDeclaration::new("orders").token("ORDERS")),
        )));
        let temporary = Arc::new(TemporaryQueueRegistry::new(channel.clone()));
        let publisher = Arc::new(MessagePublisher::new(channel.clone(), resolver.clone()));

        (
            MessageConsumer::new(channel, resolver, temporary.clone(), publisher),
            temporary,
        )
    }

    fn deliver(channel: &mut MockBrokerChannel, queue: &'static str, deliveries: Vec<Delivery>) {
        channel
            .expect_consume()
            .withf(move |name, _, _| name == queue)
            .times(1)
            .returning(move |_, _, _| {
                Ok(stream::iter(deliveries.clone().into_iter().map(Ok)).boxed())
            });
    }

    #[tokio::test]
    async fn success_is_acked_once() {
        let mut channel = MockBrokerChannel::new();
        deliver(&mut channel, "svc-orders", vec![Delivery::new(7, br#"{"id":1}"#)]);
        channel
            .expect_ack()
            .withf(|tag| *tag == 7)
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_nack().times(0);

        let seen = Arc::new(Mutex::new(vec![]));
        let (consumer, _) = consumer(channel);
        let handle = consumer
            .consume_queue(
                "ORDERS",
                callback({
                    let seen = seen.clone();
                    move |payload, _| {
                        seen.lock().unwrap().push(payload);
                        async { Ok(None) }
                    }
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(handle.queue, "svc-orders");
        assert!(handle.consumer_tag.starts_with("svc-orders."));
        handle.join().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Payload::Json(json!({"id": 1}))]);
    }

    #[tokio::test]
    async fn nack_error_is_nacked_with_requeue_flag() {
        let mut channel = MockBrokerChannel::new();
        deliver(
            &mut channel,
            "svc-jobs",
            vec![Delivery::new(1, b"{}"), Delivery::new(2, b"{}")],
        );
        channel
            .expect_nack()
            .withf(|tag, requeue| *tag == 1 && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_nack()
            .withf(|tag, requeue| *tag == 2 && !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_ack().times(0);

        let (consumer, _) = consumer(channel);
        let handle = consumer
            .consume_queue(
                "jobs",
                callback(|_, delivery| async move {
                    if delivery.delivery_tag == 1 {
                        Err(ConsumeError::nack("retry later"))
                    } else {
                        Err(ConsumeError::reject("invalid"))
                    }
                }),
                ConsumeOptions::default().consumer_tag("jobs-worker"),
            )
            .await
            .unwrap();

        assert_eq!(handle.consumer_tag, "jobs-worker");
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn other_failures_are_acked() {
        let mut channel = MockBrokerChannel::new();
        deliver(
            &mut channel,
            "svc-jobs",
            vec![Delivery::new(1, b"{}"), Delivery::new(2, b"not-json")],
        );
        channel.expect_ack().times(2).returning(|_| Ok(()));
        channel.expect_nack().times(0);

        let (consumer, _) = consumer(channel);
        let handle = consumer
            .consume_queue(
                "jobs",
                callback(|payload, _| async move {
                    match payload {
                        Payload::Json(_) => Err(ConsumeError::handler("boom")),
                        Payload::Raw(_) => Err(ConsumeError::ParseFailed("eof".to_owned())),
                    }
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn reply_is_published_after_ack() {
        let mut seq = Sequence::new();
        let mut channel = MockBrokerChannel::new();
        deliver(&mut channel, "svc-jobs", vec![Delivery::new(3, b"{}")]);
        channel
            .expect_ack()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, key, payload, _| {
                exchange.is_empty()
                    && key == "svc-results"
                    && serde_json::from_slice::<Value>(payload).unwrap() == json!({"status": "ok"})
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        let (consumer, _) = consumer(channel);
        let handle = consumer
            .consume_queue(
                "jobs",
                callback(|_, _| async {
                    Ok(Some(Reply::new(
                        ReplyDescriptor::queue(QueueRef::name("results")),
                        json!({"status": "ok"}),
                    )))
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn failed_ack_suppresses_reply() {
        let mut channel = MockBrokerChannel::new();
        deliver(&mut channel, "svc-jobs", vec![Delivery::new(3, b"{}")]);
        channel
            .expect_ack()
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError));
        channel.expect_publish().times(0);

        let (consumer, _) = consumer(channel);
        let handle = consumer
            .consume_queue(
                "jobs",
                callback(|_, _| async {
                    Ok(Some(Reply::new(
                        ReplyDescriptor::exchange("results", "done"),
                        json!({}),
                    )))
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn stream_errors_do_not_stop_the_consumer() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_consume().times(1).returning(|_, _, _| {
            Ok(stream::iter(vec![
                Err(AmqpError::ConsumerError("frame".to_owned())),
                Ok(Delivery::new(9, b"{}")),
            ])
            .boxed())
        });
        channel
            .expect_ack()
            .withf(|tag| *tag == 9)
            .times(1)
            .returning(|_| Ok(()));

        let (consumer, _) = consumer(channel);
        let handle = consumer
            .consume_queue("jobs", callback(|_, _| async { Ok(None) }), ConsumeOptions::default())
            .await
            .unwrap();

        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn exchange_subscription_declares_registers_and_binds() {
        let mut seq = Sequence::new();
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_queue()
            .withf(|name, options| name.starts_with("svc-") && options.auto_delete)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|queue, exchange, key| {
                queue.starts_with("svc-") && exchange == "events" && key == "created"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_consume()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(stream::empty().boxed()));

        let (consumer, temporary) = consumer(channel);
        let handle = consumer
            .consume_from_exchange(
                "events",
                "created",
                callback(|_, _| async { Ok(None) }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        assert!(temporary.contains(&handle.queue).await);
        assert_eq!(temporary.len().await, 1);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn temporary_queue_is_not_bound() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_queue()
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_bind_queue().times(0);
        channel
            .expect_consume()
            .times(1)
            .returning(|_, _, _| Ok(stream::empty().boxed()));

        let (consumer, temporary) = consumer(channel);
        let handle = consumer
            .consume_temporary_queue(callback(|_, _| async { Ok(None) }), ConsumeOptions::default())
            .await
            .unwrap();

        assert!(temporary.contains(&handle.queue).await);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn failed_declaration_registers_nothing() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_queue()
            .times(1)
            .returning(|name, _| Err(AmqpError::DeclareQueueError(name.to_owned())));
        channel.expect_consume().times(0);

        let (consumer, temporary) = consumer(channel);
        let result = consumer
            .consume_temporary_queue(callback(|_, _| async { Ok(None) }), ConsumeOptions::default())
            .await;

        assert!(matches!(result, Err(AmqpError::DeclareQueueError(_))));
        assert_eq!(temporary.len().await, 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_acked_and_consumer_keeps_running() {
        let mut channel = MockBrokerChannel::new();
        deliver(
            &mut channel,
            "svc-jobs",
            vec![Delivery::new(1, b"{}"), Delivery::new(2, b"{}")],
        );
        channel.expect_ack().times(2).returning(|_| Ok(()));
        channel.expect_nack().times(0);
        channel.expect_publish().times(0);

        let (consumer, _) = consumer(channel);
        let handle = consumer
            .consume_queue(
                "jobs",
                callback(|_, delivery| async move {
                    if delivery.delivery_tag == 1 {
                        panic!("boom");
                    }
                    Err(ConsumeError::handler("second failure"))
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn panic_before_the_future_is_built_is_contained() {
        let mut channel = MockBrokerChannel::new();
        deliver(&mut channel, "svc-jobs", vec![Delivery::new(4, b"{}")]);
        channel
            .expect_ack()
            .withf(|tag| *tag == 4)
            .times(1)
            .returning(|_| Ok(()));

        let failing: ConsumerCallback = Arc::new(
            |_: Payload, _: Delivery| -> BoxFuture<'static, Result<Option<Reply>, ConsumeError>> {
                panic!("not even a future")
            },
        );
        let (consumer, _) = consumer(channel);
        let handle = consumer
            .consume_queue("jobs", failing, ConsumeOptions::default())
            .await
            .unwrap();

        handle.join().await.unwrap();
    }

    #[test]
    fn panic_payloads_are_described() {
        assert_eq!(panic_message(&"boom"), "handler panicked: boom");
        assert_eq!(
            panic_message(&"owned".to_owned()),
            "handler panicked: owned"
        );
        assert_eq!(panic_message(&7_u8), "handler panicked");
    }

    #[tokio::test]
    async fn interrupted_wait_keeps_the_handle_usable() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_consume()
            .times(1)
            .returning(|_, _, _| Ok(stream::pending().boxed()));

        let (consumer, _) = consumer(channel);
        let mut handle = consumer
            .consume_queue("jobs", callback(|_, _| async { Ok(None) }), ConsumeOptions::default())
            .await
            .unwrap();

        let waited = tokio::time::timeout(std::time::Duration::from_millis(10), handle.wait()).await;

        assert!(waited.is_err());
        assert!(!handle.is_finished());
    }
}
