// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber Declarations
//!
//! A [`Subscriber`] tells the registry what a handler consumes
//! ([`SubscriptionDescriptor`]), which parts of the message it expects as
//! positional arguments ([`ParameterBindingMap`]) and, optionally, where its
//! return value should be forwarded ([`ReplyDescriptor`]).
//!
//! ```ignore
//! let subscriber = Subscriber::new("order-created", handler)
//!     .subscription(SubscriptionDescriptor::exchange("events", "order.created"))
//!     .bindings(ParameterBindingMap::new().content(0).headers(1))
//!     .reply(ReplyDescriptor::queue(QueueRef::name("results")));
//! ```

use crate::{
    errors::{AmqpError, ConsumeError},
    message::Delivery,
    queue::QueueRef,
};
use async_trait::async_trait;
use lapin::types::FieldTable;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::BTreeMap, future::Future, sync::Arc};

/// What a subscriber consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionDescriptor {
    /// A configured or literal queue
    Queue(QueueRef),
    /// An exchange and routing key. Without a queue an ephemeral queue is
    /// generated and bound.
    Exchange {
        exchange: String,
        routing_key: String,
        queue: Option<QueueRef>,
    },
    /// An ephemeral queue with no binding
    Temporary,
}

impl SubscriptionDescriptor {
    pub fn queue(queue: QueueRef) -> Self {
        SubscriptionDescriptor::Queue(queue)
    }

    pub fn exchange(exchange: &str, routing_key: &str) -> Self {
        SubscriptionDescriptor::Exchange {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            queue: None,
        }
    }

    pub fn exchange_queue(exchange: &str, routing_key: &str, queue: QueueRef) -> Self {
        SubscriptionDescriptor::Exchange {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            queue: Some(queue),
        }
    }

    pub(crate) fn queue_ref(&self) -> Option<&QueueRef> {
        match self {
            SubscriptionDescriptor::Queue(queue) => Some(queue),
            SubscriptionDescriptor::Exchange { queue, .. } => queue.as_ref(),
            SubscriptionDescriptor::Temporary => None,
        }
    }
}

/// Where the handler's return value goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyDescriptor {
    Queue(QueueRef),
    Exchange {
        exchange: String,
        routing_key: String,
    },
}

impl ReplyDescriptor {
    pub fn queue(queue: QueueRef) -> Self {
        ReplyDescriptor::Queue(queue)
    }

    pub fn exchange(exchange: &str, routing_key: &str) -> Self {
        ReplyDescriptor::Exchange {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

/// Part of a delivery injected into a handler parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterBinding {
    /// The body bytes as received
    Raw,
    /// The body parsed as JSON; parsing must succeed
    Content,
    /// The message headers
    Headers,
}

/// Number of positional parameters a handler may bind; valid indices are
/// `0..MAX_PARAMETERS`.
pub const MAX_PARAMETERS: usize = 32;

/// Positional parameter index to [`ParameterBinding`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterBindingMap {
    bindings: BTreeMap<usize, ParameterBinding>,
}

impl ParameterBindingMap {
    pub fn new() -> ParameterBindingMap {
        ParameterBindingMap::default()
    }

    pub fn bind(mut self, index: usize, binding: ParameterBinding) -> Self {
        self.bindings.insert(index, binding);
        self
    }

    pub fn raw(self, index: usize) -> Self {
        self.bind(index, ParameterBinding::Raw)
    }

    pub fn content(self, index: usize) -> Self {
        self.bind(index, ParameterBinding::Content)
    }

    pub fn headers(self, index: usize) -> Self {
        self.bind(index, ParameterBinding::Headers)
    }

    /// Checks every bound index is below [`MAX_PARAMETERS`].
    ///
    /// # Returns
    /// Ok(()) or `AmqpError::ConfigError` naming the first offending index
    pub fn validate(&self) -> Result<(), AmqpError> {
        match self.bindings.keys().next_back() {
            Some(last) if *last >= MAX_PARAMETERS => Err(AmqpError::ConfigError(format!(
                "parameter index {} exceeds the limit of {} parameters",
                last, MAX_PARAMETERS
            ))),
            _ => Ok(()),
        }
    }

    pub fn requires_content(&self) -> bool {
        self.bindings
            .values()
            .any(|binding| *binding == ParameterBinding::Content)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Builds the positional arguments for a delivery.
    ///
    /// The body is parsed once. A parse failure only matters when some
    /// parameter is bound to the content; the handler is then never called
    /// with a partial argument list. Indices without a binding are
    /// [`MessageArgument::Unbound`].
    pub fn project(&self, delivery: &Delivery) -> Result<Vec<MessageArgument>, ConsumeError> {
        self.validate().map_err(ConsumeError::handler)?;

        let values = InjectableValues::new(delivery);

        if let Some(err) = &values.parse_error {
            if self.requires_content() {
                return Err(ConsumeError::ParseFailed(err.clone()));
            }
        }

        let len = self.bindings.keys().next_back().map(|last| last + 1).unwrap_or(0);
        let mut args = vec![MessageArgument::Unbound; len];
        for (index, binding) in &self.bindings {
            args[*index] = values.get(*binding);
        }

        Ok(args)
    }
}

struct InjectableValues<'d> {
    delivery: &'d Delivery,
    content: Option<Value>,
    parse_error: Option<String>,
}

impl<'d> InjectableValues<'d> {
    fn new(delivery: &'d Delivery) -> Self {
        match delivery.content() {
            Ok(content) => InjectableValues {
                delivery,
                content: Some(content),
                parse_error: None,
            },
            Err(err) => InjectableValues {
                delivery,
                content: None,
                parse_error: Some(err.to_string()),
            },
        }
    }

    fn get(&self, binding: ParameterBinding) -> MessageArgument {
        match binding {
            ParameterBinding::Raw => MessageArgument::Raw(self.delivery.data.clone()),
            ParameterBinding::Content => match &self.content {
                Some(content) => MessageArgument::Content(content.clone()),
                None => MessageArgument::Unbound,
            },
            ParameterBinding::Headers => MessageArgument::Headers(self.delivery.headers()),
        }
    }
}

/// A value passed to a handler parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageArgument {
    Raw(Vec<u8>),
    Content(Value),
    Headers(FieldTable),
    Unbound,
}

impl MessageArgument {
    pub fn as_content(&self) -> Option<&Value> {
        match self {
            MessageArgument::Content(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            MessageArgument::Raw(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_headers(&self) -> Option<&FieldTable> {
        match self {
            MessageArgument::Headers(headers) => Some(headers),
            _ => None,
        }
    }

    /// Deserializes the bound content into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ConsumeError> {
        match self {
            MessageArgument::Content(value) => Ok(serde_json::from_value(value.clone())?),
            _ => Err(ConsumeError::handler("argument is not bound to the content")),
        }
    }
}

/// Business logic invoked for every delivery of a subscription.
///
/// Returning `Ok(Some(value))` with a reply target declared forwards `value`
/// there. Returning [`ConsumeError::Nack`] nacks the delivery; any other error
/// is logged and the delivery is acked.
#[async_trait]
pub trait SubscriberHandler: Send + Sync {
    async fn handle(&self, args: Vec<MessageArgument>) -> Result<Option<Value>, ConsumeError>;
}

#[async_trait]
impl<F, Fut> SubscriberHandler for F
where
    F: Fn(Vec<MessageArgument>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, ConsumeError>> + Send + 'static,
{
    async fn handle(&self, args: Vec<MessageArgument>) -> Result<Option<Value>, ConsumeError> {
        (self)(args).await
    }
}

/// A handler together with its declared metadata.
#[derive(Clone)]
pub struct Subscriber {
    pub(crate) name: String,
    pub(crate) handler: Arc<dyn SubscriberHandler>,
    pub(crate) subscription: SubscriptionDescriptor,
    pub(crate) bindings: ParameterBindingMap,
    pub(crate) reply: Option<ReplyDescriptor>,
}

impl Subscriber {
    /// Creates a subscriber on an ephemeral queue with no parameters bound.
    pub fn new(name: &str, handler: Arc<dyn SubscriberHandler>) -> Subscriber {
        Subscriber {
            name: name.to_owned(),
            handler,
            subscription: SubscriptionDescriptor::Temporary,
            bindings: ParameterBindingMap::default(),
            reply: None,
        }
    }

    pub fn subscription(mut self, subscription: SubscriptionDescriptor) -> Self {
        self.subscription = subscription;
        self
    }

    pub fn bindings(mut self, bindings: ParameterBindingMap) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn reply(mut self, reply: ReplyDescriptor) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{AMQPValue, LongString, ShortString};
    use serde::Deserialize;
    use serde_json::json;

    fn headers() -> FieldTable {
        let mut btree = BTreeMap::new();
        btree.insert(
            ShortString::from("tenant"),
            AMQPValue::LongString(LongString::from("acme")),
        );
        FieldTable::from(btree)
    }

    #[test]
    fn projects_in_declared_order() {
        let delivery = Delivery::new(1, br#"{"id":1}"#).with_headers(headers());
        let bindings = ParameterBindingMap::new().headers(2).content(0).raw(1);

        let args = bindings.project(&delivery).unwrap();

        assert_eq!(
            args,
            vec![
                MessageArgument::Content(json!({"id": 1})),
                MessageArgument::Raw(br#"{"id":1}"#.to_vec()),
                MessageArgument::Headers(headers()),
            ]
        );
    }

    #[test]
    fn gaps_are_unbound() {
        let delivery = Delivery::new(1, b"{}");
        let args = ParameterBindingMap::new().raw(2).project(&delivery).unwrap();

        assert_eq!(args.len(), 3);
        assert_eq!(args[0], MessageArgument::Unbound);
        assert_eq!(args[1], MessageArgument::Unbound);
        assert_eq!(args[2].as_raw(), Some(&b"{}"[..]));
    }

    #[test]
    fn parse_failure_is_fatal_only_when_content_is_bound() {
        let delivery = Delivery::new(1, b"not-json");

        let raw_only = ParameterBindingMap::new().raw(0).headers(1);
        assert!(raw_only.project(&delivery).is_ok());

        let with_content = ParameterBindingMap::new().raw(0).content(1);
        assert!(matches!(
            with_content.project(&delivery),
            Err(ConsumeError::ParseFailed(_))
        ));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let delivery = Delivery::new(1, b"{}");
        let bindings = ParameterBindingMap::new().raw(0).content(usize::MAX);

        assert!(matches!(bindings.validate(), Err(AmqpError::ConfigError(_))));
        assert!(matches!(
            bindings.project(&delivery),
            Err(ConsumeError::Handler(_))
        ));

        let last = ParameterBindingMap::new().raw(MAX_PARAMETERS - 1);
        assert!(last.validate().is_ok());
        assert_eq!(last.project(&delivery).unwrap().len(), MAX_PARAMETERS);
    }

    #[test]
    fn empty_map_yields_no_arguments() {
        let delivery = Delivery::new(1, b"not-json");
        assert!(ParameterBindingMap::new().project(&delivery).unwrap().is_empty());
    }

    #[test]
    fn content_argument_deserializes() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Order {
            id: u32,
        }

        let arg = MessageArgument::Content(json!({"id": 9}));
        assert_eq!(arg.deserialize::<Order>().unwrap(), Order { id: 9 });
        assert!(MessageArgument::Unbound.deserialize::<Order>().is_err());
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler: Arc<dyn SubscriberHandler> = Arc::new(|args: Vec<MessageArgument>| async move {
            Ok::<_, ConsumeError>(args.first().and_then(|arg| arg.as_content().cloned()))
        });

        let out = handler
            .handle(vec![MessageArgument::Content(json!({"ok": true}))])
            .await
            .unwrap();

        assert_eq!(out, Some(json!({"ok": true})));
    }

    #[test]
    fn descriptors_expose_queue_reference() {
        assert_eq!(SubscriptionDescriptor::Temporary.queue_ref(), None);
        assert_eq!(SubscriptionDescriptor::exchange("events", "created").queue_ref(), None);
        assert_eq!(
            SubscriptionDescriptor::exchange_queue("events", "created", QueueRef::token("ORDERS"))
                .queue_ref(),
            Some(&QueueRef::token("ORDERS"))
        );
    }
}
