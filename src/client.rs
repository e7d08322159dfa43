// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client
//!
//! [`RabbitMQClient`] is the entry point of the crate. It publishes typed messages
//! and attaches typed handlers, deriving every exchange and queue from the message
//! type and, for private queues, from the handler identity.
//!
//! Three kinds of messages are supported:
//!
//! | kind    | exchange                   | queues      | publish    |
//! |---------|----------------------------|-------------|------------|
//! | Event   | durable fanout             | durable     | persistent |
//! | Message | non-durable fanout         | non-durable | transient  |
//! | Command | broker default exchange    | durable     | persistent |
//!
//! Each subscription is served by its own consumer task. A failing handler sends
//! the delivery to the queue's dead-letter queue; [`RabbitMQClient::republish_dead_letter_event`]
//! replays such a queue.

use crate::{
    amqp::{self, AmqpConnection},
    channel::ChannelManager,
    config::MqConfig,
    dead_letter,
    dispatcher::{spawn_consumer, HandlerProcessor},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::HandlerSource,
    naming::{HandlerId, MessageType, NameResolver},
    publisher::{PublishMessage, Publisher},
    queue::QueueDefinition,
    serializer::{JsonSerializer, Serializer},
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Prefetch window used when the caller has no specific need
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;
/// Connection name used when the configuration has none
pub const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-pubsub";

/// Delivery semantics of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Something that happened, fanned out to every interested party
    Event,
    /// Volatile notification, lost on broker restart
    Message,
    /// A request handled by exactly one consumer
    Command,
}

impl MessageKind {
    pub fn is_durable(self) -> bool {
        !matches!(self, MessageKind::Message)
    }
}

/// Which queue a subscription consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryScope {
    /// The type's default queue, shared by every subscriber (competing consumers)
    Shared,
    /// A queue private to the handler, shared by its instances
    Own(HandlerId),
    /// A caller-named queue, bound to the given exchange or to the type's exchange
    Explicit {
        exchange: Option<String>,
        queue: String,
    },
    /// A queue private to the handler in this process, deleted with its consumer
    NodeLocal(HandlerId),
}

/// Exchange and queue resolved for a publish or a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) queue: QueueDefinition,
}

/// Typed publish/subscribe client.
pub struct RabbitMQClient<S: Serializer = JsonSerializer> {
    channels: Arc<ChannelManager>,
    names: NameResolver,
    serializer: Arc<S>,
    node_id: Uuid,
}

impl<S: Serializer> RabbitMQClient<S> {
    /// Connects to the broker with two connections, one to publish, one to consume.
    ///
    /// # Returns
    /// The client, `ConfigurationError` when no host is configured, or
    /// `ConnectionError` when no host could be reached
    pub async fn connect(cfg: &MqConfig, serializer: S) -> Result<Self, AmqpError> {
        cfg.validate()?;

        let name = cfg
            .connection_name
            .as_deref()
            .unwrap_or(DEFAULT_CONNECTION_NAME);

        let publish = amqp::connect(cfg, &format!("{name}-publish")).await?;
        let subscribe = amqp::connect(cfg, &format!("{name}-subscribe")).await?;

        Ok(Self::with_connections(
            Arc::new(publish),
            Arc::new(subscribe),
            serializer,
        ))
    }

    /// Builds a client over already established connections.
    pub fn with_connections(
        publish: Arc<dyn AmqpConnection>,
        subscribe: Arc<dyn AmqpConnection>,
        serializer: S,
    ) -> Self {
        let node_id = Uuid::new_v4();
        debug!(node = node_id.to_string(), "client created");

        RabbitMQClient {
            channels: Arc::new(ChannelManager::new(publish, subscribe)),
            names: NameResolver::new(),
            serializer: Arc::new(serializer),
            node_id,
        }
    }

    pub fn builder() -> RabbitMQClientBuilder<S> {
        RabbitMQClientBuilder::default()
    }

    /// Identity of this client instance, part of node-local queue names.
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn names(&self) -> &NameResolver {
        &self.names
    }

    pub fn is_closed(&self) -> bool {
        self.channels.is_closed()
    }

    /// Closes every channel, then both connections.
    ///
    /// Consumers stop; deliveries not yet acknowledged return to their queue.
    pub async fn close(&self) {
        self.channels.close().await
    }

    /// Publishes an event to the type's durable fanout exchange.
    pub async fn publish_event<T>(&self, event: &T) -> Result<(), AmqpError>
    where
        T: MessageType + Serialize,
    {
        self.publish(MessageKind::Event, None, None, event).await
    }

    /// Publishes a transient message to the type's fanout exchange.
    pub async fn publish_message<T>(&self, message: &T) -> Result<(), AmqpError>
    where
        T: MessageType + Serialize,
    {
        self.publish(MessageKind::Message, None, None, message).await
    }

    /// Sends a command to the type's queue.
    pub async fn send_command<T>(&self, command: &T) -> Result<(), AmqpError>
    where
        T: MessageType + Serialize,
    {
        self.publish(MessageKind::Command, None, None, command).await
    }

    /// Publishes `msg` as `kind`.
    ///
    /// The exchange and the queue declared along with it default to the names
    /// derived from `T`. Commands go through the broker's default exchange and
    /// accept no exchange.
    ///
    /// # Parameters
    /// * `kind` - Delivery semantics
    /// * `exchange` - Exchange overriding the type's one
    /// * `queue` - Queue overriding the type's default queue
    /// * `msg` - The payload
    pub async fn publish<T>(
        &self,
        kind: MessageKind,
        exchange: Option<&str>,
        queue: Option<&str>,
        msg: &T,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + Serialize,
    {
        let scope = DeliveryScope::Explicit {
            exchange: exchange.map(str::to_owned),
            queue: queue
                .map(str::to_owned)
                .unwrap_or_else(|| self.names.queue_name::<T>()),
        };
        self.publish_to(kind, &scope, msg).await
    }

    /// Sends a command to the node-local queue `handler_id` listens on in this client.
    ///
    /// Pairs with [`RabbitMQClient::listen_command`]: the command is handled by this
    /// process only.
    pub async fn send_local_command<T>(
        &self,
        handler_id: &HandlerId,
        command: &T,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + Serialize,
    {
        self.publish_to(
            MessageKind::Command,
            &DeliveryScope::NodeLocal(handler_id.clone()),
            command,
        )
        .await
    }

    async fn publish_to<T>(
        &self,
        kind: MessageKind,
        scope: &DeliveryScope,
        msg: &T,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + Serialize,
    {
        let route = self.route::<T>(kind, scope)?;

        let data = self.serializer.serialize_to_bytes(msg)?;
        let msg_type = self.names.type_name::<T>();
        let channel = self
            .channels
            .publisher_channel(route.exchange.as_ref(), &route.queue)
            .await?;

        Publisher::new(channel)
            .publish(
                &Context::current(),
                &PublishMessage {
                    to: route.exchange.as_ref().map(|e| e.name()).unwrap_or_default(),
                    key: route.queue.name(),
                    msg_type: &msg_type,
                    content_type: self.serializer.content_type(),
                    data: &data,
                    persistent: kind.is_durable(),
                },
            )
            .await
    }

    /// Consumes events from the type's shared queue.
    pub async fn receive_event<T, H>(&self, handler: H, prefetch_count: u16) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(MessageKind::Event, DeliveryScope::Shared, handler, prefetch_count)
            .await
    }

    /// Consumes events from a queue private to `handler_id`.
    pub async fn subscribe_event<T, H>(
        &self,
        handler_id: HandlerId,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(
            MessageKind::Event,
            DeliveryScope::Own(handler_id),
            handler,
            prefetch_count,
        )
        .await
    }

    /// Consumes events from `queue`, bound to `exchange` or to the type's exchange.
    pub async fn subscribe_event_on<T, H>(
        &self,
        exchange: Option<&str>,
        queue: &str,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(
            MessageKind::Event,
            explicit(exchange, queue),
            handler,
            prefetch_count,
        )
        .await
    }

    pub async fn receive_message<T, H>(
        &self,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(MessageKind::Message, DeliveryScope::Shared, handler, prefetch_count)
            .await
    }

    pub async fn subscribe_message<T, H>(
        &self,
        handler_id: HandlerId,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(
            MessageKind::Message,
            DeliveryScope::Own(handler_id),
            handler,
            prefetch_count,
        )
        .await
    }

    pub async fn subscribe_message_on<T, H>(
        &self,
        exchange: Option<&str>,
        queue: &str,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(
            MessageKind::Message,
            explicit(exchange, queue),
            handler,
            prefetch_count,
        )
        .await
    }

    /// Consumes messages on a queue private to this process.
    ///
    /// Every running instance of the application receives its own copy.
    pub async fn listen_message<T, H>(
        &self,
        handler_id: HandlerId,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(
            MessageKind::Message,
            DeliveryScope::NodeLocal(handler_id),
            handler,
            prefetch_count,
        )
        .await
    }

    pub async fn receive_command<T, H>(
        &self,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(MessageKind::Command, DeliveryScope::Shared, handler, prefetch_count)
            .await
    }

    pub async fn receive_command_on<T, H>(
        &self,
        queue: &str,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(
            MessageKind::Command,
            explicit(None, queue),
            handler,
            prefetch_count,
        )
        .await
    }

    /// Consumes commands from a queue private to `handler_id` in this process.
    ///
    /// Commands reach it through [`RabbitMQClient::send_local_command`].
    pub async fn listen_command<T, H>(
        &self,
        handler_id: HandlerId,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        self.subscribe(
            MessageKind::Command,
            DeliveryScope::NodeLocal(handler_id),
            handler,
            prefetch_count,
        )
        .await
    }

    /// Attaches `handler` to the queue `kind` and `scope` resolve to.
    ///
    /// The exchange, the queue, their binding and the queue's dead-letter pair are
    /// declared before the consumer starts. Declaration errors are returned and no
    /// consumer is started.
    ///
    /// # Parameters
    /// * `kind` - Delivery semantics
    /// * `scope` - Which queue to consume
    /// * `handler` - A handler, or a resolver invoked per delivery
    /// * `prefetch_count` - Maximum number of unacknowledged deliveries
    pub async fn subscribe<T, H>(
        &self,
        kind: MessageKind,
        scope: DeliveryScope,
        handler: H,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        T: MessageType + DeserializeOwned + Default + Send,
        H: Into<HandlerSource<T>>,
    {
        let route = self.route::<T>(kind, &scope)?;
        let channel = self
            .channels
            .receiver_channel(route.exchange.as_ref(), &route.queue, prefetch_count)
            .await?;

        let processor = HandlerProcessor::new(self.serializer.clone(), handler.into());
        spawn_consumer(
            channel,
            route.queue.name(),
            prefetch_count,
            Arc::new(processor),
        )
        .await?;

        debug!(
            queue = route.queue.name(),
            msg_type = T::NAME,
            "subscription started"
        );
        Ok(())
    }

    /// Replays the durable dead-letter queue `dead_letter_queue`.
    ///
    /// Every dead-lettered `Src` is converted to `Dst` and published to the
    /// `republish-{dead_letter_queue}` exchange, which feeds the original queue. The
    /// dead-letter delivery is acknowledged once published, and requeued when any
    /// step fails.
    pub async fn republish_dead_letter_event<Src, Dst>(
        &self,
        dead_letter_queue: &str,
        prefetch_count: u16,
    ) -> Result<(), AmqpError>
    where
        Src: DeserializeOwned + Default + Send + 'static,
        Dst: MessageType + From<Src> + Serialize + Send,
    {
        let msg_type = self.names.type_name::<Dst>();

        dead_letter::republish::<Src, Dst, S>(
            self.channels.clone(),
            self.serializer.clone(),
            &msg_type,
            dead_letter_queue,
            prefetch_count,
        )
        .await?;

        debug!(queue = dead_letter_queue, "dead letter republisher started");
        Ok(())
    }

    pub(crate) fn route<T: MessageType>(
        &self,
        kind: MessageKind,
        scope: &DeliveryScope,
    ) -> Result<Route, AmqpError> {
        let durable = kind.is_durable();

        let (exchange, queue) = match scope {
            DeliveryScope::Shared => (
                self.names.exchange_name::<T>(),
                QueueDefinition::new(&self.names.queue_name::<T>()).durability(durable),
            ),
            DeliveryScope::Own(_) if kind == MessageKind::Command => {
                return Err(AmqpError::ConfigurationError(
                    "commands are handled once, they have no handler owned queue".to_owned(),
                ));
            }
            DeliveryScope::Own(handler) => (
                self.names.exchange_name::<T>(),
                QueueDefinition::new(&self.names.scoped_queue_name::<T>(handler))
                    .durability(durable),
            ),
            DeliveryScope::Explicit {
                exchange: Some(_), ..
            } if kind == MessageKind::Command => {
                return Err(AmqpError::ConfigurationError(
                    "commands go through the default exchange".to_owned(),
                ));
            }
            DeliveryScope::Explicit { exchange, queue } => (
                exchange
                    .clone()
                    .unwrap_or_else(|| self.names.exchange_name::<T>()),
                QueueDefinition::new(queue).durability(durable),
            ),
            DeliveryScope::NodeLocal(handler) => (
                self.names.exchange_name::<T>(),
                QueueDefinition::new(
                    &self
                        .names
                        .node_queue_name::<T>(handler, &self.node_id.to_string()),
                )
                .delete(),
            ),
        };

        let exchange = match kind {
            MessageKind::Command => None,
            _ => Some(
                ExchangeDefinition::new(&exchange)
                    .fanout()
                    .durability(durable),
            ),
        };

        Ok(Route { exchange, queue })
    }
}

fn explicit(exchange: Option<&str>, queue: &str) -> DeliveryScope {
    DeliveryScope::Explicit {
        exchange: exchange.map(str::to_owned),
        queue: queue.to_owned(),
    }
}

/// Builds a [`RabbitMQClient`] from a configuration or from connections.
pub struct RabbitMQClientBuilder<S> {
    config: Option<MqConfig>,
    connections: Option<(Arc<dyn AmqpConnection>, Arc<dyn AmqpConnection>)>,
    serializer: Option<S>,
}

impl<S> Default for RabbitMQClientBuilder<S> {
    fn default() -> Self {
        RabbitMQClientBuilder {
            config: None,
            connections: None,
            serializer: None,
        }
    }
}

impl<S: Serializer> RabbitMQClientBuilder<S> {
    pub fn config(mut self, cfg: MqConfig) -> Self {
        self.config = Some(cfg);
        self
    }

    /// Uses established connections instead of connecting from a configuration.
    pub fn connections(
        mut self,
        publish: Arc<dyn AmqpConnection>,
        subscribe: Arc<dyn AmqpConnection>,
    ) -> Self {
        self.connections = Some((publish, subscribe));
        self
    }

    pub fn serializer(mut self, serializer: S) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Builds the client.
    ///
    /// # Returns
    /// The client, or `ConfigurationError` when the serializer, or both the
    /// configuration and the connections, are missing
    pub async fn build(self) -> Result<RabbitMQClient<S>, AmqpError> {
        let Some(serializer) = self.serializer else {
            return Err(AmqpError::ConfigurationError(
                "a serializer is required".to_owned(),
            ));
        };

        match (self.connections, self.config) {
            (Some((publish, subscribe)), _) => Ok(RabbitMQClient::with_connections(
                publish, subscribe, serializer,
            )),
            (None, Some(cfg)) => RabbitMQClient::connect(&cfg, serializer).await,
            (None, None) => Err(AmqpError::ConfigurationError(
                "a configuration or connections are required".to_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    struct OrderCreated;

    impl MessageType for OrderCreated {
        const NAME: &'static str = "shop.OrderCreated";
    }

    struct ShipOrder;

    impl MessageType for ShipOrder {
        const NAME: &'static str = "shop.ShipOrder";
        const VERSION: Option<&'static str> = Some("2");
    }

    fn client() -> RabbitMQClient {
        let broker = MemoryBroker::new();
        RabbitMQClient::with_connections(
            Arc::new(broker.connect()),
            Arc::new(broker.connect()),
            JsonSerializer,
        )
    }

    #[test]
    fn events_use_durable_fanout_exchanges() {
        let client = client();
        let route = client
            .route::<OrderCreated>(MessageKind::Event, &DeliveryScope::Shared)
            .unwrap();

        assert_eq!(
            route.exchange,
            Some(
                ExchangeDefinition::new("shop.OrderCreated")
                    .fanout()
                    .durable()
            )
        );
        assert_eq!(route.queue, QueueDefinition::new("shop.OrderCreated").durable());
    }

    #[test]
    fn handler_scopes_derive_private_queues() {
        let client = client();
        let handler = HandlerId::new("billing.Invoicer", "on_order");

        let own = client
            .route::<OrderCreated>(MessageKind::Message, &DeliveryScope::Own(handler.clone()))
            .unwrap();
        assert_eq!(own.queue.name(), "billing.Invoicer.on_order[shop.OrderCreated]");
        assert!(!own.queue.is_durable());
        assert!(!own.exchange.unwrap().is_durable());

        let local = client
            .route::<OrderCreated>(MessageKind::Event, &DeliveryScope::NodeLocal(handler))
            .unwrap();
        assert_eq!(
            local.queue,
            QueueDefinition::new(&format!(
                "billing.Invoicer.on_order[shop.OrderCreated][{}]",
                client.node_id()
            ))
            .delete()
        );
    }

    #[test]
    fn commands_use_the_default_exchange() {
        let client = client();

        let route = client
            .route::<ShipOrder>(MessageKind::Command, &DeliveryScope::Shared)
            .unwrap();
        assert_eq!(route.exchange, None);
        assert_eq!(route.queue, QueueDefinition::new("shop.ShipOrder[2]").durable());

        assert!(matches!(
            client.route::<ShipOrder>(
                MessageKind::Command,
                &DeliveryScope::Own(HandlerId::new("a", "b"))
            ),
            Err(AmqpError::ConfigurationError(_))
        ));
        assert!(matches!(
            client.route::<ShipOrder>(MessageKind::Command, &explicit(Some("x"), "q")),
            Err(AmqpError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn builder_requires_serializer_and_connections() {
        let broker = MemoryBroker::new();

        let missing_serializer = RabbitMQClient::<JsonSerializer>::builder()
            .connections(Arc::new(broker.connect()), Arc::new(broker.connect()))
            .build()
            .await;
        assert!(matches!(
            missing_serializer,
            Err(AmqpError::ConfigurationError(_))
        ));

        let missing_connections = RabbitMQClient::builder()
            .serializer(JsonSerializer)
            .build()
            .await;
        assert!(matches!(
            missing_connections,
            Err(AmqpError::ConfigurationError(_))
        ));

        let empty_hosts = RabbitMQClient::builder()
            .serializer(JsonSerializer)
            .config(MqConfig::new(Vec::<String>::new()))
            .build()
            .await;
        assert!(matches!(empty_hosts, Err(AmqpError::ConfigurationError(_))));

        let client = RabbitMQClient::builder()
            .serializer(JsonSerializer)
            .connections(Arc::new(broker.connect()), Arc::new(broker.connect()))
            .build()
            .await;
        assert!(client.is_ok());
    }
}
