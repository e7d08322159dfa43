// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection and Channel Abstraction
//!
//! The client only speaks to the broker through [`AmqpConnection`] and [`AmqpChannel`].
//! This module provides the `lapin` implementation used in production and the
//! function establishing connections from an [`MqConfig`]. The in-memory broker in
//! [`crate::memory`] implements the same traits.

use crate::{
    config::MqConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::{
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES,
        AMQP_HEADERS_MESSAGE_TTL,
    },
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// AMQP reply code for a normal close
pub const REPLY_SUCCESS: u16 = 200;
/// Number of passes over the host list when automatic recovery is enabled
pub const CONNECT_ROUNDS: usize = 3;

/// Stream of deliveries produced by [`AmqpChannel::basic_consume`].
///
/// The stream ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<MessageEnvelope, AmqpError>>;

/// A message handed to a consumer by the broker.
///
/// Lives from delivery until the ack/nack decision; never persisted by the client.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl MessageEnvelope {
    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type().as_ref().map(|v| v.as_str())
    }

    /// Message type stamped by the publisher, empty when absent.
    pub fn kind(&self) -> String {
        match self.properties.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        }
    }
}

impl From<Delivery> for MessageEnvelope {
    fn from(delivery: Delivery) -> Self {
        MessageEnvelope {
            payload: delivery.data,
            properties: delivery.properties,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        }
    }
}

/// A long lived connection to the broker that hands out channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    /// Closes the connection. Closing an already closed connection succeeds.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// The channel primitives the client is built on.
///
/// Acknowledgements are always for a single delivery, never cumulative.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Sets the consumer prefetch window of the channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Attaches a consumer with manual acknowledgements.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Closes the channel. Closing an already closed channel succeeds.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Connects to the first reachable host of the configuration.
///
/// Every host is tried in order. With `automatic_recovery_enabled` the host list is
/// retried up to [`CONNECT_ROUNDS`] times, waiting `network_recovery_interval`
/// between rounds.
///
/// # Parameters
/// * `cfg` - Broker settings
/// * `name` - Connection name reported to the broker
///
/// # Returns
/// The connection, or `ConnectionError` once every attempt failed
pub async fn connect(cfg: &MqConfig, name: &str) -> Result<LapinConnection, AmqpError> {
    cfg.validate()?;

    let rounds = if cfg.automatic_recovery_enabled {
        CONNECT_ROUNDS
    } else {
        1
    };

    for round in 0..rounds {
        if round > 0 {
            warn!(round = round, "no broker host reachable, retrying");
            tokio::time::sleep(cfg.network_recovery_interval()).await;
        }

        for (host, uri) in cfg.uris()?.iter().enumerate() {
            debug!(host = host, name = name, "creating amqp connection...");
            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(name.to_owned()));

            match Connection::connect(uri, options).await {
                Ok(conn) => {
                    debug!(name = name, "amqp connected");
                    return Ok(LapinConnection { conn });
                }
                Err(err) => error!(error = err.to_string(), host = host, "failure to connect"),
            }
        }
    }

    Err(AmqpError::ConnectionError)
}

/// [`AmqpConnection`] over a `lapin` connection.
pub struct LapinConnection {
    conn: Connection,
}

impl LapinConnection {
    pub fn new(conn: Connection) -> Self {
        LapinConnection { conn }
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "client closed")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError
            })
    }
}

/// [`AmqpChannel`] over a `lapin` channel.
pub struct LapinChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result.map(MessageEnvelope::from).map_err(|err| {
                    error!(error = err.to_string(), "errors consume msg");
                    AmqpError::ChannelError
                })
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "channel released")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close channel");
                AmqpError::ChannelError
            })
    }
}

/// Builds the `x-` arguments of a queue declaration.
fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(dlx) = &def.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dlx.clone())),
        );
    }

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max) = def.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    FieldTable::from(args)
}
