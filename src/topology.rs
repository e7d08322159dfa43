// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares exchanges, queues and the bindings between them. Every
//! queue the client touches is declared together with its dead-letter pair: a
//! fanout exchange and a queue, both named `dead-letter-{queue}`, wired through
//! the `x-dead-letter-exchange` argument of the primary queue. Auto-delete queues
//! get no pair, as nothing would ever remove it; their rejected messages are
//! dropped.
//!
//! Declarations are idempotent. A declaration the broker refuses (for example a
//! queue that already exists with another durability) is returned to the caller
//! as is; recreating the queue could drop its consumers or its messages.

use crate::{
    amqp::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    naming::{dead_letter_name, is_dead_letter_name},
    queue::{QueueBinding, QueueDefinition},
};
use std::sync::Arc;
use tracing::debug;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declares `queue`, its dead-letter pair and, when given, `exchange` bound to it.
///
/// Dead-letter queues and auto-delete queues are declared without a pair.
///
/// Without an exchange the queue is reached through the broker's default exchange,
/// using the queue name as routing key. The binding to `exchange` also uses the
/// queue name as routing key.
///
/// # Parameters
/// * `channel` - Channel the declarations are issued on
/// * `exchange` - Exchange to bind the queue to, if any
/// * `queue` - The primary queue
///
/// # Returns
/// Ok(()) once everything is declared, or the first declaration error
pub async fn ensure(
    channel: Arc<dyn AmqpChannel>,
    exchange: Option<&ExchangeDefinition>,
    queue: &QueueDefinition,
) -> Result<(), AmqpError> {
    let mut topology = AmqpTopology::new(channel);

    let queue = if is_dead_letter_name(&queue.name) || queue.delete {
        queue.clone()
    } else {
        let dead_letter = dead_letter_name(&queue.name);

        topology = topology
            .exchange(
                ExchangeDefinition::new(&dead_letter)
                    .fanout()
                    .durability(queue.durable),
            )
            .queue(QueueDefinition::new(&dead_letter).durability(queue.durable))
            .queue_binding(
                QueueBinding::new(&dead_letter)
                    .exchange(&dead_letter)
                    .routing_key(&dead_letter),
            );

        queue.clone().with_dead_letter()
    };

    if let Some(exchange) = exchange {
        topology = topology.exchange(exchange.clone()).queue_binding(
            QueueBinding::new(&queue.name)
                .exchange(&exchange.name)
                .routing_key(&queue.name),
        );
    }

    topology.queue(queue).install().await
}

/// A set of exchanges, queues and bindings installed on a channel.
///
/// Built with method chaining and installed in dependency order: exchanges,
/// then queues, then bindings.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    /// Creates an empty topology bound to `channel`.
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology on the broker.
    ///
    /// # Returns
    /// Ok(()) on success or the first declaration error
    pub async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }

    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            self.channel.declare_queue(def).await?;
            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}
