// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes already serialized payloads to an exchange. Every message
//! carries its type, content type and a fresh message id, plus the trace context of
//! the caller for distributed tracing.
//!
//! Publishing is fire-and-forget from the caller's point of view: nothing beyond
//! what the channel itself guarantees is awaited.

use crate::{amqp::AmqpChannel, errors::AmqpError, otel};
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// AMQP delivery mode of messages that survive a broker restart
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// AMQP delivery mode of messages kept in memory only
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// A serialized message ready to be published.
#[derive(Debug, Clone)]
pub struct PublishMessage<'a> {
    /// Target exchange, empty for the broker's default exchange
    pub to: &'a str,
    pub key: &'a str,
    pub msg_type: &'a str,
    pub content_type: &'a str,
    pub data: &'a [u8],
    pub persistent: bool,
}

/// Publishes messages on a single channel.
pub struct Publisher {
    channel: Arc<dyn AmqpChannel>,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - The channel to publish on
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Publisher {
        Publisher { channel }
    }

    /// Publishes a message.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context propagated in the message headers
    /// * `infos` - Message details including payload, exchange and routing key
    ///
    /// # Returns
    /// Ok(()) on success or `PublishingError` on failure
    pub async fn publish(
        &self,
        ctx: &Context,
        infos: &PublishMessage<'_>,
    ) -> Result<(), AmqpError> {
        let properties = otel::inject(ctx, properties(infos));

        self.channel
            .basic_publish(infos.to, infos.key, infos.data, properties)
            .await?;

        debug!(
            exchange = infos.to,
            key = infos.key,
            msg_type = infos.msg_type,
            "message published"
        );
        Ok(())
    }
}

fn properties(infos: &PublishMessage<'_>) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(infos.content_type))
        .with_type(ShortString::from(infos.msg_type))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_delivery_mode(if infos.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        })
}
