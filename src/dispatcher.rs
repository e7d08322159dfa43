// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption Loop
//!
//! Attaches a consumer to a queue and drives its deliveries on a background task.
//! At most `prefetch` deliveries are processed at the same time; together with the
//! channel's QoS window this bounds the unacknowledged messages of a consumer.
//!
//! The loop ends when the delivery stream ends, which happens when the channel or
//! its connection closes. Deliveries still buffered at that point are skipped: the
//! broker redelivers them since they were never acknowledged.

use crate::{
    amqp::{AmqpChannel, MessageEnvelope},
    consumer::consume,
    errors::AmqpError,
    handler::HandlerSource,
    otel::CONSUMER_TRACER,
    serializer::Serializer,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Decides the fate of a single delivery.
#[async_trait]
pub(crate) trait DeliveryProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        channel: &dyn AmqpChannel,
        envelope: MessageEnvelope,
    ) -> Result<(), AmqpError>;
}

/// Runs a typed handler for every delivery.
pub(crate) struct HandlerProcessor<T, S> {
    serializer: Arc<S>,
    handler: HandlerSource<T>,
}

impl<T, S> HandlerProcessor<T, S> {
    pub(crate) fn new(serializer: Arc<S>, handler: HandlerSource<T>) -> Self {
        HandlerProcessor {
            serializer,
            handler,
        }
    }
}

#[async_trait]
impl<T, S> DeliveryProcessor for HandlerProcessor<T, S>
where
    T: DeserializeOwned + Default + Send + 'static,
    S: Serializer,
{
    async fn process(
        &self,
        channel: &dyn AmqpChannel,
        envelope: MessageEnvelope,
    ) -> Result<(), AmqpError> {
        let tracer = global::tracer(CONSUMER_TRACER);

        consume(
            &tracer,
            envelope,
            channel,
            self.serializer.as_ref(),
            &self.handler,
        )
        .await
        .map(|_| ())
    }
}

/// Starts consuming `queue` on `channel`.
///
/// # Parameters
/// * `channel` - Receiving channel, with its QoS window already set
/// * `queue` - Queue to consume
/// * `prefetch_count` - Maximum number of deliveries processed concurrently
/// * `processor` - Per-delivery logic
///
/// # Returns
/// The handle of the background task, or `ConsumerDeclarationError` when the broker
/// refused the consumer
pub(crate) async fn spawn_consumer(
    channel: Arc<dyn AmqpChannel>,
    queue: &str,
    prefetch_count: u16,
    processor: Arc<dyn DeliveryProcessor>,
) -> Result<JoinHandle<()>, AmqpError> {
    let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
    let deliveries = channel.basic_consume(queue, &consumer_tag).await?;

    debug!(queue = queue, tag = consumer_tag, "consumer attached");

    let queue = queue.to_owned();
    let limit = usize::from(prefetch_count.max(1));

    Ok(tokio::spawn(async move {
        deliveries
            .for_each_concurrent(limit, |result| {
                let channel = channel.clone();
                let processor = processor.clone();

                async move {
                    match result {
                        Ok(envelope) => {
                            if !channel.is_open() {
                                debug!(tag = envelope.delivery_tag, "channel closed, skipping delivery");
                                return;
                            }

                            if let Err(err) = processor.process(channel.as_ref(), envelope).await {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        }

                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }
            })
            .await;

        debug!(queue = queue, "consumer stopped");
    }))
}
