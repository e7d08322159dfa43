// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Replay
//!
//! Messages rejected by a handler end up in the queue's dead-letter queue. This
//! module consumes such a queue and publishes every message back towards the
//! original queue through a dedicated `republish-{dead-letter queue}` exchange,
//! optionally converting it to a newer message type on the way.
//!
//! A dead-letter delivery is acknowledged only once its replay was published. Any
//! failure requeues it, so the dead-letter queue keeps the message until a replay
//! succeeds.

use crate::{
    amqp::{AmqpChannel, MessageEnvelope},
    channel::ChannelManager,
    dispatcher::{spawn_consumer, DeliveryProcessor},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    naming::{republish_exchange_name, undo_dead_letter_name},
    otel::{self, CONSUMER_TRACER},
    publisher::{PublishMessage, Publisher},
    queue::QueueDefinition,
    serializer::Serializer,
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::global;
use serde::{de::DeserializeOwned, Serialize};
use std::{marker::PhantomData, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
pub const AMQP_HEADERS_REASON: &str = "reason";
pub const AMQP_HEADERS_QUEUE: &str = "queue";
pub const AMQP_HEADERS_EXCHANGE: &str = "exchange";
pub const AMQP_HEADERS_ROUTING_KEYS: &str = "routing-keys";
pub const AMQP_HEADERS_TIME: &str = "time";

/// A dead-lettered message as handed over by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterMsg {
    /// Original payload, as text
    pub body_string: String,
    pub original_exchange: String,
    pub original_routing_key: String,
    pub original_queue: String,
    /// `rejected`, `expired`, `maxlen`, ...
    pub death_reason: String,
    /// Seconds since the epoch of the last dead-lettering
    pub timestamp: Option<u64>,
    /// How many times the message was dead-lettered
    pub count: i64,
}

impl DeadLetterMsg {
    /// Decodes a delivery from a dead-letter queue.
    ///
    /// Origin details come from the most recent `x-death` entry. Without one, the
    /// delivery's own exchange and routing key are reported and the remaining
    /// details are left empty.
    pub fn from_envelope<S: Serializer>(
        envelope: &MessageEnvelope,
        serializer: &S,
    ) -> Result<DeadLetterMsg, AmqpError> {
        let body_string = serializer.bytes_to_text(&envelope.payload)?;

        let headers = match envelope.properties.headers() {
            Some(val) => val.to_owned(),
            None => FieldTable::default(),
        };

        let death = headers
            .inner()
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|value| value.as_array())
            .and_then(|arr| arr.as_slice().first().cloned())
            .and_then(|value| value.as_field_table().cloned());

        let Some(death) = death else {
            return Ok(DeadLetterMsg {
                body_string,
                original_exchange: envelope.exchange.clone(),
                original_routing_key: envelope.routing_key.clone(),
                ..Default::default()
            });
        };

        let field = |key: &str| death.inner().get(key).and_then(text).unwrap_or_default();

        Ok(DeadLetterMsg {
            body_string,
            original_exchange: field(AMQP_HEADERS_EXCHANGE),
            original_routing_key: death
                .inner()
                .get(AMQP_HEADERS_ROUTING_KEYS)
                .and_then(|value| value.as_array())
                .and_then(|keys| keys.as_slice().first().and_then(text))
                .unwrap_or_default(),
            original_queue: field(AMQP_HEADERS_QUEUE),
            death_reason: field(AMQP_HEADERS_REASON),
            timestamp: match death.inner().get(AMQP_HEADERS_TIME) {
                Some(AMQPValue::Timestamp(time)) => Some(*time),
                _ => None,
            },
            count: death
                .inner()
                .get(AMQP_HEADERS_COUNT)
                .and_then(|value| value.as_long_long_int())
                .unwrap_or_default(),
        })
    }
}

fn text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.to_string()),
        _ => None,
    }
}

/// Replays dead-lettered `Src` messages as `Dst`.
pub(crate) struct RepublishProcessor<Src, Dst, S> {
    channels: Arc<ChannelManager>,
    serializer: Arc<S>,
    dead_letter_queue: String,
    msg_type: String,
    _types: PhantomData<fn(Src) -> Dst>,
}

impl<Src, Dst, S> RepublishProcessor<Src, Dst, S>
where
    Src: DeserializeOwned + Default + Send + 'static,
    Dst: From<Src> + Serialize + Send + 'static,
    S: Serializer,
{
    pub(crate) fn new(
        channels: Arc<ChannelManager>,
        serializer: Arc<S>,
        dead_letter_queue: &str,
        msg_type: &str,
    ) -> Self {
        RepublishProcessor {
            channels,
            serializer,
            dead_letter_queue: dead_letter_queue.to_owned(),
            msg_type: msg_type.to_owned(),
            _types: PhantomData,
        }
    }

    async fn republish(&self, envelope: &MessageEnvelope) -> Result<(), AmqpError> {
        let dead_letter = DeadLetterMsg::from_envelope(envelope, self.serializer.as_ref())?;
        let source: Src = self
            .serializer
            .deserialize_from_string(&dead_letter.body_string)?;
        let data = self.serializer.serialize_to_bytes(&Dst::from(source))?;

        let exchange_name = republish_exchange_name(&self.dead_letter_queue);
        let exchange = ExchangeDefinition::new(&exchange_name).fanout().durable();
        let queue = QueueDefinition::new(&undo_dead_letter_name(&self.dead_letter_queue)).durable();

        let (ctx, _span) = otel::new_span(envelope, &global::tracer(CONSUMER_TRACER), &self.msg_type);

        let channel = self
            .channels
            .scoped_publisher_channel(Some(&exchange), &queue)
            .await?;

        let published = Publisher::new(channel.clone())
            .publish(
                &ctx,
                &PublishMessage {
                    to: &exchange_name,
                    key: &exchange_name,
                    msg_type: &self.msg_type,
                    content_type: self.serializer.content_type(),
                    data: &data,
                    persistent: true,
                },
            )
            .await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close republish channel");
        }

        if published.is_ok() {
            debug!(
                exchange = exchange_name,
                reason = dead_letter.death_reason,
                count = dead_letter.count,
                "dead letter republished"
            );
        }
        published
    }
}

#[async_trait]
impl<Src, Dst, S> DeliveryProcessor for RepublishProcessor<Src, Dst, S>
where
    Src: DeserializeOwned + Default + Send + 'static,
    Dst: From<Src> + Serialize + Send + 'static,
    S: Serializer,
{
    async fn process(
        &self,
        channel: &dyn AmqpChannel,
        envelope: MessageEnvelope,
    ) -> Result<(), AmqpError> {
        match self.republish(&envelope).await {
            Ok(()) => channel.basic_ack(envelope.delivery_tag).await,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = self.dead_letter_queue,
                    "failure to republish dead letter, requeueing"
                );
                channel
                    .basic_nack(envelope.delivery_tag, true)
                    .await
                    .inspect_err(|_| error!("error whiling nack msg"))
            }
        }
    }
}

/// Attaches a republishing consumer to `dead_letter_queue`.
///
/// # Parameters
/// * `channels` - Channel manager of the client
/// * `serializer` - Payload codec
/// * `msg_type` - Wire name of `Dst`, stamped on the republished messages
/// * `dead_letter_queue` - Durable dead-letter queue to drain
/// * `prefetch_count` - QoS window of the consumer
pub(crate) async fn republish<Src, Dst, S>(
    channels: Arc<ChannelManager>,
    serializer: Arc<S>,
    msg_type: &str,
    dead_letter_queue: &str,
    prefetch_count: u16,
) -> Result<JoinHandle<()>, AmqpError>
where
    Src: DeserializeOwned + Default + Send + 'static,
    Dst: From<Src> + Serialize + Send + 'static,
    S: Serializer,
{
    let queue = QueueDefinition::new(dead_letter_queue).durable();
    let channel = channels
        .receiver_channel(None, &queue, prefetch_count)
        .await?;

    let processor = RepublishProcessor::<Src, Dst, S>::new(
        channels,
        serializer,
        dead_letter_queue,
        msg_type,
    );

    spawn_consumer(channel, dead_letter_queue, prefetch_count, Arc::new(processor)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        amqp::{MockAmqpChannel, MockAmqpConnection},
        serializer::JsonSerializer,
    };
    use lapin::{
        types::{FieldArray, LongString, ShortString},
        BasicProperties,
    };
    use mockall::predicate::eq;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize)]
    struct OrderCreated {
        id: u64,
    }

    #[derive(Debug, Serialize)]
    struct OrderCreatedV2 {
        id: u64,
        currency: String,
    }

    impl From<OrderCreated> for OrderCreatedV2 {
        fn from(order: OrderCreated) -> Self {
            OrderCreatedV2 {
                id: order.id,
                currency: "EUR".to_owned(),
            }
        }
    }

    fn long_string(value: &str) -> AMQPValue {
        AMQPValue::LongString(LongString::from(value))
    }

    fn dead_lettered(tag: u64, payload: &[u8]) -> MessageEnvelope {
        let mut death = FieldTable::default();
        death.insert(ShortString::from(AMQP_HEADERS_REASON), long_string("rejected"));
        death.insert(ShortString::from(AMQP_HEADERS_QUEUE), long_string("orders"));
        death.insert(
            ShortString::from(AMQP_HEADERS_EXCHANGE),
            long_string("shop.OrderCreated"),
        );
        death.insert(
            ShortString::from(AMQP_HEADERS_ROUTING_KEYS),
            AMQPValue::FieldArray(FieldArray::from(vec![long_string("orders")])),
        );
        death.insert(
            ShortString::from(AMQP_HEADERS_TIME),
            AMQPValue::Timestamp(1_700_000_000),
        );
        death.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(1),
        );

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
        );

        MessageEnvelope {
            payload: payload.to_vec(),
            properties: BasicProperties::default().with_headers(headers),
            exchange: "dead-letter-orders".to_owned(),
            routing_key: "orders".to_owned(),
            delivery_tag: tag,
            redelivered: false,
        }
    }

    #[test]
    fn decodes_the_x_death_entry() {
        let msg = DeadLetterMsg::from_envelope(&dead_lettered(1, br#"{"id":2}"#), &JsonSerializer)
            .unwrap();

        assert_eq!(
            msg,
            DeadLetterMsg {
                body_string: r#"{"id":2}"#.to_owned(),
                original_exchange: "shop.OrderCreated".to_owned(),
                original_routing_key: "orders".to_owned(),
                original_queue: "orders".to_owned(),
                death_reason: "rejected".to_owned(),
                timestamp: Some(1_700_000_000),
                count: 1,
            }
        );
    }

    #[test]
    fn missing_x_death_falls_back_to_the_delivery() {
        let envelope = MessageEnvelope {
            payload: b"{}".to_vec(),
            properties: BasicProperties::default(),
            exchange: "dead-letter-orders".to_owned(),
            routing_key: "orders".to_owned(),
            delivery_tag: 1,
            redelivered: true,
        };

        let msg = DeadLetterMsg::from_envelope(&envelope, &JsonSerializer).unwrap();
        assert_eq!(msg.original_exchange, "dead-letter-orders");
        assert_eq!(msg.original_routing_key, "orders");
        assert_eq!(msg.death_reason, "");
        assert_eq!(msg.count, 0);
    }

    fn idle_connection() -> MockAmqpConnection {
        let mut conn = MockAmqpConnection::new();
        conn.expect_create_channel().never();
        conn
    }

    #[tokio::test]
    async fn undecodable_dead_letter_is_requeued() {
        let manager = Arc::new(ChannelManager::new(
            Arc::new(idle_connection()),
            Arc::new(idle_connection()),
        ));
        let processor = RepublishProcessor::<OrderCreated, OrderCreatedV2, _>::new(
            manager,
            Arc::new(JsonSerializer),
            "dead-letter-orders",
            "shop.OrderCreated[v2]",
        );

        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(4), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        processor
            .process(&channel, dead_lettered(4, b"not json"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn republishes_converted_payload_then_acks() {
        let mut publish = MockAmqpConnection::new();
        publish.expect_create_channel().times(1).returning(|| {
            let mut channel = MockAmqpChannel::new();
            channel.expect_declare_exchange().returning(|_| Ok(()));
            channel.expect_declare_queue().returning(|_| Ok(()));
            channel.expect_bind_queue().returning(|_| Ok(()));
            channel
                .expect_basic_publish()
                .withf(|exchange, key, data, props| {
                    exchange == "republish-dead-letter-orders"
                        && key == "republish-dead-letter-orders"
                        && data == br#"{"id":2,"currency":"EUR"}"#
                        && props.kind().as_ref().map(|k| k.as_str())
                            == Some("shop.OrderCreated[v2]")
                })
                .times(1)
                .returning(|_, _, _, _| Ok(()));
            channel.expect_close().times(1).returning(|| Ok(()));
            Ok(Arc::new(channel))
        });

        let manager = Arc::new(ChannelManager::new(
            Arc::new(publish),
            Arc::new(idle_connection()),
        ));
        let processor = RepublishProcessor::<OrderCreated, OrderCreatedV2, _>::new(
            manager.clone(),
            Arc::new(JsonSerializer),
            "dead-letter-orders",
            "shop.OrderCreated[v2]",
        );

        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_nack().never();
        channel
            .expect_basic_ack()
            .with(eq(5))
            .times(1)
            .returning(|_| Ok(()));

        processor
            .process(&channel, dead_lettered(5, br#"{"id":2}"#))
            .await
            .unwrap();
        assert_eq!(manager.cached(), 0);
    }

    #[tokio::test]
    async fn publish_failure_requeues_and_releases_the_channel() {
        let mut publish = MockAmqpConnection::new();
        publish.expect_create_channel().times(1).returning(|| {
            let mut channel = MockAmqpChannel::new();
            channel.expect_declare_exchange().returning(|_| Ok(()));
            channel.expect_declare_queue().returning(|_| Ok(()));
            channel.expect_bind_queue().returning(|_| Ok(()));
            channel
                .expect_basic_publish()
                .returning(|_, _, _, _| Err(AmqpError::PublishingError));
            channel.expect_close().times(1).returning(|| Ok(()));
            Ok(Arc::new(channel))
        });

        let manager = Arc::new(ChannelManager::new(
            Arc::new(publish),
            Arc::new(idle_connection()),
        ));
        let processor = RepublishProcessor::<OrderCreated, OrderCreatedV2, _>::new(
            manager,
            Arc::new(JsonSerializer),
            "dead-letter-orders",
            "shop.OrderCreated[v2]",
        );

        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(6), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        processor
            .process(&channel, dead_lettered(6, br#"{"id":2}"#))
            .await
            .unwrap();
    }
}
