// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module processes one delivery: decode, invoke the handler, then ack or
//! dead-letter. There is no in-queue retry: the first failure, whether the payload
//! cannot be decoded or the handler fails or panics, rejects the delivery without
//! requeue and the broker moves it to the queue's dead-letter queue.

use crate::{
    amqp::{AmqpChannel, MessageEnvelope},
    errors::AmqpError,
    handler::HandlerSource,
    otel,
    serializer::Serializer,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Final state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    DeadLettered,
}

/// Consumes and processes a delivery.
///
/// This function is the core of the message consumption process. It:
/// 1. Opens a trace span linked to the publisher's context
/// 2. Decodes the payload as `T`
/// 3. Invokes the handler resolved for this delivery
/// 4. Acknowledges the single delivery on success
/// 5. Rejects it without requeue on any failure, routing it to the dead-letter queue
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for creating spans
/// * `envelope` - The delivery
/// * `channel` - Channel the delivery arrived on
/// * `serializer` - Payload decoder
/// * `handler` - Handler source of the subscription
///
/// # Returns
/// The outcome, or an error when the ack/nack itself failed
pub(crate) async fn consume<T, S>(
    tracer: &BoxedTracer,
    envelope: MessageEnvelope,
    channel: &dyn AmqpChannel,
    serializer: &S,
    handler: &HandlerSource<T>,
) -> Result<DeliveryOutcome, AmqpError>
where
    T: DeserializeOwned + Default + Send + 'static,
    S: Serializer,
{
    let msg_type = envelope.kind();
    let (ctx, mut span) = otel::new_span(&envelope, tracer, &msg_type);

    debug!(
        "received: {} - exchange: {} - redelivered: {}",
        msg_type, envelope.exchange, envelope.redelivered
    );

    let result = match serializer.deserialize_from_bytes::<T>(&envelope.payload) {
        Ok(msg) => invoke(handler, &ctx, msg).await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        warn!(
            error = err.to_string(),
            msg_type = msg_type,
            "failure to handle msg, sending to dead-letter"
        );
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });

        if let Err(e) = channel.basic_nack(envelope.delivery_tag, false).await {
            error!("error whiling nack msg");
            span.record_error(&e);
            return Err(e);
        }

        return Ok(DeliveryOutcome::DeadLettered);
    }

    debug!("message successfully processed");
    match channel.basic_ack(envelope.delivery_tag).await {
        Err(e) => {
            error!("error whiling ack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(e)
        }
        _ => {
            span.set_status(Status::Ok);
            Ok(DeliveryOutcome::Acked)
        }
    }
}

/// Runs the handler, turning errors and panics into `HandlerError`.
async fn invoke<T>(handler: &HandlerSource<T>, ctx: &Context, msg: T) -> Result<(), AmqpError> {
    let handler = handler.resolve();

    match AssertUnwindSafe(handler.handle(ctx, msg))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AmqpError::HandlerError(err.to_string())),
        Err(_) => Err(AmqpError::HandlerError("handler panicked".to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        amqp::MockAmqpChannel,
        handler::{handler_fn, HandlerError},
        serializer::JsonSerializer,
    };
    use lapin::BasicProperties;
    use mockall::predicate::eq;
    use opentelemetry::global;
    use serde::Deserialize;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Debug, Default, Deserialize)]
    struct OrderCreated {
        id: u64,
    }

    fn envelope(tag: u64, payload: &[u8]) -> MessageEnvelope {
        MessageEnvelope {
            payload: payload.to_vec(),
            properties: BasicProperties::default(),
            exchange: "shop.OrderCreated".to_owned(),
            routing_key: "orders".to_owned(),
            delivery_tag: tag,
            redelivered: false,
        }
    }

    fn failing_on_even() -> HandlerSource<OrderCreated> {
        handler_fn(|order: OrderCreated| async move {
            let result: Result<(), HandlerError> = match order.id % 2 {
                0 => Err(format!("order {} rejected", order.id).into()),
                _ => Ok(()),
            };
            result
        })
    }

    #[tokio::test]
    async fn success_acks_the_single_delivery() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().with(eq(7)).times(1).returning(|_| Ok(()));
        channel.expect_basic_nack().never();

        let outcome = consume(
            &global::tracer("test"),
            envelope(7, br#"{"id":1}"#),
            &channel,
            &JsonSerializer,
            &failing_on_even(),
        )
        .await;

        assert_eq!(outcome, Ok(DeliveryOutcome::Acked));
    }

    #[tokio::test]
    async fn handler_error_nacks_without_requeue() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(8), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = consume(
            &global::tracer("test"),
            envelope(8, br#"{"id":2}"#),
            &channel,
            &JsonSerializer,
            &failing_on_even(),
        )
        .await;

        assert_eq!(outcome, Ok(DeliveryOutcome::DeadLettered));
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(9), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handler: HandlerSource<OrderCreated> = handler_fn(move |_: OrderCreated| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(()) }
        });

        let outcome = consume(
            &global::tracer("test"),
            envelope(9, b"<order/>"),
            &channel,
            &JsonSerializer,
            &handler,
        )
        .await;

        assert_eq!(outcome, Ok(DeliveryOutcome::DeadLettered));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_dead_lettered() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .with(eq(10), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let handler: HandlerSource<OrderCreated> = handler_fn(|order: OrderCreated| async move {
            if order.id > 0 {
                panic!("boom");
            }
            Ok::<_, HandlerError>(())
        });

        let outcome = consume(
            &global::tracer("test"),
            envelope(10, br#"{"id":3}"#),
            &channel,
            &JsonSerializer,
            &handler,
        )
        .await;

        assert_eq!(outcome, Ok(DeliveryOutcome::DeadLettered));
    }

    #[tokio::test]
    async fn empty_payload_reaches_the_handler_as_default() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().with(eq(11)).times(1).returning(|_| Ok(()));

        let handler: HandlerSource<OrderCreated> = handler_fn(|order: OrderCreated| async move {
            assert_eq!(order.id, 0);
            Ok::<_, HandlerError>(())
        });

        let outcome = consume(
            &global::tracer("test"),
            envelope(11, b""),
            &channel,
            &JsonSerializer,
            &handler,
        )
        .await;

        assert_eq!(outcome, Ok(DeliveryOutcome::Acked));
    }

    #[tokio::test]
    async fn ack_failure_is_reported() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_ack()
            .returning(|_| Err(AmqpError::AckMessageError));

        let outcome = consume(
            &global::tracer("test"),
            envelope(12, br#"{"id":5}"#),
            &channel,
            &JsonSerializer,
            &failing_on_even(),
        )
        .await;

        assert_eq!(outcome, Err(AmqpError::AckMessageError));
    }
}
