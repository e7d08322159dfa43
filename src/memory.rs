// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process broker implementing [`AmqpConnection`] and [`AmqpChannel`], for
//! tests and local pipelines. It follows the broker semantics the client relies on:
//!
//! - direct, fanout, topic and headers exchanges plus the default exchange
//! - idempotent declarations, refusing redeclarations with other properties
//! - round-robin dispatch bounded by each channel's prefetch window
//! - single-delivery ack/nack, requeue flags redeliveries
//! - dead-lettering through `x-dead-letter-exchange` with an `x-death` header, for
//!   rejections, `x-max-length` overflow and `x-message-ttl` expiry
//! - closing a channel requeues its unacknowledged deliveries and cancels its
//!   consumers, auto-delete queues go away with their last consumer
//!
//! Headers exchanges route like fanout exchanges: bindings carry no arguments.
//! `x-max-length-bytes` is accepted but not enforced.

use crate::{
    amqp::{AmqpChannel, AmqpConnection, DeliveryStream, MessageEnvelope},
    dead_letter::{
        AMQP_HEADERS_COUNT, AMQP_HEADERS_EXCHANGE, AMQP_HEADERS_QUEUE, AMQP_HEADERS_REASON,
        AMQP_HEADERS_ROUTING_KEYS, AMQP_HEADERS_TIME, AMQP_HEADERS_X_DEATH,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, error};

type Deliveries = UnboundedSender<Result<MessageEnvelope, AmqpError>>;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    properties: BasicProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    enqueued_at: Instant,
}

impl StoredMessage {
    fn envelope(&self, delivery_tag: u64) -> MessageEnvelope {
        MessageEnvelope {
            payload: self.payload.clone(),
            properties: self.properties.clone(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            delivery_tag,
            redelivered: self.redelivered,
        }
    }
}

struct Consumer {
    channel: u64,
    tag: String,
    deliveries: Deliveries,
}

struct MemoryQueue {
    def: QueueDefinition,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

impl ChannelState {
    fn ready(&self) -> bool {
        self.open && (self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch))
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    channels_created: usize,
    fail_publishes: bool,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, id: u64) -> bool {
        self.channels.get(&id).is_some_and(|channel| channel.open)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect());
        }

        let Some(def) = self.exchanges.get(exchange) else {
            error!(exchange = exchange, "no exchange to publish to");
            return Err(AmqpError::PublishingError);
        };

        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| binding.exchange_name == exchange)
            .filter(|binding| match def.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            })
            .map(|binding| binding.queue_name.clone())
            .collect();

        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    fn enqueue(&mut self, queue_name: &str, message: StoredMessage) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        queue.messages.push_back(message);

        let overflow = match queue.def.max_length {
            Some(max) if queue.messages.len() > usize::try_from(max).unwrap_or_default() => {
                queue.messages.pop_front()
            }
            _ => None,
        };

        if let Some(head) = overflow {
            self.dead_letter(queue_name, head, "maxlen");
        }
    }

    fn expire(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let Some(ttl) = queue.def.ttl else {
            return;
        };

        let ttl = Duration::from_millis(u64::try_from(ttl).unwrap_or_default());
        let mut expired = vec![];
        while queue
            .messages
            .front()
            .is_some_and(|message| message.enqueued_at.elapsed() >= ttl)
        {
            expired.extend(queue.messages.pop_front());
        }

        for message in expired {
            self.dead_letter(queue_name, message, "expired");
        }
    }

    fn dead_letter(&mut self, queue_name: &str, message: StoredMessage, reason: &str) {
        let Some(exchange) = self
            .queues
            .get(queue_name)
            .and_then(|queue| queue.def.dead_letter_exchange.clone())
        else {
            debug!(queue = queue_name, reason = reason, "message dropped");
            return;
        };

        let dead = StoredMessage {
            properties: with_x_death(&message, queue_name, reason),
            exchange: exchange.clone(),
            redelivered: false,
            enqueued_at: Instant::now(),
            ..message
        };

        match self.route(&exchange, &dead.routing_key) {
            Ok(queues) => {
                for queue in queues {
                    self.enqueue(&queue, dead.clone());
                }
            }
            Err(err) => error!(error = err.to_string(), queue = queue_name, "failure to dead letter"),
        }
    }

    fn dispatch(&mut self, queue_name: &str) {
        self.expire(queue_name);

        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let Some(idx) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|idx| {
                    self.channels
                        .get(&queue.consumers[*idx].channel)
                        .is_some_and(ChannelState::ready)
                })
            else {
                return;
            };

            let Some(channel) = self.channels.get_mut(&queue.consumers[idx].channel) else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            queue.next_consumer = (idx + 1) % count;
            channel.next_tag += 1;
            let tag = channel.next_tag;

            if queue.consumers[idx]
                .deliveries
                .send(Ok(message.envelope(tag)))
                .is_err()
            {
                debug!(tag = queue.consumers[idx].tag, "consumer gone");
                queue.messages.push_front(message);
                queue.consumers.remove(idx);
                queue.next_consumer = 0;
                continue;
            }

            channel.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_owned(),
                    message,
                },
            );
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn settle(&mut self, channel: u64, tag: u64) -> Option<Unacked> {
        self.channels
            .get_mut(&channel)
            .filter(|channel| channel.open)
            .and_then(|channel| channel.unacked.remove(&tag))
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.messages.push_front(StoredMessage {
                redelivered: true,
                ..unacked.message
            });
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.get_mut(&id).filter(|channel| channel.open) else {
            return;
        };
        channel.open = false;

        let mut unacked: Vec<(u64, Unacked)> = channel.unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| *tag);
        for (_, message) in unacked.into_iter().rev() {
            self.requeue(message);
        }

        let mut unused = vec![];
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| consumer.channel != id);
            queue.next_consumer = 0;
            if before > 0 && queue.consumers.is_empty() && queue.def.delete {
                unused.push(name.clone());
            }
        }

        for name in unused {
            debug!(queue = name, "auto-delete queue removed");
            self.queues.remove(&name);
            self.bindings.retain(|binding| binding.queue_name != name);
        }

        self.dispatch_all();
    }
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

/// Returns the message properties with a new `x-death` entry on top.
///
/// An entry for the same queue and reason is moved to the top with its count
/// incremented.
fn with_x_death(message: &StoredMessage, queue: &str, reason: &str) -> BasicProperties {
    let mut headers = message.properties.headers().clone().unwrap_or_default();

    let mut deaths: Vec<AMQPValue> = headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .map(|arr| arr.as_slice().to_vec())
        .unwrap_or_default();

    let same = |value: &AMQPValue| {
        value.as_field_table().is_some_and(|table| {
            table.inner().get(AMQP_HEADERS_QUEUE) == Some(&long_string(queue))
                && table.inner().get(AMQP_HEADERS_REASON) == Some(&long_string(reason))
        })
    };

    let count = match deaths.iter().position(same) {
        Some(idx) => deaths
            .remove(idx)
            .as_field_table()
            .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT).cloned())
            .and_then(|value| value.as_long_long_int())
            .unwrap_or_default(),
        None => 0,
    };

    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    let mut death = FieldTable::default();
    death.insert(ShortString::from(AMQP_HEADERS_COUNT), AMQPValue::LongLongInt(count + 1));
    death.insert(ShortString::from(AMQP_HEADERS_REASON), long_string(reason));
    death.insert(ShortString::from(AMQP_HEADERS_QUEUE), long_string(queue));
    death.insert(ShortString::from(AMQP_HEADERS_TIME), AMQPValue::Timestamp(time));
    death.insert(
        ShortString::from(AMQP_HEADERS_EXCHANGE),
        long_string(&message.exchange),
    );
    death.insert(
        ShortString::from(AMQP_HEADERS_ROUTING_KEYS),
        AMQPValue::FieldArray(FieldArray::from(vec![long_string(&message.routing_key)])),
    );
    deaths.insert(0, AMQPValue::FieldTable(death));

    headers.insert(
        ShortString::from(AMQP_HEADERS_X_DEATH),
        AMQPValue::FieldArray(FieldArray::from(deaths)),
    );
    message.properties.clone().with_headers(headers)
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// The broker. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new connection to the broker.
    pub fn connect(&self) -> MemoryConnection {
        let mut state = self.state();
        let id = state.next_id();
        state.connections.insert(id, true);

        MemoryConnection {
            state: self.state.clone(),
            id,
        }
    }

    /// Makes every publish fail with `PublishingError` while set.
    pub fn fail_publishes(&self, fail: bool) {
        self.state().fail_publishes = fail;
    }

    /// Number of messages ready for delivery in `queue`.
    pub fn message_count(&self, queue: &str) -> usize {
        let mut state = self.state();
        state.expire(queue);
        state
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
            .unwrap_or_default()
    }

    /// Number of deliveries from `queue` awaiting ack or nack.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|queue| queue.consumers.len())
            .unwrap_or_default()
    }

    /// Takes the next ready message out of `queue`, as a basic.get with auto-ack.
    pub fn pop(&self, queue: &str) -> Option<MessageEnvelope> {
        let mut state = self.state();
        state.expire(queue);
        state
            .queues
            .get_mut(queue)
            .and_then(|queue| queue.messages.pop_front())
            .map(|message| message.envelope(0))
    }

    pub fn channels_created(&self) -> usize {
        self.state().channels_created
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.state().exchanges.contains_key(exchange)
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl MemoryConnection {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open_locked(&self, state: &BrokerState) -> bool {
        state.connections.get(&self.id).copied().unwrap_or_default()
    }
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.state();
        if !self.is_open_locked(&state) {
            error!("error to create the channel, connection closed");
            return Err(AmqpError::ChannelError);
        }

        let id = state.next_id();
        state.channels_created += 1;
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::default(),
            },
        );

        debug!(id = id, "channel created");
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id,
        }))
    }

    fn is_open(&self) -> bool {
        self.is_open_locked(&self.state())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state();
        if !self.is_open_locked(&state) {
            return Ok(());
        }

        state.connections.insert(self.id, false);
        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            state.close_channel(channel);
        }
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl MemoryChannel {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.state();
        if !state.channel_open(self.id) {
            error!(id = self.id, "channel closed");
            return Err(AmqpError::ChannelError);
        }
        Ok(state)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        match state.exchanges.get(&def.name) {
            Some(existing)
                if existing.kind != def.kind
                    || existing.durable != def.durable
                    || existing.delete != def.delete =>
            {
                error!(exchange = def.name, "exchange redeclared with other properties");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                debug!(exchange = def.name, "exchange declared");
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        match state.queues.get(&def.name) {
            Some(existing) if existing.def != *def => {
                error!(queue = def.name, "queue redeclared with other properties");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                debug!(queue = def.name, "queue declared");
                state.queues.insert(
                    def.name.clone(),
                    MemoryQueue {
                        def: def.clone(),
                        messages: VecDeque::default(),
                        consumers: vec![],
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            error!(
                exchange = binding.exchange_name,
                queue = binding.queue_name,
                "binding to a missing exchange or queue"
            );
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self
            .open_state()
            .map_err(|_| AmqpError::PublishingError)?;

        if state.fail_publishes {
            error!(exchange = exchange, "error to publish");
            return Err(AmqpError::PublishingError);
        }

        let queues = state.route(exchange, routing_key)?;
        if queues.is_empty() {
            debug!(exchange = exchange, key = routing_key, "message unroutable, dropped");
        }

        let message = StoredMessage {
            payload: payload.to_vec(),
            properties,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            enqueued_at: Instant::now(),
        };

        for queue in queues {
            state.enqueue(&queue, message.clone());
        }
        state.dispatch_all();
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self
            .open_state()
            .map_err(|_| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;

        let (deliveries, receiver) = unbounded_channel();

        let Some(target) = state.queues.get_mut(queue) else {
            error!(queue = queue, "no queue to consume");
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        target.consumers.push(Consumer {
            channel: self.id,
            tag: consumer_tag.to_owned(),
            deliveries,
        });
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state();
        if state.settle(self.id, delivery_tag).is_none() {
            error!(tag = delivery_tag, "unknown delivery tag");
            return Err(AmqpError::AckMessageError);
        }

        state.dispatch_all();
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state();
        let Some(unacked) = state.settle(self.id, delivery_tag) else {
            error!(tag = delivery_tag, "unknown delivery tag");
            return Err(AmqpError::NackMessageError);
        };

        if requeue {
            state.requeue(unacked);
        } else {
            state.dead_letter(&unacked.queue, unacked.message, "rejected");
        }

        state.dispatch_all();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().channel_open(self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::DeadLetterMsg;
    use crate::serializer::JsonSerializer;
    use futures_util::StreamExt;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn AmqpChannel> {
        broker.connect().create_channel().await.unwrap()
    }

    async fn declare_with_dead_letter(channel: &dyn AmqpChannel, name: &str) {
        let dead_letter = format!("dead-letter-{name}");
        channel
            .declare_exchange(&ExchangeDefinition::new(&dead_letter).fanout())
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new(&dead_letter))
            .await
            .unwrap();
        channel
            .bind_queue(&QueueBinding::new(&dead_letter).exchange(&dead_letter))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new(name).with_dead_letter())
            .await
            .unwrap();
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#.eu", "orders.created.eu"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
    }

    #[tokio::test]
    async fn routes_by_exchange_kind() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;

        for name in ["a", "b"] {
            channel
                .declare_queue(&QueueDefinition::new(name))
                .await
                .unwrap();
        }
        channel
            .declare_exchange(&ExchangeDefinition::new("direct"))
            .await
            .unwrap();
        channel
            .declare_exchange(&ExchangeDefinition::new("fanout").fanout())
            .await
            .unwrap();
        channel
            .bind_queue(&QueueBinding::new("a").exchange("direct").routing_key("a"))
            .await
            .unwrap();
        for name in ["a", "b"] {
            channel
                .bind_queue(&QueueBinding::new(name).exchange("fanout"))
                .await
                .unwrap();
        }

        let props = BasicProperties::default();
        channel.basic_publish("direct", "a", b"1", props.clone()).await.unwrap();
        channel.basic_publish("fanout", "x", b"2", props.clone()).await.unwrap();
        channel.basic_publish("", "b", b"3", props.clone()).await.unwrap();

        assert_eq!(broker.message_count("a"), 2);
        assert_eq!(broker.message_count("b"), 2);
        assert_eq!(
            channel.basic_publish("missing", "a", b"4", props).await,
            Err(AmqpError::PublishingError)
        );
    }

    #[tokio::test]
    async fn redeclaration_with_other_durability_conflicts() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;

        channel
            .declare_queue(&QueueDefinition::new("orders").durable())
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new("orders").durable())
            .await
            .unwrap();

        assert_eq!(
            channel.declare_queue(&QueueDefinition::new("orders")).await,
            Err(AmqpError::DeclareQueueError("orders".to_owned()))
        );
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue(&QueueDefinition::new("orders"))
            .await
            .unwrap();
        channel.basic_qos(2).await.unwrap();

        for _ in 0..5 {
            channel
                .basic_publish("", "orders", b"{}", BasicProperties::default())
                .await
                .unwrap();
        }

        let mut deliveries = channel.basic_consume("orders", "c1").await.unwrap();
        assert_eq!(broker.unacked_count("orders"), 2);
        assert_eq!(broker.message_count("orders"), 3);

        let first = deliveries.next().await.unwrap().unwrap();
        channel.basic_ack(first.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count("orders"), 2);
        assert_eq!(broker.message_count("orders"), 2);

        assert_eq!(
            channel.basic_ack(first.delivery_tag).await,
            Err(AmqpError::AckMessageError)
        );
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters_with_x_death() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        declare_with_dead_letter(channel.as_ref(), "orders").await;

        channel
            .basic_publish("", "orders", br#"{"id":2}"#, BasicProperties::default())
            .await
            .unwrap();
        let mut deliveries = channel.basic_consume("orders", "c1").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.basic_nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.message_count("orders"), 0);
        let dead = broker.pop("dead-letter-orders").unwrap();
        let msg = DeadLetterMsg::from_envelope(&dead, &JsonSerializer).unwrap();
        assert_eq!(msg.body_string, r#"{"id":2}"#);
        assert_eq!(msg.original_queue, "orders");
        assert_eq!(msg.original_routing_key, "orders");
        assert_eq!(msg.death_reason, "rejected");
        assert_eq!(msg.count, 1);
    }

    #[tokio::test]
    async fn requeue_marks_redelivered() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue(&QueueDefinition::new("orders"))
            .await
            .unwrap();
        channel
            .basic_publish("", "orders", b"{}", BasicProperties::default())
            .await
            .unwrap();

        let mut deliveries = channel.basic_consume("orders", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        channel.basic_nack(first.delivery_tag, true).await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_ne!(first.delivery_tag, second.delivery_tag);
    }

    #[tokio::test]
    async fn overflow_dead_letters_the_oldest_message() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_exchange(&ExchangeDefinition::new("dead-letter-orders").fanout())
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new("dead-letter-orders"))
            .await
            .unwrap();
        channel
            .bind_queue(&QueueBinding::new("dead-letter-orders").exchange("dead-letter-orders"))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new("orders").max_length(1).with_dead_letter())
            .await
            .unwrap();

        for payload in [b"1", b"2"] {
            channel
                .basic_publish("", "orders", payload, BasicProperties::default())
                .await
                .unwrap();
        }

        assert_eq!(broker.pop("orders").unwrap().payload, b"2");
        let dead = broker.pop("dead-letter-orders").unwrap();
        assert_eq!(dead.payload, b"1");
        let msg = DeadLetterMsg::from_envelope(&dead, &JsonSerializer).unwrap();
        assert_eq!(msg.death_reason, "maxlen");
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_and_ends_its_consumers() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let publisher = conn.create_channel().await.unwrap();
        let consumer = conn.create_channel().await.unwrap();

        publisher
            .declare_queue(&QueueDefinition::new("orders"))
            .await
            .unwrap();
        publisher
            .basic_publish("", "orders", b"{}", BasicProperties::default())
            .await
            .unwrap();

        let mut deliveries = consumer.basic_consume("orders", "c1").await.unwrap();
        assert_eq!(broker.unacked_count("orders"), 1);

        consumer.close().await.unwrap();
        assert!(!consumer.is_open());
        assert_eq!(broker.unacked_count("orders"), 0);
        assert_eq!(broker.message_count("orders"), 1);
        assert_eq!(broker.consumer_count("orders"), 0);

        assert!(deliveries.next().await.is_some());
        assert!(deliveries.next().await.is_none());

        let redelivered = broker.pop("orders").unwrap();
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn auto_delete_queue_goes_with_its_last_consumer() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let channel = conn.create_channel().await.unwrap();
        channel
            .declare_queue(&QueueDefinition::new("local").delete())
            .await
            .unwrap();

        let _deliveries = channel.basic_consume("local", "c1").await.unwrap();
        conn.close().await.unwrap();

        assert!(!broker.queue_exists("local"));
        assert!(!conn.is_open());
        assert!(conn.create_channel().await.is_err());
    }

    #[tokio::test]
    async fn publish_failures_can_be_injected() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue(&QueueDefinition::new("orders"))
            .await
            .unwrap();

        broker.fail_publishes(true);
        assert_eq!(
            channel
                .basic_publish("", "orders", b"{}", BasicProperties::default())
                .await,
            Err(AmqpError::PublishingError)
        );

        broker.fail_publishes(false);
        channel
            .basic_publish("", "orders", b"{}", BasicProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.message_count("orders"), 1);
    }
}
