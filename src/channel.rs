// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! The client holds exactly two connections: one for publishing and one for
//! subscribing, so flow control on one path never stalls the other. Channels are
//! created lazily, one per exchange/queue pairing (plus prefetch for receivers),
//! and cached for the lifetime of the manager.
//!
//! Creating a channel also installs its topology, so a queue always exists with
//! its dead-letter pair before anything is published to or consumed from it.

use crate::{
    amqp::{AmqpChannel, AmqpConnection},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    topology,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type ChannelSlot = Arc<OnceCell<Arc<dyn AmqpChannel>>>;

/// Identity of a cached channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    exchange: Option<String>,
    queue: String,
    prefetch: Option<u16>,
}

impl ChannelKey {
    fn new(
        exchange: Option<&ExchangeDefinition>,
        queue: &QueueDefinition,
        prefetch: Option<u16>,
    ) -> Self {
        ChannelKey {
            exchange: exchange.map(|e| e.name.clone()),
            queue: queue.name.clone(),
            prefetch,
        }
    }
}

/// Owns the publish and subscribe connections and every channel created on them.
pub struct ChannelManager {
    publish_conn: Arc<dyn AmqpConnection>,
    subscribe_conn: Arc<dyn AmqpConnection>,
    publishers: Mutex<HashMap<ChannelKey, ChannelSlot>>,
    receivers: Mutex<HashMap<ChannelKey, ChannelSlot>>,
    closed: AtomicBool,
}

impl ChannelManager {
    /// Creates a manager over the two connections.
    ///
    /// # Parameters
    /// * `publish_conn` - Connection used by every publishing channel
    /// * `subscribe_conn` - Connection used by every consuming channel
    pub fn new(
        publish_conn: Arc<dyn AmqpConnection>,
        subscribe_conn: Arc<dyn AmqpConnection>,
    ) -> Self {
        ChannelManager {
            publish_conn,
            subscribe_conn,
            publishers: Mutex::default(),
            receivers: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the cached publishing channel for the exchange/queue pair.
    ///
    /// The first request creates the channel and declares the topology; concurrent
    /// first requests wait on the same creation and share its result.
    pub async fn publisher_channel(
        &self,
        exchange: Option<&ExchangeDefinition>,
        queue: &QueueDefinition,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let slot = self.slot(&self.publishers, ChannelKey::new(exchange, queue, None))?;

        let channel = slot
            .get_or_try_init(|| self.open(self.publish_conn.as_ref(), exchange, queue, None))
            .await
            .cloned()?;

        self.reject_if_closed(channel).await
    }

    /// Returns the cached consuming channel for the exchange/queue/prefetch triple.
    ///
    /// The prefetch window is set before the channel is handed out, so it is in
    /// place before any consumer attaches.
    pub async fn receiver_channel(
        &self,
        exchange: Option<&ExchangeDefinition>,
        queue: &QueueDefinition,
        prefetch_count: u16,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let slot = self.slot(
            &self.receivers,
            ChannelKey::new(exchange, queue, Some(prefetch_count)),
        )?;

        let channel = slot
            .get_or_try_init(|| {
                self.open(
                    self.subscribe_conn.as_ref(),
                    exchange,
                    queue,
                    Some(prefetch_count),
                )
            })
            .await
            .cloned()?;

        self.reject_if_closed(channel).await
    }

    /// Opens an uncached publishing channel.
    ///
    /// The caller owns the channel and must close it once done.
    pub async fn scoped_publisher_channel(
        &self,
        exchange: Option<&ExchangeDefinition>,
        queue: &QueueDefinition,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClientClosed);
        }

        self.open(self.publish_conn.as_ref(), exchange, queue, None)
            .await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every cached channel, then both connections.
    ///
    /// Safe to call more than once. Failures to close a channel or connection the
    /// broker already closed are logged and skipped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let slots: Vec<ChannelSlot> = [&self.publishers, &self.receivers]
            .into_iter()
            .flat_map(|cache| {
                cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain()
                    .map(|(_, slot)| slot)
                    .collect::<Vec<_>>()
            })
            .collect();

        for slot in slots {
            if let Some(channel) = slot.get() {
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "failure to close channel");
                }
            }
        }

        for conn in [&self.publish_conn, &self.subscribe_conn] {
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }

        debug!("channels and connections released");
    }

    /// Number of channels currently cached, publishers and receivers together.
    pub fn cached(&self) -> usize {
        [&self.publishers, &self.receivers]
            .iter()
            .map(|cache| {
                cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|slot| slot.initialized())
                    .count()
            })
            .sum()
    }

    /// Gets or inserts the slot for `key`, dropping a slot whose channel was closed.
    fn slot(
        &self,
        cache: &Mutex<HashMap<ChannelKey, ChannelSlot>>,
        key: ChannelKey,
    ) -> Result<ChannelSlot, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClientClosed);
        }

        let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = cache.entry(key).or_default();

        if slot.get().is_some_and(|channel| !channel.is_open()) {
            debug!("replacing closed channel");
            *slot = ChannelSlot::default();
        }

        Ok(slot.clone())
    }

    /// Closes a channel whose creation finished after the manager was closed.
    async fn reject_if_closed(
        &self,
        channel: Arc<dyn AmqpChannel>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_closed() {
            return Ok(channel);
        }

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close channel");
        }
        Err(AmqpError::ClientClosed)
    }

    async fn open(
        &self,
        conn: &dyn AmqpConnection,
        exchange: Option<&ExchangeDefinition>,
        queue: &QueueDefinition,
        prefetch_count: Option<u16>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = conn.create_channel().await?;

        let prepared = async {
            if let Some(prefetch) = prefetch_count {
                channel.basic_qos(prefetch).await?;
            }
            topology::ensure(channel.clone(), exchange, queue).await
        };

        if let Err(err) = prepared.await {
            if let Err(close_err) = channel.close().await {
                warn!(error = close_err.to_string(), "failure to close channel");
            }
            return Err(err);
        }

        Ok(channel)
    }
}
