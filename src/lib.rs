// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Typed publish/subscribe over AMQP.
//!
//! ```no_run
//! use rabbitmq_pubsub::{
//!     handler::{handler_fn, HandlerError},
//!     naming::MessageType,
//!     JsonSerializer, MqConfig, RabbitMQClient, DEFAULT_PREFETCH_COUNT,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct OrderCreated {
//!     id: u64,
//! }
//!
//! impl MessageType for OrderCreated {
//!     const NAME: &'static str = "shop.OrderCreated";
//! }
//!
//! # async fn run() -> Result<(), rabbitmq_pubsub::errors::AmqpError> {
//! let client = RabbitMQClient::connect(&MqConfig::new(["localhost"]), JsonSerializer).await?;
//!
//! client
//!     .receive_event::<OrderCreated, _>(
//!         handler_fn(|order: OrderCreated| async move {
//!             println!("order {}", order.id);
//!             Ok::<_, HandlerError>(())
//!         }),
//!         DEFAULT_PREFETCH_COUNT,
//!     )
//!     .await?;
//!
//! client.publish_event(&OrderCreated { id: 1 }).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod consumer;
mod dispatcher;
mod otel;

pub mod amqp;
pub mod channel;
pub mod client;
pub mod config;
pub mod dead_letter;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod naming;
pub mod publisher;
pub mod queue;
pub mod serializer;
pub mod topology;

pub use client::{
    DeliveryScope, MessageKind, RabbitMQClient, RabbitMQClientBuilder, DEFAULT_PREFETCH_COUNT,
};
pub use config::MqConfig;
pub use consumer::DeliveryOutcome;
pub use errors::AmqpError;
pub use serializer::{JsonSerializer, Serializer};
