// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A subscription is served either by one handler instance for its whole lifetime,
//! or by a resolver invoked once per delivery, which lets every message get its own
//! freshly scoped handler (a new unit of work, a new transaction, ...).

use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, marker::PhantomData, sync::Arc};

/// Error returned by a handler. Any error dead-letters the delivery.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one decoded message.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    /// Handles `msg`.
    ///
    /// # Parameters
    /// * `ctx` - Trace context extracted from the delivery
    /// * `msg` - The decoded payload
    async fn handle(&self, ctx: &Context, msg: T) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F, T> {
    f: F,
    _msg: PhantomData<fn(T)>,
}

#[async_trait]
impl<F, Fut, T> MessageHandler<T> for FnHandler<F, T>
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
    T: Send + 'static,
{
    async fn handle(&self, _ctx: &Context, msg: T) -> Result<(), HandlerError> {
        (self.f)(msg).await
    }
}

/// Wraps an async closure as a handler.
///
/// ```
/// use rabbitmq_pubsub::handler::{handler_fn, HandlerError, HandlerSource};
///
/// let source: HandlerSource<u64> = handler_fn(|id: u64| async move {
///     println!("order {id}");
///     Ok::<_, HandlerError>(())
/// });
/// ```
pub fn handler_fn<F, Fut, T>(f: F) -> HandlerSource<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    T: Send + 'static,
{
    HandlerSource::direct(FnHandler {
        f,
        _msg: PhantomData,
    })
}

type Resolver<T> = dyn Fn() -> Arc<dyn MessageHandler<T>> + Send + Sync;

/// Where the handler for a delivery comes from.
pub enum HandlerSource<T> {
    /// The same handler serves every delivery
    Direct(Arc<dyn MessageHandler<T>>),
    /// The resolver is invoked once per delivery
    Resolver(Arc<Resolver<T>>),
}

impl<T> HandlerSource<T> {
    /// Builds a source that hands `handler` to every delivery.
    pub fn direct<H>(handler: H) -> Self
    where
        H: MessageHandler<T> + 'static,
    {
        HandlerSource::Direct(Arc::new(handler))
    }

    /// Builds a source that asks `resolve` for a handler on every delivery.
    pub fn resolver<R, H>(resolve: R) -> Self
    where
        R: Fn() -> H + Send + Sync + 'static,
        H: MessageHandler<T> + 'static,
    {
        HandlerSource::Resolver(Arc::new(move || {
            Arc::new(resolve()) as Arc<dyn MessageHandler<T>>
        }))
    }

    /// Returns the handler for the current delivery.
    pub fn resolve(&self) -> Arc<dyn MessageHandler<T>> {
        match self {
            HandlerSource::Direct(handler) => handler.clone(),
            HandlerSource::Resolver(resolve) => resolve(),
        }
    }
}

impl<T> Clone for HandlerSource<T> {
    fn clone(&self) -> Self {
        match self {
            HandlerSource::Direct(handler) => HandlerSource::Direct(handler.clone()),
            HandlerSource::Resolver(resolve) => HandlerSource::Resolver(resolve.clone()),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> MessageHandler<T> for HandlerSource<T> {
    async fn handle(&self, ctx: &Context, msg: T) -> Result<(), HandlerError> {
        self.resolve().handle(ctx, msg).await
    }
}
