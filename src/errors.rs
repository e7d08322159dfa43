// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pub/Sub Layer
//!
//! This module provides the error taxonomy for every operation of the client:
//! construction, topology declaration, publishing, consuming and dead-letter replay.
//! Handler failures are not part of this enum as a propagated error; they are
//! recovered by the consumer engine, which dead-letters the offending delivery.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Construction and topology variants surface to the caller. Errors raised while
/// processing a single delivery are logged by the consumption loop and turned into
/// an ack/nack decision instead of tearing the consumer down.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Missing or invalid construction arguments
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The client was already closed
    #[error("client is closed")]
    ClientClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error attaching a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The user handler returned an error or panicked
    #[error("handler failure `{0}`")]
    HandlerError(String),
}
