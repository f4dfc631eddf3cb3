// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Back-End
//!
//! This module provides the closed set of error values for queue operations.
//! The `AmqpError` enum covers connection and channel setup, the close path,
//! the retry machinery, and the streaming consumer protocol. Raw
//! `lapin::Error` values never cross the crate boundary; every broker failure
//! is mapped into one of these variants at the point where it is observed.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring the prefetch bound on a subscriber channel
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error enabling delivery-confirmation mode on a publisher channel
    #[error("failure to enable confirm mode")]
    ConfirmSelectError,

    /// Error publishing a message, or the broker refused the confirmation
    #[error("failure to publish")]
    PublishingError,

    /// Close was requested but the connection is already closed
    #[error("connection already closed")]
    AlreadyClosedError,

    /// Close was requested with nothing to close, or teardown itself failed
    #[error("failure to close: {0}")]
    ClosingFailedError(String),

    /// Reconnect-and-retry budget exhausted without a successful attempt
    #[error("connection retries exhausted")]
    ConnectionExhaustedError,

    /// A channel-level protocol error; never retried
    #[error("channel protocol error: {0}")]
    ChannelProtocolError(String),

    /// Raised by the code consuming the message stream, not by the broker
    #[error("downstream consumer error: {0}")]
    DownstreamError(String),

    /// Operation attempted on an instance that is not connected
    #[error("queue is not connected")]
    NotConnectedError,
}
