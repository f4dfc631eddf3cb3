// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pub/Sub Queue Contracts
//!
//! Broker-agnostic contracts satisfied by the RabbitMQ roles in this crate:
//! the `Message` envelope, the `Queue` lifecycle trait, the `Publisher` and
//! `Subscriber` role traits, and the `Backend` factory. Payloads are opaque
//! byte sequences; the only broker-assigned datum carried alongside them is
//! the delivery identifier used for acknowledgment.

use crate::errors::AmqpError;
use async_trait::async_trait;

/// Default timeout, in milliseconds, for single-message fetches.
///
/// Accepted by [`Subscriber::get_message`] for signature compatibility with
/// other back-ends; the RabbitMQ fetch primitive is immediate, so the value
/// is currently ignored.
pub const TIMEOUT_MILLIS_DEFAULT: u64 = 1000;

/// An opaque payload paired with its broker-assigned delivery identifier.
///
/// The identifier orders acknowledgments on a channel; it is not a content
/// hash. Acknowledging or rejecting identifier `k` settles every outstanding
/// delivery up to and including `k` on that channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned delivery identifier.
    pub id: u64,
    /// Message body, passed through untouched.
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: u64, payload: Vec<u8>) -> Message {
        Message { id, payload }
    }
}

/// Lifecycle shared by both queue roles.
///
/// An instance is created, connected once, used for any number of
/// operations, and closed exactly once. Operating on an unconnected or
/// closed instance is reported as an error, never undefined behavior.
#[async_trait]
pub trait Queue {
    /// Establishes the connection/channel pair and performs role setup.
    async fn connect(&mut self) -> Result<(), AmqpError>;

    /// Closes the connection. Fails with `ClosingFailedError` when there is
    /// nothing to close and with `AlreadyClosedError` on a second close.
    async fn close(&mut self) -> Result<(), AmqpError>;
}

/// Sending half of the pub/sub pair.
#[async_trait]
pub trait Publisher: Queue {
    /// Publishes one message to the queue.
    async fn send_message(&mut self, msg: &[u8]) -> Result<(), AmqpError>;
}

/// Receiving half of the pub/sub pair.
#[async_trait]
pub trait Subscriber: Queue {
    /// Fetches a single message, or `None` when the queue is empty.
    ///
    /// `timeout_millis` is accepted but has no effect: the underlying fetch
    /// is a single immediate round trip.
    async fn get_message(&mut self, timeout_millis: u64) -> Result<Option<Message>, AmqpError>;

    /// Acknowledges a message by its delivery identifier.
    async fn ack_message(&mut self, msg: &Message) -> Result<(), AmqpError>;

    /// Rejects a message by its delivery identifier.
    async fn reject_message(&mut self, msg: &Message) -> Result<(), AmqpError>;
}

/// Factory constructing connected queue roles against a broker address.
#[async_trait]
pub trait Backend {
    type PubQueue: Publisher;
    type SubQueue: Subscriber;

    /// Creates and connects a publishing queue.
    async fn create_pub_queue(
        &self,
        address: &str,
        name: &str,
    ) -> Result<Self::PubQueue, AmqpError>;

    /// Creates and connects a subscription queue with the given prefetch
    /// bound.
    async fn create_sub_queue(
        &self,
        address: &str,
        name: &str,
        prefetch: u16,
    ) -> Result<Self::SubQueue, AmqpError>;
}
