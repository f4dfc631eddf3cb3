// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Backend Factory
//!
//! Constructs and connects queue roles against a broker address. This is
//! the entry point a generic queue client drives; it never touches the
//! broker itself beyond delegating to the roles' `connect`.

use crate::{
    errors::AmqpError,
    interface::{Backend, Queue},
    publisher::RabbitMQPublisher,
    subscriber::RabbitMQSubscriber,
};
use async_trait::async_trait;
use tracing::debug;

/// RabbitMQ pub/sub backend factory.
pub struct RabbitMQBackend;

#[async_trait]
impl Backend for RabbitMQBackend {
    type PubQueue = RabbitMQPublisher;
    type SubQueue = RabbitMQSubscriber;

    async fn create_pub_queue(
        &self,
        address: &str,
        name: &str,
    ) -> Result<RabbitMQPublisher, AmqpError> {
        debug!(queue = name, "creating pub queue");
        let mut publisher = RabbitMQPublisher::new(address, name);
        publisher.connect().await?;
        Ok(publisher)
    }

    async fn create_sub_queue(
        &self,
        address: &str,
        name: &str,
        prefetch: u16,
    ) -> Result<RabbitMQSubscriber, AmqpError> {
        debug!(queue = name, prefetch, "creating sub queue");
        let mut subscriber = RabbitMQSubscriber::new(address, name).with_prefetch(prefetch);
        subscriber.connect().await?;
        Ok(subscriber)
    }
}
