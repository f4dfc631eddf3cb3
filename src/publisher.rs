// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides the publishing role of the pub/sub pair. The
//! publisher owns one connection/channel pair in delivery-confirmation
//! mode and sends opaque byte payloads to its queue through the default
//! exchange, one message per call, with every publish routed through the
//! resilient call wrapper.

use crate::{
    channel::{AmqpLink, ChannelSetup},
    errors::AmqpError,
    interface::{Publisher, Queue},
    retry::try_call,
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions, publisher_confirm::Confirmation, types::ShortString,
    BasicProperties,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Publishing end of a RabbitMQ queue.
///
/// State machine: `created -> connected(confirm-mode) -> closed`. Connect
/// declares the queue (non-durable) and turns on delivery confirmations;
/// both must succeed before the role is usable.
pub struct RabbitMQPublisher {
    link: AmqpLink,
}

impl RabbitMQPublisher {
    /// Creates an unconnected publisher. The address gains the `amqp://`
    /// prefix here if it lacks one.
    pub fn new(address: &str, queue: &str) -> RabbitMQPublisher {
        RabbitMQPublisher {
            link: AmqpLink::new(address, queue, ChannelSetup::Confirms),
        }
    }

    pub fn address(&self) -> &str {
        self.link.address()
    }

    pub fn queue(&self) -> &str {
        self.link.queue()
    }
}

#[async_trait]
impl Queue for RabbitMQPublisher {
    async fn connect(&mut self) -> Result<(), AmqpError> {
        debug!("connecting publisher");
        self.link.connect().await?;
        debug!("publisher connected");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AmqpError> {
        debug!("closing publisher");
        self.link.close().await?;
        debug!("publisher closed");
        Ok(())
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    /// Publishes one message and waits for the broker's confirmation.
    ///
    /// Transient connection failures are retried behind the scenes; a
    /// broker nack of the confirmation is a publish failure.
    async fn send_message(&mut self, msg: &[u8]) -> Result<(), AmqpError> {
        debug!("sending message");
        if !self.link.is_connected() {
            return Err(AmqpError::NotConnectedError);
        }

        let queue = self.link.queue().to_owned();
        let payload = msg.to_vec();

        let confirmation = try_call(&mut self.link, move |channel| {
            let queue = queue.clone();
            let payload = payload.clone();
            async move {
                let confirm = channel
                    .basic_publish(
                        "",
                        &queue,
                        BasicPublishOptions::default(),
                        &payload,
                        BasicProperties::default().with_message_id(ShortString::from(
                            Uuid::new_v4().to_string(),
                        )),
                    )
                    .await?;
                confirm.await
            }
        })
        .await?;

        if let Confirmation::Nack(_) = confirmation {
            error!("message was nacked by the broker");
            return Err(AmqpError::PublishingError);
        }

        debug!("message sent");
        Ok(())
    }
}
