// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Subscriber
//!
//! This module provides the consuming role of the pub/sub pair. The
//! subscriber owns one connection/channel pair with a global prefetch
//! bound, fetches and acknowledges single messages through the resilient
//! call wrapper, and exposes [`MessageStream`], a cancellable lazy sequence
//! of deliveries driven by the resilient stream wrapper.
//!
//! `MessageStream` carries a second error-negotiation protocol between the
//! subscriber and its downstream consumer, separate from broker failures:
//! after processing an item, the consumer may report a processing error
//! through [`MessageStream::report_error`]. Depending on the policy chosen
//! at creation, the error either terminates the sequence or is swallowed,
//! in which case a single [`StreamItem::Skipped`] placeholder is yielded
//! before normal production resumes.

use crate::{
    channel::{AmqpLink, ChannelSetup, Reconnect},
    errors::AmqpError,
    interface::{Message, Queue, Subscriber},
    retry::{try_call, StreamFactory, TryStream},
};
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions,
    },
    types::FieldTable,
};
use std::{fmt::Display, pin::Pin, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Inactivity window after which a message stream decides it has caught up.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Delivery as it leaves the transport layer: tag plus body.
pub(crate) type RawDelivery = (u64, Vec<u8>);

pub(crate) type DeliverySource =
    Pin<Box<dyn Stream<Item = Result<RawDelivery, lapin::Error>> + Send>>;

/// Consuming end of a RabbitMQ queue.
///
/// State machine: `created -> connected(prefetch = N) -> closed`. Connect
/// declares the queue (non-durable) and bounds the number of
/// unacknowledged deliveries in flight on the channel; the bound defaults
/// to 1 and is set with [`RabbitMQSubscriber::with_prefetch`] before
/// connecting.
pub struct RabbitMQSubscriber {
    link: AmqpLink,
    consumer_tag: Option<String>,
}

impl RabbitMQSubscriber {
    /// Creates an unconnected subscriber. The address gains the `amqp://`
    /// prefix here if it lacks one.
    pub fn new(address: &str, queue: &str) -> RabbitMQSubscriber {
        RabbitMQSubscriber {
            link: AmqpLink::new(address, queue, ChannelSetup::Prefetch(1)),
            consumer_tag: None,
        }
    }

    /// Overrides the prefetch bound. Takes effect on the next connect.
    pub fn with_prefetch(mut self, prefetch: u16) -> RabbitMQSubscriber {
        *self.link.setup_mut() = ChannelSetup::Prefetch(prefetch);
        self
    }

    pub fn address(&self) -> &str {
        self.link.address()
    }

    pub fn queue(&self) -> &str {
        self.link.queue()
    }

    pub fn prefetch(&self) -> u16 {
        match self.link.setup() {
            ChannelSetup::Prefetch(count) => *count,
            ChannelSetup::Confirms => 0,
        }
    }

    /// Opens a lazy sequence of deliveries from the queue.
    ///
    /// The sequence ends normally once `inactivity` elapses with nothing
    /// pending: the queue has been drained for now and the caller should
    /// look for more work later. Broker-side failures are retried behind
    /// the scenes and surface only as `ConnectionExhaustedError` or a
    /// fatal channel error, no matter what `propagate_errors` says; the
    /// flag only governs errors reported by the downstream consumer via
    /// [`MessageStream::report_error`].
    ///
    /// Dropping the stream abandons it silently; outstanding deliveries
    /// stay unacknowledged until the subscriber is closed or they are
    /// settled individually. Closing the connection remains the caller's
    /// responsibility.
    pub fn message_stream(
        &mut self,
        inactivity: Duration,
        propagate_errors: bool,
    ) -> Result<MessageStream<'_>, AmqpError> {
        debug!("entering message stream");
        if !self.link.is_connected() {
            return Err(AmqpError::NotConnectedError);
        }

        let tag = self
            .consumer_tag
            .get_or_insert_with(|| format!("{}-{}", self.link.queue(), Uuid::new_v4()))
            .clone();
        let queue = self.link.queue().to_owned();

        let factory: StreamFactory<lapin::Channel, DeliverySource> = Box::new(move |channel| {
            let queue = queue.clone();
            let tag = tag.clone();
            Box::pin(async move {
                let consumer = channel
                    .basic_consume(
                        &queue,
                        &tag,
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;

                let source: DeliverySource =
                    Box::pin(stream::unfold(consumer, move |mut consumer| async move {
                        match tokio::time::timeout(inactivity, consumer.next()).await {
                            // quiet for the whole window: caught up
                            Err(_) => None,
                            // consumer cancelled
                            Ok(None) => None,
                            Ok(Some(Ok(delivery))) => {
                                Some((Ok((delivery.delivery_tag, delivery.data)), consumer))
                            }
                            Ok(Some(Err(err))) => Some((Err(err), consumer)),
                        }
                    }));

                Ok(source)
            })
        });

        Ok(MessageStream::new(
            &mut self.link,
            factory,
            propagate_errors,
        ))
    }
}

#[async_trait]
impl Queue for RabbitMQSubscriber {
    async fn connect(&mut self) -> Result<(), AmqpError> {
        debug!("connecting subscriber");
        self.link.connect().await?;
        debug!("subscriber connected");
        Ok(())
    }

    /// Cancels the active consumer, then closes the connection.
    ///
    /// Cancelling first makes the broker requeue every delivery still
    /// unacknowledged on this channel. A cancellation failure is reported
    /// as `ClosingFailedError`, never swallowed.
    async fn close(&mut self) -> Result<(), AmqpError> {
        debug!("closing subscriber");
        self.link.ensure_closable()?;

        if let Some(tag) = self.consumer_tag.take() {
            let channel = self.link.chan()?;
            if let Err(err) = channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                error!(error = err.to_string(), "failure to cancel the consumer");
                return Err(AmqpError::ClosingFailedError(err.to_string()));
            }
        }

        self.link.close().await?;
        debug!("subscriber closed");
        Ok(())
    }
}

#[async_trait]
impl Subscriber for RabbitMQSubscriber {
    /// Fetches a single message without blocking.
    ///
    /// `timeout_millis` is accepted for interface compatibility but has no
    /// effect: the underlying fetch is one immediate round trip.
    async fn get_message(&mut self, _timeout_millis: u64) -> Result<Option<Message>, AmqpError> {
        debug!("getting message");
        if !self.link.is_connected() {
            return Err(AmqpError::NotConnectedError);
        }

        let queue = self.link.queue().to_owned();
        let fetched = try_call(&mut self.link, move |channel| {
            let queue = queue.clone();
            async move {
                let got = channel
                    .basic_get(&queue, BasicGetOptions { no_ack: false })
                    .await?;
                Ok(got.map(|msg| (msg.delivery.delivery_tag, msg.delivery.data)))
            }
        })
        .await?;

        match fetched {
            Some((tag, payload)) => {
                debug!(delivery_tag = tag, "message received");
                Ok(Some(Message::new(tag, payload)))
            }
            None => {
                debug!("no message available");
                Ok(None)
            }
        }
    }

    /// Acknowledges a message.
    ///
    /// RabbitMQ settles acknowledgments in order: acking identifier `k`
    /// acks every outstanding delivery on the channel up to and
    /// including `k`.
    async fn ack_message(&mut self, msg: &Message) -> Result<(), AmqpError> {
        debug!("acking message");
        if !self.link.is_connected() {
            return Err(AmqpError::NotConnectedError);
        }

        let delivery_tag = msg.id;
        try_call(&mut self.link, move |channel| async move {
            channel
                .basic_ack(delivery_tag, BasicAckOptions { multiple: true })
                .await
        })
        .await?;

        debug!(delivery_tag, "message acked");
        Ok(())
    }

    /// Rejects a message, requeueing it for redelivery.
    ///
    /// Rejections settle in order like acknowledgments: nacking
    /// identifier `k` nacks every outstanding delivery up to and
    /// including `k`.
    async fn reject_message(&mut self, msg: &Message) -> Result<(), AmqpError> {
        debug!("nacking message");
        if !self.link.is_connected() {
            return Err(AmqpError::NotConnectedError);
        }

        let delivery_tag = msg.id;
        try_call(&mut self.link, move |channel| async move {
            channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: true,
                        requeue: true,
                    },
                )
                .await
        })
        .await?;

        debug!(delivery_tag, "message nacked");
        Ok(())
    }
}

/// Item produced by [`MessageStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// A delivery handed to the downstream consumer.
    Message(Message),
    /// Placeholder for an item whose processing failed downstream while
    /// the stream was created with `propagate_errors = false`.
    Skipped,
}

/// Lazy, cancellable sequence of queue deliveries.
///
/// Drive it with [`next`](MessageStream::next); when processing an item
/// fails, hand the failure back with
/// [`report_error`](MessageStream::report_error) before requesting the
/// next one. Dropping the stream abandons it silently.
pub struct MessageStream<'l, L: Reconnect = AmqpLink> {
    inner: TryStream<'l, L, DeliverySource>,
    propagate_errors: bool,
    skip_pending: bool,
    finished: bool,
}

impl<'l, L: Reconnect> MessageStream<'l, L> {
    pub(crate) fn new(
        link: &'l mut L,
        factory: StreamFactory<L::Chan, DeliverySource>,
        propagate_errors: bool,
    ) -> MessageStream<'l, L> {
        MessageStream {
            inner: TryStream::new(link, factory),
            propagate_errors,
            skip_pending: false,
            finished: false,
        }
    }

    /// Produces the next item, or `None` once the sequence has ended.
    ///
    /// The end of the sequence is not an error: it means the queue was
    /// quiet for the whole inactivity window. A finished stream keeps
    /// returning `None`.
    pub async fn next(&mut self) -> Result<Option<StreamItem>, AmqpError> {
        if self.finished {
            return Ok(None);
        }

        if self.skip_pending {
            self.skip_pending = false;
            return Ok(Some(StreamItem::Skipped));
        }

        match self.inner.next().await {
            Ok(Some((tag, payload))) => {
                debug!(delivery_tag = tag, "yielding message");
                Ok(Some(StreamItem::Message(Message::new(tag, payload))))
            }
            Ok(None) => {
                debug!("no message, look for more work later");
                self.finished = true;
                Ok(None)
            }
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    /// Reports that processing the last item failed downstream.
    ///
    /// With `propagate_errors = true` the sequence terminates and the
    /// failure comes back as `DownstreamError`. Otherwise the failure is
    /// logged and swallowed: the next call to `next` yields a single
    /// [`StreamItem::Skipped`], after which production continues
    /// normally.
    pub fn report_error(&mut self, err: impl Display) -> Result<(), AmqpError> {
        debug!("downstream error reported");

        if self.propagate_errors {
            debug!("propagating downstream error");
            self.finished = true;
            return Err(AmqpError::DownstreamError(err.to_string()));
        }

        warn!(error = err.to_string(), "excepting downstream error");
        self.skip_pending = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockReconnect;
    use lapin::protocol::{AMQPError, AMQPErrorKind, AMQPSoftError};
    use std::collections::VecDeque;

    fn transient() -> lapin::Error {
        lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed)
    }

    fn fatal() -> lapin::Error {
        lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED),
            "precondition failed".into(),
        ))
    }

    fn stream_over(
        link: &mut MockReconnect,
        scripts: Vec<Vec<Result<RawDelivery, lapin::Error>>>,
        propagate_errors: bool,
    ) -> MessageStream<'_, MockReconnect> {
        let mut scripts = VecDeque::from(scripts);
        let factory: StreamFactory<(), DeliverySource> = Box::new(move |_| {
            let items = scripts.pop_front().unwrap_or_default();
            Box::pin(async move {
                let source: DeliverySource = Box::pin(stream::iter(items));
                Ok(source)
            })
        });
        MessageStream::new(link, factory, propagate_errors)
    }

    fn delivery(tag: u64, body: &str) -> Result<RawDelivery, lapin::Error> {
        Ok((tag, body.as_bytes().to_vec()))
    }

    fn msg(tag: u64, body: &str) -> StreamItem {
        StreamItem::Message(Message::new(tag, body.as_bytes().to_vec()))
    }

    #[test]
    fn with_prefetch_overrides_the_default() {
        let subscriber = RabbitMQSubscriber::new("localhost", "jobs");
        assert_eq!(subscriber.prefetch(), 1);

        let subscriber = RabbitMQSubscriber::new("localhost", "jobs").with_prefetch(213);
        assert_eq!(subscriber.prefetch(), 213);
        assert_eq!(subscriber.address(), "amqp://localhost");
    }

    #[tokio::test]
    async fn operations_fail_before_connect() {
        let mut subscriber = RabbitMQSubscriber::new("localhost", "jobs");
        let probe = Message::new(1, b"payload".to_vec());

        assert_eq!(
            subscriber.get_message(1000).await.unwrap_err(),
            AmqpError::NotConnectedError
        );
        assert_eq!(
            subscriber.ack_message(&probe).await.unwrap_err(),
            AmqpError::NotConnectedError
        );
        assert_eq!(
            subscriber.reject_message(&probe).await.unwrap_err(),
            AmqpError::NotConnectedError
        );
        assert!(matches!(
            subscriber.message_stream(DEFAULT_INACTIVITY_TIMEOUT, true),
            Err(AmqpError::NotConnectedError)
        ));
    }

    #[tokio::test]
    async fn close_fails_before_connect() {
        let mut subscriber = RabbitMQSubscriber::new("localhost", "jobs");
        assert!(matches!(
            subscriber.close().await,
            Err(AmqpError::ClosingFailedError(_))
        ));
    }

    #[tokio::test]
    async fn stream_yields_messages_until_quiet() {
        let mut link = MockReconnect::new();
        link.expect_chan().returning(|| Ok(()));
        link.expect_recycle().times(0);

        let script = vec![vec![delivery(1, "a"), delivery(2, "b")]];
        let mut stream = stream_over(&mut link, script, true);

        assert_eq!(stream.next().await.unwrap(), Some(msg(1, "a")));
        assert_eq!(stream.next().await.unwrap(), Some(msg(2, "b")));
        assert_eq!(stream.next().await.unwrap(), None);
        // a finished stream stays finished
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn swallowed_downstream_error_yields_a_placeholder() {
        let mut link = MockReconnect::new();
        link.expect_chan().returning(|| Ok(()));
        link.expect_recycle().times(0);

        let script = vec![vec![delivery(1, "a"), delivery(2, "b"), delivery(3, "c")]];
        let mut stream = stream_over(&mut link, script, false);

        assert_eq!(stream.next().await.unwrap(), Some(msg(1, "a")));
        assert_eq!(stream.next().await.unwrap(), Some(msg(2, "b")));
        assert_eq!(stream.report_error("processing failed"), Ok(()));
        assert_eq!(stream.next().await.unwrap(), Some(StreamItem::Skipped));
        assert_eq!(stream.next().await.unwrap(), Some(msg(3, "c")));
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn propagated_downstream_error_terminates_the_stream() {
        let mut link = MockReconnect::new();
        link.expect_chan().returning(|| Ok(()));
        link.expect_recycle().times(0);

        let script = vec![vec![delivery(1, "a"), delivery(2, "b"), delivery(3, "c")]];
        let mut stream = stream_over(&mut link, script, true);

        assert_eq!(stream.next().await.unwrap(), Some(msg(1, "a")));
        assert_eq!(stream.next().await.unwrap(), Some(msg(2, "b")));
        assert_eq!(
            stream.report_error("processing failed"),
            Err(AmqpError::DownstreamError("processing failed".to_owned()))
        );
        // the remaining delivery is never produced
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn quiet_source_ends_the_stream_without_error() {
        let mut link = MockReconnect::new();
        link.expect_chan().returning(|| Ok(()));
        link.expect_recycle().times(0);

        let mut stream = stream_over(&mut link, vec![vec![]], true);
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn broker_failure_is_retried_before_yielding() {
        let mut link = MockReconnect::new();
        link.expect_chan().returning(|| Ok(()));
        link.expect_recycle().times(1).returning(|| Ok(()));

        let script = vec![vec![Err(transient())], vec![delivery(1, "a")]];
        let mut stream = stream_over(&mut link, script, true);

        assert_eq!(stream.next().await.unwrap(), Some(msg(1, "a")));
    }

    #[tokio::test]
    async fn channel_errors_escape_regardless_of_the_error_policy() {
        let mut link = MockReconnect::new();
        link.expect_chan().returning(|| Ok(()));
        link.expect_recycle().times(0);

        let script = vec![vec![Err(fatal())]];
        let mut stream = stream_over(&mut link, script, false);

        assert!(matches!(
            stream.next().await.unwrap_err(),
            AmqpError::ChannelProtocolError(_)
        ));
    }
}
