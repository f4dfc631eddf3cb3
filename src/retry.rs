// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Broker Calls
//!
//! Every broker interaction in this crate funnels through this module.
//! [`try_call`] wraps a single operation and [`TryStream`] wraps a
//! long-lived delivery stream; both apply the same failure classification:
//!
//! - a channel-level (soft) protocol error is fatal and propagates
//!   immediately, without touching the connection;
//! - everything else, including a connection closed by the broker, is
//!   transient: the connection/channel pair is discarded, the fixed delay
//!   is awaited, and a fresh pair is established before the next attempt.
//!
//! The retry budget is a process-wide constant scoped to one call or one
//! stream. When it runs out, the caller sees a single
//! `ConnectionExhaustedError`, not the original cause.

use crate::{channel::Reconnect, errors::AmqpError};
use futures_util::{future::BoxFuture, Stream, StreamExt};
use lapin::protocol::AMQPErrorKind;
use std::{future::Future, time::Duration};
use tracing::{debug, error};

/// Reconnect-and-retry attempts allowed per call, beyond the initial one.
pub(crate) const RETRY_ATTEMPTS: usize = 3;

/// Pause between a teardown and the reconnect that follows it.
pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome classification for a failed broker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    /// Recoverable by reconnecting; eligible for retry.
    Transient,
    /// Channel-level protocol error; a reconnect would not help.
    Fatal,
}

/// Classifies a broker failure as transient or fatal.
///
/// Soft AMQP errors are raised on the channel (not-found, precondition
/// failed, access refused) and survive a reconnect unchanged, so they are
/// never retried. Hard errors close the connection and everything else is
/// connection-level, so both are worth a fresh connection.
pub(crate) fn classify(err: &lapin::Error) -> Failure {
    match err {
        lapin::Error::ProtocolError(e) if matches!(e.kind(), AMQPErrorKind::Soft(_)) => {
            Failure::Fatal
        }
        _ => Failure::Transient,
    }
}

/// Executes `op` against the current channel, reconnecting and retrying on
/// transient failures.
///
/// The closure receives a fresh channel handle on every attempt, since a
/// reconnect replaces the pair. On success the operation's value is passed
/// through unchanged. The final failed attempt is still followed by a
/// reconnect, so an exhausted call leaves the link in a reconnect-attempted
/// state.
pub(crate) async fn try_call<L, F, Fut, T>(link: &mut L, mut op: F) -> Result<T, AmqpError>
where
    L: Reconnect,
    F: FnMut(L::Chan) -> Fut,
    Fut: Future<Output = Result<T, lapin::Error>>,
{
    for attempt in 0..=RETRY_ATTEMPTS {
        if attempt > 0 {
            debug!(attempt, "connection error, trying again");
        }

        match link.chan() {
            Ok(chan) => match op(chan).await {
                Ok(value) => return Ok(value),
                Err(err) => match classify(&err) {
                    Failure::Fatal => {
                        error!(error = err.to_string(), "channel error, not retrying");
                        return Err(AmqpError::ChannelProtocolError(err.to_string()));
                    }
                    Failure::Transient => {
                        debug!(error = err.to_string(), "transient connection error");
                    }
                },
            },
            // the previous reconnect failed and left no channel behind
            Err(_) => {}
        }

        if let Err(err) = link.recycle().await {
            debug!(error = err.to_string(), "reconnect attempt failed");
        }
    }

    error!("connection error, max retries reached");
    Err(AmqpError::ConnectionExhaustedError)
}

/// Factory re-invoked after every reconnect to issue a fresh stream.
pub(crate) type StreamFactory<C, S> =
    Box<dyn FnMut(C) -> BoxFuture<'static, Result<S, lapin::Error>> + Send>;

/// Resilient wrapper around a sequence of broker-delivered items.
///
/// Items from the underlying stream are forwarded unchanged. On a transient
/// failure mid-stream the connection is recycled and the factory is invoked
/// again from scratch; where the broker-side cursor resumes is up to the
/// broker. The stream ending on its own is forwarded as `Ok(None)`.
pub(crate) struct TryStream<'l, L: Reconnect, S> {
    link: &'l mut L,
    factory: StreamFactory<L::Chan, S>,
    stream: Option<S>,
    failures: usize,
}

impl<'l, L, S, T> TryStream<'l, L, S>
where
    L: Reconnect,
    S: Stream<Item = Result<T, lapin::Error>> + Unpin,
{
    pub(crate) fn new(link: &'l mut L, factory: StreamFactory<L::Chan, S>) -> TryStream<'l, L, S> {
        TryStream {
            link,
            factory,
            stream: None,
            failures: 0,
        }
    }

    /// Produces the next item, reconnecting on transient failures.
    pub(crate) async fn next(&mut self) -> Result<Option<T>, AmqpError> {
        loop {
            match self.stream.as_mut() {
                Some(stream) => match stream.next().await {
                    Some(Ok(item)) => return Ok(Some(item)),
                    Some(Err(err)) => {
                        self.stream = None;
                        self.recover(err).await?;
                    }
                    None => return Ok(None),
                },
                None => match self.link.chan() {
                    Ok(chan) => match (self.factory)(chan).await {
                        Ok(stream) => self.stream = Some(stream),
                        Err(err) => self.recover(err).await?,
                    },
                    // the previous reconnect failed and left no channel behind
                    Err(_) => self.strike().await?,
                },
            }
        }
    }

    async fn recover(&mut self, err: lapin::Error) -> Result<(), AmqpError> {
        match classify(&err) {
            Failure::Fatal => {
                error!(error = err.to_string(), "channel error, not retrying");
                Err(AmqpError::ChannelProtocolError(err.to_string()))
            }
            Failure::Transient => {
                debug!(error = err.to_string(), "transient connection error mid-stream");
                self.strike().await
            }
        }
    }

    async fn strike(&mut self) -> Result<(), AmqpError> {
        self.failures += 1;

        if let Err(err) = self.link.recycle().await {
            debug!(error = err.to_string(), "reconnect attempt failed");
        }

        if self.failures > RETRY_ATTEMPTS {
            error!("connection error, max retries reached");
            Err(AmqpError::ConnectionExhaustedError)
        } else {
            Ok(())
        }
    }
}
