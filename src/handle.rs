// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Handle
//!
//! A `ConnectionHandle` owns one channel on a shared connection. It lazily
//! creates the message stream of its queue and exposes two one-shot signals the
//! dispatch loop waits on next to the stream:
//!
//! - channel-closed fires when the consumer stream fails or ends;
//! - connection-closed fires when the health monitor observes connection loss.
//!
//! Closing a handle is terminal.

use crate::{
    channel::SharedConnection,
    errors::AmqpError,
    health::spawn_health_monitor,
};
use futures_util::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use lapin::{message::Delivery, options::BasicConsumeOptions, types::FieldTable, Channel};
use std::fmt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Why a channel or connection stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Channel(String),
    Connection(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Channel(reason) => write!(f, "channel closed: {reason}"),
            CloseReason::Connection(reason) => write!(f, "connection closed: {reason}"),
        }
    }
}

/// Sending half of a `ClosedSignal`.
pub type ClosedNotifier = oneshot::Sender<CloseReason>;

/// A closed notification that can be observed at most once.
///
/// Waiting on a signal whose notifier was dropped without sending, or on a signal
/// that already fired, never completes. That keeps the signal safe to poll from a
/// `select!` loop.
#[derive(Debug)]
pub struct ClosedSignal {
    rx: Option<oneshot::Receiver<CloseReason>>,
}

impl ClosedSignal {
    /// Creates a connected notifier/signal pair.
    pub fn pair() -> (ClosedNotifier, ClosedSignal) {
        let (tx, rx) = oneshot::channel();
        (tx, ClosedSignal { rx: Some(rx) })
    }

    /// A signal that never fires.
    pub fn never() -> ClosedSignal {
        ClosedSignal { rx: None }
    }

    /// Waits for the signal to fire.
    pub async fn fired(&mut self) -> CloseReason {
        let Some(rx) = self.rx.as_mut() else {
            return future::pending().await;
        };

        let received = rx.await;
        self.rx = None;

        match received {
            Ok(reason) => reason,
            Err(_) => future::pending().await,
        }
    }
}

/// The pieces of a consuming handle the dispatch loop multiplexes.
pub struct Subscription<'h> {
    pub messages: &'h mut BoxStream<'static, Delivery>,
    pub channel_closed: &'h mut ClosedSignal,
    pub connection_closed: &'h mut ClosedSignal,
}

/// Owns one channel on a shared connection.
pub struct ConnectionHandle {
    connection: SharedConnection,
    channel: Channel,
    queue: String,
    scope: CancellationToken,
    messages: Option<BoxStream<'static, Delivery>>,
    channel_closed: ClosedSignal,
    connection_closed: ClosedSignal,
    closed: bool,
}

impl ConnectionHandle {
    /// Opens a channel on `connection` for `queue`.
    ///
    /// # Parameters
    /// * `connection` - The shared broker connection
    /// * `queue` - Queue this handle consumes from or publishes for
    /// * `scope` - Cancellation scope of the handle; closing the handle cancels it
    pub async fn open(
        connection: SharedConnection,
        queue: &str,
        scope: CancellationToken,
    ) -> Result<ConnectionHandle, AmqpError> {
        let channel = connection.create_channel().await?;

        Ok(ConnectionHandle {
            connection,
            channel,
            queue: queue.to_owned(),
            scope,
            messages: None,
            channel_closed: ClosedSignal::never(),
            connection_closed: ClosedSignal::never(),
            closed: false,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Starts the health monitor for this handle's connection.
    ///
    /// The monitor lives until the connection is lost or the handle is closed.
    pub fn enable_health_monitor(&mut self) {
        self.connection_closed =
            spawn_health_monitor(self.connection.closed(), self.scope.child_token());
    }

    /// Subscribes to the handle's queue, creating the message stream.
    ///
    /// Consumption is manual-ack and non-exclusive: every delivery must be
    /// accepted or rejected by the caller. Calling it again is a no-op.
    pub async fn start_consuming(&mut self) -> Result<(), AmqpError> {
        if self.messages.is_some() {
            return Ok(());
        }

        let tag = format!("{}-{}", self.queue, Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                warn!(error = err.to_string(), queue = %self.queue, "error to create the consumer");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;
        debug!(queue = %self.queue, consumer = %tag, "consuming");

        let (notifier, signal) = ClosedSignal::pair();
        self.channel_closed = signal;

        let messages = stream::unfold(
            (consumer, Some(notifier)),
            |(mut consumer, mut notifier)| async move {
                let reason = match consumer.next().await {
                    Some(Ok(delivery)) => return Some((delivery, (consumer, notifier))),
                    Some(Err(err)) => {
                        warn!(error = err.to_string(), "consumer stream failed");
                        err.to_string()
                    }
                    None => "consumer stream ended".to_owned(),
                };

                if let Some(tx) = notifier.take() {
                    let _ = tx.send(CloseReason::Channel(reason));
                }

                None
            },
        );

        self.messages = Some(messages.fuse().boxed());

        Ok(())
    }

    /// Borrows the stream and both closed signals at once.
    pub fn subscription(&mut self) -> Result<Subscription<'_>, AmqpError> {
        let messages = self.messages.as_mut().ok_or(AmqpError::NotConsuming)?;

        Ok(Subscription {
            messages,
            channel_closed: &mut self.channel_closed,
            connection_closed: &mut self.connection_closed,
        })
    }

    pub fn channel_closed_signal(&mut self) -> &mut ClosedSignal {
        &mut self.channel_closed
    }

    pub fn connection_closed_signal(&mut self) -> &mut ClosedSignal {
        &mut self.connection_closed
    }

    /// Releases the channel and stops the handle's background work.
    ///
    /// Only the first call does anything; later calls are logged and ignored.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        if self.closed {
            warn!(queue = %self.queue, "connection handle already closed");
            return Ok(());
        }

        self.closed = true;
        self.scope.cancel();
        self.messages = None;

        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel.close(200, "OK").await.map_err(|err| {
            warn!(error = err.to_string(), "failed to close channel");
            AmqpError::CloseError(err.to_string())
        })
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn signal_delivers_the_close_reason() {
        let (tx, mut signal) = ClosedSignal::pair();
        tx.send(CloseReason::Channel("gone".to_owned())).unwrap();

        assert_eq!(signal.fired().await, CloseReason::Channel("gone".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_is_consumed_once() {
        let (tx, mut signal) = ClosedSignal::pair();
        tx.send(CloseReason::Connection("gone".to_owned())).unwrap();
        signal.fired().await;

        assert!(timeout(Duration::from_secs(1), signal.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_notifier_never_fires() {
        let (tx, mut signal) = ClosedSignal::pair();
        drop(tx);

        assert!(timeout(Duration::from_secs(1), signal.fired()).await.is_err());
        assert!(timeout(Duration::from_secs(1), ClosedSignal::never().fired())
            .await
            .is_err());
    }
}
