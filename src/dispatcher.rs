// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Loop
//!
//! The `Consuming` state of a consumer session. The loop waits on whichever of
//! these is ready first:
//!
//! ```text
//!   cancellation ─────────┐
//!   channel-closed ───────┤
//!   connection-closed ────┼──► select! ──► exit or settle one delivery
//!   next delivery ────────┘
//! ```
//!
//! Deliveries are processed strictly one at a time, so acknowledgements follow
//! delivery order.

use crate::{
    consumer::consume,
    handle::{CloseReason, ClosedSignal},
    handler::MessageHandler,
    message::Envelope,
    otel::TRACER_NAME,
};
use futures_util::{Stream, StreamExt};
use opentelemetry::global;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a consumer session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// The consumer was cancelled; no reconnect follows.
    Cancelled,
    /// The channel or the connection went away.
    Closed(CloseReason),
    /// A handler or a settlement reported the transport unusable.
    BrokerFailure(String),
}

impl SessionExit {
    /// Reports whether the manager should reconnect after this exit.
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, SessionExit::Cancelled)
    }
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionExit::Cancelled => write!(f, "cancelled"),
            SessionExit::Closed(reason) => write!(f, "{reason}"),
            SessionExit::BrokerFailure(reason) => write!(f, "broker failure: {reason}"),
        }
    }
}

/// Drives one consumer session until it must end.
///
/// # Parameters
/// * `queue` - Queue being consumed, used for spans and logs
/// * `messages` - Delivery stream of the session
/// * `channel_closed` - Fires when the channel goes away
/// * `connection_closed` - Fires when the health monitor observes connection loss
/// * `handler` - Handler (or chain) processing every delivery
/// * `cancel` - Cancellation scope of the consumer
///
/// # Returns
/// The reason the session ended
pub async fn dispatch<S, E, H>(
    queue: &str,
    messages: &mut S,
    channel_closed: &mut ClosedSignal,
    connection_closed: &mut ClosedSignal,
    handler: &mut H,
    cancel: &CancellationToken,
) -> SessionExit
where
    S: Stream<Item = E> + Unpin + ?Sized,
    E: Envelope,
    H: MessageHandler + ?Sized,
{
    let tracer = global::tracer(TRACER_NAME);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(queue, "consumer cancelled");
                return SessionExit::Cancelled;
            }

            reason = channel_closed.fired() => {
                warn!(queue, reason = %reason, "channel closed");
                return SessionExit::Closed(reason);
            }

            reason = connection_closed.fired() => {
                warn!(queue, reason = %reason, "connection closed");
                return SessionExit::Closed(reason);
            }

            next = messages.next() => {
                let Some(envelope) = next else {
                    warn!(queue, "message stream ended");
                    return SessionExit::Closed(CloseReason::Channel(
                        "message stream ended".to_owned(),
                    ));
                };

                if let Err(reason) = consume(&tracer, queue, &envelope, handler).await {
                    return SessionExit::BrokerFailure(reason);
                }
            }
        }
    }
}
