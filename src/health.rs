// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Health Monitor
//!
//! A background task scoped to one connection handle. It waits for whichever comes
//! first: the connection close notification, in which case it forwards exactly one
//! signal, or cancellation of its scope, in which case it exits without emitting
//! anything. The dispatch loop can then notice connection loss even while it is
//! parked waiting for the next delivery.

use crate::handle::{CloseReason, ClosedSignal};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawns a health monitor watching `close_notification` until `scope` is cancelled.
///
/// # Returns
/// The signal the monitor fires on connection loss
pub fn spawn_health_monitor<F>(close_notification: F, scope: CancellationToken) -> ClosedSignal
where
    F: Future<Output = CloseReason> + Send + 'static,
{
    let (notifier, signal) = ClosedSignal::pair();

    tokio::spawn(async move {
        tokio::select! {
            reason = close_notification => {
                warn!(reason = %reason, "connection lost");
                let _ = notifier.send(reason);
            }
            _ = scope.cancelled() => {
                debug!("stopping connection health monitoring");
            }
        }
    });

    signal
}
