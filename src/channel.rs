// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module dials the broker and wraps the resulting connection so it can be
//! shared by every channel owner spawned from one connection manager. The wrapper
//! also turns lapin's connection error callback into an awaitable close
//! notification that any number of health monitors can observe.

use crate::{config::ConnectionConfig, errors::AmqpError, handle::CloseReason};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{future::Future, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// A broker connection shared between connection handles.
///
/// Cloning is cheap and yields another reference to the same connection.
#[derive(Clone)]
pub struct SharedConnection {
    conn: Arc<Connection>,
    lost: Arc<watch::Sender<Option<CloseReason>>>,
}

impl SharedConnection {
    /// Establishes a new connection to the broker described by `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Connection configuration holding the broker URL and connection name
    ///
    /// # Returns
    /// The shared connection, or `AmqpError::ConnectionError` on failure
    pub async fn dial(cfg: &ConnectionConfig) -> Result<SharedConnection, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name()));

        let conn = Connection::connect(cfg.url(), options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })?;
        debug!("amqp connected");

        let (lost, _) = watch::channel(None);
        let lost = Arc::new(lost);

        let notifier = lost.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection closed by the broker");
            notifier.send_replace(Some(CloseReason::Connection(err.to_string())));
        });

        Ok(SharedConnection {
            conn: Arc::new(conn),
            lost,
        })
    }

    /// Opens a new channel on this connection.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!(channel = c.id(), "channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    /// Reports whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.conn.status().connected() && self.lost.borrow().is_none()
    }

    /// Resolves once the connection is lost.
    ///
    /// The returned future owns everything it needs, so it can be handed to a
    /// background task. It also resolves when the connection is dropped.
    pub fn closed(&self) -> impl Future<Output = CloseReason> + Send + 'static {
        let mut rx = self.lost.subscribe();

        async move {
            let reason = match rx.wait_for(Option::is_some).await {
                Ok(reason) => (*reason).clone(),
                Err(_) => None,
            };

            reason.unwrap_or_else(|| CloseReason::Connection("connection dropped".to_owned()))
        }
    }

    /// Closes the connection and wakes every observer of `closed`.
    pub async fn close(&self, reason: &str) -> Result<(), AmqpError> {
        self.lost
            .send_replace(Some(CloseReason::Connection(reason.to_owned())));

        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn.close(200, reason).await.map_err(|err| {
            warn!(error = err.to_string(), "failed to close connection");
            AmqpError::CloseError(err.to_string())
        })
    }
}
