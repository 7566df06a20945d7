// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the one broker connection of the process and runs consumers on top of it.
//! Each consumer is a worker task cycling through:
//!
//! ```text
//!   Disconnected ──► Connecting ──► Provisioning ──► Consuming
//!        ▲                │               │              │
//!        └── retry interval ◄─────────────┴──────────────┘
//! ```
//!
//! Dial, channel and provisioning failures and every session loss are logged and
//! retried after the configured interval. Only configuration errors end the
//! worker; they are reported through the `ConsumerHandle`. Cancelling the
//! consumer's token stops the worker without further reconnects.

use crate::{
    channel::SharedConnection,
    config::{ConnectionConfig, StreamConfig},
    dispatcher::{dispatch, SessionExit},
    errors::AmqpError,
    handle::ConnectionHandle,
    handler::{HandlerContext, MessageHandler},
    publisher::Publisher,
    topology,
};
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Dials, shares and replaces the broker connection, and spawns consumers.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
    cancel: CancellationToken,
    connection: Arc<Mutex<Option<SharedConnection>>>,
}

impl ConnectionManager {
    /// Creates a manager for the broker described by `config`.
    ///
    /// No connection is opened yet; the first consumer or producer dials.
    ///
    /// # Parameters
    /// * `config` - Broker URL and retry interval
    /// * `cancel` - Root cancellation scope; every consumer runs in a child of it
    ///
    /// # Returns
    /// `AmqpError::ConfigurationError` if the broker URL is malformed
    pub fn new(
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> Result<ConnectionManager, AmqpError> {
        config.validate()?;

        Ok(ConnectionManager {
            config: Arc::new(config),
            cancel,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Creates a producer for `stream`.
    ///
    /// Producers neither consume nor watch connection health: they only own a
    /// channel able to publish. Topology is not declared; call `provision` first if
    /// the stream may not exist yet.
    pub async fn new_producer(&self, stream: &StreamConfig) -> Result<Publisher, AmqpError> {
        let connection = self.connection().await?;
        let handle =
            ConnectionHandle::open(connection, stream.name(), self.cancel.child_token()).await?;

        Ok(Publisher::new(handle, stream.clone()))
    }

    /// Starts a consumer for `stream` and returns immediately.
    ///
    /// The handler's `on_init` runs first inside the worker, `on_close` runs
    /// exactly once when the worker stops.
    ///
    /// # Parameters
    /// * `stream` - Stream to consume; its topology is declared on every (re)connect
    /// * `handler` - Handler or `HandlerChain` processing the deliveries
    ///
    /// # Returns
    /// A handle resolving when the worker stops
    pub fn new_consumer<H>(&self, stream: StreamConfig, handler: H) -> ConsumerHandle
    where
        H: MessageHandler + 'static,
    {
        let cancel = self.cancel.child_token();
        let manager = self.clone();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { manager.run_consumer(stream, handler, cancel).await }
        });

        ConsumerHandle { task, cancel }
    }

    /// Declares the topology of `stream`.
    ///
    /// Provisioning runs under the connection lock on a dedicated channel, so two
    /// consumers never redeclare concurrently.
    pub async fn provision(&self, stream: &StreamConfig) -> Result<(), AmqpError> {
        let mut guard = self.connection.lock().await;
        let connection = self.connect_locked(&mut guard).await?;
        let channel = connection.create_channel().await?;

        let result = topology::provision(&channel, stream).await;

        if channel.status().connected() {
            if let Err(err) = channel.close(200, "OK").await {
                warn!(error = err.to_string(), "failed to close provisioning channel");
            }
        }

        result
    }

    /// Closes the shared connection, if any.
    pub async fn close(&self) -> Result<(), AmqpError> {
        match self.connection.lock().await.take() {
            Some(connection) => connection.close("manager closed").await,
            None => Ok(()),
        }
    }

    /// Returns the live connection, dialing a new one when needed.
    async fn connection(&self) -> Result<SharedConnection, AmqpError> {
        let mut guard = self.connection.lock().await;
        self.connect_locked(&mut guard).await
    }

    async fn connect_locked(
        &self,
        current: &mut Option<SharedConnection>,
    ) -> Result<SharedConnection, AmqpError> {
        if let Some(connection) = current.as_ref().filter(|c| c.is_connected()) {
            return Ok(connection.clone());
        }

        // A dead connection is replaced, never kept next to the new one.
        if let Some(stale) = current.take() {
            let _ = stale.close("replaced").await;
        }

        info!(endpoint = self.config.endpoint(), "trying to connect to amqp server");
        let connection = SharedConnection::dial(&self.config).await?;
        info!(endpoint = self.config.endpoint(), "connection established");

        *current = Some(connection.clone());
        Ok(connection)
    }

    /// Drops the shared connection after a broker-level failure.
    async fn reset_connection(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(err) = connection.close("reset after broker failure").await {
                warn!(error = err.to_string(), "error closing amqp connection");
            }
        }
    }

    /// Connecting, Provisioning and subscribing for one session.
    ///
    /// Returns `Ok(None)` when `cancel` fires first. A handle opened before the
    /// cancellation is closed here so its channel is not left on the shared
    /// connection.
    async fn open_session(
        &self,
        stream: &StreamConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<ConnectionHandle>, AmqpError> {
        let connection = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            connection = self.connection() => connection?,
        };
        let mut handle =
            ConnectionHandle::open(connection, stream.name(), cancel.child_token()).await?;

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => None,
            result = async {
                self.provision(stream).await?;
                handle.enable_health_monitor();
                handle.start_consuming().await
            } => Some(result),
        };

        match subscribed {
            Some(Ok(())) => Ok(Some(handle)),
            Some(Err(err)) => {
                let _ = handle.close().await;
                Err(err)
            }
            None => {
                let _ = handle.close().await;
                Ok(None)
            }
        }
    }

    async fn run_consumer<H>(
        &self,
        stream: StreamConfig,
        mut handler: H,
        cancel: CancellationToken,
    ) -> Result<(), AmqpError>
    where
        H: MessageHandler,
    {
        let ctx = HandlerContext::new(stream.name(), cancel.clone());
        handler.on_init(&ctx).await;

        let result = self.consume_until_cancelled(&stream, &mut handler, &cancel).await;

        handler.on_close(&ctx).await;
        result
    }

    async fn consume_until_cancelled<H>(
        &self,
        stream: &StreamConfig,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<(), AmqpError>
    where
        H: MessageHandler,
    {
        loop {
            if cancel.is_cancelled() {
                warn!(queue = stream.name(), "consumer cancelled, connection closed");
                return Ok(());
            }

            match self.open_session(stream, cancel).await {
                Ok(None) => {
                    warn!(queue = stream.name(), "consumer cancelled while connecting");
                    return Ok(());
                }

                Ok(Some(mut handle)) => {
                    info!(queue = stream.name(), "consuming");
                    let exit = match handle.subscription() {
                        Ok(sub) => {
                            dispatch(
                                stream.name(),
                                sub.messages,
                                sub.channel_closed,
                                sub.connection_closed,
                                handler,
                                cancel,
                            )
                            .await
                        }
                        Err(err) => SessionExit::BrokerFailure(err.to_string()),
                    };

                    if let Err(err) = handle.close().await {
                        warn!(error = err.to_string(), "error closing connection handle");
                    }

                    if !exit.should_reconnect() {
                        return Ok(());
                    }

                    if let SessionExit::BrokerFailure(reason) = &exit {
                        error!(queue = stream.name(), reason = %reason, "message processing error");
                        self.reset_connection().await;
                    } else {
                        warn!(queue = stream.name(), reason = %exit, "session lost");
                    }
                }

                Err(err) if err.is_fatal() => {
                    error!(
                        queue = stream.name(),
                        error = err.to_string(),
                        "unrecoverable consumer setup failure"
                    );
                    return Err(err);
                }

                Err(err) => {
                    error!(
                        queue = stream.name(),
                        error = err.to_string(),
                        "error creating amqp connection"
                    );
                    self.reset_connection().await;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(queue = stream.name(), "consumer cancelled while waiting to reconnect");
                    return Ok(());
                }
                _ = time::sleep(self.config.retry_interval()) => {}
            }
        }
    }
}

/// Handle on a running consumer.
pub struct ConsumerHandle {
    task: JoinHandle<Result<(), AmqpError>>,
    cancel: CancellationToken,
}

impl ConsumerHandle {
    /// Stops the consumer. Already-running work finishes its current step first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the consumer to stop.
    ///
    /// # Returns
    /// Ok(()) after cancellation, or the unrecoverable setup error that ended it
    pub async fn wait(self) -> Result<(), AmqpError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "consumer task failed");
                Err(AmqpError::InternalError(err.to_string()))
            }
        }
    }
}
