// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Stream Publisher
//!
//! Publishes to the fanout exchange of a stream with an empty routing key, so
//! every message reaches both the main queue and the snapshot queue. The channel
//! is switched to publisher-confirm mode before the first publish, but confirms
//! are not awaited: publishing is fire-and-forget.

use crate::{config::StreamConfig, errors::AmqpError, handle::ConnectionHandle, otel};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error};
use uuid::Uuid;

/// Content type of `Json` payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of raw byte and text payloads
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Anything that can be turned into a message body.
pub trait Payload {
    fn to_bytes(&self) -> Result<Vec<u8>, AmqpError>;

    /// MIME type announced in the message properties.
    fn content_type(&self) -> &'static str {
        OCTET_STREAM_CONTENT_TYPE
    }
}

impl Payload for [u8] {
    fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        Ok(self.to_vec())
    }
}

impl Payload for Vec<u8> {
    fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        Ok(self.clone())
    }
}

impl Payload for str {
    fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        Ok(self.as_bytes().to_vec())
    }
}

impl Payload for String {
    fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        Ok(self.as_bytes().to_vec())
    }
}

/// Serializes the wrapped value as JSON.
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize> Payload for Json<T> {
    fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(&self.0).map_err(|err| {
            error!(error = err.to_string(), "error serializing payload");
            AmqpError::SerializePayloadError(err.to_string())
        })
    }

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }
}

/// Publishes messages onto a stream.
pub struct Publisher {
    handle: ConnectionHandle,
    stream: StreamConfig,
    confirms: bool,
}

impl Publisher {
    pub(crate) fn new(handle: ConnectionHandle, stream: StreamConfig) -> Publisher {
        Publisher {
            handle,
            stream,
            confirms: false,
        }
    }

    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    /// Publishes `payload` with the current trace context.
    pub async fn publish<P: Payload + ?Sized>(&mut self, payload: &P) -> Result<(), AmqpError> {
        self.publish_with_context(&Context::current(), payload).await
    }

    /// Publishes `payload`, propagating `ctx` in the message headers.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context for tracing
    /// * `payload` - Message body
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the frame, confirms are not awaited
    pub async fn publish_with_context<P: Payload + ?Sized>(
        &mut self,
        ctx: &Context,
        payload: &P,
    ) -> Result<(), AmqpError> {
        let body = payload.to_bytes()?;
        self.enable_confirms().await?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut headers);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let _confirm = self
            .handle
            .channel()
            .basic_publish(
                self.stream.fanout_exchange(),
                "",
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(payload.content_type()))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_timestamp(timestamp)
                    .with_headers(FieldTable::from(headers)),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        debug!(exchange = self.stream.fanout_exchange(), "message published");
        Ok(())
    }

    /// Releases the publisher's channel.
    pub async fn close(mut self) -> Result<(), AmqpError> {
        self.handle.close().await
    }

    async fn enable_confirms(&mut self) -> Result<(), AmqpError> {
        if self.confirms {
            return Ok(());
        }

        self.handle
            .channel()
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error confirming channel");
                AmqpError::ConfirmSelectError(err.to_string())
            })?;

        self.confirms = true;
        Ok(())
    }
}
