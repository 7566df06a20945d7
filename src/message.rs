// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumed Messages
//!
//! Handlers only ever see a `Message`: the payload plus delivery metadata.
//! Settling the delivery (ack or reject) is the dispatch loop's job and goes
//! through the `Envelope` trait, implemented for lapin deliveries.

use crate::{
    errors::{AmqpError, HandlerError},
    otel,
};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicRejectOptions},
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use serde::de::DeserializeOwned;

/// Handler-facing view of a delivery.
#[derive(Debug, Clone, Default)]
pub struct Message {
    payload: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    content_type: Option<String>,
    message_id: Option<String>,
    context: Context,
}

impl Message {
    /// Creates a message carrying `payload` and no delivery metadata.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = tag;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Broker-assigned identity of the delivery on its channel.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Trace context propagated by the publisher.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Decodes the JSON payload into `T`.
    ///
    /// A malformed payload is an application failure, so returning this error
    /// from a handler rejects the message.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

impl From<&Delivery> for Message {
    fn from(delivery: &Delivery) -> Self {
        let props = &delivery.properties;

        Message {
            payload: delivery.data.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            content_type: props.content_type().as_ref().map(|v| v.to_string()),
            message_id: props.message_id().as_ref().map(|v| v.to_string()),
            context: otel::extract(props.headers().as_ref()),
        }
    }
}

/// A delivery that must be settled exactly once.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Envelope: Send + Sync {
    /// Builds the handler-facing view of this delivery.
    fn message(&self) -> Message;

    /// Acknowledges the delivery.
    async fn accept(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery without requeueing it, handing it to the dead-letter path.
    async fn reject(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl Envelope for Delivery {
    fn message(&self) -> Message {
        Message::from(self)
    }

    async fn accept(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn reject(&self) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}
