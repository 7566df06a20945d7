// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Settlement
//!
//! Runs one delivery through the handler and settles it:
//! 1. handler succeeded: `on_success`, then ack
//! 2. application failure: `on_error`, then reject without requeue (dead-letter path)
//! 3. broker failure: neither ack nor reject; the session is abandoned and the
//!    broker redelivers the message once the channel is gone

use crate::{handler::MessageHandler, message::Envelope, otel};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Processes a single delivery.
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for the consumer span
/// * `queue` - Queue the delivery came from, used as span name
/// * `envelope` - The delivery to process and settle
/// * `handler` - Handler (or chain) processing the delivery
///
/// # Returns
/// Ok(()) once the delivery is settled, or the reason the session must be
/// abandoned
pub(crate) async fn consume<E, H>(
    tracer: &BoxedTracer,
    queue: &str,
    envelope: &E,
    handler: &mut H,
) -> Result<(), String>
where
    E: Envelope + ?Sized,
    H: MessageHandler + ?Sized,
{
    let msg = envelope.message();
    let mut span = otel::consumer_span(tracer, queue, msg.context());

    debug!(
        delivery_tag = msg.delivery_tag(),
        exchange = msg.exchange(),
        "received message"
    );

    match handler.on_data_received(&msg).await {
        Ok(()) => {
            debug!("message successfully processed");
            handler.on_success().await;

            if let Err(err) = envelope.accept().await {
                error!(error = err.to_string(), "error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Err(err.to_string());
            }

            span.set_status(Status::Ok);
            Ok(())
        }

        Err(err) if err.is_broker() => {
            error!(error = err.to_string(), "broker failure reported by handler");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("broker failure"),
            });
            Err(err.to_string())
        }

        Err(err) => {
            warn!(error = err.to_string(), "error whiling handling msg, rejecting");
            span.record_error(&err);
            handler.on_error(&err).await;

            if let Err(nack_err) = envelope.reject().await {
                error!(error = nack_err.to_string(), "error whiling reject msg");
                span.record_error(&nack_err);
                span.set_status(Status::Error {
                    description: Cow::from("error to reject msg"),
                });
                return Err(nack_err.to_string());
            }

            span.set_status(Status::Error {
                description: Cow::from("msg was sent to dlq"),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{AmqpError, HandlerError},
        handler::MockMessageHandler,
        message::{Message, MockEnvelope},
    };
    use opentelemetry::global;

    fn envelope() -> MockEnvelope {
        let mut envelope = MockEnvelope::new();
        envelope
            .expect_message()
            .returning(|| Message::new(b"payload".to_vec()).with_delivery_tag(1));
        envelope
    }

    #[tokio::test]
    async fn acknowledges_processed_messages_once() {
        let mut envelope = envelope();
        envelope.expect_accept().times(1).returning(|| Ok(()));
        envelope.expect_reject().never();

        let mut handler = MockMessageHandler::new();
        handler
            .expect_on_data_received()
            .times(1)
            .returning(|_| Ok(()));
        handler.expect_on_success().times(1).return_const(());
        handler.expect_on_error().never();

        let tracer = global::tracer("test");
        assert_eq!(consume(&tracer, "loki", &envelope, &mut handler).await, Ok(()));
    }

    #[tokio::test]
    async fn rejects_application_failures_once() {
        let mut envelope = envelope();
        envelope.expect_accept().never();
        envelope.expect_reject().times(1).returning(|| Ok(()));

        let mut handler = MockMessageHandler::new();
        handler
            .expect_on_data_received()
            .times(1)
            .returning(|_| Err(HandlerError::application("malformed")));
        handler.expect_on_success().never();
        handler.expect_on_error().times(1).return_const(());

        let tracer = global::tracer("test");
        assert_eq!(consume(&tracer, "loki", &envelope, &mut handler).await, Ok(()));
    }

    #[tokio::test]
    async fn broker_failures_leave_the_message_unsettled() {
        let mut envelope = envelope();
        envelope.expect_accept().never();
        envelope.expect_reject().never();

        let mut handler = MockMessageHandler::new();
        handler
            .expect_on_data_received()
            .times(1)
            .returning(|_| Err(HandlerError::broker("channel gone")));
        handler.expect_on_success().never();
        handler.expect_on_error().never();

        let tracer = global::tracer("test");
        assert!(consume(&tracer, "loki", &envelope, &mut handler).await.is_err());
    }

    #[tokio::test]
    async fn failed_ack_abandons_the_session() {
        let mut envelope = envelope();
        envelope
            .expect_accept()
            .times(1)
            .returning(|| Err(AmqpError::AckMessageError("closed".to_owned())));

        let mut handler = MockMessageHandler::new();
        handler
            .expect_on_data_received()
            .returning(|_| Ok(()));
        handler.expect_on_success().return_const(());

        let tracer = global::tracer("test");
        assert!(consume(&tracer, "loki", &envelope, &mut handler).await.is_err());
    }
}
