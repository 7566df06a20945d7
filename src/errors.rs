// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Two error families live here. `AmqpError` covers everything the runtime itself
//! can hit while talking to the broker: dialing, opening channels, declaring the
//! stream topology, consuming, publishing and settling deliveries. `HandlerError`
//! is what application handlers return, and it tells the dispatch loop whether the
//! failure concerns the message or the transport underneath it.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Apart from `ConfigurationError`, every variant is a transport failure the
/// connection manager recovers from by tearing the session down and retrying
/// after the configured interval.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Malformed configuration or topology arguments rejected by the broker
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring the named exchange, with the broker's reason
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring the named queue, with the broker's reason
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The handle was asked for its message stream before consuming started
    #[error("handle is not consuming")]
    NotConsuming,

    /// Error switching the channel into publisher-confirm mode
    #[error("failure to enable publisher confirms `{0}`")]
    ConfirmSelectError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(String),

    /// Error closing a channel or connection
    #[error("failure to close `{0}`")]
    CloseError(String),
}

impl AmqpError {
    /// Reports whether retrying cannot fix this error.
    ///
    /// Only configuration problems are fatal; the consumer worker hands them to the
    /// caller through its terminal-failure handle instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AmqpError::ConfigurationError(_))
    }

    /// Classifies a lapin error raised while declaring topology.
    ///
    /// A `PRECONDITION_FAILED` reply means an exchange or queue already exists with
    /// different arguments, which no amount of redialing will fix.
    pub(crate) fn from_declare(
        err: &lapin::Error,
        transport: impl FnOnce(String) -> AmqpError,
    ) -> AmqpError {
        if let lapin::Error::ProtocolError(amqp) = err {
            if *amqp.kind() == AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) {
                return AmqpError::ConfigurationError(err.to_string());
            }
        }

        transport(err.to_string())
    }
}

/// Failure reported by a message handler.
///
/// The two variants drive different outcomes in the dispatch loop: an
/// application failure rejects the one message, a broker failure abandons the
/// whole session and reconnects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The underlying transport or session is unusable
    #[error("broker failure: {0}")]
    Broker(String),

    /// The message could not be processed
    #[error("processing failure: {0}")]
    Application(String),
}

impl HandlerError {
    pub fn broker(reason: impl Into<String>) -> Self {
        HandlerError::Broker(reason.into())
    }

    pub fn application(reason: impl Into<String>) -> Self {
        HandlerError::Application(reason.into())
    }

    pub fn is_broker(&self) -> bool {
        matches!(self, HandlerError::Broker(_))
    }
}

impl From<lapin::Error> for HandlerError {
    fn from(err: lapin::Error) -> Self {
        HandlerError::Broker(err.to_string())
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        HandlerError::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Application(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(AmqpError::ConfigurationError("bad ttl".to_owned()).is_fatal());
        assert!(!AmqpError::ConnectionError("refused".to_owned()).is_fatal());
        assert!(!AmqpError::DeclareQueueError("loki".to_owned(), "closed".to_owned()).is_fatal());
    }

    #[test]
    fn declare_errors_without_precondition_stay_transport_errors() {
        let err = lapin::Error::InvalidChannelState(lapin::ChannelState::Closed);
        let mapped = AmqpError::from_declare(&err, |cause| {
            AmqpError::DeclareQueueError("loki".to_owned(), cause)
        });

        assert_eq!(
            mapped,
            AmqpError::DeclareQueueError("loki".to_owned(), err.to_string())
        );
        assert!(mapped.to_string().contains(&err.to_string()));
    }

    #[test]
    fn malformed_json_is_an_application_failure() {
        let err = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();

        assert!(!HandlerError::from(err).is_broker());
    }
}
