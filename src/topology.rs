// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Stream Topology
//!
//! Every stream is backed by the same dead-letter-aware layout:
//!
//! ```text
//!   publish ──► <name>.Exchange-fan (fanout) ──┬──► <name>       (main, DLX = <name>.Exchange-dlx)
//!                      ▲                        └──► <name>-snap  (audit copy)
//!                      │
//!                      │ after x-message-ttl      reject ──► <name>.Exchange-dlx (topic)
//!                      │                                           │ "final-dlq"
//!                      └──────────────── <name>-dlq ◄──────────────┘
//! ```
//!
//! A message rejected from the main queue lands in the DLQ, waits there for the
//! TTL and is then recycled onto the fanout exchange, giving it one more chance.
//!
//! The main components are:
//! - `StreamTopology`: the deterministic set of declarations derived from a `StreamConfig`
//! - `Topology` trait: interface for installing declarations on the broker
//! - `AmqpTopology`: `Topology` implementation over a lapin channel

use crate::{
    config::StreamConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{options::QueueBindOptions, types::FieldTable, Channel};
use tracing::{debug, error};

/// The declarations backing one stream, in installation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl StreamTopology {
    /// Derives the full topology of a stream from its configuration.
    pub fn new(stream: &StreamConfig) -> StreamTopology {
        let exchanges = vec![
            ExchangeDefinition::fanout(stream.fanout_exchange()).durable(),
            ExchangeDefinition::topic(stream.dlx_exchange()).durable(),
        ];

        let queues = vec![
            QueueDefinition::new(stream.name())
                .durable()
                .dead_letter(stream.dlx_exchange(), Some(stream.dead_letter_routing_key())),
            QueueDefinition::new(stream.snapshot_queue()).durable(),
            QueueDefinition::new(stream.dead_letter_queue())
                .durable()
                .preserve_headers()
                .dead_letter(stream.fanout_exchange(), None)
                .ttl(stream.dead_letter_ttl()),
        ];

        let bindings = vec![
            QueueBinding::new(stream.name()).exchange(stream.fanout_exchange()),
            QueueBinding::new(stream.snapshot_queue()).exchange(stream.fanout_exchange()),
            QueueBinding::new(stream.dead_letter_queue())
                .exchange(stream.dlx_exchange())
                .routing_key(stream.dead_letter_routing_key()),
        ];

        StreamTopology {
            exchanges,
            queues,
            bindings,
        }
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }
}

/// Trait defining the interface for topology installation.
#[async_trait]
pub trait Topology {
    /// Declares every exchange, queue and binding of `topology`.
    ///
    /// Declarations are idempotent on the broker, so installing the same topology
    /// twice is safe. The first failure aborts the installation; nothing already
    /// declared is rolled back.
    async fn install(&self, topology: &StreamTopology) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology<'tp> {
    channel: &'tp Channel,
}

impl<'tp> AmqpTopology<'tp> {
    /// Creates a new AmqpTopology installing through `channel`.
    pub fn new(channel: &'tp Channel) -> AmqpTopology<'tp> {
        AmqpTopology { channel }
    }
}

#[async_trait]
impl Topology for AmqpTopology<'_> {
    async fn install(&self, topology: &StreamTopology) -> Result<(), AmqpError> {
        self.install_exchanges(&topology.exchanges).await?;
        self.install_queues(&topology.queues).await?;
        self.binding_queues(&topology.bindings).await
    }
}

impl AmqpTopology<'_> {
    async fn install_exchanges(&self, exchanges: &[ExchangeDefinition]) -> Result<(), AmqpError> {
        for exch in exchanges {
            debug!("creating exchange: {}", exch.name);

            self.channel
                .exchange_declare(
                    &exch.name,
                    exch.kind.into(),
                    exch.options(),
                    exch.arguments(),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = %exch.name,
                        "error to declare the exchange"
                    );
                    AmqpError::from_declare(&err, |cause| {
                        AmqpError::DeclareExchangeError(exch.name.clone(), cause)
                    })
                })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, queues: &[QueueDefinition]) -> Result<(), AmqpError> {
        for def in queues {
            debug!("creating queue: {}", def.name);

            self.channel
                .queue_declare(&def.name, def.options(), def.arguments())
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = %def.name,
                        "error to declare the queue"
                    );
                    AmqpError::from_declare(&err, |cause| {
                        AmqpError::DeclareQueueError(def.name.clone(), cause)
                    })
                })?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self, bindings: &[QueueBinding]) -> Result<(), AmqpError> {
        for binding in bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            self.channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    AmqpError::from_declare(&err, |cause| {
                        AmqpError::BindingExchangeToQueueError(
                            binding.exchange_name.clone(),
                            binding.queue_name.clone(),
                            cause,
                        )
                    })
                })?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// Declares the whole topology of `stream` through `channel`.
pub async fn provision(channel: &Channel, stream: &StreamConfig) -> Result<(), AmqpError> {
    AmqpTopology::new(channel)
        .install(&StreamTopology::new(stream))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeKind, queue::*};
    use lapin::types::{AMQPValue, LongInt};
    use std::collections::BTreeSet;

    fn loki() -> StreamTopology {
        StreamTopology::new(&StreamConfig::new("loki").unwrap())
    }

    #[test]
    fn declares_durable_fanout_and_topic_exchanges() {
        let topology = loki();
        let exchanges: Vec<_> = topology
            .exchanges()
            .iter()
            .map(|e| (e.name(), e.kind(), e.is_durable()))
            .collect();

        assert_eq!(
            exchanges,
            vec![
                ("loki.Exchange-fan", ExchangeKind::Fanout, true),
                ("loki.Exchange-dlx", ExchangeKind::Topic, true),
            ]
        );
    }

    #[test]
    fn main_queue_dead_letters_to_the_dlx() {
        let topology = loki();
        let main = &topology.queues()[0];
        let args = main.arguments();

        assert_eq!(main.name(), "loki");
        assert!(main.is_durable());
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString("loki.Exchange-dlx".into()))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString("final-dlq".into()))
        );
    }

    #[test]
    fn dead_letter_queue_recycles_onto_the_fanout_exchange() {
        let topology = loki();
        let dlq = &topology.queues()[2];
        let args = dlq.arguments();

        assert_eq!(dlq.name(), "loki-dlq");
        assert_eq!(args.inner().len(), 3);
        assert_eq!(
            args.inner().get(AMQP_HEADERS_PRESERVED),
            Some(&AMQPValue::Boolean(true))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString("loki.Exchange-fan".into()))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(LongInt::from(15000)))
        );
    }

    #[test]
    fn snapshot_queue_is_plain_and_bound_to_fanout() {
        let topology = loki();
        let snap = &topology.queues()[1];

        assert_eq!(snap.name(), "loki-snap");
        assert!(snap.arguments().inner().is_empty());
        assert!(topology
            .bindings()
            .iter()
            .any(|b| b.queue_name() == "loki-snap"
                && b.exchange_name() == "loki.Exchange-fan"
                && b.key().is_empty()));
    }

    #[test]
    fn derivation_is_deterministic_and_free_of_duplicates() {
        let first = loki();
        let second = loki();
        assert_eq!(first, second);

        let bindings: BTreeSet<_> = first.bindings().iter().collect();
        assert_eq!(bindings.len(), first.bindings().len());

        let queues: BTreeSet<_> = first.queues().iter().map(|q| q.name()).collect();
        assert_eq!(queues.len(), first.queues().len());

        let dlq_binding = first
            .bindings()
            .iter()
            .find(|b| b.queue_name() == "loki-dlq")
            .unwrap();
        assert_eq!(dlq_binding.exchange_name(), "loki.Exchange-dlx");
        assert_eq!(dlq_binding.key(), "final-dlq");
    }
}
