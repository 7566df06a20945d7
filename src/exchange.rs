// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Builder-style descriptions of the exchanges a stream topology declares. A
//! stream only ever needs two of them: a fanout exchange for publishing and a
//! topic exchange acting as dead-letter exchange.

use lapin::{options::ExchangeDeclareOptions, types::FieldTable};

/// Represents the types of exchanges the topology declares.
///
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its declaration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable exchange definition.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    /// * `kind` - How the exchange routes messages
    pub fn new(name: &str, kind: ExchangeKind) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind,
            durable: false,
        }
    }

    /// Shorthand for a fanout exchange.
    pub fn fanout(name: &str) -> ExchangeDefinition {
        ExchangeDefinition::new(name, ExchangeKind::Fanout)
    }

    /// Shorthand for a topic exchange.
    pub fn topic(name: &str) -> ExchangeDefinition {
        ExchangeDefinition::new(name, ExchangeKind::Topic)
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: false,
            internal: false,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::default()
    }
}
