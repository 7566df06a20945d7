// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # automq
//!
//! A resilient RabbitMQ consumer/producer runtime. A [`manager::ConnectionManager`]
//! owns the broker connection, declares a dead-letter-aware topology for each
//! stream, and runs consumers that push every delivery through a
//! [`handler::HandlerChain`], reconnecting after a fixed interval whenever the
//! connection is lost.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handle;
pub mod handler;
pub mod handlers;
pub mod health;
pub mod manager;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use config::{ConnectionConfig, StreamConfig};
pub use errors::{AmqpError, HandlerError};
pub use handler::{HandlerChain, HandlerContext, MessageHandler};
pub use manager::{ConnectionManager, ConsumerHandle};
pub use message::Message;
pub use publisher::{Json, Payload, Publisher};
