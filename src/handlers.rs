// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Stock Handlers
//!
//! Small building blocks meant to be composed in a `HandlerChain`:
//! `AuditLog` records what happened to each delivery under a step name, and
//! `JsonPayload` decodes the payload before handing it to application code.

use crate::{
    errors::HandlerError,
    handler::{HandlerContext, MessageHandler},
    message::Message,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData};
use tracing::{info, warn};

/// Audit step logging received, processed and failed deliveries.
pub struct AuditLog {
    name: String,
    last_tag: Option<u64>,
}

impl AuditLog {
    pub fn new(name: &str) -> Self {
        AuditLog {
            name: name.to_owned(),
            last_tag: None,
        }
    }
}

#[async_trait]
impl MessageHandler for AuditLog {
    async fn on_init(&mut self, ctx: &HandlerContext) {
        info!(step = %self.name, stream = ctx.stream(), "audit started");
    }

    async fn on_data_received(&mut self, msg: &Message) -> Result<(), HandlerError> {
        self.last_tag = Some(msg.delivery_tag());
        info!(
            step = %self.name,
            delivery_tag = msg.delivery_tag(),
            redelivered = msg.redelivered(),
            size = msg.payload().len(),
            "message received"
        );
        Ok(())
    }

    async fn on_success(&mut self) {
        info!(step = %self.name, delivery_tag = self.last_tag, "message processed");
    }

    async fn on_error(&mut self, err: &HandlerError) {
        warn!(
            step = %self.name,
            delivery_tag = self.last_tag,
            error = err.to_string(),
            "message failed"
        );
    }

    async fn on_close(&mut self, ctx: &HandlerContext) {
        info!(step = %self.name, stream = ctx.stream(), "audit stopped");
    }
}

/// Decodes JSON payloads into `T` and hands them to a closure.
///
/// A payload that does not decode is reported as an application failure, so the
/// delivery is rejected without the closure ever running.
pub struct JsonPayload<T, F> {
    callback: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F, Fut> JsonPayload<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    pub fn new(callback: F) -> Self {
        JsonPayload {
            callback,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> MessageHandler for JsonPayload<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn on_data_received(&mut self, msg: &Message) -> Result<(), HandlerError> {
        let payload = msg.json::<T>()?;
        (self.callback)(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerChain;
    use serde::Deserialize;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    #[tokio::test]
    async fn hands_decoded_payloads_to_the_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut handler = JsonPayload::new(move |order: Order| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(order.id);
                Ok(())
            }
        });

        handler
            .on_data_received(&Message::new(br#"{"id": 3}"#.to_vec()))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn undecodable_payloads_stop_an_audited_chain() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();

        let mut chain = HandlerChain::new()
            .with(AuditLog::new("step-1"))
            .with(JsonPayload::new(move |_: Order| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }
            }))
            .with(AuditLog::new("step-3"));

        let err = chain
            .on_data_received(&Message::new(b"{".to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Application(_)));
        assert_eq!(chain.current_step(), Some(1));
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
