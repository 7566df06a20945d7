// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! `MessageHandler` is the boundary to application logic. `HandlerChain` composes
//! several handlers into one: deliveries run through the steps in registration
//! order and the first failing step stops the chain. The chain remembers which
//! step ran last, and `on_success`/`on_error` are delegated to that step alone so
//! each stage owns its side effects.

use crate::{errors::HandlerError, message::Message};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;

/// Context handed to handlers when a consumer starts and stops.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    stream: String,
    cancel: CancellationToken,
}

impl HandlerContext {
    pub fn new(stream: &str, cancel: CancellationToken) -> Self {
        HandlerContext {
            stream: stream.to_owned(),
            cancel,
        }
    }

    /// Name of the stream the consumer reads from.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Cancellation scope of the consumer.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Application logic plugged into a consumer.
///
/// Only `on_data_received` is required. Its error decides the fate of the
/// delivery: `HandlerError::Application` rejects it into the dead-letter path,
/// `HandlerError::Broker` abandons the connection and reconnects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send {
    /// Called once before the consumer starts.
    async fn on_init(&mut self, _ctx: &HandlerContext) {}

    /// Processes one delivery.
    async fn on_data_received(&mut self, msg: &Message) -> Result<(), HandlerError>;

    /// Called after a delivery was processed, before it is acknowledged.
    async fn on_success(&mut self) {}

    /// Called after an application failure, before the delivery is rejected.
    async fn on_error(&mut self, _err: &HandlerError) {}

    /// Called once when the consumer stops.
    async fn on_close(&mut self, _ctx: &HandlerContext) {}
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Box<H> {
    async fn on_init(&mut self, ctx: &HandlerContext) {
        (**self).on_init(ctx).await
    }

    async fn on_data_received(&mut self, msg: &Message) -> Result<(), HandlerError> {
        (**self).on_data_received(msg).await
    }

    async fn on_success(&mut self) {
        (**self).on_success().await
    }

    async fn on_error(&mut self, err: &HandlerError) {
        (**self).on_error(err).await
    }

    async fn on_close(&mut self, ctx: &HandlerContext) {
        (**self).on_close(ctx).await
    }
}

/// Ordered pipeline of handlers; the first registered is the outermost.
#[derive(Default)]
pub struct HandlerChain {
    steps: Vec<Box<dyn MessageHandler>>,
    current: Option<usize>,
}

impl HandlerChain {
    pub fn new() -> Self {
        HandlerChain::default()
    }

    /// Appends a step to the chain.
    pub fn with(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.steps.push(Box::new(handler));
        self
    }

    pub fn push(&mut self, handler: Box<dyn MessageHandler>) {
        self.steps.push(handler);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the step that ran last on the current delivery.
    pub fn current_step(&self) -> Option<usize> {
        self.current
    }
}

#[async_trait]
impl MessageHandler for HandlerChain {
    async fn on_init(&mut self, ctx: &HandlerContext) {
        for step in self.steps.iter_mut() {
            step.on_init(ctx).await;
        }
    }

    async fn on_data_received(&mut self, msg: &Message) -> Result<(), HandlerError> {
        self.current = None;

        for (idx, step) in self.steps.iter_mut().enumerate() {
            self.current = Some(idx);
            step.on_data_received(msg).await?;
        }

        Ok(())
    }

    async fn on_success(&mut self) {
        if let Some(step) = self.current.and_then(|idx| self.steps.get_mut(idx)) {
            step.on_success().await;
        }
    }

    async fn on_error(&mut self, err: &HandlerError) {
        if let Some(step) = self.current.and_then(|idx| self.steps.get_mut(idx)) {
            step.on_error(err).await;
        }
    }

    async fn on_close(&mut self, ctx: &HandlerContext) {
        for step in self.steps.iter_mut() {
            step.on_close(ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn passing(times: usize) -> MockMessageHandler {
        let mut step = MockMessageHandler::new();
        step.expect_on_data_received()
            .times(times)
            .returning(|_| Ok(()));
        step
    }

    #[tokio::test]
    async fn runs_steps_in_registration_order() {
        let mut seq = mockall::Sequence::new();
        let mut first = MockMessageHandler::new();
        let mut second = MockMessageHandler::new();

        first
            .expect_on_data_received()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        second
            .expect_on_data_received()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut chain = HandlerChain::new().with(first).with(second);

        assert_eq!(chain.on_data_received(&Message::new(b"x".to_vec())).await, Ok(()));
        assert_eq!(chain.current_step(), Some(1));
    }

    #[tokio::test]
    async fn first_failure_stops_the_chain() {
        let mut failing = MockMessageHandler::new();
        failing
            .expect_on_data_received()
            .times(1)
            .returning(|_| Err(HandlerError::application("bad payload")));
        failing
            .expect_on_error()
            .with(eq(HandlerError::application("bad payload")))
            .times(1)
            .return_const(());

        let mut later = MockMessageHandler::new();
        later.expect_on_data_received().never();
        later.expect_on_error().never();

        let mut chain = HandlerChain::new().with(passing(1)).with(failing).with(later);
        let err = chain
            .on_data_received(&Message::new(b"x".to_vec()))
            .await
            .unwrap_err();

        assert_eq!(chain.current_step(), Some(1));
        chain.on_error(&err).await;
    }

    #[tokio::test]
    async fn success_goes_to_the_last_step_only() {
        let mut first = passing(1);
        first.expect_on_success().never();

        let mut last = passing(1);
        last.expect_on_success().times(1).return_const(());

        let mut chain = HandlerChain::new().with(first).with(last);
        chain
            .on_data_received(&Message::new(b"x".to_vec()))
            .await
            .unwrap();
        chain.on_success().await;
    }

    #[tokio::test]
    async fn lifecycle_hooks_reach_every_step() {
        let ctx = HandlerContext::new("loki", CancellationToken::new());
        let mut chain = HandlerChain::new();

        for _ in 0..3 {
            let mut step = MockMessageHandler::new();
            step.expect_on_init().times(1).return_const(());
            step.expect_on_close().times(1).return_const(());
            chain.push(Box::new(step));
        }

        chain.on_init(&ctx).await;
        chain.on_close(&ctx).await;
        assert_eq!(chain.len(), 3);
    }

    #[tokio::test]
    async fn empty_chain_accepts_everything() {
        let mut chain = HandlerChain::new();

        assert!(chain.is_empty());
        assert_eq!(chain.on_data_received(&Message::new(b"x".to_vec())).await, Ok(()));
        chain.on_success().await;
        assert_eq!(chain.current_step(), None);
    }
}
