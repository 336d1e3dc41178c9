//! Routes envelopes to the handler registered for their type.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stream_courier::{Envelope, HandlerError, MessageHandler, MessageType};
use tracing::warn;

/// Type-based router and unknown-type sink.
///
/// Envelopes with no registered handler are logged, counted and
/// acknowledged. A `Dispatcher` with no handlers is the consumer for the
/// `unknown` topic.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
    unknown: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, message_type: MessageType, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(message_type, handler);
        self
    }

    /// Envelopes acknowledged without a handler.
    pub fn unknown_count(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        match self.handlers.get(&envelope.message_type) {
            Some(handler) => handler.handle(envelope).await,
            None => {
                let total = self.unknown.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    message_id = %envelope.id,
                    message_type = %envelope.message_type,
                    unknown_total = total,
                    "No handler for message type, acknowledging"
                );
                Ok(())
            }
        }
    }
}
