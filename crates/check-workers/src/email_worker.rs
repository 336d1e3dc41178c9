//! Email-send worker.

use crate::{EmailMessage, EmailSender, WorkerResult};
use async_trait::async_trait;
use std::sync::Arc;
use stream_courier::{EmailSendPayload, Envelope, HandlerError, MessageHandler};
use tracing::debug;

/// Consumes `email_send` envelopes and hands them to an [`EmailSender`].
///
/// A send failure is retried through redelivery, so a relay outage can
/// produce a duplicate email once it recovers.
pub struct EmailSendWorker {
    sender: Arc<dyn EmailSender>,
}

impl EmailSendWorker {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }

    pub async fn process(&self, envelope: Envelope) -> WorkerResult<EmailMessage> {
        let payload: EmailSendPayload = envelope.decode_payload()?;
        let message = EmailMessage {
            to: payload.email,
            subject: payload.subject,
            body: payload.body,
            request_id: payload.request_id,
            message_id: payload.message_id,
        };

        debug!(request_id = message.request_id, to = %message.to, "Sending result email");
        self.sender.send(&message).await?;
        Ok(message)
    }
}

#[async_trait]
impl MessageHandler for EmailSendWorker {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        self.process(envelope).await.map(|_| ()).map_err(HandlerError::from)
    }
}
