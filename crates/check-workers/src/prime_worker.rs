//! Prime-check worker.
//!
//! Consumes `prime_check` envelopes. For each one it:
//! 1. Decodes the payload (mismatch is permanent)
//! 2. Checks primality (unparseable number marks the row `failed`, permanent)
//! 3. Resolves the recipient
//! 4. In one transaction, completes the row and enqueues an `email_send`
//!    envelope in the outbox
//!
//! Step 4 only applies to a row still `pending`. A redelivered message
//! whose row is already resolved is acknowledged without enqueuing a
//! second email.

use crate::email::compose_result;
use crate::{PrimeCalculator, RecipientResolver, WorkerError, WorkerResult};
use async_trait::async_trait;
use checker_database::{queries, AsyncDatabase, DatabaseError, PrimeCheckResolution, PrimeCheckStatus};
use checker_outbox::append_envelope;
use observability::TracePropagator;
use std::sync::Arc;
use stream_courier::{
    EmailSendPayload, Envelope, HandlerError, MessageHandler, MessageType, PrimeCheckPayload,
};
use tracing::{debug, info, warn};

/// What a processed prime check message led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimeCheckOutcome {
    /// Row completed and an email enqueued as outbox record `email_record_id`.
    Completed { is_prime: bool, email_record_id: i64 },
    /// Row was already resolved by an earlier delivery.
    AlreadyResolved,
}

enum Resolve {
    Enqueued(i64),
    AlreadyResolved,
    Missing,
}

pub struct PrimeCheckWorker {
    db: AsyncDatabase,
    calculator: Arc<dyn PrimeCalculator>,
    recipients: Arc<dyn RecipientResolver>,
    propagator: TracePropagator,
}

impl PrimeCheckWorker {
    pub fn new(
        db: AsyncDatabase,
        calculator: Arc<dyn PrimeCalculator>,
        recipients: Arc<dyn RecipientResolver>,
        propagator: TracePropagator,
    ) -> Self {
        Self {
            db,
            calculator,
            recipients,
            propagator,
        }
    }

    pub async fn process(&self, envelope: Envelope) -> WorkerResult<PrimeCheckOutcome> {
        let payload: PrimeCheckPayload = envelope.decode_payload()?;
        debug!(
            request_id = payload.request_id,
            number = %payload.number_text,
            "Checking primality"
        );

        let is_prime = match self.calculator.check(&payload.number_text) {
            Ok(is_prime) => is_prime,
            Err(e @ WorkerError::InvalidNumber { .. }) => {
                self.mark_failed(payload.request_id, &envelope.id).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let email = self.recipients.resolve(payload.user_id).await?;
        let (subject, body) = compose_result(&payload.number_text, is_prime);

        // Continue the consumer span's trace, or carry the incoming one
        // forward when no exporter is installed.
        let mut trace_context = self.propagator.inject_current();
        if trace_context.is_empty() {
            trace_context = envelope.trace_context.clone();
        }
        let trace_id = self.propagator.trace_id(&trace_context);

        let resolution = PrimeCheckResolution {
            id: payload.request_id,
            status: PrimeCheckStatus::Completed,
            is_prime: Some(is_prime),
            message_id: Some(envelope.id.clone()),
            trace_id,
        };
        let email_payload = EmailSendPayload {
            request_id: payload.request_id,
            user_id: payload.user_id,
            email,
            subject,
            body,
            is_prime,
            number_text: payload.number_text.clone(),
            message_id: envelope.id.clone(),
        };

        let resolved = self
            .db
            .transaction(move |tx| {
                if !queries::resolve_prime_check(tx, &resolution)? {
                    return match queries::get_prime_check(tx, resolution.id)? {
                        Some(_) => Ok(Resolve::AlreadyResolved),
                        None => Ok(Resolve::Missing),
                    };
                }
                let follow_up = Envelope::new(MessageType::EmailSend, &email_payload, trace_context)
                    .map_err(|e| DatabaseError::InvalidData(e.to_string()))?;
                Ok(Resolve::Enqueued(append_envelope(tx, &follow_up)?))
            })
            .await?;

        match resolved {
            Resolve::Enqueued(email_record_id) => {
                info!(
                    request_id = payload.request_id,
                    is_prime,
                    email_record_id,
                    "Prime check completed"
                );
                Ok(PrimeCheckOutcome::Completed {
                    is_prime,
                    email_record_id,
                })
            }
            Resolve::AlreadyResolved => {
                info!(
                    request_id = payload.request_id,
                    message_id = %envelope.id,
                    "Prime check already resolved, skipping duplicate"
                );
                Ok(PrimeCheckOutcome::AlreadyResolved)
            }
            Resolve::Missing => Err(WorkerError::NotFound(payload.request_id)),
        }
    }

    async fn mark_failed(&self, id: i64, message_id: &str) -> WorkerResult<()> {
        let resolution = PrimeCheckResolution {
            id,
            status: PrimeCheckStatus::Failed,
            is_prime: None,
            message_id: Some(message_id.to_string()),
            trace_id: None,
        };
        let updated = self
            .db
            .call(move |conn| queries::resolve_prime_check(conn, &resolution))
            .await?;
        if updated {
            warn!(request_id = id, "Prime check marked failed");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for PrimeCheckWorker {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        self.process(envelope).await.map(|_| ()).map_err(HandlerError::from)
    }
}
