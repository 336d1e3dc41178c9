//! Producer-side transactional write and plain reads.

use crate::store::append_envelope;
use crate::{OutboxError, OutboxResult};
use checker_database::{queries, AsyncDatabase, DatabaseError, NewPrimeCheck, PrimeCheck};
use observability::{TraceContext, TracePropagator};
use stream_courier::{Envelope, MessageType, PrimeCheckPayload};
use tracing::{debug, info};

/// Entry point the request layer calls. It never touches the broker.
#[derive(Clone)]
pub struct PrimeCheckService {
    db: AsyncDatabase,
    propagator: TracePropagator,
}

impl PrimeCheckService {
    pub fn new(db: AsyncDatabase, propagator: TracePropagator) -> Self {
        Self { db, propagator }
    }

    /// Create a pending prime check and enqueue its `prime_check` event.
    ///
    /// The row and the outbox record are written in one transaction. If
    /// `trace_context` is empty the current span's context is used instead.
    /// Returns the row as stored, still `pending`; delivery happens later.
    pub async fn create_prime_check(
        &self,
        user_id: i64,
        number_text: &str,
        trace_context: TraceContext,
    ) -> OutboxResult<PrimeCheck> {
        let number_text = number_text.trim().to_string();
        if number_text.is_empty() {
            return Err(OutboxError::Validation(
                "number must not be empty".to_string(),
            ));
        }

        let trace_context = if trace_context.is_empty() {
            self.propagator.inject_current()
        } else {
            trace_context
        };
        let new_check = NewPrimeCheck {
            user_id,
            number_text,
            trace_id: self.propagator.trace_id(&trace_context),
        };

        let check = self
            .db
            .transaction(move |tx| {
                let check = queries::insert_prime_check(tx, &new_check)?;
                let payload = PrimeCheckPayload {
                    request_id: check.id,
                    user_id: check.user_id,
                    number_text: check.number_text.clone(),
                };
                let envelope = Envelope::new(MessageType::PrimeCheck, &payload, trace_context)
                    .map_err(|e| DatabaseError::InvalidData(e.to_string()))?;
                let record_id = append_envelope(tx, &envelope)?;
                debug!(check_id = check.id, record_id, "Prime check queued in outbox");
                Ok(check)
            })
            .await?;

        info!(
            check_id = check.id,
            user_id = check.user_id,
            trace_id = check.trace_id.as_deref().unwrap_or(""),
            "Prime check created"
        );
        Ok(check)
    }

    pub async fn get_prime_check(&self, id: i64) -> OutboxResult<Option<PrimeCheck>> {
        Ok(self
            .db
            .call(move |conn| queries::get_prime_check(conn, id))
            .await?)
    }

    /// Newest first.
    pub async fn list_prime_checks(&self) -> OutboxResult<Vec<PrimeCheck>> {
        Ok(self.db.call(|conn| queries::list_prime_checks(conn)).await?)
    }
}
