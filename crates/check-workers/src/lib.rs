//! Workers for the prime checker pipeline.
//!
//! This crate provides:
//! - PrimeCheckWorker: checks a number, completes its row and enqueues the
//!   result email through the outbox
//! - EmailSendWorker: delivers result emails over SMTP
//! - Dispatcher: routes envelopes by type; unknown types are counted and
//!   acknowledged
//!
//! Workers implement `stream_courier::MessageHandler` and are driven by a
//! `stream_courier::Subscriber`. Their errors classify into retryable
//! (nak, redeliver) and permanent (ack, drop).

mod dispatch;
mod email;
mod email_worker;
mod error;
mod prime;
mod prime_worker;
mod recipient;

#[cfg(test)]
mod tests;

pub use dispatch::Dispatcher;
pub use email::{
    compose_result, EmailMessage, EmailSender, RecordingEmailSender, SmtpConfig, SmtpEmailSender,
};
pub use email_worker::EmailSendWorker;
pub use error::{WorkerError, WorkerResult};
pub use prime::{parse_number, Number, PrimeCalculator, ProbablePrime, DEFAULT_ROUNDS};
pub use prime_worker::{PrimeCheckOutcome, PrimeCheckWorker};
pub use recipient::{RecipientResolver, StaticRecipient};
