//! Email delivery.
//!
//! [`SmtpEmailSender`] speaks just enough SMTP to hand one message to a
//! relay (no AUTH, no TLS): `EHLO`, `MAIL FROM`, `RCPT TO`, `DATA`, `QUIT`.
//! Local development points it at a catch-all relay such as MailHog.

use crate::{WorkerError, WorkerResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// One outgoing email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Prime check the email reports on.
    pub request_id: i64,
    /// Broker id of the prime check message; part of `Message-ID`.
    pub message_id: String,
}

/// Subject and body for a prime check result.
pub fn compose_result(number_text: &str, is_prime: bool) -> (String, String) {
    if is_prime {
        (
            format!("Prime Check Result: {} is Prime!", number_text),
            format!("Good news! The number {} is a prime number.", number_text),
        )
    } else {
        (
            format!("Prime Check Result: {} is not Prime", number_text),
            format!("The number {} is not a prime number.", number_text),
        )
    }
}

/// Sends emails for the email-send worker.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Fails with [`WorkerError::DomainAction`] when the message was not
    /// accepted.
    async fn send(&self, message: &EmailMessage) -> WorkerResult<()>;
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    /// Bound on connecting and on each reply.
    pub timeout: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1025,
            from: "noreply@primechecker.local".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Plain SMTP client, one connection per message.
#[derive(Debug, Clone)]
pub struct SmtpEmailSender {
    config: SmtpConfig,
}

impl SmtpEmailSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Domain part of the sender address, used for `EHLO` and `Message-ID`.
    fn mail_domain(&self) -> &str {
        self.config
            .from
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .unwrap_or("localhost")
    }

    async fn deliver(&self, message: &EmailMessage) -> WorkerResult<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = tokio::time::timeout(self.config.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| smtp_error(format!("connect to {} timed out", addr)))?
            .map_err(|e| smtp_error(format!("connect to {}: {}", addr, e)))?;

        let (read, write) = stream.into_split();
        let mut session = SmtpSession {
            reader: BufReader::new(read),
            writer: write,
            timeout: self.config.timeout,
        };

        session.expect(&[220]).await?;
        session.command(&format!("EHLO {}", self.mail_domain()), &[250]).await?;
        session.command(&format!("MAIL FROM:<{}>", self.config.from), &[250]).await?;
        session.command(&format!("RCPT TO:<{}>", message.to), &[250, 251]).await?;
        session.command("DATA", &[354]).await?;

        let data = format_message(&self.config.from, self.mail_domain(), message);
        session.write_raw(&data).await?;
        session.command(".", &[250]).await?;

        // The message is accepted at this point
        if let Err(e) = session.command("QUIT", &[221]).await {
            debug!(error = %e, "QUIT not acknowledged");
        }
        Ok(())
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, message: &EmailMessage) -> WorkerResult<()> {
        self.deliver(message).await?;
        info!(
            to = %message.to,
            request_id = message.request_id,
            message_id = %message.message_id,
            "Email sent"
        );
        Ok(())
    }
}

fn smtp_error(reason: String) -> WorkerError {
    WorkerError::DomainAction(format!("smtp: {}", reason))
}

struct SmtpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl SmtpSession {
    async fn command(&mut self, line: &str, accepted: &[u16]) -> WorkerResult<u16> {
        self.write_raw(&format!("{}\r\n", line)).await?;
        self.expect(accepted).await
    }

    async fn write_raw(&mut self, data: &str) -> WorkerResult<()> {
        self.writer
            .write_all(data.as_bytes())
            .await
            .map_err(|e| smtp_error(format!("write: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| smtp_error(format!("flush: {}", e)))
    }

    /// Read one (possibly multi-line) reply and check its code.
    async fn expect(&mut self, accepted: &[u16]) -> WorkerResult<u16> {
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
                .await
                .map_err(|_| smtp_error("reply timed out".to_string()))?
                .map_err(|e| smtp_error(format!("read: {}", e)))?;
            if read == 0 {
                return Err(smtp_error("connection closed by server".to_string()));
            }

            let line = line.trim_end();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| smtp_error(format!("malformed reply {:?}", line)))?;

            // "250-..." continues, "250 ..." ends the reply
            if line.as_bytes().get(3) == Some(&b'-') {
                continue;
            }
            if accepted.contains(&code) {
                return Ok(code);
            }
            return Err(smtp_error(format!("unexpected reply {:?}", line)));
        }
    }
}

/// Headers plus dot-stuffed body with CRLF line endings. The terminating
/// "." line is sent separately.
fn format_message(from: &str, domain: &str, message: &EmailMessage) -> String {
    let mut data = String::new();
    data.push_str(&format!("From: <{}>\r\n", from));
    data.push_str(&format!("To: <{}>\r\n", message.to));
    data.push_str(&format!("Subject: {}\r\n", message.subject));
    data.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
    data.push_str(&format!(
        "Message-ID: <{}-{}@{}>\r\n",
        message.request_id, message.message_id, domain
    ));
    data.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    data.push_str("\r\n");

    for line in message.body.lines() {
        if line.starts_with('.') {
            data.push('.');
        }
        data.push_str(line);
        data.push_str("\r\n");
    }
    data
}

/// Test sender that records messages and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<EmailMessage>>,
    failures_remaining: Mutex<u32>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends.
    pub fn fail_next(&self, count: u32) {
        *self.failures_remaining.lock() = count;
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, message: &EmailMessage) -> WorkerResult<()> {
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WorkerError::DomainAction("injected send failure".to_string()));
            }
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn message() -> EmailMessage {
        EmailMessage {
            to: "user@example.com".to_string(),
            subject: "Prime Check Result: 17 is Prime!".to_string(),
            body: "Good news!\n.hidden line\nThe end.".to_string(),
            request_id: 42,
            message_id: "1718000000000-0".to_string(),
        }
    }

    /// Minimal relay that accepts one message and returns the session
    /// transcript (client lines only).
    async fn fake_relay(reject_rcpt: bool) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut transcript = String::new();
            let mut in_data = false;

            write.write_all(b"220 fake relay ready\r\n").await.unwrap();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                transcript.push_str(&line);
                let trimmed = line.trim_end();

                let reply = if in_data {
                    if trimmed == "." {
                        in_data = false;
                        "250 queued\r\n"
                    } else {
                        continue;
                    }
                } else if trimmed.starts_with("EHLO") {
                    "250-fake relay\r\n250 SIZE 1000000\r\n"
                } else if trimmed.starts_with("RCPT") && reject_rcpt {
                    "550 no such user\r\n"
                } else if trimmed == "DATA" {
                    in_data = true;
                    "354 go ahead\r\n"
                } else if trimmed == "QUIT" {
                    write.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                } else {
                    "250 ok\r\n"
                };
                write.write_all(reply.as_bytes()).await.unwrap();
            }

            let mut rest = String::new();
            let _ = reader.read_to_string(&mut rest).await;
            transcript
        });

        (port, handle)
    }

    fn sender(port: u16) -> SmtpEmailSender {
        SmtpEmailSender::new(SmtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            from: "noreply@primechecker.local".to_string(),
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn test_compose_result() {
        let (subject, body) = compose_result("17", true);
        assert_eq!(subject, "Prime Check Result: 17 is Prime!");
        assert_eq!(body, "Good news! The number 17 is a prime number.");

        let (subject, body) = compose_result("21", false);
        assert_eq!(subject, "Prime Check Result: 21 is not Prime");
        assert_eq!(body, "The number 21 is not a prime number.");
    }

    #[test]
    fn test_format_message_headers_and_dot_stuffing() {
        let data = format_message("noreply@primechecker.local", "primechecker.local", &message());
        assert!(data.contains("To: <user@example.com>\r\n"));
        assert!(data.contains("Subject: Prime Check Result: 17 is Prime!\r\n"));
        assert!(data.contains("Message-ID: <42-1718000000000-0@primechecker.local>\r\n"));
        assert!(data.contains("Date: "));
        assert!(data.contains("\r\n\r\nGood news!\r\n..hidden line\r\nThe end.\r\n"));
    }

    #[tokio::test]
    async fn test_smtp_session() {
        let (port, relay) = fake_relay(false).await;
        sender(port).send(&message()).await.unwrap();

        let transcript = relay.await.unwrap();
        assert!(transcript.starts_with("EHLO primechecker.local\r\n"));
        assert!(transcript.contains("MAIL FROM:<noreply@primechecker.local>\r\n"));
        assert!(transcript.contains("RCPT TO:<user@example.com>\r\n"));
        assert!(transcript.contains("..hidden line\r\n"));
        assert!(transcript.ends_with(".\r\nQUIT\r\n"));
    }

    #[tokio::test]
    async fn test_rejected_recipient_is_domain_error() {
        let (port, _relay) = fake_relay(true).await;
        let result = sender(port).send(&message()).await;
        assert!(matches!(result, Err(WorkerError::DomainAction(_))));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_domain_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = sender(port).send(&message()).await;
        assert!(matches!(result, Err(WorkerError::DomainAction(_))));
    }

    #[tokio::test]
    async fn test_recording_sender() {
        let sender = RecordingEmailSender::new();
        sender.fail_next(1);
        assert!(sender.send(&message()).await.is_err());
        sender.send(&message()).await.unwrap();
        assert_eq!(sender.sent(), vec![message()]);
    }
}
