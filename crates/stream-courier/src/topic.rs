//! Topic naming.
//!
//! Topic `T` is backed by the stream `T_stream` and read through the
//! consumer group `T_consumer`. One group per topic, shared by every worker
//! process, so a restart resumes from the group's pending entries.

use crate::{CourierError, CourierResult};

/// Stream key backing `topic`.
pub fn stream_name(topic: &str) -> String {
    format!("{}_stream", topic)
}

/// Durable consumer group for `topic`.
pub fn consumer_group_name(topic: &str) -> String {
    format!("{}_consumer", topic)
}

/// Topics are single tokens of ASCII letters, digits, `-`, `_` and `.`.
pub fn validate_topic(topic: &str) -> CourierResult<()> {
    let valid = !topic.is_empty()
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CourierError::InvalidTopic(topic.to_string()))
    }
}
