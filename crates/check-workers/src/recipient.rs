//! Recipient lookup.

use async_trait::async_trait;
use crate::WorkerResult;

/// Resolves the address a user's results are mailed to.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(&self, user_id: i64) -> WorkerResult<String>;
}

/// Sends every result to one configured address.
#[derive(Debug, Clone)]
pub struct StaticRecipient {
    address: String,
}

impl StaticRecipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl RecipientResolver for StaticRecipient {
    async fn resolve(&self, _user_id: i64) -> WorkerResult<String> {
        Ok(self.address.clone())
    }
}
