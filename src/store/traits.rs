//! Backend seams used by the persistence gateway.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Exchange, UserRecord};

/// A store of user records keyed by user identifier.
#[async_trait]
pub trait UserBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Load a record. `Ok(None)` means the identifier is not stored here.
    async fn load(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Write the full record, replacing whatever was stored.
    async fn store(&self, user_id: &str, record: &UserRecord) -> Result<(), StoreError>;

    /// Replace only `chat_history` and `last_updated`, keeping every other
    /// field. Creates the record if it does not exist.
    async fn merge_history(
        &self,
        user_id: &str,
        history: &[Exchange],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Produces a connected remote backend.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn UserBackend>, StoreError>;
}
