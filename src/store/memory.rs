//! In-memory remote store stand-in.
//!
//! Documents are kept in the remote wire shape (tagged history objects), so
//! reads go through the same normalization as the real remote store. Failures
//! can be injected to simulate outages.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, StoreError};
use crate::model::{Exchange, UserRecord};
use crate::store::traits::{RemoteConnector, UserBackend};
use crate::store::wire;

/// Build an error of the given kind, as a failing backend would report it.
pub fn simulated_error(kind: ErrorKind) -> StoreError {
    const REASON: &str = "simulated failure";
    match kind {
        ErrorKind::CredentialMissing => StoreError::CredentialMissing(REASON.to_string()),
        ErrorKind::BackendUnreachable => StoreError::unreachable("memory", REASON),
        ErrorKind::NotProvisioned => StoreError::NotProvisioned(REASON.to_string()),
        ErrorKind::LocalIo => StoreError::LocalIo {
            path: PathBuf::from("memory"),
            source: std::io::Error::other(REASON),
        },
        ErrorKind::MalformedRecord => StoreError::malformed("memory", REASON),
        ErrorKind::InvalidUserId => StoreError::InvalidUserId {
            user_id: String::new(),
            reason: REASON.to_string(),
        },
    }
}

/// Documents held in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    docs: Mutex<HashMap<String, Map<String, Value>>>,
    failure: Mutex<Option<ErrorKind>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following operation fail with `kind`, or heal with `None`.
    pub fn fail_with(&self, kind: Option<ErrorKind>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = kind;
    }

    /// Raw stored document, in remote wire shape.
    pub fn document(&self, user_id: &str) -> Option<Map<String, Value>> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    /// Seed a raw document, bypassing encoding.
    pub fn insert_document(&self, user_id: &str, fields: Map<String, Value>) {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), fields);
    }

    fn check(&self) -> Result<(), StoreError> {
        match *self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(kind) => Err(simulated_error(kind)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UserBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        self.check()?;
        match self.document(user_id) {
            Some(fields) => wire::from_document(user_id, fields).map(Some),
            None => Ok(None),
        }
    }

    async fn store(&self, user_id: &str, record: &UserRecord) -> Result<(), StoreError> {
        self.check()?;
        let fields = wire::to_document(user_id, record, Utc::now())?;
        self.insert_document(user_id, fields);
        Ok(())
    }

    async fn merge_history(
        &self,
        user_id: &str,
        history: &[Exchange],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let patch = wire::history_patch(history, updated_at);
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.entry(user_id.to_string()).or_default().extend(patch);
        Ok(())
    }
}

/// Connector handing out a shared `MemoryBackend`.
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
    connect_failure: Mutex<Option<ErrorKind>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            connect_failure: Mutex::new(None),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Make connection attempts fail with `kind`, or succeed with `None`.
    pub fn fail_connect_with(&self, kind: Option<ErrorKind>) {
        *self
            .connect_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = kind;
    }

    /// Number of connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn UserBackend>, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failure = *self
            .connect_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match failure {
            Some(kind) => Err(simulated_error(kind)),
            None => Ok(Arc::clone(&self.backend) as Arc<dyn UserBackend>),
        }
    }
}
