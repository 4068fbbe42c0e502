//! Persistence gateway: user records with remote-or-local fallback.
//!
//! Every operation tries the remote document store first (when one is
//! connected) and falls back to the local file backend within the same call.
//! Callers only ever see `bool` / `Option`: storage failures are logged and
//! absorbed here so they cannot take the conversation down.
//!
//! Remote connection state:
//!
//! ```text
//! Uninitialized ──connect ok──▶ RemoteReady        (kept for the gateway's lifetime)
//!       │
//!       └──connect failed──▶ RemoteUnavailable ──cooldown elapsed──▶ retry connect
//! ```

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::{ErrorKind, StoreError};
use crate::model::{self, Exchange, UserRecord};
use crate::store::{FirestoreConnector, LocalFileBackend, RemoteConnector, UserBackend};

/// What to do after a backend reported an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDecision {
    /// Retry the operation against the local file backend.
    UseLocal,
    /// Give up and report failure to the caller.
    Surface,
}

/// The fallback policy, per failure class.
pub fn fallback_decision(kind: ErrorKind) -> FallbackDecision {
    match kind {
        ErrorKind::CredentialMissing
        | ErrorKind::BackendUnreachable
        | ErrorKind::NotProvisioned
        | ErrorKind::MalformedRecord => FallbackDecision::UseLocal,
        ErrorKind::LocalIo | ErrorKind::InvalidUserId => FallbackDecision::Surface,
    }
}

/// Public snapshot of the remote connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    RemoteReady { backend: &'static str },
    RemoteUnavailable { kind: ErrorKind, reason: String },
}

enum RemoteState {
    Uninitialized,
    Ready(Arc<dyn UserBackend>),
    Unavailable {
        kind: ErrorKind,
        reason: String,
        since: Instant,
    },
}

/// Durable storage of user records with graceful backend degradation.
pub struct PersistenceGateway {
    local: LocalFileBackend,
    connector: Option<Arc<dyn RemoteConnector>>,
    remote: Mutex<RemoteState>,
    retry_cooldown: Duration,
}

impl PersistenceGateway {
    /// Gateway backed by Firestore, with credentials from the usual chain.
    pub fn new(config: &GatewayConfig) -> Self {
        let connector = Arc::new(FirestoreConnector::new(config.clone()));
        Self::with_connector(config, connector)
    }

    /// Gateway using a caller-supplied remote connector.
    pub fn with_connector(config: &GatewayConfig, connector: Arc<dyn RemoteConnector>) -> Self {
        Self::build(config, Some(connector))
    }

    /// Gateway that never talks to a remote store.
    pub fn local_only(config: &GatewayConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: &GatewayConfig, connector: Option<Arc<dyn RemoteConnector>>) -> Self {
        Self {
            local: LocalFileBackend::new(config.data_dir.clone()),
            connector,
            remote: Mutex::new(RemoteState::Uninitialized),
            retry_cooldown: config.init_retry_cooldown,
        }
    }

    /// The local fallback backend.
    pub fn local(&self) -> &LocalFileBackend {
        &self.local
    }

    /// Connect to the remote store if not already connected.
    ///
    /// Returns true when a remote connection is usable. Never fails: on
    /// `false` every operation uses local files until a retry succeeds.
    pub async fn initialize(&self) -> bool {
        self.remote().await.is_some()
    }

    pub async fn state(&self) -> BackendState {
        match &*self.remote.lock().await {
            RemoteState::Uninitialized => BackendState::Uninitialized,
            RemoteState::Ready(backend) => BackendState::RemoteReady {
                backend: backend.name(),
            },
            RemoteState::Unavailable { kind, reason, .. } => BackendState::RemoteUnavailable {
                kind: *kind,
                reason: reason.clone(),
            },
        }
    }

    /// The connected remote backend, connecting (or retrying after the
    /// cooldown) when needed.
    async fn remote(&self) -> Option<Arc<dyn UserBackend>> {
        let mut state = self.remote.lock().await;
        match &*state {
            RemoteState::Ready(backend) => return Some(Arc::clone(backend)),
            RemoteState::Unavailable { since, .. } if since.elapsed() < self.retry_cooldown => {
                return None;
            }
            _ => {}
        }

        let Some(connector) = &self.connector else {
            *state = RemoteState::Unavailable {
                kind: ErrorKind::CredentialMissing,
                reason: "no remote store configured".to_string(),
                since: Instant::now(),
            };
            return None;
        };

        match connector.connect().await {
            Ok(backend) => {
                info!(backend = backend.name(), "Remote store initialized");
                *state = RemoteState::Ready(Arc::clone(&backend));
                Some(backend)
            }
            Err(e) => {
                warn!(error = %e, "Remote store unavailable, using local file storage");
                *state = RemoteState::Unavailable {
                    kind: e.kind(),
                    reason: e.to_string(),
                    since: Instant::now(),
                };
                None
            }
        }
    }

    /// Log a remote failure and decide whether local storage gets a turn.
    fn falls_back(&self, backend: &str, user_id: &str, op: &str, err: &StoreError) -> bool {
        match fallback_decision(err.kind()) {
            FallbackDecision::UseLocal => {
                warn!(backend, user_id, op, error = %err, "Remote store failed, using local file storage");
                true
            }
            FallbackDecision::Surface => {
                error!(backend, user_id, op, error = %err, "Storage operation failed");
                false
            }
        }
    }

    fn valid_id(user_id: &str) -> bool {
        match model::validate_user_id(user_id) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Rejected user identifier");
                false
            }
        }
    }

    /// Look up a user record, remote first, then local.
    ///
    /// A remote miss also checks local files, so records written while the
    /// remote store was down stay visible.
    pub async fn get_record(&self, user_id: &str) -> Option<UserRecord> {
        if !Self::valid_id(user_id) {
            return None;
        }

        if let Some(remote) = self.remote().await {
            match remote.load(user_id).await {
                Ok(Some(record)) => {
                    debug!(user_id, backend = remote.name(), "User data found");
                    return Some(record);
                }
                Ok(None) => debug!(user_id, "No remote user data, checking local files"),
                Err(e) => {
                    if !self.falls_back(remote.name(), user_id, "get_record", &e) {
                        return None;
                    }
                }
            }
        }

        match self.local.load(user_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(user_id, error = %e, "Error loading user data locally");
                None
            }
        }
    }

    /// Write the full record. True if either backend accepted it.
    pub async fn store_record(&self, user_id: &str, record: &UserRecord) -> bool {
        if !Self::valid_id(user_id) {
            return false;
        }
        let record = persistable(record);

        if let Some(remote) = self.remote().await {
            match remote.store(user_id, &record).await {
                Ok(()) => {
                    debug!(user_id, backend = remote.name(), "User data stored");
                    return true;
                }
                Err(e) => {
                    if !self.falls_back(remote.name(), user_id, "store_record", &e) {
                        return false;
                    }
                }
            }
        }

        match self.local.store(user_id, &record).await {
            Ok(()) => true,
            Err(e) => {
                error!(user_id, error = %e, "Error saving user data locally");
                false
            }
        }
    }

    /// Replace only the history (and update timestamp), creating the record
    /// if needed. Pending exchanges are not written.
    pub async fn save_history(&self, user_id: &str, history: &[Exchange]) -> bool {
        if !Self::valid_id(user_id) {
            return false;
        }
        let history = model::complete_only(history);
        let updated_at = Utc::now();

        if let Some(remote) = self.remote().await {
            match self.write_history(&remote, user_id, &history, updated_at).await {
                Ok(()) => {
                    debug!(user_id, entries = history.len(), "Chat history saved");
                    return true;
                }
                Err(e) => {
                    if !self.falls_back(remote.name(), user_id, "save_history", &e) {
                        return false;
                    }
                }
            }
        }

        match self.local.merge_history(user_id, &history, updated_at).await {
            Ok(()) => true,
            Err(e) => {
                error!(user_id, error = %e, "Error saving chat history locally");
                false
            }
        }
    }

    /// History update against the remote store. A record that so far exists
    /// only in local files is written to the remote in full, so its
    /// credential and profile fields are not shadowed by a history-only
    /// document.
    async fn write_history(
        &self,
        remote: &Arc<dyn UserBackend>,
        user_id: &str,
        history: &[Exchange],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Ok(None) = remote.load(user_id).await {
            if let Ok(Some(mut record)) = self.local.load(user_id).await {
                info!(user_id, backend = remote.name(), "Moving local record to remote store");
                record.history = history.to_vec();
                record.last_updated = Some(updated_at);
                return remote.store(user_id, &record).await;
            }
        }
        remote.merge_history(user_id, history, updated_at).await
    }
}

/// The record with pending exchanges removed.
fn persistable(record: &UserRecord) -> Cow<'_, UserRecord> {
    if record.history.iter().all(Exchange::is_complete) {
        Cow::Borrowed(record)
    } else {
        let mut owned = record.clone();
        owned.history = model::complete_only(&record.history);
        Cow::Owned(owned)
    }
}
