//! Local file backend, one pretty-printed JSON file per user.
//!
//! Layout: `<data_dir>/<user_id>.json`, history as `[prompt, reply]` pairs.
//! Writes go straight to the target file; a crash mid-write can leave a
//! truncated file, which later reads as malformed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{Exchange, UserRecord};
use crate::store::traits::UserBackend;
use crate::store::wire::{HISTORY_FIELD, UPDATED_FIELD};

/// Per-user JSON files under a data directory.
pub struct LocalFileBackend {
    dir: PathBuf,
}

impl LocalFileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `user_id`'s record.
    pub fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{user_id}.json"))
    }

    /// Create the data directory and write-then-remove a probe file.
    pub async fn check_writable(&self) -> Result<(), StoreError> {
        let probe = self.dir.join(".write_probe");
        let io = |source| StoreError::LocalIo {
            path: probe.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).await.map_err(io)?;
        fs::write(&probe, b"ok").await.map_err(io)?;
        fs::remove_file(&probe).await.map_err(io)?;
        Ok(())
    }

    /// Read the raw stored object. Missing file → `Ok(None)`.
    async fn read_object(&self, user_id: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(user_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::LocalIo { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::malformed(user_id, format!("{}: {e}", path.display())))
    }

    async fn write_object(&self, user_id: &str, value: &Value) -> Result<(), StoreError> {
        let path = self.path_for(user_id);
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StoreError::malformed(user_id, e.to_string()))?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::LocalIo {
                path: self.dir.clone(),
                source,
            })?;
        fs::write(&path, content)
            .await
            .map_err(|source| StoreError::LocalIo {
                path: path.clone(),
                source,
            })?;
        debug!(user_id, path = %path.display(), "User data saved locally");
        Ok(())
    }
}

#[async_trait]
impl UserBackend for LocalFileBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn load(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        match self.read_object(user_id).await? {
            Some(value) => UserRecord::from_json(user_id, value).map(Some),
            None => Ok(None),
        }
    }

    async fn store(&self, user_id: &str, record: &UserRecord) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(record).map_err(|e| StoreError::malformed(user_id, e.to_string()))?;
        self.write_object(user_id, &value).await
    }

    async fn merge_history(
        &self,
        user_id: &str,
        history: &[Exchange],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut object = match self.read_object(user_id).await {
            Ok(Some(Value::Object(object))) => object,
            Ok(Some(_)) | Ok(None) => Map::new(),
            Err(e @ StoreError::Malformed { .. }) => {
                warn!(user_id, error = %e, "Replacing unreadable local record");
                Map::new()
            }
            Err(e) => return Err(e),
        };

        let pairs = serde_json::to_value(history)
            .map_err(|e| StoreError::malformed(user_id, e.to_string()))?;
        object.insert(HISTORY_FIELD.to_string(), pairs);
        object.insert(
            UPDATED_FIELD.to_string(),
            Value::String(updated_at.to_rfc3339()),
        );
        self.write_object(user_id, &Value::Object(object)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_backend() -> (LocalFileBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalFileBackend::new(dir.path().join("user_data"));
        (backend, dir)
    }

    #[tokio::test]
    async fn store_creates_dir_and_pair_shaped_file() {
        let (backend, _dir) = test_backend();
        let record = UserRecord {
            credential: Some("p1".to_string()),
            history: vec![Exchange::new("hi", "hello")],
            ..UserRecord::default()
        };
        backend.store("bob", &record).await.unwrap();

        let raw = std::fs::read_to_string(backend.path_for("bob")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["chat_history"], json!([["hi", "hello"]]));
        assert!(raw.contains("\n  \"password\""));
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let (backend, _dir) = test_backend();
        assert!(backend.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_then_load_roundtrip() {
        let (backend, _dir) = test_backend();
        let mut record = UserRecord::with_credential("secret");
        record.history = vec![Exchange::new("a", "b"), Exchange::new("c", "d")];
        record.email = Some("alice@example.com".to_string());
        backend.store("alice", &record).await.unwrap();
        assert_eq!(backend.load("alice").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn merge_history_keeps_other_fields() {
        let (backend, _dir) = test_backend();
        std::fs::create_dir_all(backend.dir()).unwrap();
        std::fs::write(
            backend.path_for("carol"),
            r#"{"password": "pw", "display_name": "Carol", "test": true, "chat_history": []}"#,
        )
        .unwrap();

        backend
            .merge_history("carol", &[Exchange::new("q", "a")], Utc::now())
            .await
            .unwrap();

        let record = backend.load("carol").await.unwrap().unwrap();
        assert_eq!(record.credential.as_deref(), Some("pw"));
        assert_eq!(record.display_name.as_deref(), Some("Carol"));
        assert_eq!(record.extra.get("test"), Some(&json!(true)));
        assert_eq!(record.history, vec![Exchange::new("q", "a")]);
        assert!(record.last_updated.is_some());
    }

    #[tokio::test]
    async fn merge_history_creates_missing_record() {
        let (backend, _dir) = test_backend();
        backend
            .merge_history("new", &[Exchange::new("q", "a")], Utc::now())
            .await
            .unwrap();
        let record = backend.load("new").await.unwrap().unwrap();
        assert!(record.credential.is_none());
        assert_eq!(record.history.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_malformed_on_load_and_replaced_on_merge() {
        let (backend, _dir) = test_backend();
        std::fs::create_dir_all(backend.dir()).unwrap();
        std::fs::write(backend.path_for("dave"), "{\"password\": \"pw\", \"chat_his").unwrap();

        let err = backend.load("dave").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedRecord);

        backend
            .merge_history("dave", &[Exchange::new("q", "a")], Utc::now())
            .await
            .unwrap();
        assert!(backend.load("dave").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unwritable_dir_is_local_io() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "file in the way").unwrap();
        let backend = LocalFileBackend::new(&blocker);

        let err = backend.store("eve", &UserRecord::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LocalIo);
        assert!(backend.check_writable().await.is_err());
    }

    #[tokio::test]
    async fn check_writable_leaves_no_probe() {
        let (backend, _dir) = test_backend();
        backend.check_writable().await.unwrap();
        assert!(!backend.dir().join(".write_probe").exists());
    }
}
