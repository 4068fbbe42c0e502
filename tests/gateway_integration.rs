//! End-to-end behaviour of the persistence gateway.
//!
//! The remote store is the in-memory stand-in; the local fallback writes into
//! a temporary directory.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use chatkeep::config::GatewayConfig;
use chatkeep::credentials::CredentialChain;
use chatkeep::error::ErrorKind;
use chatkeep::gateway::{BackendState, PersistenceGateway};
use chatkeep::model::{Exchange, UserRecord};
use chatkeep::store::{FirestoreConnector, MemoryBackend, MemoryConnector};

fn test_config(dir: &TempDir) -> GatewayConfig {
    let mut config = GatewayConfig {
        data_dir: dir.path().join("user_data"),
        init_retry_cooldown: Duration::ZERO,
        ..GatewayConfig::default()
    };
    config.credentials.secrets_file = dir.path().join("secrets.toml");
    config.credentials.key_file = dir.path().join("firebase_service_account.json");
    config
}

fn with_memory_remote(dir: &TempDir) -> (PersistenceGateway, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let connector = Arc::new(MemoryConnector::new(Arc::clone(&backend)));
    let gateway = PersistenceGateway::with_connector(&test_config(dir), connector);
    (gateway, backend)
}

fn alice_history() -> Vec<Exchange> {
    vec![Exchange::new("hi", "hello"), Exchange::new("bye", "cya")]
}

#[tokio::test]
async fn alice_keeps_credential_across_history_save() {
    let dir = TempDir::new().unwrap();
    let (gateway, _) = with_memory_remote(&dir);

    assert!(gateway.store_record("alice", &UserRecord::with_credential("p1")).await);
    assert!(gateway.save_history("alice", &alice_history()).await);

    let record = gateway.get_record("alice").await.unwrap();
    assert!(record.credential_matches("p1"));
    assert_eq!(record.history, alice_history());
}

#[tokio::test]
async fn alice_scenario_in_local_only_mode() {
    let dir = TempDir::new().unwrap();
    let gateway = PersistenceGateway::local_only(&test_config(&dir));

    assert!(gateway.store_record("alice", &UserRecord::with_credential("p1")).await);
    assert!(gateway.save_history("alice", &alice_history()).await);

    let record = gateway.get_record("alice").await.unwrap();
    assert_eq!(record.credential.as_deref(), Some("p1"));
    assert_eq!(record.history, alice_history());
}

#[tokio::test]
async fn bob_without_credentials_lands_in_a_local_file() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let chain = CredentialChain::with_env(&config.credentials, |_| None);
    let connector = Arc::new(FirestoreConnector::with_chain(config.clone(), chain));
    let gateway = PersistenceGateway::with_connector(&config, connector);

    assert!(!gateway.initialize().await);
    assert!(matches!(
        gateway.state().await,
        BackendState::RemoteUnavailable {
            kind: ErrorKind::CredentialMissing,
            ..
        }
    ));

    let record = UserRecord {
        history: vec![Exchange::new("q", "a")],
        ..UserRecord::with_credential("pw")
    };
    assert!(gateway.store_record("bob", &record).await);

    let path = dir.path().join("user_data").join("bob.json");
    assert!(path.exists());
    let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["password"], json!("pw"));
    assert_eq!(on_disk["chat_history"], json!([["q", "a"]]));
}

#[tokio::test]
async fn store_then_get_returns_the_same_record() {
    let dir = TempDir::new().unwrap();
    let (gateway, _) = with_memory_remote(&dir);

    let mut record = UserRecord::with_credential("secret");
    record.display_name = Some("Carol".to_string());
    record.history = alice_history();
    record.extra.insert("theme".to_string(), json!("dark"));

    assert!(gateway.store_record("carol", &record).await);
    let loaded = gateway.get_record("carol").await.unwrap();
    assert_eq!(loaded.credential, record.credential);
    assert_eq!(loaded.display_name, record.display_name);
    assert_eq!(loaded.history, record.history);
    assert_eq!(loaded.extra.get("theme"), Some(&json!("dark")));
}

#[tokio::test]
async fn never_stored_id_is_absent() {
    let dir = TempDir::new().unwrap();
    let (gateway, _) = with_memory_remote(&dir);
    assert!(gateway.get_record("nobody").await.is_none());

    let local = PersistenceGateway::local_only(&test_config(&dir));
    assert!(local.get_record("nobody").await.is_none());
}

#[tokio::test]
async fn history_save_leaves_profile_fields_alone() {
    let dir = TempDir::new().unwrap();
    let (gateway, _) = with_memory_remote(&dir);

    let mut record = UserRecord::with_credential("pw");
    record.email = Some("dave@example.com".to_string());
    record.display_name = Some("Dave".to_string());
    record.extra.insert("plan".to_string(), json!("pro"));
    assert!(gateway.store_record("dave", &record).await);

    assert!(gateway.save_history("dave", &alice_history()).await);

    let loaded = gateway.get_record("dave").await.unwrap();
    assert_eq!(loaded.email.as_deref(), Some("dave@example.com"));
    assert_eq!(loaded.display_name.as_deref(), Some("Dave"));
    assert_eq!(loaded.created_at, record.created_at);
    assert_eq!(loaded.extra.get("plan"), Some(&json!("pro")));
    assert!(loaded.last_updated.is_some());
    assert_eq!(loaded.history, alice_history());
}

#[tokio::test]
async fn degraded_mode_round_trips_every_operation() {
    let dir = TempDir::new().unwrap();
    let (gateway, backend) = with_memory_remote(&dir);
    backend.fail_with(Some(ErrorKind::BackendUnreachable));

    assert!(gateway.store_record("erin", &UserRecord::with_credential("pw")).await);
    assert!(gateway.save_history("erin", &alice_history()).await);

    let loaded = gateway.get_record("erin").await.unwrap();
    assert!(loaded.credential_matches("pw"));
    assert_eq!(loaded.history, alice_history());
    assert!(backend.document("erin").is_none());
    assert!(gateway.local().path_for("erin").exists());
}

#[tokio::test]
async fn object_history_is_normalized_and_bad_entries_dropped() {
    let dir = TempDir::new().unwrap();
    let gateway = PersistenceGateway::local_only(&test_config(&dir));
    let path = gateway.local().path_for("frank");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        json!({
            "password": "pw",
            "chat_history": [
                {"user_message": "hi", "bot_reply": "hello"},
                {"user_message": "hi"},
                ["bye", "cya"]
            ]
        })
        .to_string(),
    )
    .unwrap();

    let loaded = gateway.get_record("frank").await.unwrap();
    assert_eq!(loaded.history, alice_history());
}

#[tokio::test]
async fn remote_documents_in_tagged_shape_read_as_pairs() {
    let dir = TempDir::new().unwrap();
    let (gateway, backend) = with_memory_remote(&dir);
    let fields = json!({
        "password": "pw",
        "chat_history": [
            {"message_id": 0, "user_message": "hi", "bot_reply": "hello", "timestamp": "2024-01-01 00:00:00"},
            {"message_id": 1, "user_message": "dangling"}
        ]
    });
    backend.insert_document("gina", fields.as_object().unwrap().clone());

    let loaded = gateway.get_record("gina").await.unwrap();
    assert_eq!(loaded.history, vec![Exchange::new("hi", "hello")]);
}

#[tokio::test]
async fn records_written_while_down_stay_visible_after_recovery() {
    let dir = TempDir::new().unwrap();
    let (gateway, backend) = with_memory_remote(&dir);

    backend.fail_with(Some(ErrorKind::BackendUnreachable));
    assert!(gateway.store_record("hank", &UserRecord::with_credential("pw")).await);

    backend.fail_with(None);
    let loaded = gateway.get_record("hank").await.unwrap();
    assert!(loaded.credential_matches("pw"));
}

#[tokio::test]
async fn history_save_after_recovery_keeps_the_local_credential() {
    let dir = TempDir::new().unwrap();
    let (gateway, backend) = with_memory_remote(&dir);

    backend.fail_with(Some(ErrorKind::BackendUnreachable));
    let mut record = UserRecord::with_credential("pw");
    record.display_name = Some("Hank".to_string());
    assert!(gateway.store_record("hank", &record).await);

    backend.fail_with(None);
    assert!(gateway.save_history("hank", &[Exchange::new("hi", "hello")]).await);

    let loaded = gateway.get_record("hank").await.unwrap();
    assert_eq!(loaded.credential.as_deref(), Some("pw"));
    assert_eq!(loaded.display_name.as_deref(), Some("Hank"));
    assert_eq!(loaded.history, vec![Exchange::new("hi", "hello")]);

    let document = backend.document("hank").unwrap();
    assert_eq!(document["password"], json!("pw"));

    assert!(gateway.save_history("hank", &alice_history()).await);
    let loaded = gateway.get_record("hank").await.unwrap();
    assert!(loaded.credential_matches("pw"));
    assert_eq!(loaded.history, alice_history());
}
