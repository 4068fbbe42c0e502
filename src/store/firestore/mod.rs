//! Firestore REST backend.
//!
//! Documents live at
//! `{base}/projects/{project}/databases/(default)/documents/{collection}/{user_id}`.
//! Full writes are a `PATCH` without a field mask (replace, upsert); history
//! merges are a `PATCH` masked to `chat_history` and `last_updated`.

pub mod auth;
pub mod value;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode, Url};
use secrecy::ExposeSecret;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::credentials::{CredentialChain, ServiceAccountKey};
use crate::error::StoreError;
use crate::model::{Exchange, UserRecord};
use crate::store::traits::{RemoteConnector, UserBackend};
use crate::store::wire;

pub use auth::TokenSource;

const BACKEND: &str = "firestore";

/// Firestore document store for user records.
pub struct FirestoreBackend {
    http: reqwest::Client,
    documents_url: String,
    collection: String,
    tokens: TokenSource,
}

impl FirestoreBackend {
    pub fn new(config: &GatewayConfig, key: ServiceAccountKey) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| StoreError::unreachable(BACKEND, format!("HTTP client: {e}")))?;
        let documents_url = format!(
            "{}/projects/{}/databases/(default)/documents",
            config.firestore_url, key.project_id
        );
        Ok(Self {
            http: http.clone(),
            documents_url,
            collection: config.collection.clone(),
            tokens: TokenSource::new(key, http),
        })
    }

    pub fn project_id(&self) -> &str {
        self.tokens.project_id()
    }

    /// URL of one document; `doc_id` is percent-encoded as a single segment.
    pub fn document_url(&self, collection: &str, doc_id: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.documents_url)
            .map_err(|e| StoreError::unreachable(BACKEND, format!("bad base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::unreachable(BACKEND, "base URL cannot hold a path"))?
            .push(collection)
            .push(doc_id);
        Ok(url)
    }

    /// Read `test/connection_test` to confirm the database answers.
    pub async fn probe(&self) -> Result<(), StoreError> {
        let url = self.document_url("test", "connection_test")?;
        let response = self.send(Method::GET, url, None).await?;
        match response.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => {
                let body = response.text().await.unwrap_or_default();
                if status == StatusCode::NOT_FOUND && names_missing_database(&body) {
                    return Err(StoreError::NotProvisioned(error_message(&body)));
                }
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(classify(status, &body, "connection_test"))
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<reqwest::Response, StoreError> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token.expose_secret());
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .map_err(|e| StoreError::unreachable(BACKEND, e.to_string()))
    }

    async fn patch(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
        mask: &[&str],
    ) -> Result<(), StoreError> {
        let mut url = self.document_url(&self.collection, user_id)?;
        if !mask.is_empty() {
            let mut query = url.query_pairs_mut();
            for field in mask {
                query.append_pair("updateMask.fieldPaths", field);
            }
        }
        let body = json!({ "fields": value::encode_fields(fields) });
        let response = self.send(Method::PATCH, url, Some(body)).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body, user_id))
    }
}

#[async_trait]
impl UserBackend for FirestoreBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn load(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let url = self.document_url(&self.collection, user_id)?;
        let response = self.send(Method::GET, url, None).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::unreachable(BACKEND, e.to_string()))?;

        if status == StatusCode::NOT_FOUND && !names_missing_database(&body) {
            debug!(user_id, "No remote document");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify(status, &body, user_id));
        }

        let document: Value = serde_json::from_str(&body)
            .map_err(|e| StoreError::malformed(user_id, format!("document body: {e}")))?;
        let fields = match document.get("fields") {
            Some(Value::Object(fields)) => value::decode_fields(fields)
                .map_err(|reason| StoreError::malformed(user_id, reason))?,
            _ => Map::new(),
        };
        wire::from_document(user_id, fields).map(Some)
    }

    async fn store(&self, user_id: &str, record: &UserRecord) -> Result<(), StoreError> {
        let fields = wire::to_document(user_id, record, Utc::now())?;
        self.patch(user_id, &fields, &[]).await
    }

    async fn merge_history(
        &self,
        user_id: &str,
        history: &[Exchange],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let fields = wire::history_patch(history, updated_at);
        self.patch(user_id, &fields, &[wire::HISTORY_FIELD, wire::UPDATED_FIELD])
            .await
    }
}

/// The `error.message` of a Firestore error body, or the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Firestore answers 404 both for a missing document and for a database that
/// was never created; only the message tells them apart.
fn names_missing_database(body: &str) -> bool {
    let message = error_message(body).to_lowercase();
    message.contains("database") && message.contains("does not exist")
}

/// Map a failed response onto the storage error taxonomy.
pub(crate) fn classify(status: StatusCode, body: &str, user_id: &str) -> StoreError {
    let message = error_message(body);
    match status {
        StatusCode::NOT_FOUND => StoreError::NotProvisioned(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::unreachable(BACKEND, format!("permission denied ({status}): {message}"))
        }
        StatusCode::BAD_REQUEST => StoreError::malformed(user_id, message),
        _ => StoreError::unreachable(BACKEND, format!("{status}: {message}")),
    }
}

/// Connects to Firestore using credentials from the precedence chain.
pub struct FirestoreConnector {
    config: GatewayConfig,
    chain: CredentialChain,
}

impl FirestoreConnector {
    pub fn new(config: GatewayConfig) -> Self {
        let chain = CredentialChain::new(&config.credentials);
        Self { config, chain }
    }

    pub fn with_chain(config: GatewayConfig, chain: CredentialChain) -> Self {
        Self { config, chain }
    }
}

#[async_trait]
impl RemoteConnector for FirestoreConnector {
    async fn connect(&self) -> Result<Arc<dyn UserBackend>, StoreError> {
        let resolved = self.chain.resolve().await?;
        let backend = FirestoreBackend::new(&self.config, resolved.key)?;
        info!(project = backend.project_id(), source = %resolved.source, "Initializing Firestore");

        backend.tokens.access_token().await?;
        match backend.probe().await {
            Ok(()) => info!("Firestore connection test successful"),
            Err(e) => warn!(error = %e, "Firestore connection test failed"),
        }
        Ok(Arc::new(backend))
    }
}
