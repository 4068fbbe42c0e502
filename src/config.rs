//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;

use crate::error::ConfigError;

/// Google's production Firestore REST endpoint.
pub const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";

/// Where credentials are looked up, in precedence order.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Hosted-secrets TOML file (keys at the top level).
    pub secrets_file: PathBuf,
    /// Service-account JSON key file, used last.
    pub key_file: PathBuf,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            secrets_file: PathBuf::from(".streamlit/secrets.toml"),
            key_file: PathBuf::from("firebase_service_account.json"),
        }
    }
}

/// Persistence gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory holding one `<user_id>.json` per user.
    pub data_dir: PathBuf,
    /// Remote collection holding user documents.
    pub collection: String,
    /// How long a failed remote connection is remembered before retrying.
    /// Zero retries on every call.
    pub init_retry_cooldown: Duration,
    /// Per-request timeout of the HTTP client.
    pub http_timeout: Duration,
    /// Firestore REST base URL (overridable for emulators and proxies).
    pub firestore_url: String,
    pub credentials: CredentialConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("user_data"),
            collection: "users".to_string(),
            init_retry_cooldown: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
            firestore_url: DEFAULT_FIRESTORE_URL.to_string(),
            credentials: CredentialConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Build from `CHATKEEP_*` environment variables, defaulting the rest.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let data_dir = lookup("CHATKEEP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let collection = lookup("CHATKEEP_COLLECTION")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.collection);

        let init_retry_cooldown = lookup("CHATKEEP_INIT_RETRY_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.init_retry_cooldown);

        let http_timeout = lookup("CHATKEEP_HTTP_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        let firestore_url = lookup("CHATKEEP_FIRESTORE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.firestore_url);

        let credentials = CredentialConfig {
            secrets_file: lookup("CHATKEEP_SECRETS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.credentials.secrets_file),
            key_file: lookup("CHATKEEP_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.credentials.key_file),
        };

        Self {
            data_dir,
            collection,
            init_retry_cooldown,
            http_timeout,
            firestore_url,
            credentials,
        }
    }

    /// Reject values the backends cannot use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.contains('/') {
            return Err(ConfigError::InvalidValue {
                key: "CHATKEEP_COLLECTION",
                message: format!("{:?} must be a single path segment", self.collection),
            });
        }
        match Url::parse(&self.firestore_url) {
            Ok(url) if !url.cannot_be_a_base() => {}
            Ok(_) => {
                return Err(ConfigError::InvalidValue {
                    key: "CHATKEEP_FIRESTORE_URL",
                    message: format!("{} cannot hold a path", self.firestore_url),
                });
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    key: "CHATKEEP_FIRESTORE_URL",
                    message: e.to_string(),
                });
            }
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "CHATKEEP_HTTP_TIMEOUT_SECS",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
