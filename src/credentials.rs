//! Remote-store credential resolution.
//!
//! Service-account credentials are looked up in three places, first match wins:
//! 1. the hosted-secrets TOML file (`FIREBASE_*` keys at the top level)
//! 2. process environment variables with the same names
//! 3. a service-account JSON key file
//!
//! A source matches when it carries a non-empty `FIREBASE_PROJECT_ID` (or
//! `project_id` in the key file). Once a source matches, the remaining
//! required fields must be present there; the chain does not continue.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::CredentialConfig;
use crate::error::StoreError;

pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_CERT_URL: &str = "https://www.googleapis.com/oauth2/v1/certs";

/// Well-known credential keys.
pub mod keys {
    pub const PROJECT_ID: &str = "FIREBASE_PROJECT_ID";
    pub const PRIVATE_KEY_ID: &str = "FIREBASE_PRIVATE_KEY_ID";
    pub const PRIVATE_KEY: &str = "FIREBASE_PRIVATE_KEY";
    pub const CLIENT_EMAIL: &str = "FIREBASE_CLIENT_EMAIL";
    pub const CLIENT_ID: &str = "FIREBASE_CLIENT_ID";
    pub const AUTH_URI: &str = "FIREBASE_AUTH_URI";
    pub const TOKEN_URI: &str = "FIREBASE_TOKEN_URI";
    pub const AUTH_PROVIDER_CERT_URL: &str = "FIREBASE_AUTH_PROVIDER_X509_CERT_URL";
    pub const CLIENT_CERT_URL: &str = "FIREBASE_CLIENT_X509_CERT_URL";
}

/// Where a credential was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    HostedSecrets,
    Environment,
    KeyFile,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HostedSecrets => "hosted secrets",
            Self::Environment => "environment variables",
            Self::KeyFile => "service account key file",
        };
        f.write_str(name)
    }
}

/// A Google service-account key.
#[derive(Debug)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub private_key_id: String,
    pub private_key: SecretString,
    pub client_email: String,
    pub client_id: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub auth_provider_x509_cert_url: String,
    pub client_x509_cert_url: String,
}

/// On-disk shape of a service-account JSON key file.
#[derive(Deserialize)]
struct KeyFile {
    project_id: String,
    #[serde(default)]
    private_key_id: String,
    private_key: String,
    client_email: String,
    #[serde(default)]
    client_id: String,
    auth_uri: Option<String>,
    token_uri: Option<String>,
    auth_provider_x509_cert_url: Option<String>,
    #[serde(default)]
    client_x509_cert_url: String,
}

impl From<KeyFile> for ServiceAccountKey {
    fn from(raw: KeyFile) -> Self {
        Self {
            project_id: raw.project_id,
            private_key_id: raw.private_key_id,
            private_key: SecretString::from(unescape_newlines(&raw.private_key)),
            client_email: raw.client_email,
            client_id: raw.client_id,
            auth_uri: raw.auth_uri.unwrap_or_else(|| DEFAULT_AUTH_URI.to_string()),
            token_uri: raw.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            auth_provider_x509_cert_url: raw
                .auth_provider_x509_cert_url
                .unwrap_or_else(|| DEFAULT_CERT_URL.to_string()),
            client_x509_cert_url: raw.client_x509_cert_url,
        }
    }
}

/// A key together with the source it came from.
#[derive(Debug)]
pub struct ResolvedCredentials {
    pub key: ServiceAccountKey,
    pub source: CredentialSource,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// The hosted-secrets → environment → key-file precedence chain.
pub struct CredentialChain {
    secrets_file: PathBuf,
    key_file: PathBuf,
    env: EnvLookup,
}

impl CredentialChain {
    /// Chain over the given files and the process environment.
    pub fn new(config: &CredentialConfig) -> Self {
        Self::with_env(config, |key| std::env::var(key).ok())
    }

    /// Chain with a custom environment lookup.
    pub fn with_env(
        config: &CredentialConfig,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            secrets_file: config.secrets_file.clone(),
            key_file: config.key_file.clone(),
            env: Box::new(env),
        }
    }

    /// Walk the chain and return the first matching credential.
    pub async fn resolve(&self) -> Result<ResolvedCredentials, StoreError> {
        if let Some(table) = load_secrets_table(&self.secrets_file).await {
            let lookup = |key: &str| {
                table
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            };
            if non_empty(lookup(keys::PROJECT_ID)).is_some() {
                return self.found(CredentialSource::HostedSecrets, key_from_lookup(lookup));
            }
        }

        if non_empty((self.env)(keys::PROJECT_ID)).is_some() {
            return self.found(CredentialSource::Environment, key_from_lookup(&self.env));
        }

        if let Some(key) = load_key_file(&self.key_file).await {
            return self.found(CredentialSource::KeyFile, key);
        }

        Err(StoreError::CredentialMissing(
            "no hosted secrets, environment variables or key file found".to_string(),
        ))
    }

    fn found(
        &self,
        source: CredentialSource,
        key: Result<ServiceAccountKey, String>,
    ) -> Result<ResolvedCredentials, StoreError> {
        match key {
            Ok(key) => {
                info!(%source, project = %key.project_id, "Using remote store credentials");
                Ok(ResolvedCredentials { key, source })
            }
            Err(reason) => Err(StoreError::CredentialMissing(format!("{source}: {reason}"))),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Private keys pasted into env vars or TOML often carry literal `\n`.
fn unescape_newlines(key: &str) -> String {
    key.replace("\\n", "\n")
}

fn key_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ServiceAccountKey, String> {
    let get = |key: &str| non_empty(lookup(key));
    let require = |key: &str| get(key).ok_or_else(|| format!("{key} is missing"));

    let project_id = require(keys::PROJECT_ID)?;
    let private_key = require(keys::PRIVATE_KEY)?;
    let client_email = require(keys::CLIENT_EMAIL)?;

    Ok(ServiceAccountKey {
        project_id,
        private_key_id: get(keys::PRIVATE_KEY_ID).unwrap_or_default(),
        private_key: SecretString::from(unescape_newlines(&private_key)),
        client_email,
        client_id: get(keys::CLIENT_ID).unwrap_or_default(),
        auth_uri: get(keys::AUTH_URI).unwrap_or_else(|| DEFAULT_AUTH_URI.to_string()),
        token_uri: get(keys::TOKEN_URI).unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
        auth_provider_x509_cert_url: get(keys::AUTH_PROVIDER_CERT_URL)
            .unwrap_or_else(|| DEFAULT_CERT_URL.to_string()),
        client_x509_cert_url: get(keys::CLIENT_CERT_URL).unwrap_or_default(),
    })
}

/// Unreadable or unparseable secrets files are skipped, not fatal.
async fn load_secrets_table(path: &Path) -> Option<toml::Table> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No hosted secrets file");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read hosted secrets");
            return None;
        }
    };
    match toml::from_str::<toml::Table>(&content) {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not parse hosted secrets");
            None
        }
    }
}

/// `None` when there is no key file at all.
async fn load_key_file(path: &Path) -> Option<Result<ServiceAccountKey, String>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => return Some(Err(format!("cannot read {}: {e}", path.display()))),
    };
    Some(parse_key_file(path, &content))
}

fn parse_key_file(path: &Path, content: &str) -> Result<ServiceAccountKey, String> {
    let raw: KeyFile = serde_json::from_str(content)
        .map_err(|e| format!("cannot parse {}: {e}", path.display()))?;
    if raw.project_id.trim().is_empty() {
        return Err("project_id is empty".to_string());
    }
    Ok(raw.into())
}
