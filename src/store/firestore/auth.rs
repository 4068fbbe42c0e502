//! Service-account bearer tokens.
//!
//! A signed RS256 JWT assertion is exchanged at the key's `token_uri` for a
//! short-lived access token, which is cached until shortly before it expires.

use std::time::{Duration, Instant};

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::credentials::ServiceAccountKey;
use crate::error::StoreError;

const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    ASSERTION_LIFETIME_SECS as u64
}

struct CachedToken {
    token: SecretString,
    refresh_at: Instant,
}

/// Access-token provider for one service account.
pub struct TokenSource {
    key: ServiceAccountKey,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(key: ServiceAccountKey, http: reqwest::Client) -> Self {
        Self {
            key,
            http,
            cached: Mutex::new(None),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.key.project_id
    }

    /// A valid access token, fetching a new one when the cache is stale.
    pub async fn access_token(&self) -> Result<SecretString, StoreError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(SecretString::from(token.token.expose_secret().to_string()));
            }
        }

        let response = self.exchange(&self.sign_assertion()?).await?;
        let lifetime = Duration::from_secs(response.expires_in);
        debug!(expires_in = response.expires_in, "Fetched access token");
        let token = SecretString::from(response.access_token);
        let handed_out = SecretString::from(token.expose_secret().to_string());
        *cached = Some(CachedToken {
            token,
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        });
        Ok(handed_out)
    }

    /// Sign the JWT bearer assertion.
    pub(crate) fn sign_assertion(&self) -> Result<String, StoreError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: DATASTORE_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        if !self.key.private_key_id.is_empty() {
            header.kid = Some(self.key.private_key_id.clone());
        }

        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.expose_secret().as_bytes())
            .map_err(|e| StoreError::CredentialMissing(format!("unusable private key: {e}")))?;
        encode(&header, &claims, &signing_key)
            .map_err(|e| StoreError::CredentialMissing(format!("cannot sign assertion: {e}")))
    }

    async fn exchange(&self, assertion: &str) -> Result<TokenResponse, StoreError> {
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)])
            .send()
            .await
            .map_err(|e| StoreError::unreachable("oauth", format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::unreachable(
                "oauth",
                format!("token endpoint returned {status}: {body}"),
            ));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| StoreError::unreachable("oauth", format!("bad token response: {e}")))
    }
}
