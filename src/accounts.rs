//! Account flows on top of the persistence gateway.
//!
//! Password sign-up and log-in, plus creating/updating records for identities
//! that an external provider already authenticated. No token exchange happens
//! here; callers hand in the identity they obtained.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::AccountError;
use crate::gateway::PersistenceGateway;
use crate::model::{Exchange, UserRecord};

/// External identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityProvider {
    Google,
    GitHub,
    LinkedIn,
    Apple,
}

impl IdentityProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::GitHub => "github",
            Self::LinkedIn => "linkedin",
            Self::Apple => "apple",
        }
    }
}

impl fmt::Display for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::GitHub),
            "linkedin" => Ok(Self::LinkedIn),
            "apple" => Ok(Self::Apple),
            other => Err(format!("unknown identity provider: {other}")),
        }
    }
}

/// Profile data an external provider returned for a user.
#[derive(Debug, Clone, Default)]
pub struct ExternalIdentity {
    /// Provider-side account id.
    pub id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    /// Handle, for providers that have one (GitHub).
    pub login: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl ExternalIdentity {
    /// The user id and display name this identity maps to.
    pub fn resolve(&self, provider: IdentityProvider) -> (String, String) {
        let id = self.id.as_deref().unwrap_or("user");
        match provider {
            IdentityProvider::Google => {
                let user_id = first_of(&[&self.email, &self.name]).unwrap_or("google_user");
                let display = self.name.as_deref().unwrap_or(user_id);
                (user_id.to_string(), display.to_string())
            }
            IdentityProvider::GitHub => {
                let user_id = first_of(&[&self.email, &self.login]).unwrap_or("github_user");
                let display = first_of(&[&self.name, &self.login]).unwrap_or(user_id);
                (user_id.to_string(), display.to_string())
            }
            IdentityProvider::LinkedIn => {
                let user_id = self
                    .email
                    .clone()
                    .unwrap_or_else(|| format!("linkedin_{id}"));
                let display = format!(
                    "{} {}",
                    self.first_name.as_deref().unwrap_or_default(),
                    self.last_name.as_deref().unwrap_or_default()
                )
                .trim()
                .to_string();
                (user_id, display)
            }
            IdentityProvider::Apple => {
                let user_id = self.email.clone().unwrap_or_else(|| format!("apple_{id}"));
                let display = self.name.clone().unwrap_or_else(|| "Apple User".to_string());
                (user_id, display)
            }
        }
    }
}

fn first_of<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
    candidates.iter().find_map(|c| c.as_deref())
}

/// A signed-in user's in-session state. The UI owns this copy of the history
/// and pushes it back through `AccountService::save`.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub display_name: Option<String>,
    pub history: Vec<Exchange>,
    /// False when the account could not be written to any backend.
    pub persisted: bool,
}

impl Session {
    fn from_record(user_id: &str, record: UserRecord, persisted: bool) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: record.display_name,
            history: record.history,
            persisted,
        }
    }

    /// Start a turn whose reply is still pending.
    pub fn ask(&mut self, prompt: impl Into<String>) {
        self.history.push(Exchange::pending(prompt));
    }

    /// Complete the latest pending turn. Returns false if none is pending.
    pub fn answer(&mut self, reply: impl Into<String>) -> bool {
        match self.history.last_mut() {
            Some(last) if !last.is_complete() => {
                last.reply = reply.into();
                true
            }
            _ => false,
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

/// Sign-up, log-in and external sign-in.
pub struct AccountService {
    gateway: Arc<PersistenceGateway>,
}

impl AccountService {
    pub fn new(gateway: Arc<PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Create a password account.
    pub async fn sign_up(
        &self,
        username: &str,
        password: &str,
        confirm: &str,
    ) -> Result<(), AccountError> {
        if username.is_empty() || password.is_empty() || confirm.is_empty() {
            return Err(AccountError::MissingFields);
        }
        if password != confirm {
            return Err(AccountError::PasswordMismatch);
        }
        if self.gateway.get_record(username).await.is_some() {
            return Err(AccountError::UsernameTaken(username.to_string()));
        }

        let record = UserRecord::with_credential(password);
        if !self.gateway.store_record(username, &record).await {
            return Err(AccountError::StorageUnavailable(username.to_string()));
        }
        info!(user_id = username, "Account created");
        Ok(())
    }

    /// Check a password and open a session.
    pub async fn log_in(&self, username: &str, password: &str) -> Result<Session, AccountError> {
        if username.is_empty() || password.is_empty() {
            return Err(AccountError::MissingFields);
        }
        match self.gateway.get_record(username).await {
            Some(record) if record.credential_matches(password) => {
                info!(user_id = username, "Login successful");
                Ok(Session::from_record(username, record, true))
            }
            _ => Err(AccountError::InvalidCredentials),
        }
    }

    /// Create or refresh the record of an externally-authenticated user.
    ///
    /// A storage failure does not block sign-in; the session comes back with
    /// `persisted == false`.
    pub async fn external_sign_in(
        &self,
        provider: IdentityProvider,
        identity: &ExternalIdentity,
    ) -> Result<Session, AccountError> {
        let (user_id, display_name) = identity.resolve(provider);
        let now = Utc::now();

        let mut record = match self.gateway.get_record(&user_id).await {
            Some(existing) => existing,
            None => UserRecord {
                credential: None,
                provider: Some(provider.as_str().to_string()),
                external: true,
                created_at: Some(now),
                ..UserRecord::default()
            },
        };
        record.last_login = Some(now);
        record.display_name = Some(display_name);
        record.email = Some(identity.email.clone().unwrap_or_else(|| user_id.clone()));

        let persisted = self.gateway.store_record(&user_id, &record).await;
        if persisted {
            info!(%user_id, %provider, "External sign-in");
        } else {
            warn!(%user_id, %provider, "External sign-in not persisted, session only");
        }
        Ok(Session::from_record(&user_id, record, persisted))
    }

    /// Persist the session's completed exchanges.
    pub async fn save(&self, session: &Session) -> bool {
        self.gateway
            .save_history(&session.user_id, &session.history)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> AccountService {
        let config = GatewayConfig {
            data_dir: dir.path().join("user_data"),
            ..GatewayConfig::default()
        };
        AccountService::new(Arc::new(PersistenceGateway::local_only(&config)))
    }

    #[tokio::test]
    async fn sign_up_then_log_in() {
        let dir = TempDir::new().unwrap();
        let accounts = service(&dir);
        accounts.sign_up("alice", "p1", "p1").await.unwrap();

        let session = accounts.log_in("alice", "p1").await.unwrap();
        assert_eq!(session.user_id, "alice");
        assert!(session.history.is_empty());
        assert!(matches!(
            accounts.log_in("alice", "wrong").await,
            Err(AccountError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn sign_up_validation() {
        let dir = TempDir::new().unwrap();
        let accounts = service(&dir);
        assert!(matches!(
            accounts.sign_up("", "a", "a").await,
            Err(AccountError::MissingFields)
        ));
        assert!(matches!(
            accounts.sign_up("bob", "a", "b").await,
            Err(AccountError::PasswordMismatch)
        ));
        accounts.sign_up("bob", "a", "a").await.unwrap();
        assert!(matches!(
            accounts.sign_up("bob", "c", "c").await,
            Err(AccountError::UsernameTaken(_))
        ));
    }

    #[tokio::test]
    async fn wrong_typed_field_does_not_free_the_username() {
        let dir = TempDir::new().unwrap();
        let accounts = service(&dir);
        let path = accounts.gateway.local().path_for("ivy");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"password": "pw", "chat_history": [["a", "b"]], "display_name": 42}"#,
        )
        .unwrap();

        assert!(matches!(
            accounts.sign_up("ivy", "attacker", "attacker").await,
            Err(AccountError::UsernameTaken(_))
        ));
        let session = accounts.log_in("ivy", "pw").await.unwrap();
        assert_eq!(session.history, vec![Exchange::new("a", "b")]);
        assert!(session.display_name.is_none());
    }

    #[tokio::test]
    async fn external_accounts_cannot_password_login() {
        let dir = TempDir::new().unwrap();
        let accounts = service(&dir);
        let identity = ExternalIdentity {
            email: Some("eve@example.com".to_string()),
            name: Some("Eve".to_string()),
            ..ExternalIdentity::default()
        };
        let session = accounts
            .external_sign_in(IdentityProvider::Google, &identity)
            .await
            .unwrap();
        assert_eq!(session.user_id, "eve@example.com");
        assert_eq!(session.display_name.as_deref(), Some("Eve"));
        assert!(session.persisted);

        assert!(accounts.log_in("eve@example.com", "").await.is_err());
        assert!(accounts.log_in("eve@example.com", "anything").await.is_err());
    }

    #[tokio::test]
    async fn external_sign_in_keeps_history() {
        let dir = TempDir::new().unwrap();
        let accounts = service(&dir);
        let identity = ExternalIdentity {
            login: Some("octo".to_string()),
            ..ExternalIdentity::default()
        };
        let mut session = accounts
            .external_sign_in(IdentityProvider::GitHub, &identity)
            .await
            .unwrap();
        assert_eq!(session.user_id, "octo");
        session.ask("hi");
        assert!(session.answer("hello"));
        assert!(accounts.save(&session).await);

        let again = accounts
            .external_sign_in(IdentityProvider::GitHub, &identity)
            .await
            .unwrap();
        assert_eq!(again.history, vec![Exchange::new("hi", "hello")]);

        let record = accounts.gateway.get_record("octo").await.unwrap();
        assert!(record.external);
        assert_eq!(record.provider.as_deref(), Some("github"));
        assert_eq!(record.email.as_deref(), Some("octo"));
    }

    #[test]
    fn provider_identity_mapping() {
        let bare = ExternalIdentity {
            id: Some("42".to_string()),
            ..ExternalIdentity::default()
        };
        assert_eq!(
            bare.resolve(IdentityProvider::Apple),
            ("apple_42".to_string(), "Apple User".to_string())
        );
        assert_eq!(bare.resolve(IdentityProvider::LinkedIn).0, "linkedin_42");
        assert_eq!(
            ExternalIdentity::default().resolve(IdentityProvider::Google).0,
            "google_user"
        );

        let linkedin = ExternalIdentity {
            email: Some("li@example.com".to_string()),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            ..ExternalIdentity::default()
        };
        assert_eq!(
            linkedin.resolve(IdentityProvider::LinkedIn),
            ("li@example.com".to_string(), "Ada Lovelace".to_string())
        );
    }

    #[test]
    fn provider_parsing() {
        assert_eq!("GitHub".parse::<IdentityProvider>(), Ok(IdentityProvider::GitHub));
        assert!("myspace".parse::<IdentityProvider>().is_err());
    }

    #[test]
    fn answer_needs_pending_turn() {
        let mut session = Session {
            user_id: "u".to_string(),
            display_name: None,
            history: Vec::new(),
            persisted: true,
        };
        assert!(!session.answer("orphan"));
        session.ask("q");
        assert!(session.answer("a"));
        assert!(!session.answer("again"));
    }
}
