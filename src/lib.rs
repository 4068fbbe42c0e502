//! Persistence gateway for chatbot user records.
//!
//! Records go to a remote document store when one is reachable and fall back
//! to per-user JSON files otherwise.

pub mod accounts;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod health;
pub mod model;
pub mod store;

pub use accounts::{AccountService, ExternalIdentity, IdentityProvider, Session};
pub use config::GatewayConfig;
pub use error::{AccountError, ConfigError, ErrorKind, StoreError};
pub use gateway::{BackendState, PersistenceGateway};
pub use model::{Exchange, UserRecord};
