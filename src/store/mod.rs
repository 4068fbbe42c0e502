//! Persistence backends for user records.
//!
//! - `FirestoreBackend`: the remote document store (REST)
//! - `LocalFileBackend`: one JSON file per user, the fallback
//! - `MemoryBackend`: in-process stand-in for the remote store

pub mod firestore;
pub mod local;
pub mod memory;
pub mod traits;
pub mod wire;

pub use firestore::{FirestoreBackend, FirestoreConnector};
pub use local::LocalFileBackend;
pub use memory::{MemoryBackend, MemoryConnector};
pub use traits::{RemoteConnector, UserBackend};
