//! Pluggable key/value persistence for token slots
//!
//! Two kinds of backend are used by the token store: a volatile one for the
//! access token and a session-scoped one for the refresh token.

mod memory;
mod session;

pub use memory::MemoryBackend;
pub use session::SessionBackend;

use async_trait::async_trait;

use crate::error::StorageError;

/// Async string key/value store.
///
/// `set` and `remove` report whether the write took effect. Removing a key
/// that is not present still succeeds.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<bool, StorageError>;
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;
}
