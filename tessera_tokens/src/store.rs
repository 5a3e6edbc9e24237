//! Key-value persistence for session credentials

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "file")]
pub mod file;
pub mod memory;

#[cfg(feature = "file")]
pub use file::FileStore;
pub use memory::MemoryStore;

/// Key holding the current access token
pub const AUTH_TOKEN_KEY: &str = "auth_token";
/// Key holding the current refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Key holding the lifetime the authority declared, in milliseconds
pub const EXPIRES_IN_KEY: &str = "expiresIn";
/// Key holding the absolute expiry, in epoch milliseconds
pub const TOKEN_EXPIRATION_KEY: &str = "token_expiration";
/// Key holding the signed-in user's profile as JSON
pub const USER_INFO_KEY: &str = "user_info";

/// Every key that belongs to a session
pub const SESSION_KEYS: [&str; 5] = [
    AUTH_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    EXPIRES_IN_KEY,
    TOKEN_EXPIRATION_KEY,
    USER_INFO_KEY,
];

/// An error raised by a credential store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing storage could not be read or written
    #[error("credential storage I/O failed")]
    Io(#[from] std::io::Error),
    /// The backing storage held data that could not be (de)serialized
    #[error("credential storage contents are malformed")]
    Serialization(#[from] serde_json::Error),
}

/// A string key-value store for credentials
///
/// Stores attach no meaning to keys. Each individual write must be atomic
/// from the caller's perspective.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Reads the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` under `key`, replacing any existing value
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Removes the value stored under `key`, if any
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Removes every value in the store
    async fn clear(&self) -> Result<(), StoreError>;

    /// Stores several values
    ///
    /// The default writes each entry in turn. Stores that can do so should
    /// apply all entries as a single write.
    async fn set_many(&self, entries: Vec<(&'static str, String)>) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(key, value).await?;
        }
        Ok(())
    }
}
