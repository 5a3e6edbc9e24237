//! Token sources

use async_trait::async_trait;

use crate::{error::BoxError, IssuedTokens, RefreshTokenRef};

#[cfg(feature = "http")]
pub mod http;

/// An authority able to exchange a refresh token for new tokens
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchanges `refresh_token` for a new set of tokens
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<IssuedTokens, BoxError>;
}
