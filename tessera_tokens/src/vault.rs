//! A typed view of session credentials held in a [`CredentialStore`]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_clock::{DurationMillis, EpochMillis};

use crate::{
    store::{
        CredentialStore, StoreError, AUTH_TOKEN_KEY, EXPIRES_IN_KEY, REFRESH_TOKEN_KEY,
        SESSION_KEYS, TOKEN_EXPIRATION_KEY, USER_INFO_KEY,
    },
    AccessToken, Credential, RefreshToken,
};

/// Profile details for the signed-in user
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// The user's login name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// The user's email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Reads and writes whole credentials against the store's key layout
#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Wraps a credential store
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Loads the stored credential
    ///
    /// Returns `None` unless both tokens and a readable expiry are present.
    pub async fn load(&self) -> Result<Option<Credential>, StoreError> {
        let access_token = self.store.get(AUTH_TOKEN_KEY).await?;
        let refresh_token = self.store.get(REFRESH_TOKEN_KEY).await?;
        let expiration = self.store.get(TOKEN_EXPIRATION_KEY).await?;

        let (access_token, refresh_token, expiration) =
            match (access_token, refresh_token, expiration) {
                (Some(a), Some(r), Some(e)) => (a, r, e),
                (None, None, None) => return Ok(None),
                (a, r, e) => {
                    tracing::warn!(
                        has_access_token = a.is_some(),
                        has_refresh_token = r.is_some(),
                        has_expiration = e.is_some(),
                        "incomplete credential in store, treating session as signed out"
                    );
                    return Ok(None);
                }
            };

        let expires_at = match expiration.trim().parse::<u64>() {
            Ok(ms) => EpochMillis(ms),
            Err(_) => {
                tracing::warn!(
                    value = %expiration,
                    "unreadable token expiration in store, treating session as signed out"
                );
                return Ok(None);
            }
        };

        let lifetime = self
            .store
            .get(EXPIRES_IN_KEY)
            .await?
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(DurationMillis)
            .unwrap_or(DurationMillis::ZERO);

        Ok(Some(Credential::new(
            AccessToken::new(access_token),
            RefreshToken::new(refresh_token),
            lifetime,
            expires_at,
        )))
    }

    /// Loads only the stored access token
    pub async fn access_token(&self) -> Result<Option<AccessToken>, StoreError> {
        Ok(self.store.get(AUTH_TOKEN_KEY).await?.map(AccessToken::new))
    }

    /// Loads only the stored refresh token
    pub async fn refresh_token(&self) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self
            .store
            .get(REFRESH_TOKEN_KEY)
            .await?
            .map(RefreshToken::new))
    }

    /// Writes a credential, replacing every credential key
    pub async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        self.store
            .set_many(vec![
                (AUTH_TOKEN_KEY, credential.access_token().as_str().to_owned()),
                (
                    REFRESH_TOKEN_KEY,
                    credential.refresh_token().as_str().to_owned(),
                ),
                (EXPIRES_IN_KEY, credential.lifetime().0.to_string()),
                (TOKEN_EXPIRATION_KEY, credential.expires_at().0.to_string()),
            ])
            .await
    }

    /// Writes the signed-in user's profile
    pub async fn save_user(&self, user: &UserInfo) -> Result<(), StoreError> {
        let data = serde_json::to_string(user)?;
        self.store.set(USER_INFO_KEY, data).await
    }

    /// Forgets the signed-in user's profile
    pub async fn clear_user(&self) -> Result<(), StoreError> {
        self.store.remove(USER_INFO_KEY).await
    }

    /// Loads the signed-in user's profile
    pub async fn user(&self) -> Result<Option<UserInfo>, StoreError> {
        match self.store.get(USER_INFO_KEY).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Removes every session key
    ///
    /// Each removal is attempted even if an earlier one fails; the first
    /// failure is returned.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for key in SESSION_KEYS {
            if let Err(error) = self.store.remove(key).await {
                tracing::warn!(
                    key,
                    error = (&error as &dyn std::error::Error),
                    "unable to remove session key"
                );
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
