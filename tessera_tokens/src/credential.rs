use tessera_clock::{Clock, DurationMillis, EpochMillis};

use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

/// How long before expiry a token becomes eligible for proactive refresh
pub const DEFAULT_REFRESH_MARGIN: DurationMillis = DurationMillis::from_mins(5);

/// Tokens as issued by the token authority, before being anchored in time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedTokens {
    /// The new access token
    pub access_token: AccessToken,
    /// The new refresh token
    pub refresh_token: RefreshToken,
    /// The lifetime declared by the authority
    pub expires_in: DurationMillis,
}

/// A complete set of session credentials
///
/// Both tokens and the absolute expiry always travel together; a credential
/// is replaced wholesale on refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    access_token: AccessToken,
    refresh_token: RefreshToken,
    lifetime: DurationMillis,
    expires_at: EpochMillis,
}

/// A credential's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and not yet near expiry
    Fresh,
    /// The token is valid, but should be refreshed
    Stale,
    /// The token is no longer valid
    Expired,
}

impl Credential {
    /// Assembles a credential from its stored parts
    pub fn new(
        access_token: AccessToken,
        refresh_token: RefreshToken,
        lifetime: DurationMillis,
        expires_at: EpochMillis,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            lifetime,
            expires_at,
        }
    }

    /// Anchors freshly issued tokens to the clock's current time
    pub fn issue<C: Clock + ?Sized>(tokens: IssuedTokens, clock: &C) -> Self {
        let issued = clock.now();
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            lifetime: tokens.expires_in,
            expires_at: issued + tokens.expires_in,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the lifetime the authority declared when issuing the token
    #[inline]
    pub fn lifetime(&self) -> DurationMillis {
        self.lifetime
    }

    /// Gets the instant at which the access token expires
    #[inline]
    pub fn expires_at(&self) -> EpochMillis {
        self.expires_at
    }

    /// Gets the credential's status as of `now`
    ///
    /// A token is stale once less than `margin` remains before expiry.
    #[inline]
    pub fn status_at(&self, now: EpochMillis, margin: DurationMillis) -> TokenStatus {
        match self.expires_at.remaining_after(now) {
            None => TokenStatus::Expired,
            Some(remaining) if remaining < margin => TokenStatus::Stale,
            Some(_) => TokenStatus::Fresh,
        }
    }

    /// Gets how much longer the token will be valid as of `now`
    #[inline]
    pub fn until_expired_at(&self, now: EpochMillis) -> DurationMillis {
        self.expires_at - now
    }
}
