use std::{error, fmt, sync::Arc};

use thiserror::Error;

use crate::store::StoreError;

/// Why a session is not (or no longer) authenticated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnauthenticatedReason {
    /// No credential has been established
    NotSignedIn,
    /// The user signed out
    SignedOut,
    /// A refresh was needed but no refresh token was stored
    MissingRefreshToken,
    /// The token authority refused or failed to issue new tokens
    RefreshFailed,
    /// The API rejected the credential for a reason other than expiry
    Rejected,
}

impl fmt::Display for UnauthenticatedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotSignedIn => "not signed in",
            Self::SignedOut => "signed out",
            Self::MissingRefreshToken => "no refresh token available",
            Self::RefreshFailed => "token refresh failed",
            Self::Rejected => "credential rejected",
        })
    }
}

/// The session is no longer authenticated and the user must sign in again
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("unauthenticated: {reason}")]
pub struct Unauthenticated {
    /// Why the session ended
    pub reason: UnauthenticatedReason,
}

impl From<UnauthenticatedReason> for Unauthenticated {
    fn from(reason: UnauthenticatedReason) -> Self {
        Self { reason }
    }
}

/// A boxed error returned by external collaborators
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// An error while refreshing credentials
///
/// Every caller waiting on the same refresh receives a clone of the same
/// error.
#[derive(Clone, Debug, Error)]
pub enum RefreshError {
    /// No refresh token was stored
    #[error("no refresh token is available")]
    NoRefreshToken,
    /// The token authority failed or returned unusable tokens
    #[error("token authority did not issue new tokens")]
    Rejected(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// New tokens were issued but could not be persisted
    #[error("unable to persist refreshed credential")]
    Store(#[source] Arc<StoreError>),
    /// The task driving the refresh was dropped before it completed
    #[error("in-flight refresh was abandoned before completing")]
    Abandoned,
    /// The session ended while the refresh was in flight; nothing was stored
    #[error("session ended during refresh: {0}")]
    SessionEnded(UnauthenticatedReason),
}

impl RefreshError {
    /// The session-level reason corresponding to this failure
    pub fn reason(&self) -> UnauthenticatedReason {
        match self {
            Self::NoRefreshToken => UnauthenticatedReason::MissingRefreshToken,
            Self::Rejected(_) | Self::Store(_) | Self::Abandoned => {
                UnauthenticatedReason::RefreshFailed
            }
            Self::SessionEnded(reason) => *reason,
        }
    }
}

impl From<RefreshError> for Unauthenticated {
    fn from(error: RefreshError) -> Self {
        error.reason().into()
    }
}
