use crate::UnauthenticatedReason;

/// Whether the session currently holds usable credentials
///
/// Published by the coordinator whenever a session begins or ends, so that
/// UI layers can redirect to sign-in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// A complete credential is stored
    Authenticated,
    /// No credential is stored
    Unauthenticated(UnauthenticatedReason),
}

impl SessionStatus {
    /// Whether this status is [`SessionStatus::Authenticated`]
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Unauthenticated(UnauthenticatedReason::NotSignedIn)
    }
}
