//! Single-flight credential refresh
//!
//! A [`RefreshCoordinator`] owns the refresh protocol for one client session.
//! Any number of concurrent callers may ask it to refresh; only the first
//! caller to arrive while the coordinator is idle performs the network call,
//! and everyone who arrives while that call is in flight is parked as a
//! waiter. When the call finishes, the outcome is persisted (or the session
//! is torn down) first, and only then are the waiters released with a clone
//! of the same outcome.
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tessera_clock::DurationMillis;
//! use tessera_tokens::{
//!     error::BoxError, sources::TokenRefresher, store::MemoryStore, AccessToken, IssuedTokens,
//!     RefreshCoordinator, RefreshToken, RefreshTokenRef,
//! };
//!
//! struct Authority;
//!
//! #[async_trait]
//! impl TokenRefresher for Authority {
//!     async fn refresh(&self, _: &RefreshTokenRef) -> Result<IssuedTokens, BoxError> {
//!         Ok(IssuedTokens {
//!             access_token: AccessToken::from_static("next"),
//!             refresh_token: RefreshToken::from_static("next-refresh"),
//!             expires_in: DurationMillis::from_mins(15),
//!         })
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()), Arc::new(Authority));
//! assert!(!coordinator.should_refresh().await);
//! # }
//! ```

use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tessera_clock::{Clock, DurationMillis, EpochMillis, System};
use tokio::sync::{oneshot, watch};

use crate::{
    sources::TokenRefresher,
    store::{CredentialStore, StoreError},
    vault::{CredentialVault, UserInfo},
    AccessToken, AccessTokenRef, Credential, IssuedTokens, RefreshError, SessionStatus,
    TokenStatus, UnauthenticatedReason, DEFAULT_REFRESH_MARGIN,
};

type Outcome = Result<Credential, RefreshError>;

enum RefreshState {
    Idle,
    Refreshing {
        waiters: Vec<oneshot::Sender<Outcome>>,
    },
}

/// Counts ended sessions so that a refresh can tell it has been outlived
#[derive(Clone, Copy, Debug)]
struct SessionEpoch {
    epoch: u64,
    /// Set while the most recent session has ended and no new one has begun
    ended_by: Option<UnauthenticatedReason>,
}

struct Inner {
    vault: CredentialVault,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock + Send + Sync>,
    refresh_margin: DurationMillis,
    state: Mutex<RefreshState>,
    session: Mutex<SessionEpoch>,
    status: watch::Sender<SessionStatus>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> SessionEpoch {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_session_started(&self) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ended_by = None;
    }

    fn mark_session_ended(&self, reason: UnauthenticatedReason) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.epoch = session.epoch.wrapping_add(1);
        session.ended_by = Some(reason);
    }

    /// The error for a refresh whose session ended after `epoch`, if it did
    fn ended_since(&self, epoch: u64) -> Option<RefreshError> {
        let session = self.session();
        if session.epoch == epoch {
            return None;
        }

        let reason = session
            .ended_by
            .unwrap_or(UnauthenticatedReason::SignedOut);
        Some(RefreshError::SessionEnded(reason))
    }

    /// Returns to idle, handing back whoever was waiting
    fn finish_refresh(&self) -> Vec<oneshot::Sender<Outcome>> {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        }
    }
}

/// Marks the calling task as the one driving the current refresh
///
/// If the driving future is dropped before completing, the coordinator is
/// returned to idle and every waiter observes [`RefreshError::Abandoned`].
struct InFlight<'a> {
    inner: &'a Inner,
    completed: bool,
}

impl InFlight<'_> {
    fn complete(mut self, outcome: &Outcome) {
        self.completed = true;
        let waiters = self.inner.finish_refresh();
        if !waiters.is_empty() {
            tracing::debug!(waiters = waiters.len(), "releasing refresh waiters");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let waiters = self.inner.finish_refresh();
            tracing::warn!(
                waiters = waiters.len(),
                "in-flight refresh dropped before completing"
            );
        }
    }
}

/// Coordinates credential refreshes so that at most one is in flight
///
/// Cloning is cheap; all clones share the same refresh state, store, and
/// session status channel.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

/// A handle that does not keep the coordinator alive
#[derive(Clone, Debug)]
pub(crate) struct WeakCoordinator(Weak<Inner>);

impl WeakCoordinator {
    pub(crate) fn upgrade(&self) -> Option<RefreshCoordinator> {
        self.0.upgrade().map(|inner| RefreshCoordinator { inner })
    }
}

/// Configures and builds a [`RefreshCoordinator`]
pub struct CoordinatorBuilder {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock + Send + Sync>,
    refresh_margin: DurationMillis,
}

impl fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("now", &self.clock.now())
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

impl CoordinatorBuilder {
    /// Uses `clock` to determine the current time
    ///
    /// Defaults to the system clock.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets how long before expiry a token becomes due for proactive refresh
    ///
    /// Defaults to [`DEFAULT_REFRESH_MARGIN`].
    pub fn with_refresh_margin(mut self, refresh_margin: DurationMillis) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    /// Builds the coordinator
    ///
    /// The coordinator starts idle and reports the session as not signed in
    /// until [`RefreshCoordinator::restore()`] or
    /// [`RefreshCoordinator::begin_session()`] says otherwise.
    pub fn build(self) -> RefreshCoordinator {
        let (status, _) = watch::channel(SessionStatus::default());
        RefreshCoordinator {
            inner: Arc::new(Inner {
                vault: CredentialVault::new(self.store),
                refresher: self.refresher,
                clock: self.clock,
                refresh_margin: self.refresh_margin,
                state: Mutex::new(RefreshState::Idle),
                session: Mutex::new(SessionEpoch {
                    epoch: 0,
                    ended_by: None,
                }),
                status,
            }),
        }
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refresh_margin", &self.inner.refresh_margin)
            .field("refreshing", &self.is_refreshing())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    /// Constructs a coordinator using the system clock and default margin
    pub fn new(store: Arc<dyn CredentialStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::builder(store, refresher).build()
    }

    /// Starts configuring a coordinator
    pub fn builder(
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            store,
            refresher,
            clock: Arc::new(System),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// The typed credential view over the underlying store
    pub fn vault(&self) -> &CredentialVault {
        &self.inner.vault
    }

    /// The margin before expiry at which a token becomes due for refresh
    pub fn refresh_margin(&self) -> DurationMillis {
        self.inner.refresh_margin
    }

    /// The current time according to the coordinator's clock
    pub fn now(&self) -> EpochMillis {
        self.inner.clock.now()
    }

    /// Subscribes to session status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// The most recently published session status
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Loads the current credential
    pub async fn credential(&self) -> Result<Option<Credential>, StoreError> {
        self.inner.vault.load().await
    }

    /// Loads the current access token
    pub async fn access_token(&self) -> Result<Option<AccessToken>, StoreError> {
        self.inner.vault.access_token().await
    }

    /// Whether a complete credential is currently stored
    pub async fn is_authenticated(&self) -> bool {
        matches!(self.inner.vault.load().await, Ok(Some(_)))
    }

    /// The status of the stored credential, if there is one
    pub async fn token_status(&self) -> Option<TokenStatus> {
        match self.inner.vault.load().await {
            Ok(credential) => credential
                .map(|c| c.status_at(self.inner.clock.now(), self.inner.refresh_margin)),
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to read credential from store"
                );
                None
            }
        }
    }

    /// Whether the stored credential is valid but close enough to expiry
    /// that it should be refreshed
    ///
    /// An already expired token is not considered due; requests carrying it
    /// are expected to be rejected and recovered reactively.
    pub async fn should_refresh(&self) -> bool {
        matches!(self.token_status().await, Some(TokenStatus::Stale))
    }

    /// Refreshes the stored credential if it is due
    ///
    /// Returns `Ok(None)` when no refresh was needed. Unlike checking
    /// [`should_refresh()`][Self::should_refresh()] and then calling
    /// [`refresh()`][Self::refresh()], the credential that was judged stale
    /// is remembered: if another caller has rotated it by the time this
    /// caller gets to refresh, the rotated credential is returned without
    /// contacting the authority.
    pub async fn refresh_if_due(&self) -> Result<Option<Credential>, RefreshError> {
        let credential = match self.inner.vault.load().await {
            Ok(Some(credential)) => credential,
            Ok(None) => return Ok(None),
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to read credential from store"
                );
                return Ok(None);
            }
        };

        let status = credential.status_at(self.inner.clock.now(), self.inner.refresh_margin);
        if status != TokenStatus::Stale {
            return Ok(None);
        }

        self.refresh_from(Some(credential.access_token()))
            .await
            .map(Some)
    }

    /// Publishes the session status implied by the store's contents
    ///
    /// Intended for application start-up, when a credential may have been
    /// persisted by a previous run.
    pub async fn restore(&self) -> Result<SessionStatus, StoreError> {
        let status = match self.inner.vault.load().await? {
            Some(_) => {
                self.inner.mark_session_started();
                SessionStatus::Authenticated
            }
            None => SessionStatus::Unauthenticated(UnauthenticatedReason::NotSignedIn),
        };
        self.publish(status);
        Ok(status)
    }

    /// Persists freshly issued tokens as the new session credential
    pub async fn begin_session(
        &self,
        tokens: IssuedTokens,
        user: Option<&UserInfo>,
    ) -> Result<Credential, StoreError> {
        let credential = Credential::issue(tokens, &*self.inner.clock);
        self.inner.mark_session_started();
        self.inner.vault.save(&credential).await?;
        match user {
            Some(user) => self.inner.vault.save_user(user).await?,
            None => self.inner.vault.clear_user().await?,
        }

        tracing::info!(
            lifetime = credential.lifetime().0,
            expires_at = credential.expires_at().0,
            "session started"
        );
        self.publish(SessionStatus::Authenticated);
        Ok(credential)
    }

    /// Removes all session credentials and announces the session's end
    ///
    /// Safe to call repeatedly.
    ///
    /// A refresh in flight when the session ends stores nothing, and its
    /// callers receive [`RefreshError::SessionEnded`].
    pub async fn end_session(&self, reason: UnauthenticatedReason) {
        self.inner.mark_session_ended(reason);
        if let Err(error) = self.inner.vault.clear().await {
            tracing::error!(
                error = (&error as &dyn error::Error),
                "unable to fully clear session credentials"
            );
        }

        tracing::info!(%reason, "session ended");
        self.publish(SessionStatus::Unauthenticated(reason));
    }

    /// Signs the user out
    pub async fn logout(&self) {
        self.end_session(UnauthenticatedReason::SignedOut).await
    }

    /// Obtains a new credential, joining any refresh already in flight
    ///
    /// On failure the session has already been ended by the time the error
    /// is returned.
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        self.refresh_from(None).await
    }

    /// Recovers from the API rejecting `rejected` as expired
    ///
    /// If the stored token has already been rotated away from `rejected`,
    /// the stored credential is returned without contacting the authority.
    /// Otherwise this behaves like [`refresh()`][Self::refresh()].
    pub async fn refresh_rejected(
        &self,
        rejected: Option<&AccessTokenRef>,
    ) -> Result<Credential, RefreshError> {
        self.refresh_from(rejected).await
    }

    /// Refreshes on behalf of a caller that last saw `observed`
    ///
    /// Whether `observed` is still current is decided only once this caller
    /// is driving the refresh, so no other refresh can complete in between.
    async fn refresh_from(
        &self,
        observed: Option<&AccessTokenRef>,
    ) -> Result<Credential, RefreshError> {
        let waiter = {
            let mut state = self.inner.lock_state();
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing {
                        waiters: Vec::new(),
                    };
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            tracing::debug!("refresh already in flight, waiting for its outcome");
            return rx.await.unwrap_or(Err(RefreshError::Abandoned));
        }

        let flight = InFlight {
            inner: &self.inner,
            completed: false,
        };
        let outcome = self.perform_refresh(observed).await;
        flight.complete(&outcome);
        outcome
    }

    #[tracing::instrument(level = "debug", skip(self, observed))]
    async fn perform_refresh(&self, observed: Option<&AccessTokenRef>) -> Outcome {
        let session = self.inner.session();
        if let Some(reason) = session.ended_by {
            tracing::debug!(%reason, "session ended before refresh began");
            return Err(RefreshError::SessionEnded(reason));
        }
        let epoch = session.epoch;

        if let Some(observed) = observed {
            match self.inner.vault.load().await {
                Ok(Some(current)) if current.access_token() != observed => {
                    tracing::debug!("credential was already rotated, reusing current");
                    return Ok(current);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "unable to read credential from store"
                    );
                }
            }
        }

        let refresh_token = match self.inner.vault.refresh_token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                if let Some(ended) = self.inner.ended_since(epoch) {
                    return Err(ended);
                }
                tracing::warn!("refresh requested without a stored refresh token");
                self.end_session(UnauthenticatedReason::MissingRefreshToken)
                    .await;
                return Err(RefreshError::NoRefreshToken);
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to read refresh token"
                );
                self.end_session(UnauthenticatedReason::RefreshFailed).await;
                return Err(RefreshError::Store(Arc::new(error)));
            }
        };

        tracing::debug!("requesting new tokens from authority");
        let issued = match self.inner.refresher.refresh(&refresh_token).await {
            Ok(issued) => issued,
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "token refresh failed"
                );
                if let Some(ended) = self.inner.ended_since(epoch) {
                    return Err(ended);
                }
                self.end_session(UnauthenticatedReason::RefreshFailed).await;
                return Err(RefreshError::Rejected(Arc::from(error)));
            }
        };

        if let Some(ended) = self.inner.ended_since(epoch) {
            tracing::debug!("session ended during refresh, discarding issued tokens");
            return Err(ended);
        }

        let credential = Credential::issue(issued, &*self.inner.clock);
        if let Err(error) = self.inner.vault.save(&credential).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to persist refreshed credential"
            );
            if let Some(ended) = self.inner.ended_since(epoch) {
                return Err(ended);
            }
            self.end_session(UnauthenticatedReason::RefreshFailed).await;
            return Err(RefreshError::Store(Arc::new(error)));
        }

        if let Some(ended) = self.inner.ended_since(epoch) {
            tracing::debug!("session ended while saving, removing refreshed credential");
            if let Err(error) = self.inner.vault.clear().await {
                tracing::error!(
                    error = (&error as &dyn error::Error),
                    "unable to fully clear session credentials"
                );
            }
            return Err(ended);
        }

        tracing::info!(
            lifetime = credential.lifetime().0,
            expires_at = credential.expires_at().0,
            "credential refreshed"
        );
        self.publish(SessionStatus::Authenticated);
        Ok(credential)
    }

    pub(crate) fn downgrade(&self) -> WeakCoordinator {
        WeakCoordinator(Arc::downgrade(&self.inner))
    }

    fn publish(&self, status: SessionStatus) {
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
