use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tessera_clock::{DurationMillis, EpochMillis};

use crate::{
    error::BoxError,
    sources::TokenRefresher,
    store::{CredentialStore, MemoryStore, StoreError},
    AccessToken, IssuedTokens, RefreshToken, RefreshTokenRef,
};

pub(crate) const NOW: EpochMillis = EpochMillis(1_700_000_000_000);

/// Stores a `{prefix}-access`/`{prefix}-refresh` credential expiring
/// `remaining` after [`NOW`]
pub(crate) async fn seed_credential(store: &MemoryStore, prefix: &str, remaining: DurationMillis) {
    seed_credential_in(store, prefix, remaining).await
}

/// Like [`seed_credential()`], for any store
pub(crate) async fn seed_credential_in(
    store: &dyn CredentialStore,
    prefix: &str,
    remaining: DurationMillis,
) {
    store
        .set_many(vec![
            ("auth_token", format!("{prefix}-access")),
            ("refresh_token", format!("{prefix}-refresh")),
            ("expiresIn", DurationMillis::from_mins(15).0.to_string()),
            ("token_expiration", (NOW + remaining).0.to_string()),
        ])
        .await
        .unwrap();
}

/// A unique path in the temporary directory, removed if it already exists
pub(crate) fn scratch_path(name: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "tessera-{}-{}.json",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

/// Wraps a store so that every read suspends for `delay` after the value
/// has been read
pub(crate) struct SlowReadStore {
    inner: Arc<dyn CredentialStore>,
    delay: Duration,
}

impl SlowReadStore {
    pub(crate) fn new(inner: Arc<dyn CredentialStore>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { inner, delay })
    }
}

#[async_trait]
impl CredentialStore for SlowReadStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self.inner.get(key).await;
        tokio::time::sleep(self.delay).await;
        value
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear().await
    }

    async fn set_many(&self, entries: Vec<(&'static str, String)>) -> Result<(), StoreError> {
        self.inner.set_many(entries).await
    }
}

enum Behavior {
    Succeed(Duration),
    Fail(Duration),
    Hang,
}

pub(crate) struct MockRefresher {
    behavior: Behavior,
    calls: AtomicUsize,
    last_refresh_token: Mutex<Option<String>>,
}

impl MockRefresher {
    fn with(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            last_refresh_token: Mutex::new(None),
        })
    }

    pub(crate) fn succeeding() -> Arc<Self> {
        Self::with(Behavior::Succeed(Duration::ZERO))
    }

    pub(crate) fn succeeding_after(delay: Duration) -> Arc<Self> {
        Self::with(Behavior::Succeed(delay))
    }

    pub(crate) fn failing() -> Arc<Self> {
        Self::with(Behavior::Fail(Duration::ZERO))
    }

    pub(crate) fn failing_after(delay: Duration) -> Arc<Self> {
        Self::with(Behavior::Fail(delay))
    }

    pub(crate) fn hanging() -> Arc<Self> {
        Self::with(Behavior::Hang)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_refresh_token(&self) -> Option<String> {
        self.last_refresh_token.lock().unwrap().clone()
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl TokenRefresher for MockRefresher {
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<IssuedTokens, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_refresh_token.lock().unwrap() = Some(refresh_token.as_str().to_owned());

        match self.behavior {
            Behavior::Succeed(delay) => {
                pause(delay).await;
                Ok(IssuedTokens {
                    access_token: AccessToken::new(format!("new-access-{call}")),
                    refresh_token: RefreshToken::new(format!("new-refresh-{call}")),
                    expires_in: DurationMillis::from_mins(15),
                })
            }
            Behavior::Fail(delay) => {
                pause(delay).await;
                Err("refresh token revoked".into())
            }
            Behavior::Hang => std::future::pending().await,
        }
    }
}
