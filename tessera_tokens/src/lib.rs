//! Credential lifecycle management for bearer-token API clients
//!
//! This library keeps a client's session credential (an access token, the
//! refresh token used to replace it, and the instant at which it expires) in
//! a durable [`CredentialStore`][store::CredentialStore], and rotates it
//! through a [`RefreshCoordinator`] that guarantees at most one refresh is
//! ever in flight.
//!
//! Any number of concurrent tasks may discover at the same moment that the
//! access token is expired or about to expire. The first of them performs
//! the refresh; everyone else queues behind it and resumes with the same
//! outcome once the new credential has been persisted. If the refresh
//! fails, the session is cleared before anyone resumes, and subscribers to
//! the coordinator's [`SessionStatus`] channel are told why.
//!
//! # General Flow
//!
//! On application start-up, choose where credentials live and how they are
//! refreshed, then restore any session persisted by a previous run. A
//! [`RefreshTicker`] can be spawned to refresh the credential proactively in
//! the background, so that requests rarely have to wait for a refresh at
//! all.
//!
//! ```
//! use std::sync::Arc;
//! use tessera_tokens::{
//!     sources::http::AuthApi, store::FileStore, RefreshCoordinator, RefreshTicker,
//!     DEFAULT_TICK_INTERVAL,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let api = AuthApi::with_default_client("https://api.example.com/v1".parse()?)?;
//! let store = FileStore::new("credentials.json".into());
//!
//! let coordinator = RefreshCoordinator::new(Arc::new(store), Arc::new(api.clone()));
//! coordinator.restore().await?;
//!
//! if !coordinator.status().is_authenticated() {
//!     api.sign_in(&coordinator, "ada", "hunter22").await?;
//! }
//!
//! let ticker = RefreshTicker::new(coordinator.clone(), DEFAULT_TICK_INTERVAL);
//! ticker.start();
//!
//! let mut status = coordinator.subscribe();
//! while status.changed().await.is_ok() {
//!     tracing::info!(status = ?*status.borrow(), "session status changed");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Outbound requests are authorized by the `tessera_reqwest` middleware,
//! which consults the same coordinator.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `file`: Provides a credential store using the local filesystem.
//! * `http`: Provides a token refresher, along with sign-in and account
//!   recovery calls, against the API's `/auth` endpoints.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod coordinator;
mod credential;
pub mod error;
mod session;
pub mod sources;
pub mod store;
#[cfg(test)]
mod testing;
mod ticker;
pub mod vault;

pub use braids::*;
pub use coordinator::{CoordinatorBuilder, RefreshCoordinator};
pub use credential::{Credential, IssuedTokens, TokenStatus, DEFAULT_REFRESH_MARGIN};
pub use error::{RefreshError, Unauthenticated, UnauthenticatedReason};
pub use session::SessionStatus;
pub use ticker::{RefreshTicker, DEFAULT_TICK_INTERVAL, MIN_TICK_INTERVAL};
