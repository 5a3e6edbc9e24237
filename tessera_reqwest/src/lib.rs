//! Middleware to authorize outgoing requests and recover from expired credentials
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AuthenticationMiddleware`] in the middleware stack to attach
//! the session's current access token to each outbound request. The
//! middleware consults a shared [`RefreshCoordinator`], so that however many
//! requests are in flight, an expiring credential is only ever refreshed
//! once.
//!
//! For each request, the middleware:
//!
//! 1. passes requests to public endpoints through untouched;
//! 2. refreshes the credential first if it is close to expiry;
//! 3. attaches the current access token as a bearer token;
//! 4. on a `401 Unauthorized` that reports an expired token, refreshes the
//!    credential and resends the request exactly once. Any other `401` ends
//!    the session.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the request is treated as
//! managing its own credentials and is passed through untouched.
//!
//! ```
//! use std::sync::Arc;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tessera_reqwest::AuthenticationMiddleware;
//! use tessera_tokens::{sources::http::AuthApi, store::MemoryStore, RefreshCoordinator};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let api = AuthApi::new(Client::new(), "https://api.example.com/api".parse()?);
//! let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()), Arc::new(api));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AuthenticationMiddleware::new(coordinator))
//!     .build();
//!
//! let req = client.get("https://api.example.com/api/collections");
//! # drop(req);
//! # Ok(())
//! # }
//! ```
//!
//! Which requests are public is decided by a predicate. The default,
//! [`PublicEndpoints`], matches the API's own sign-in and account recovery
//! endpoints. Predicates can be composed to evaluate more complex
//! requirements; to keep the token from leaking to other hosts that share
//! the client, treat every [`ForeignHost`] as public too.
//!
//! ```
//! # use std::sync::Arc;
//! use predicates::prelude::PredicateBooleanExt;
//! use tessera_reqwest::{AuthenticationMiddleware, ForeignHost, PublicEndpoints};
//! # use tessera_tokens::{sources::http::AuthApi, store::MemoryStore, RefreshCoordinator};
//! # let api = AuthApi::new(reqwest::Client::new(), "https://api.example.com/api".parse().unwrap());
//! # let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()), Arc::new(api));
//!
//! AuthenticationMiddleware::new(coordinator).with_public_endpoints(
//!     PublicEndpoints::default().or(ForeignHost::new("api.example.com")),
//! );
//! ```
//!
//! When the session cannot be recovered, the request fails with a
//! [`reqwest_middleware::Error::Middleware`] wrapping an [`Unauthenticated`]
//! error, which can be recognized with [`unauthenticated()`].

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use bytes::{BufMut, BytesMut};
use predicates::Predicate;
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Error, Middleware, Next, Result};
use tessera_tokens::{
    AccessToken, AccessTokenRef, RefreshCoordinator, Unauthenticated, UnauthenticatedReason,
};

mod endpoints;
mod rejection;

pub use endpoints::{ForeignHost, PublicEndpoints, DEFAULT_PUBLIC_PATHS};
pub use rejection::{rejection_reason, AuthFailure};

/// A middleware that authorizes outgoing requests with the session credential
#[derive(Clone, Debug)]
pub struct AuthenticationMiddleware<P = PublicEndpoints> {
    coordinator: RefreshCoordinator,
    public: P,
}

impl AuthenticationMiddleware<PublicEndpoints> {
    /// Construct a new middleware from a refresh coordinator
    ///
    /// By default, requests to the endpoints in [`DEFAULT_PUBLIC_PATHS`] are
    /// sent without credentials. To change this behavior, provide a
    /// custom predicate with
    /// [`with_public_endpoints()`][Self::with_public_endpoints()].
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self {
            coordinator,
            public: PublicEndpoints::default(),
        }
    }

    /// Replaces the default predicate deciding which requests are public
    pub fn with_public_endpoints<P>(self, predicate: P) -> AuthenticationMiddleware<P> {
        AuthenticationMiddleware {
            coordinator: self.coordinator,
            public: predicate,
        }
    }
}

/// Recognizes a failure caused by the session being unauthenticated
pub fn unauthenticated(error: &Error) -> Option<&Unauthenticated> {
    match error {
        Error::Middleware(inner) => inner.downcast_ref::<Unauthenticated>(),
        _ => None,
    }
}

fn unauthenticated_error(reason: UnauthenticatedReason) -> Error {
    Error::middleware(Unauthenticated::from(reason))
}

fn bearer_header(token: &AccessTokenRef) -> Result<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value =
        header::HeaderValue::from_maybe_shared(header_value.freeze()).map_err(Error::middleware)?;
    value.set_sensitive(true);
    Ok(value)
}

impl<P> AuthenticationMiddleware<P> {
    /// Attaches the stored access token, returning the token attached
    async fn authorize(&self, req: &mut Request) -> Result<Option<AccessToken>> {
        let token = self
            .coordinator
            .access_token()
            .await
            .map_err(Error::middleware)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            if let Ok(Some(credential)) = self.coordinator.credential().await {
                let now = self.coordinator.now();
                tracing::trace!(
                    token.status = ?credential.status_at(now, self.coordinator.refresh_margin()),
                    token.lifetime = credential.lifetime().0,
                    token.expiry = credential.expires_at().0,
                    token.until_expired = credential.until_expired_at(now).0,
                    "obtained access token"
                );
            }
        }

        match &token {
            Some(token) => {
                req.headers_mut()
                    .insert(header::AUTHORIZATION, bearer_header(token)?);
            }
            None => {
                tracing::debug!("no access token stored, sending request without one");
            }
        }

        Ok(token)
    }
}

#[async_trait::async_trait]
impl<P> Middleware for AuthenticationMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.public.eval(&req) {
            tracing::trace!(url = %req.url(), "public endpoint, sending without credentials");
            return next.run(req, extensions).await;
        }

        if req.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!("request carries its own authorization");
            return next.run(req, extensions).await;
        }

        match self.coordinator.refresh_if_due().await {
            Ok(Some(_)) => {
                tracing::debug!("access token was close to expiry, refreshed before sending");
            }
            Ok(None) => {}
            Err(error) => return Err(unauthenticated_error(error.reason())),
        }

        let replay = req.try_clone();
        let sent_token = self.authorize(&mut req).await?;
        let resp = next.clone().run(req, extensions).await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let (resp, failure, reason) = rejection::read_rejection(resp).await?;
        match failure {
            AuthFailure::Malformed => {
                tracing::warn!(%reason, "credential rejected, ending session");
                self.coordinator
                    .end_session(UnauthenticatedReason::Rejected)
                    .await;
                return Err(unauthenticated_error(UnauthenticatedReason::Rejected));
            }
            AuthFailure::Expired => {
                tracing::debug!(%reason, "access token expired, refreshing");
            }
        }

        if let Err(error) = self
            .coordinator
            .refresh_rejected(sent_token.as_deref())
            .await
        {
            return Err(unauthenticated_error(error.reason()));
        }

        let Some(mut retry) = replay else {
            tracing::warn!("request body cannot be replayed, returning original response");
            return Ok(resp);
        };

        self.authorize(&mut retry).await?;
        tracing::debug!("retrying request with refreshed credential");
        next.run(retry, extensions).await
    }
}
