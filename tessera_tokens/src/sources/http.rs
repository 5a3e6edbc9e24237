//! A token refresher that uses the API's own authentication endpoints

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::TokenRefresher;
use crate::{
    error::BoxError, store::StoreError, vault::UserInfo, Credential, IssuedTokens,
    RefreshCoordinator, RefreshTokenRef,
};

pub mod dto;

/// The request timeout used by [`AuthApi::with_default_client()`]
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MIN_PASSWORD_LEN: usize = 6;

/// Tokens and profile details returned by a successful sign-in or refresh
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedIn {
    /// The newly issued tokens
    pub tokens: IssuedTokens,
    /// Profile details, as far as the authority reported them
    pub user: UserInfo,
}

/// Client for the API's `/auth` endpoints
#[derive(Clone, Debug)]
pub struct AuthApi {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

/// An error while talking to the authentication endpoints
#[derive(Debug, Error)]
pub enum AuthApiError {
    /// A request was rejected locally before being sent
    #[error("invalid {field}: {problem}")]
    InvalidInput {
        /// The offending input
        field: &'static str,
        /// What is wrong with it
        problem: &'static str,
    },
    /// The authority responded successfully but with unusable data
    #[error("invalid response from authority: {0}")]
    InvalidResponse(&'static str),
    /// An error from the authority with an error body
    #[error("authority responded with {status}: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The status code of the response
        status: reqwest::StatusCode,
        /// The body of the error
        body: String,
    },
    /// Unable to send a request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),
    /// Unable to deserialize the response body
    #[error("error deserializing response body from authority")]
    Deserialize(#[from] serde_json::Error),
    /// Unable to construct an endpoint URL
    #[error("unable to construct endpoint URL")]
    Url(#[from] url::ParseError),
    /// Unable to construct the HTTP client
    #[error("unable to construct HTTP client")]
    ClientBuild(#[source] reqwest::Error),
    /// Unable to persist the new session
    #[error("unable to persist session")]
    Store(#[from] StoreError),
}

impl AuthApi {
    /// Constructs a client for the API rooted at `base_url`
    ///
    /// Endpoints are resolved relative to `base_url`, so
    /// `https://api.example.com/v1` and `https://api.example.com/v1/` are
    /// equivalent.
    pub fn new(client: reqwest::Client, mut base_url: reqwest::Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self { client, base_url }
    }

    /// Constructs a client with its own HTTP client, using
    /// [`DEFAULT_REQUEST_TIMEOUT`]
    pub fn with_default_client(base_url: reqwest::Url) -> Result<Self, AuthApiError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(AuthApiError::ClientBuild)?;
        Ok(Self::new(client, base_url))
    }

    /// The root URL of the API
    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    /// Resolves the URL of an endpoint beneath the API root
    pub fn endpoint(&self, path: &str) -> Result<reqwest::Url, AuthApiError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Signs in with a username and password
    #[tracing::instrument(err, skip(self, password), fields(base_url = %self.base_url))]
    pub async fn login(&self, username: &str, password: &str) -> Result<SignedIn, AuthApiError> {
        require("username", username)?;
        require("password", password)?;

        let resp = self
            .post("auth/login", &dto::LoginRequest { username, password })
            .await?;
        read_tokens(resp).await
    }

    /// Signs in and establishes the result as the coordinator's session
    pub async fn sign_in(
        &self,
        coordinator: &RefreshCoordinator,
        username: &str,
        password: &str,
    ) -> Result<Credential, AuthApiError> {
        let signed_in = self.login(username, password).await?;
        let credential = coordinator
            .begin_session(signed_in.tokens, Some(&signed_in.user))
            .await?;
        Ok(credential)
    }

    /// Exchanges a refresh token for new tokens
    #[tracing::instrument(err, skip(self, refresh_token), fields(base_url = %self.base_url))]
    pub async fn refresh_session(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<SignedIn, AuthApiError> {
        let resp = self
            .post("auth/refresh", &dto::RefreshRequest { refresh_token })
            .await?;
        read_tokens(resp).await
    }

    /// Registers a new account
    ///
    /// Returns the client-generated identifier submitted with the
    /// registration.
    #[tracing::instrument(err, skip(self, email, password), fields(base_url = %self.base_url))]
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<uuid::Uuid, AuthApiError> {
        require("username", username)?;
        validate_email(email)?;
        validate_password(password)?;

        let uuid = uuid::Uuid::new_v4();
        self.post(
            "auth/register",
            &dto::RegisterRequest {
                uuid,
                username,
                email,
                password,
            },
        )
        .await?;

        tracing::info!(%uuid, "registered new account");
        Ok(uuid)
    }

    /// Requests a password reset email
    #[tracing::instrument(err, skip(self, email), fields(base_url = %self.base_url))]
    pub async fn forgot_password(&self, email: &str) -> Result<(), AuthApiError> {
        require("email", email)?;
        self.post("auth/forgot-password", &dto::ForgotPasswordRequest { email })
            .await?;
        Ok(())
    }

    /// Sets a new password using a reset token
    #[tracing::instrument(err, skip(self, token, password), fields(base_url = %self.base_url))]
    pub async fn reset_password(&self, token: &str, password: &str) -> Result<(), AuthApiError> {
        require("token", token)?;
        validate_password(password)?;
        self.post(
            "auth/reset-password",
            &dto::ResetPasswordRequest { token, password },
        )
        .await?;
        Ok(())
    }

    /// Confirms an account using a verification token
    #[tracing::instrument(err, skip(self, token), fields(base_url = %self.base_url))]
    pub async fn verify_account(&self, token: &str) -> Result<(), AuthApiError> {
        require("token", token)?;
        self.post("auth/verify", &dto::VerifyRequest { token })
            .await?;
        Ok(())
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, AuthApiError> {
        let url = self.endpoint(path)?;
        tracing::trace!(%url, "sending request to authority");

        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(AuthApiError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received response from authority"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let status = resp.status();
            let body = resp.text().await.map_err(AuthApiError::BodyRead)?;
            return Err(AuthApiError::ErrorWithBody {
                source: error,
                status,
                body,
            });
        }

        Ok(resp)
    }
}

#[async_trait]
impl TokenRefresher for AuthApi {
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<IssuedTokens, BoxError> {
        Ok(self.refresh_session(refresh_token).await?.tokens)
    }
}

async fn read_tokens(resp: reqwest::Response) -> Result<SignedIn, AuthApiError> {
    let body = resp.bytes().await.map_err(AuthApiError::BodyRead)?;
    let resp: dto::TokenResponse = serde_json::from_slice(&body)?;

    if resp.token.as_str().is_empty() {
        return Err(AuthApiError::InvalidResponse("empty access token"));
    }
    if resp.refresh_token.as_str().is_empty() {
        return Err(AuthApiError::InvalidResponse("empty refresh token"));
    }

    tracing::info!(
        lifetime = resp.expires_in.0,
        has_username = resp.username.is_some(),
        "received new tokens"
    );

    Ok(SignedIn {
        tokens: IssuedTokens {
            access_token: resp.token,
            refresh_token: resp.refresh_token,
            expires_in: resp.expires_in,
        },
        user: UserInfo {
            username: resp.username,
            email: resp.email,
        },
    })
}

fn require(field: &'static str, value: &str) -> Result<(), AuthApiError> {
    if value.trim().is_empty() {
        Err(AuthApiError::InvalidInput {
            field,
            problem: "is required",
        })
    } else {
        Ok(())
    }
}

fn validate_email(email: &str) -> Result<(), AuthApiError> {
    require("email", email)?;

    let invalid = AuthApiError::InvalidInput {
        field: "email",
        problem: "is not a valid email address",
    };

    if email.chars().any(char::is_whitespace) {
        return Err(invalid);
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(invalid);
    };

    let has_inner_dot = domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len());

    if local.is_empty() || domain.contains('@') || !has_inner_dot {
        return Err(invalid);
    }

    Ok(())
}

fn validate_password(password: &str) -> Result<(), AuthApiError> {
    require("password", password)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthApiError::InvalidInput {
            field: "password",
            problem: "must be at least 6 characters",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::Matcher;
    use serde_json::json;
    use tessera_clock::{DurationMillis, EpochMillis, TestClock};

    use super::*;
    use crate::store::MemoryStore;

    fn api(server: &mockito::Server) -> AuthApi {
        AuthApi::new(
            reqwest::Client::new(),
            reqwest::Url::parse(&format!("{}/api", server.url())).unwrap(),
        )
    }

    mod validation {
        use super::*;

        #[test]
        fn accepts_ordinary_addresses() {
            assert!(validate_email("ada@example.com").is_ok());
            assert!(validate_email("a.b+c@mail.example.org").is_ok());
        }

        #[test]
        fn rejects_malformed_addresses() {
            for email in [
                "",
                "   ",
                "ada",
                "ada@example",
                "@example.com",
                "ada@.com",
                "ada@example.",
                "ada@@example.com",
                "ada lovelace@example.com",
            ] {
                assert!(
                    matches!(
                        validate_email(email),
                        Err(AuthApiError::InvalidInput { field: "email", .. })
                    ),
                    "{email:?} should be rejected"
                );
            }
        }

        #[test]
        fn passwords_need_six_characters() {
            assert!(validate_password("12345").is_err());
            assert!(validate_password("      ").is_err());
            assert!(validate_password("123456").is_ok());
        }

        #[test]
        fn blank_values_are_required() {
            assert!(matches!(
                require("username", " \t"),
                Err(AuthApiError::InvalidInput {
                    field: "username",
                    problem: "is required"
                })
            ));
        }
    }

    #[test]
    fn endpoints_resolve_beneath_the_base_path() {
        let with_slash = AuthApi::new(
            reqwest::Client::new(),
            reqwest::Url::parse("https://api.example.com/v1/").unwrap(),
        );
        let without_slash = AuthApi::new(
            reqwest::Client::new(),
            reqwest::Url::parse("https://api.example.com/v1").unwrap(),
        );

        for api in [with_slash, without_slash] {
            assert_eq!(
                api.endpoint("auth/refresh").unwrap().as_str(),
                "https://api.example.com/v1/auth/refresh"
            );
            assert_eq!(
                api.endpoint("/auth/login").unwrap().as_str(),
                "https://api.example.com/v1/auth/login"
            );
        }
    }

    #[tokio::test]
    async fn refresh_posts_the_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/refresh")
            .match_body(Matcher::Json(json!({ "refreshToken": "def" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"new","refreshToken":"newer","expiresIn":900000}"#)
            .create_async()
            .await;

        let tokens = TokenRefresher::refresh(&api(&server), RefreshTokenRef::from_str("def"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(tokens.access_token.as_str(), "new");
        assert_eq!(tokens.refresh_token.as_str(), "newer");
        assert_eq!(tokens.expires_in, DurationMillis::from_mins(15));
    }

    #[tokio::test]
    async fn refresh_rejects_empty_tokens() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/auth/refresh")
            .with_status(200)
            .with_body(r#"{"token":"","refreshToken":"newer","expiresIn":900000}"#)
            .create_async()
            .await;

        let error = api(&server)
            .refresh_session(RefreshTokenRef::from_str("def"))
            .await
            .unwrap_err();

        assert!(matches!(error, AuthApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn error_statuses_carry_their_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/auth/refresh")
            .with_status(403)
            .with_body("refresh token revoked")
            .create_async()
            .await;

        let error = api(&server)
            .refresh_session(RefreshTokenRef::from_str("def"))
            .await
            .unwrap_err();

        match error {
            AuthApiError::ErrorWithBody { status, body, .. } => {
                assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
                assert_eq!(body, "refresh token revoked");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sign_in_begins_a_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/auth/login")
            .match_body(Matcher::Json(json!({ "username": "ada", "password": "hunter22" })))
            .with_status(200)
            .with_body(
                r#"{"token":"abc","refreshToken":"def","expiresIn":3600000,"username":"ada","email":"ada@example.com"}"#,
            )
            .create_async()
            .await;

        let api = api(&server);
        let store = Arc::new(MemoryStore::new());
        let coordinator = RefreshCoordinator::builder(store.clone(), Arc::new(api.clone()))
            .with_clock(TestClock::new(EpochMillis(1_000)))
            .build();

        let credential = api.sign_in(&coordinator, "ada", "hunter22").await.unwrap();

        assert_eq!(
            credential.expires_at(),
            EpochMillis(1_000) + DurationMillis::from_mins(60)
        );
        assert!(coordinator.status().is_authenticated());
        assert_eq!(
            coordinator.vault().user().await.unwrap(),
            Some(UserInfo {
                username: Some("ada".to_owned()),
                email: Some("ada@example.com".to_owned()),
            })
        );
    }

    #[tokio::test]
    async fn register_sends_a_generated_identifier() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/register")
            .match_body(Matcher::PartialJson(json!({
                "username": "ada",
                "email": "ada@example.com",
                "password": "hunter22",
            })))
            .with_status(201)
            .create_async()
            .await;

        let uuid = api(&server)
            .register("ada", "ada@example.com", "hunter22")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[tokio::test]
    async fn invalid_registration_is_not_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/register")
            .expect(0)
            .create_async()
            .await;

        let error = api(&server)
            .register("ada", "ada@example.com", "short")
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(
            error,
            AuthApiError::InvalidInput {
                field: "password",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn account_recovery_endpoints_post_their_payloads() {
        let mut server = mockito::Server::new_async().await;
        let forgot = server
            .mock("POST", "/api/auth/forgot-password")
            .match_body(Matcher::Json(json!({ "email": "ada@example.com" })))
            .with_status(200)
            .create_async()
            .await;
        let reset = server
            .mock("POST", "/api/auth/reset-password")
            .match_body(Matcher::Json(json!({ "token": "t1", "password": "hunter22" })))
            .with_status(200)
            .create_async()
            .await;
        let verify = server
            .mock("POST", "/api/auth/verify")
            .match_body(Matcher::Json(json!({ "token": "t2" })))
            .with_status(200)
            .create_async()
            .await;

        let api = api(&server);
        api.forgot_password("ada@example.com").await.unwrap();
        api.reset_password("t1", "hunter22").await.unwrap();
        api.verify_account("t2").await.unwrap();

        forgot.assert_async().await;
        reset.assert_async().await;
        verify.assert_async().await;
    }
}
