//! Request and response bodies for the API's authentication endpoints

use serde::{Deserialize, Serialize};
use tessera_clock::DurationMillis;

use crate::{AccessToken, RefreshToken, RefreshTokenRef};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshRequest<'a> {
    pub refresh_token: &'a RefreshTokenRef,
}

#[derive(Serialize)]
pub(super) struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
pub(super) struct RegisterRequest<'a> {
    pub uuid: uuid::Uuid,
    pub username: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
pub(super) struct ForgotPasswordRequest<'a> {
    pub email: &'a str,
}

#[derive(Serialize)]
pub(super) struct ResetPasswordRequest<'a> {
    pub token: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
pub(super) struct VerifyRequest<'a> {
    pub token: &'a str,
}

/// Returned by both the login and refresh endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TokenResponse {
    pub token: AccessToken,
    pub refresh_token: RefreshToken,
    pub expires_in: DurationMillis,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}
