use reqwest::{header, Response};
use serde_json::Value;

/// How the API characterized a rejected credential
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthFailure {
    /// The credential was valid but has expired; a refresh may recover
    Expired,
    /// The credential is invalid for any other reason; the session is over
    Malformed,
}

impl AuthFailure {
    /// Classifies a rejection from its stated reason
    ///
    /// Any reason mentioning expiry, in any letter case, is [`Expired`][Self::Expired].
    pub fn classify(reason: &str) -> Self {
        if reason.to_ascii_lowercase().contains("expired") {
            Self::Expired
        } else {
            Self::Malformed
        }
    }
}

/// Extracts the reason the API gave for a `401 Unauthorized` response
///
/// The reason is taken from the JSON body's `error` field, then its `message`
/// field. A body that is not JSON is used verbatim. Failing those, the
/// `WWW-Authenticate` challenge is used.
pub fn rejection_reason(body: &[u8], www_authenticate: Option<&str>) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => {
            let stated = ["error", "message"]
                .iter()
                .find_map(|key| fields.get(*key).and_then(Value::as_str));
            if let Some(stated) = stated {
                return stated.to_owned();
            }
        }
        Ok(_) => {}
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            if !text.trim().is_empty() {
                return text.into_owned();
            }
        }
    }

    www_authenticate.unwrap_or_default().to_owned()
}

/// Reads and classifies a `401` response
///
/// Reading the body consumes the response, so an equivalent response is
/// rebuilt from the buffered body for handing back to the caller.
pub(crate) async fn read_rejection(
    resp: Response,
) -> Result<(Response, AuthFailure, String), reqwest::Error> {
    let status = resp.status();
    let version = resp.version();
    let headers = resp.headers().clone();
    let body = resp.bytes().await?;

    let www_authenticate = headers
        .get(header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok());
    let reason = rejection_reason(&body, www_authenticate);
    let failure = AuthFailure::classify(&reason);

    let mut rebuilt = http::Response::new(body);
    *rebuilt.status_mut() = status;
    *rebuilt.version_mut() = version;
    *rebuilt.headers_mut() = headers;

    Ok((Response::from(rebuilt), failure, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_the_error_field() {
        let reason = rejection_reason(
            br#"{"error":"Token expired","message":"please sign in"}"#,
            Some(r#"Bearer error="invalid_token""#),
        );
        assert_eq!(reason, "Token expired");
    }

    #[test]
    fn falls_back_to_the_message_field() {
        let reason = rejection_reason(br#"{"message":"JWT expired at 12:00"}"#, None);
        assert_eq!(reason, "JWT expired at 12:00");
    }

    #[test]
    fn uses_a_plain_text_body_verbatim() {
        assert_eq!(rejection_reason(b"token has EXPIRED", None), "token has EXPIRED");
    }

    #[test]
    fn falls_back_to_the_challenge_header() {
        let challenge = r#"Bearer error="invalid_token", error_description="The token expired""#;
        assert_eq!(rejection_reason(b"", Some(challenge)), challenge);
        assert_eq!(rejection_reason(br#"{"status":401}"#, Some(challenge)), challenge);
    }

    #[test]
    fn is_empty_when_nothing_is_stated() {
        assert_eq!(rejection_reason(b"", None), "");
    }

    #[test]
    fn expiry_is_recognized_in_any_case() {
        assert_eq!(AuthFailure::classify("Token expired"), AuthFailure::Expired);
        assert_eq!(AuthFailure::classify("EXPIRED"), AuthFailure::Expired);
        assert_eq!(AuthFailure::classify("invalid signature"), AuthFailure::Malformed);
        assert_eq!(AuthFailure::classify(""), AuthFailure::Malformed);
    }

    #[tokio::test]
    async fn rebuilt_response_keeps_status_headers_and_body() {
        let original = http::Response::builder()
            .status(http::StatusCode::UNAUTHORIZED)
            .header(header::WWW_AUTHENTICATE, "Bearer")
            .body(r#"{"error":"Token expired"}"#)
            .unwrap();

        let (resp, failure, reason) = read_rejection(Response::from(original)).await.unwrap();

        assert_eq!(failure, AuthFailure::Expired);
        assert_eq!(reason, "Token expired");
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(resp.text().await.unwrap(), r#"{"error":"Token expired"}"#);
    }
}
