//! Assertion-for-session-token exchange (leg 2).

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use super::AuthError;
use crate::mrn::Mrn;

/// `client_assertion_type` for JWT bearer client authentication (RFC 7523).
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Grant requested from the token endpoint.
pub const GRANT_TYPE: &str = "client_credentials";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// POST the assertion to `token_url` and return the issued session JWT.
///
/// A single request is made; any transport failure, non-2xx status, or
/// response without an `access_token` is an error.
pub(crate) fn exchange(
    http: &Client,
    token_url: &str,
    client_id: &Mrn,
    assertion: &str,
) -> Result<String, AuthError> {
    debug!(url = %token_url, "Exchanging assertion for session token");

    let form = [
        ("grant_type", GRANT_TYPE),
        ("client_id", client_id.as_str()),
        ("client_assertion_type", CLIENT_ASSERTION_TYPE),
        ("client_assertion", assertion),
    ];

    let response = http.post(token_url).form(&form).send()?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(AuthError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body: TokenResponse = response
        .json()
        .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

    body.access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AuthError::MalformedResponse("response has no access_token".to_string()))
}
