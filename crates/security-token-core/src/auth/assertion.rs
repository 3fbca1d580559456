//! Self-asserted JWT construction (leg 1).
//!
//! The assertion is an ECDSA JWS (ES256 or ES384, following the key's curve)
//! signed by the identity key. Its header embeds
//! the identity certificate (`x5c`) so the backend can check the signature and
//! recompute the MRN. The claim set is supplied by an [`AssertionClaims`]
//! implementation.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::AuthError;
use crate::certificate::IdentityCertificate;
use crate::keystore::IdentitySigner;
use crate::mrn::Mrn;

/// Default assertion lifetime in seconds.
pub const DEFAULT_ASSERTION_LIFETIME_SECS: i64 = 300;

/// Produces the claim set of an assertion JWT.
pub trait AssertionClaims {
    /// Claims asserting `subject` to the token endpoint at `audience`.
    fn claims(&self, subject: &Mrn, audience: &str) -> Result<Value, AuthError>;
}

/// OAuth 2.0 JWT client assertion claims (RFC 7523).
///
/// `iss` and `sub` are the MRN, `aud` is the token URL, and every assertion
/// carries a fresh `jti`.
#[derive(Debug, Clone)]
pub struct ClientAssertionClaims {
    lifetime: Duration,
}

impl ClientAssertionClaims {
    /// Claims valid for `lifetime` after issue.
    pub fn new(lifetime: Duration) -> Self {
        Self { lifetime }
    }
}

impl Default for ClientAssertionClaims {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_ASSERTION_LIFETIME_SECS))
    }
}

#[derive(Serialize)]
struct ClientAssertion<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    jti: String,
    iat: i64,
    exp: i64,
}

impl AssertionClaims for ClientAssertionClaims {
    fn claims(&self, subject: &Mrn, audience: &str) -> Result<Value, AuthError> {
        let issued_at = Utc::now();
        let claims = ClientAssertion {
            iss: subject.as_str(),
            sub: subject.as_str(),
            aud: audience,
            jti: Uuid::new_v4().to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.lifetime).timestamp(),
        };
        serde_json::to_value(claims).map_err(AuthError::Encoding)
    }
}

#[derive(Serialize)]
struct Header<'a> {
    alg: &'a str,
    typ: &'a str,
    x5c: [String; 1],
}

/// Sign `claims` into a compact JWS with `certificate` in `x5c`.
///
/// The `alg` header follows the signer's curve.
pub fn sign_assertion<S: IdentitySigner + ?Sized>(
    signer: &S,
    certificate: &IdentityCertificate,
    claims: &Value,
) -> Result<String, AuthError> {
    let algorithm = signer.algorithm();
    let header = Header {
        alg: algorithm.jws_name(),
        typ: "JWT",
        x5c: [STANDARD.encode(certificate.der())],
    };

    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).map_err(AuthError::Encoding)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(AuthError::Encoding)?);
    let signing_input = format!("{}.{}", header, payload);

    let signature = signer.sign(signing_input.as_bytes())?;
    if signature.len() != algorithm.signature_len() {
        return Err(AuthError::Signature(format!(
            "expected a {}-byte {} signature, got {} bytes",
            algorithm.signature_len(),
            algorithm.jws_name(),
            signature.len()
        )));
    }

    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
}
