//! Two-leg JWT login against the backend token endpoint.
//!
//! Leg 1 signs a self-asserted JWT naming the certificate's MRN with the
//! identity key. Leg 2 posts it to the token endpoint, which verifies it and
//! answers with a session JWT. Every login runs both legs; nothing is retried
//! or cached.

mod assertion;
mod exchange;

use std::fmt;

use reqwest::blocking::Client;
use thiserror::Error;
use tracing::{debug, info};

use crate::certificate::IdentityCertificate;
use crate::config::BackendConfig;
use crate::keystore::{IdentitySigner, KeystoreError};
use crate::mrn::compute_mrn;

pub use assertion::{
    sign_assertion, AssertionClaims, ClientAssertionClaims, DEFAULT_ASSERTION_LIFETIME_SECS,
};
pub use exchange::{CLIENT_ASSERTION_TYPE, GRANT_TYPE};

/// Errors that can occur during login.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The identity key could not sign the assertion.
    #[error("failed to sign assertion: {0}")]
    Signing(#[from] KeystoreError),

    /// The signer produced an unusable signature.
    #[error("invalid assertion signature: {0}")]
    Signature(String),

    /// Claims or header could not be serialized.
    #[error("failed to encode assertion: {0}")]
    Encoding(serde_json::Error),

    /// The token endpoint could not be reached.
    #[error("token endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The token endpoint answered with a non-success status.
    #[error("token endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The token endpoint answered with an unusable body.
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
}

/// Session JWT issued by the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// Client for the backend token endpoint.
pub struct AuthenticationClient {
    http: Client,
    token_url: String,
    claims: Box<dyn AssertionClaims + Send + Sync>,
}

impl AuthenticationClient {
    /// Create a client for the configured token endpoint using
    /// [`ClientAssertionClaims`].
    pub fn new(backend: &BackendConfig) -> Result<Self, AuthError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            token_url: backend.token_url.clone(),
            claims: Box::new(ClientAssertionClaims::default()),
        })
    }

    /// Replace the assertion claim schema.
    pub fn with_claims(mut self, claims: impl AssertionClaims + Send + Sync + 'static) -> Self {
        self.claims = Box::new(claims);
        self
    }

    /// The token endpoint address.
    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    /// Prove possession of `certificate`'s key and obtain a session token.
    pub fn login<S: IdentitySigner + ?Sized>(
        &self,
        signer: &S,
        certificate: &IdentityCertificate,
    ) -> Result<SessionToken, AuthError> {
        let mrn = compute_mrn(certificate);
        debug!(mrn = %mrn, url = %self.token_url, "Building login assertion");

        let claims = self.claims.claims(&mrn, &self.token_url)?;
        let assertion = sign_assertion(signer, certificate, &claims)?;
        let token = exchange::exchange(&self.http, &self.token_url, &mrn, &assertion)?;

        info!(mrn = %mrn, "Obtained session token");
        Ok(SessionToken(token))
    }
}

impl fmt::Debug for AuthenticationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationClient")
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}
