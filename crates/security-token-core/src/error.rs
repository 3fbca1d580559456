//! Crate-level errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;
use crate::certificate::CertificateError;
use crate::keystore::KeystoreError;

/// Errors returned by identity lifecycle and login operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The keystore module rejected an operation or could not be reached.
    #[error("keystore error: {0}")]
    Backend(#[from] KeystoreError),

    /// No identity is provisioned in the keystore.
    #[error("no security-tokens found")]
    NoTokensFound,

    /// No key pair exists for the requested serial number.
    #[error("invalid serial number: {0}")]
    InvalidSerial(String),

    /// The key pair exists but its certificate does not.
    #[error("certificate not found for serial {0}")]
    CertificateNotFound(String),

    /// The serial number is not colon-separated hex.
    #[error("malformed serial number: {0}")]
    MalformedSerial(String),

    /// The secure random source could not produce a key id.
    #[error("failed to draw random key id: {0}")]
    Randomness(String),

    /// A freshly issued certificate failed self-verification.
    #[error("certificate failed self-verification: {0}")]
    CertificateIntegrity(String),

    /// The supplied private key is not a P-256 or P-384 elliptic-curve key.
    #[error("unsupported private key: {0}")]
    UnsupportedKeyAlgorithm(String),

    /// The login exchange failed.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// The certificate could not be built or parsed.
    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Supplied key material could not be decoded.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The supplied private key does not belong to the supplied certificate.
    #[error("private key does not match the certificate public key")]
    KeyMismatch,

    /// A credential file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether this error means the requested identity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NoTokensFound | Error::InvalidSerial(_) | Error::CertificateNotFound(_)
        )
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
