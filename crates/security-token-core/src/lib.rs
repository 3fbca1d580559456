//! Security Token Core
//!
//! Hardware-backed machine identities:
//! - P-256 key pairs generated inside a PKCS#11 token
//! - self-signed identity certificates and their MRNs
//! - two-leg JWT login against a backend token endpoint
//!
//! [`Core`] ties these together over a [`Keystore`].

pub mod auth;
pub mod certificate;
pub mod config;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod mrn;
pub mod serial;

// Re-export commonly used types
pub use auth::{
    AssertionClaims, AuthError, AuthenticationClient, ClientAssertionClaims, SessionToken,
};
pub use certificate::{export_certificate_pem, IdentityCertificate, TrustPool};
pub use config::{BackendConfig, Config, ConfigError, Pkcs11Config};
pub use error::{Error, Result};
pub use identity::{Core, CredentialSource, DeleteOutcome, IdentitySummary, Token};
pub use keystore::{
    IdentitySigner, Keystore, KeystoreError, MemoryKeystore, Pkcs11Keystore, SigningAlgorithm,
    SoftwareSigner,
};
pub use mrn::{compute_mrn, Mrn};
pub use serial::{hex_decode, hex_encode, KeyId};
