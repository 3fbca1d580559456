//! Keystore abstraction over identity key pairs and their certificates.
//!
//! A keystore holds P-256 key pairs and self-signed certificates, both
//! addressed by the same [`KeyId`]. Two realizations exist:
//!
//! - [`Pkcs11Keystore`]: a hardware module reached through PKCS#11. Private
//!   keys never leave the device; only signatures are observed.
//! - [`MemoryKeystore`]: software keys held in process memory, for tests and
//!   development.
//!
//! Signing is exposed through the [`IdentitySigner`] capability so callers
//! never care where a key lives. [`SoftwareSigner`] also serves the login path
//! that takes caller-supplied PEM material.

mod memory;
mod pkcs11;
mod software;

use thiserror::Error;

use crate::certificate::IdentityCertificate;
use crate::serial::KeyId;

pub use memory::MemoryKeystore;
pub use pkcs11::{Pkcs11Keystore, Pkcs11Signer};
pub use software::SoftwareSigner;


/// Errors reported by a keystore backend.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// The module rejected a call or could not be reached.
    #[error("{context}: {message}")]
    Module { context: String, message: String },

    /// No slot carries a token with the configured label.
    #[error("no token labelled '{0}' found")]
    TokenNotFound(String),

    /// A key pair with this id is already provisioned.
    #[error("key pair {0} already exists")]
    KeyPairExists(String),

    /// No key pair exists for this id.
    #[error("no key pair for {0}")]
    KeyPairMissing(String),

    /// The signing operation failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// An object in the keystore could not be interpreted.
    #[error("malformed keystore object: {0}")]
    Malformed(String),

    /// The session lock was poisoned by a panicking holder.
    #[error("keystore session is poisoned")]
    SessionPoisoned,
}

impl KeystoreError {
    pub(crate) fn module(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Module {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

/// Elliptic curves a keystore can generate identity keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Curve {
    /// NIST P-256 (secp256r1).
    #[default]
    P256,
}

/// ECDSA schemes an identity key signs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// P-256 with SHA-256.
    EcdsaP256Sha256,
    /// P-384 with SHA-384.
    EcdsaP384Sha384,
}

impl SigningAlgorithm {
    /// JWS `alg` name.
    pub fn jws_name(self) -> &'static str {
        match self {
            Self::EcdsaP256Sha256 => "ES256",
            Self::EcdsaP384Sha384 => "ES384",
        }
    }

    /// Length of a fixed-width `r || s` signature.
    pub fn signature_len(self) -> usize {
        match self {
            Self::EcdsaP256Sha256 => 64,
            Self::EcdsaP384Sha384 => 96,
        }
    }
}

/// Signing capability of an identity private key.
pub trait IdentitySigner {
    /// Scheme used by [`IdentitySigner::sign`].
    fn algorithm(&self) -> SigningAlgorithm;

    /// SEC1 uncompressed public key point.
    fn public_key(&self) -> Result<Vec<u8>, KeystoreError>;

    /// ECDSA signature over `message`, hashed as [`IdentitySigner::algorithm`]
    /// requires, as fixed-width `r || s`.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeystoreError>;
}

impl<S: IdentitySigner + ?Sized> IdentitySigner for &S {
    fn algorithm(&self) -> SigningAlgorithm {
        (**self).algorithm()
    }

    fn public_key(&self) -> Result<Vec<u8>, KeystoreError> {
        (**self).public_key()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        (**self).sign(message)
    }
}

/// A provisioned identity: certificate plus a handle on its key pair.
#[derive(Debug, Clone)]
pub struct IdentityRecord<S> {
    /// Id shared by the key pair and certificate.
    pub id: KeyId,
    /// The stored certificate.
    pub certificate: IdentityCertificate,
    /// Handle on the matching private key.
    pub signer: S,
}

/// Storage and lookup of identity key pairs and certificates.
///
/// Lookups that miss return `Ok(None)`; errors are reserved for module
/// failures. Implementations perform no locking beyond what their own
/// handles need, so one keystore serves one logical caller at a time.
pub trait Keystore {
    /// Handle on a private key held by this keystore.
    type Signer: IdentitySigner + Clone + Send + Sync + 'static;

    /// Generate a new key pair under `id`. Fails if `id` is already in use.
    fn generate_key_pair(&self, id: &KeyId, curve: Curve) -> Result<Self::Signer, KeystoreError>;

    /// Store `certificate` under the id of an existing key pair.
    fn import_certificate(
        &self,
        id: &KeyId,
        certificate: &IdentityCertificate,
    ) -> Result<(), KeystoreError>;

    /// Look up the key pair for `id`.
    fn find_key_pair(&self, id: &KeyId) -> Result<Option<Self::Signer>, KeystoreError>;

    /// Look up the certificate for `id`.
    fn find_certificate(&self, id: &KeyId) -> Result<Option<IdentityCertificate>, KeystoreError>;

    /// Every certificate that has a matching key pair, collected eagerly.
    fn find_all_paired_certificates(
        &self,
    ) -> Result<Vec<IdentityRecord<Self::Signer>>, KeystoreError>;

    /// Remove the certificate for `id`. Returns whether one was removed.
    fn delete_certificate(&self, id: &KeyId) -> Result<bool, KeystoreError>;

    /// Remove the key pair for `id`. Returns whether one was removed.
    fn delete_key_pair(&self, id: &KeyId) -> Result<bool, KeystoreError>;

    /// Release the keystore. Dropping it releases it as well.
    fn close(self) -> Result<(), KeystoreError>
    where
        Self: Sized,
    {
        Ok(())
    }
}
