//! Software ECDSA signer.

use p256::ecdsa::signature::Signer;
use p256::pkcs8::{DecodePrivateKey, ObjectIdentifier, PrivateKeyInfo};
use rand::rngs::OsRng;

use super::{IdentitySigner, KeystoreError, SigningAlgorithm};
use crate::error::{Error, Result};

/// id-ecPublicKey (RFC 5480).
const EC_PUBLIC_KEY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// secp256r1 / prime256v1.
const SECP256R1_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");

/// secp384r1.
const SECP384R1_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

const PKCS8_PEM_TAG: &str = "PRIVATE KEY";

#[derive(Clone)]
enum EcKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

/// Signer backed by an EC private key in process memory.
///
/// P-256 and P-384 keys are supported.
#[derive(Clone)]
pub struct SoftwareSigner {
    key: EcKey,
}

impl SoftwareSigner {
    /// Generate a fresh random P-256 key.
    pub fn generate() -> Self {
        Self {
            key: EcKey::P256(p256::ecdsa::SigningKey::random(&mut OsRng)),
        }
    }

    /// Load a PEM-encoded PKCS#8 private key.
    pub fn from_pkcs8_pem(pem_bytes: &[u8]) -> Result<Self> {
        let block = pem::parse(pem_bytes)
            .map_err(|e| Error::InvalidCredential(format!("failed to decode private key PEM: {}", e)))?;

        if block.tag() != PKCS8_PEM_TAG {
            return Err(Error::InvalidCredential(format!(
                "expected a '{}' PEM block, found '{}'",
                PKCS8_PEM_TAG,
                block.tag()
            )));
        }

        Self::from_pkcs8_der(block.contents())
    }

    /// Load a DER-encoded PKCS#8 private key.
    ///
    /// Non-EC keys and EC keys on curves other than P-256 and P-384 are
    /// rejected with [`Error::UnsupportedKeyAlgorithm`].
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let info = PrivateKeyInfo::try_from(der)
            .map_err(|e| Error::InvalidCredential(format!("not a PKCS#8 private key: {}", e)))?;

        if info.algorithm.oid != EC_PUBLIC_KEY_OID {
            return Err(Error::UnsupportedKeyAlgorithm(format!(
                "algorithm {} is not an elliptic-curve key",
                info.algorithm.oid
            )));
        }

        let curve = info
            .algorithm
            .parameters_oid()
            .map_err(|e| Error::InvalidCredential(format!("missing EC curve parameters: {}", e)))?;

        let invalid = |e: p256::pkcs8::Error| {
            Error::InvalidCredential(format!("invalid EC private key: {}", e))
        };

        let key = if curve == SECP256R1_OID {
            EcKey::P256(p256::ecdsa::SigningKey::from_pkcs8_der(der).map_err(invalid)?)
        } else if curve == SECP384R1_OID {
            EcKey::P384(p384::ecdsa::SigningKey::from_pkcs8_der(der).map_err(invalid)?)
        } else {
            return Err(Error::UnsupportedKeyAlgorithm(format!(
                "EC curve {} is not supported",
                curve
            )));
        };

        Ok(Self { key })
    }

    /// Whether `public_key` (a SEC1 point, compressed or not) is this key's
    /// public half.
    pub fn matches_public_key(&self, public_key: &[u8]) -> bool {
        match &self.key {
            EcKey::P256(key) => p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map(|other| other == *key.verifying_key())
                .unwrap_or(false),
            EcKey::P384(key) => p384::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map(|other| other == *key.verifying_key())
                .unwrap_or(false),
        }
    }
}

impl std::fmt::Debug for SoftwareSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareSigner")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

impl IdentitySigner for SoftwareSigner {
    fn algorithm(&self) -> SigningAlgorithm {
        match self.key {
            EcKey::P256(_) => SigningAlgorithm::EcdsaP256Sha256,
            EcKey::P384(_) => SigningAlgorithm::EcdsaP384Sha384,
        }
    }

    fn public_key(&self) -> std::result::Result<Vec<u8>, KeystoreError> {
        let point = match &self.key {
            EcKey::P256(key) => key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
            EcKey::P384(key) => key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
        };
        Ok(point)
    }

    fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, KeystoreError> {
        let signing_failed = |e: p256::ecdsa::Error| KeystoreError::Signing(e.to_string());
        let signature = match &self.key {
            EcKey::P256(key) => {
                let signature: p256::ecdsa::Signature =
                    key.try_sign(message).map_err(signing_failed)?;
                signature.to_bytes().to_vec()
            }
            EcKey::P384(key) => {
                let signature: p384::ecdsa::Signature =
                    key.try_sign(message).map_err(signing_failed)?;
                signature.to_bytes().to_vec()
            }
        };
        Ok(signature)
    }
}
