//! Manetu Resource Names for identity certificates.
//!
//! An MRN has the form `mrn:iam:<organization>:identity:<sha256(der)>`, where
//! the hash is taken over the certificate's exact DER bytes.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::certificate::IdentityCertificate;

/// Identity string derived from a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mrn(String);

impl Mrn {
    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Mrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the MRN of a certificate.
pub fn compute_mrn(certificate: &IdentityCertificate) -> Mrn {
    let digest = Sha256::digest(certificate.der());
    Mrn(format!(
        "mrn:iam:{}:identity:{}",
        certificate.organization(),
        hex::encode(digest)
    ))
}
