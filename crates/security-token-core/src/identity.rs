//! Identity lifecycle and login over a keystore.
//!
//! [`Core`] owns one keystore handle and one authentication client for its
//! whole lifetime. Every operation blocks until the keystore or the token
//! endpoint answers.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::auth::{AuthenticationClient, SessionToken};
use crate::certificate::{build_identity_certificate, export_certificate_pem, IdentityCertificate};
use crate::config::{BackendConfig, Config};
use crate::error::{Error, Result};
use crate::keystore::{
    Curve, IdentityRecord, IdentitySigner, Keystore, Pkcs11Keystore, SoftwareSigner,
};
use crate::mrn::{compute_mrn, Mrn};
use crate::serial::KeyId;

/// A signer paired with the certificate stored under the same id.
#[derive(Debug, Clone)]
pub struct Token<S> {
    pub id: KeyId,
    pub certificate: IdentityCertificate,
    pub signer: S,
}

impl<S> Token<S> {
    /// Colon-hex serial number of this identity.
    pub fn serial(&self) -> String {
        self.id.to_serial()
    }

    /// MRN of this identity's certificate.
    pub fn mrn(&self) -> Mrn {
        compute_mrn(&self.certificate)
    }
}

impl<S> From<IdentityRecord<S>> for Token<S> {
    fn from(record: IdentityRecord<S>) -> Self {
        Self {
            id: record.id,
            certificate: record.certificate,
            signer: record.signer,
        }
    }
}

/// How software credentials are passed to [`Core::login_x509`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// The arguments are PEM text.
    Inline,
    /// The arguments are paths to PEM files.
    Path,
}

/// One row of [`Core::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySummary {
    /// Colon-hex serial number.
    pub serial: String,
    /// Subject organizations joined with `,`.
    pub providers: String,
    /// Certificate NotBefore.
    pub created: DateTime<Utc>,
}

/// Result of [`Core::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub certificate_removed: bool,
    pub key_pair_removed: bool,
}

/// Machine identity operations bound to one keystore session.
pub struct Core<K: Keystore> {
    keystore: K,
    backend: BackendConfig,
    auth: AuthenticationClient,
}

impl Core<Pkcs11Keystore> {
    /// Open the configured PKCS#11 token and prepare the login client.
    pub fn open(config: &Config) -> Result<Self> {
        let keystore = Pkcs11Keystore::open(&config.pkcs11)?;
        Self::with_keystore(keystore, config.backend.clone())
    }
}

impl<K: Keystore> Core<K> {
    /// Build a core over an already opened keystore.
    pub fn with_keystore(keystore: K, backend: BackendConfig) -> Result<Self> {
        let auth = AuthenticationClient::new(&backend)?;
        Ok(Self {
            keystore,
            backend,
            auth,
        })
    }

    /// Replace the login client, e.g. to change the assertion claims.
    pub fn with_auth(mut self, auth: AuthenticationClient) -> Self {
        self.auth = auth;
        self
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn keystore(&self) -> &K {
        &self.keystore
    }

    /// Provision a new identity for `provider`.
    ///
    /// Draws a fresh id, generates a key pair under it, builds and
    /// self-verifies the certificate, then imports it. If a step after key
    /// generation fails, the key pair is left in the keystore without a
    /// certificate; it is not listed and must be removed with
    /// [`Core::delete`] using the serial from the log.
    pub fn generate(&self, provider: &str) -> Result<Token<K::Signer>> {
        let id = KeyId::generate()?;
        let signer = self.keystore.generate_key_pair(&id, Curve::P256)?;
        debug!(serial = %id, "Generated key pair");

        let certificate =
            build_identity_certificate(&id, provider, signer.clone()).map_err(|e| {
                warn!(serial = %id, error = %e, "Certificate issue failed; key pair left orphaned");
                e
            })?;

        self.keystore
            .import_certificate(&id, &certificate)
            .map_err(|e| {
                warn!(serial = %id, error = %e, "Certificate import failed; key pair left orphaned");
                e
            })?;

        info!(serial = %id, provider = %provider, "Provisioned identity");
        Ok(Token {
            id,
            certificate,
            signer,
        })
    }

    /// Summaries of every provisioned identity, oldest first.
    pub fn list(&self) -> Result<Vec<IdentitySummary>> {
        let mut records = self.keystore.find_all_paired_certificates()?;
        sort_by_issue(&mut records);

        Ok(records
            .into_iter()
            .map(|record| IdentitySummary {
                serial: record.id.to_serial(),
                providers: record.certificate.organizations().join(","),
                created: record.certificate.not_before(),
            })
            .collect())
    }

    /// PEM of the identity `serial`, or of the default identity.
    pub fn show(&self, serial: Option<&str>) -> Result<String> {
        let token = self.get_token(serial)?;
        Ok(export_certificate_pem(&token.certificate))
    }

    /// Remove the certificate and then the key pair of `serial`.
    ///
    /// A key pair that is already gone is reported with a warning and in the
    /// returned outcome, not as an error.
    pub fn delete(&self, serial: &str) -> Result<DeleteOutcome> {
        let id = KeyId::parse(serial)?;

        let certificate_removed = self.keystore.delete_certificate(&id)?;

        if self.keystore.find_key_pair(&id)?.is_none() {
            warn!(serial = %id, "Key pair not found; nothing else to delete");
            return Ok(DeleteOutcome {
                certificate_removed,
                key_pair_removed: false,
            });
        }

        let key_pair_removed = self.keystore.delete_key_pair(&id)?;
        info!(serial = %id, "Deleted identity");

        Ok(DeleteOutcome {
            certificate_removed,
            key_pair_removed,
        })
    }

    /// Resolve the identity `serial`.
    ///
    /// Without a serial (or with an empty one) the identity with the
    /// earliest NotBefore is chosen, ties broken by ascending id.
    pub fn get_token(&self, serial: Option<&str>) -> Result<Token<K::Signer>> {
        let serial = serial.map(str::trim).filter(|s| !s.is_empty());

        let Some(serial) = serial else {
            let mut records = self.keystore.find_all_paired_certificates()?;
            sort_by_issue(&mut records);
            let record = records.into_iter().next().ok_or(Error::NoTokensFound)?;
            debug!(serial = %record.id, "Selected default identity");
            return Ok(record.into());
        };

        let id = KeyId::parse(serial)?;

        let signer = self
            .keystore
            .find_key_pair(&id)?
            .ok_or_else(|| Error::InvalidSerial(serial.to_string()))?;

        let certificate = self
            .keystore
            .find_certificate(&id)?
            .ok_or_else(|| Error::CertificateNotFound(serial.to_string()))?;

        Ok(Token {
            id,
            certificate,
            signer,
        })
    }

    /// Run the login exchange with an already resolved signer and certificate.
    pub fn login<S: IdentitySigner + ?Sized>(
        &self,
        signer: &S,
        certificate: &IdentityCertificate,
    ) -> Result<SessionToken> {
        Ok(self.auth.login(signer, certificate)?)
    }

    /// Log in with an identity held in the keystore.
    pub fn login_keystore(&self, serial: Option<&str>) -> Result<SessionToken> {
        let token = self.get_token(serial)?;
        info!(serial = %token.id, "Logging in with keystore identity");
        self.login(&token.signer, &token.certificate)
    }

    /// Log in with a PKCS#8 EC private key (P-256 or P-384) and its
    /// certificate.
    ///
    /// `key` and `cert` are PEM text or file paths depending on `source`.
    /// All decoding and the key/certificate match check happen before any
    /// network traffic.
    pub fn login_x509(
        &self,
        key: &str,
        cert: &str,
        source: CredentialSource,
    ) -> Result<SessionToken> {
        let (key_pem, cert_pem) = match source {
            CredentialSource::Inline => (key.as_bytes().to_vec(), cert.as_bytes().to_vec()),
            CredentialSource::Path => (
                read_credential(Path::new(key))?,
                read_credential(Path::new(cert))?,
            ),
        };

        let signer = SoftwareSigner::from_pkcs8_pem(&key_pem)?;
        let certificate = IdentityCertificate::from_pem(&cert_pem)
            .map_err(|e| Error::InvalidCredential(format!("certificate: {}", e)))?;

        if !signer.matches_public_key(certificate.public_key()) {
            return Err(Error::KeyMismatch);
        }

        info!("Logging in with supplied credentials");
        self.login(&signer, &certificate)
    }

    /// Release the keystore.
    pub fn close(self) -> Result<()> {
        self.keystore.close()?;
        Ok(())
    }
}

impl<K: Keystore> std::fmt::Debug for Core<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

fn sort_by_issue<S>(records: &mut [IdentityRecord<S>]) {
    records.sort_by(|a, b| {
        a.certificate
            .not_before()
            .cmp(&b.certificate.not_before())
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn read_credential(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}
