//! PKCS#11 hardware keystore.
//!
//! Key pairs are generated on the token as non-extractable P-256 keys and
//! certificates are stored as `CKO_CERTIFICATE` objects. Key pair and
//! certificate share the same `CKA_ID`, which is the identity's [`KeyId`].

use std::sync::{Arc, Mutex, MutexGuard};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, CertificateType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{Curve, IdentityRecord, IdentitySigner, Keystore, KeystoreError, SigningAlgorithm};
use crate::certificate::IdentityCertificate;
use crate::config::Pkcs11Config;
use crate::serial::KeyId;

/// DER-encoded OID of secp256r1, the `CKA_EC_PARAMS` value for P-256.
const SECP256R1_PARAMS: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

/// Length of an uncompressed SEC1 P-256 point.
const P256_POINT_LEN: usize = 65;

type SharedSession = Arc<Mutex<Session>>;

fn lock(session: &SharedSession) -> Result<MutexGuard<'_, Session>, KeystoreError> {
    session.lock().map_err(|_| KeystoreError::SessionPoisoned)
}

/// Keystore backed by a PKCS#11 token.
///
/// One R/W session is opened and logged in by [`Pkcs11Keystore::open`] and
/// released when the keystore is closed or dropped. The session sits behind a
/// mutex only so that [`Pkcs11Signer`] handles are `Send + Sync`; the keystore
/// still serves one caller at a time.
pub struct Pkcs11Keystore {
    session: SharedSession,
    token_label: String,
    logged_in: bool,
    // Declared last so the library is finalised after the session closes.
    _context: Pkcs11,
}

impl Pkcs11Keystore {
    /// Load the module, find the token by label, open a session and log in.
    pub fn open(config: &Pkcs11Config) -> Result<Self, KeystoreError> {
        let context = Pkcs11::new(&config.path).map_err(|e| {
            KeystoreError::module(
                format!("failed to load PKCS#11 module {}", config.path.display()),
                e,
            )
        })?;

        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| KeystoreError::module("failed to initialize PKCS#11 module", e))?;

        let slots = context
            .get_slots_with_token()
            .map_err(|e| KeystoreError::module("failed to list slots", e))?;

        let slot = slots
            .into_iter()
            .find(|slot| {
                context
                    .get_token_info(*slot)
                    .map(|info| info.label().trim() == config.token_label)
                    .unwrap_or(false)
            })
            .ok_or_else(|| KeystoreError::TokenNotFound(config.token_label.clone()))?;

        let session = context
            .open_rw_session(slot)
            .map_err(|e| KeystoreError::module("failed to open session", e))?;

        session
            .login(UserType::User, Some(&AuthPin::new(config.pin.clone())))
            .map_err(|e| KeystoreError::module("failed to log in to token", e))?;

        info!(
            module = %config.path.display(),
            token = %config.token_label,
            "Opened PKCS#11 session"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            token_label: config.token_label.clone(),
            logged_in: true,
            _context: context,
        })
    }

    /// Label of the token this keystore is bound to.
    pub fn token_label(&self) -> &str {
        &self.token_label
    }

    fn signer_for(
        &self,
        session: &Session,
        private_key: ObjectHandle,
        id: &KeyId,
    ) -> Result<Pkcs11Signer, KeystoreError> {
        let public_key = find_object(session, ObjectClass::PUBLIC_KEY, id)?
            .ok_or_else(|| KeystoreError::Malformed(format!("no public key for {}", id)))?;

        Ok(Pkcs11Signer {
            session: Arc::clone(&self.session),
            private_key,
            public_key: read_ec_point(session, public_key)?,
        })
    }
}

impl Drop for Pkcs11Keystore {
    fn drop(&mut self) {
        if !self.logged_in {
            return;
        }
        if let Ok(session) = self.session.lock() {
            if let Err(e) = session.logout() {
                debug!(error = %e, "PKCS#11 logout failed during drop");
            }
        }
    }
}

impl Keystore for Pkcs11Keystore {
    type Signer = Pkcs11Signer;

    fn generate_key_pair(&self, id: &KeyId, curve: Curve) -> Result<Pkcs11Signer, KeystoreError> {
        let session = lock(&self.session)?;

        if find_object(&session, ObjectClass::PRIVATE_KEY, id)?.is_some() {
            return Err(KeystoreError::KeyPairExists(id.to_serial()));
        }

        let ec_params = match curve {
            Curve::P256 => SECP256R1_PARAMS.to_vec(),
        };

        let public_template = [
            Attribute::Token(true),
            Attribute::Id(id.as_bytes().to_vec()),
            Attribute::EcParams(ec_params),
            Attribute::Verify(true),
        ];
        let private_template = [
            Attribute::Token(true),
            Attribute::Id(id.as_bytes().to_vec()),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
        ];

        let (public_key, private_key) = session
            .generate_key_pair(&Mechanism::EccKeyPairGen, &public_template, &private_template)
            .map_err(|e| KeystoreError::module("failed to generate key pair", e))?;

        debug!(serial = %id, "Generated key pair on token");

        Ok(Pkcs11Signer {
            session: Arc::clone(&self.session),
            private_key,
            public_key: read_ec_point(&session, public_key)?,
        })
    }

    fn import_certificate(
        &self,
        id: &KeyId,
        certificate: &IdentityCertificate,
    ) -> Result<(), KeystoreError> {
        let session = lock(&self.session)?;

        if find_object(&session, ObjectClass::PRIVATE_KEY, id)?.is_none() {
            return Err(KeystoreError::KeyPairMissing(id.to_serial()));
        }

        let template = [
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            Attribute::Id(id.as_bytes().to_vec()),
            Attribute::Subject(certificate.subject_der().to_vec()),
            Attribute::Value(certificate.der().to_vec()),
        ];

        session
            .create_object(&template)
            .map_err(|e| KeystoreError::module("failed to import certificate", e))?;

        Ok(())
    }

    fn find_key_pair(&self, id: &KeyId) -> Result<Option<Pkcs11Signer>, KeystoreError> {
        let session = lock(&self.session)?;

        match find_object(&session, ObjectClass::PRIVATE_KEY, id)? {
            Some(private_key) => self.signer_for(&session, private_key, id).map(Some),
            None => Ok(None),
        }
    }

    fn find_certificate(&self, id: &KeyId) -> Result<Option<IdentityCertificate>, KeystoreError> {
        let session = lock(&self.session)?;

        let Some(handle) = find_object(&session, ObjectClass::CERTIFICATE, id)? else {
            return Ok(None);
        };

        let (_, der) = read_id_and_value(&session, handle)?;
        IdentityCertificate::from_der(der)
            .map(Some)
            .map_err(|e| KeystoreError::Malformed(format!("certificate {}: {}", id, e)))
    }

    fn find_all_paired_certificates(
        &self,
    ) -> Result<Vec<IdentityRecord<Pkcs11Signer>>, KeystoreError> {
        let session = lock(&self.session)?;

        let handles = session
            .find_objects(&[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::CertificateType(CertificateType::X_509),
            ])
            .map_err(|e| KeystoreError::module("failed to enumerate certificates", e))?;

        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            let (id, der) = read_id_and_value(&session, handle)?;
            let id = KeyId::new(id);

            let Some(private_key) = find_object(&session, ObjectClass::PRIVATE_KEY, &id)? else {
                continue;
            };

            let certificate = match IdentityCertificate::from_der(der) {
                Ok(certificate) => certificate,
                Err(e) => {
                    warn!(serial = %id, error = %e, "Skipping unreadable certificate on token");
                    continue;
                }
            };

            records.push(IdentityRecord {
                signer: self.signer_for(&session, private_key, &id)?,
                id,
                certificate,
            });
        }

        Ok(records)
    }

    fn delete_certificate(&self, id: &KeyId) -> Result<bool, KeystoreError> {
        let session = lock(&self.session)?;
        destroy_all(&session, ObjectClass::CERTIFICATE, id)
    }

    fn delete_key_pair(&self, id: &KeyId) -> Result<bool, KeystoreError> {
        let session = lock(&self.session)?;
        let removed = destroy_all(&session, ObjectClass::PRIVATE_KEY, id)?;
        destroy_all(&session, ObjectClass::PUBLIC_KEY, id)?;
        Ok(removed)
    }

    fn close(mut self) -> Result<(), KeystoreError> {
        let session = lock(&self.session)?;
        session
            .logout()
            .map_err(|e| KeystoreError::module("failed to log out of token", e))?;
        drop(session);

        self.logged_in = false;
        info!(token = %self.token_label, "Closed PKCS#11 session");
        Ok(())
    }
}

/// Handle on a private key held by a PKCS#11 token.
#[derive(Clone)]
pub struct Pkcs11Signer {
    session: SharedSession,
    private_key: ObjectHandle,
    public_key: Vec<u8>,
}

impl std::fmt::Debug for Pkcs11Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Signer")
            .field("private_key", &self.private_key)
            .finish_non_exhaustive()
    }
}

impl IdentitySigner for Pkcs11Signer {
    fn algorithm(&self) -> SigningAlgorithm {
        SigningAlgorithm::EcdsaP256Sha256
    }

    fn public_key(&self) -> Result<Vec<u8>, KeystoreError> {
        Ok(self.public_key.clone())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        // CKM_ECDSA signs a caller-supplied digest and returns r || s.
        let digest = Sha256::digest(message);
        let session = lock(&self.session)?;
        session
            .sign(&Mechanism::Ecdsa, self.private_key, &digest)
            .map_err(|e| KeystoreError::Signing(e.to_string()))
    }
}

fn find_object(
    session: &Session,
    class: ObjectClass,
    id: &KeyId,
) -> Result<Option<ObjectHandle>, KeystoreError> {
    let template = [Attribute::Class(class), Attribute::Id(id.as_bytes().to_vec())];
    session
        .find_objects(&template)
        .map(|handles| handles.into_iter().next())
        .map_err(|e| KeystoreError::module("failed to find object", e))
}

fn destroy_all(session: &Session, class: ObjectClass, id: &KeyId) -> Result<bool, KeystoreError> {
    let template = [Attribute::Class(class), Attribute::Id(id.as_bytes().to_vec())];
    let handles = session
        .find_objects(&template)
        .map_err(|e| KeystoreError::module("failed to find object", e))?;

    let found = !handles.is_empty();
    for handle in handles {
        session
            .destroy_object(handle)
            .map_err(|e| KeystoreError::module("failed to destroy object", e))?;
    }
    Ok(found)
}

fn read_id_and_value(
    session: &Session,
    handle: ObjectHandle,
) -> Result<(Vec<u8>, Vec<u8>), KeystoreError> {
    let attributes = session
        .get_attributes(handle, &[AttributeType::Id, AttributeType::Value])
        .map_err(|e| KeystoreError::module("failed to read certificate attributes", e))?;

    let mut id = None;
    let mut value = None;
    for attribute in attributes {
        match attribute {
            Attribute::Id(bytes) => id = Some(bytes),
            Attribute::Value(bytes) => value = Some(bytes),
            _ => {}
        }
    }

    match (id, value) {
        (Some(id), Some(value)) => Ok((id, value)),
        _ => Err(KeystoreError::Malformed(
            "certificate object lacks CKA_ID or CKA_VALUE".to_string(),
        )),
    }
}

fn read_ec_point(session: &Session, public_key: ObjectHandle) -> Result<Vec<u8>, KeystoreError> {
    let attributes = session
        .get_attributes(public_key, &[AttributeType::EcPoint])
        .map_err(|e| KeystoreError::module("failed to read public key", e))?;

    attributes
        .into_iter()
        .find_map(|attribute| match attribute {
            Attribute::EcPoint(point) => Some(point),
            _ => None,
        })
        .ok_or_else(|| KeystoreError::Malformed("public key has no CKA_EC_POINT".to_string()))
        .and_then(unwrap_ec_point)
}

/// Strip the DER OCTET STRING that most modules wrap `CKA_EC_POINT` in.
fn unwrap_ec_point(point: Vec<u8>) -> Result<Vec<u8>, KeystoreError> {
    if point.len() == P256_POINT_LEN && point[0] == 0x04 {
        return Ok(point);
    }
    if point.len() == P256_POINT_LEN + 2
        && point[0] == 0x04
        && point[1] as usize == P256_POINT_LEN
        && point[2] == 0x04
    {
        return Ok(point[2..].to_vec());
    }
    Err(KeystoreError::Malformed(format!(
        "unexpected EC point encoding ({} bytes)",
        point.len()
    )))
}
