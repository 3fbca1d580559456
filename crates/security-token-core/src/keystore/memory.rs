//! In-memory keystore.
//!
//! [`MemoryKeystore`] keeps software P-256 keys and certificates in a
//! [`BTreeMap`] keyed by id. Nothing is persisted; everything is lost when the
//! value is dropped. It honours the same contract as the hardware keystore,
//! which makes it the backend of choice for tests.

use std::cell::RefCell;
use std::collections::BTreeMap;

use tracing::debug;

use super::{Curve, IdentityRecord, Keystore, KeystoreError, SoftwareSigner};
use crate::certificate::IdentityCertificate;
use crate::serial::KeyId;

struct Entry {
    signer: SoftwareSigner,
    certificate: Option<IdentityCertificate>,
}

/// Keystore holding software keys in process memory.
#[derive(Default)]
pub struct MemoryKeystore {
    entries: RefCell<BTreeMap<KeyId, Entry>>,
}

impl MemoryKeystore {
    /// Create an empty keystore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of key pairs held, with or without a certificate.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether no key pairs are held.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl Keystore for MemoryKeystore {
    type Signer = SoftwareSigner;

    fn generate_key_pair(&self, id: &KeyId, curve: Curve) -> Result<SoftwareSigner, KeystoreError> {
        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(id) {
            return Err(KeystoreError::KeyPairExists(id.to_serial()));
        }

        let signer = match curve {
            Curve::P256 => SoftwareSigner::generate(),
        };
        entries.insert(
            id.clone(),
            Entry {
                signer: signer.clone(),
                certificate: None,
            },
        );
        debug!(serial = %id, "Generated in-memory key pair");

        Ok(signer)
    }

    fn import_certificate(
        &self,
        id: &KeyId,
        certificate: &IdentityCertificate,
    ) -> Result<(), KeystoreError> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| KeystoreError::KeyPairMissing(id.to_serial()))?;
        entry.certificate = Some(certificate.clone());
        Ok(())
    }

    fn find_key_pair(&self, id: &KeyId) -> Result<Option<SoftwareSigner>, KeystoreError> {
        Ok(self.entries.borrow().get(id).map(|e| e.signer.clone()))
    }

    fn find_certificate(&self, id: &KeyId) -> Result<Option<IdentityCertificate>, KeystoreError> {
        Ok(self
            .entries
            .borrow()
            .get(id)
            .and_then(|e| e.certificate.clone()))
    }

    fn find_all_paired_certificates(
        &self,
    ) -> Result<Vec<IdentityRecord<SoftwareSigner>>, KeystoreError> {
        Ok(self
            .entries
            .borrow()
            .iter()
            .filter_map(|(id, entry)| {
                entry.certificate.as_ref().map(|certificate| IdentityRecord {
                    id: id.clone(),
                    certificate: certificate.clone(),
                    signer: entry.signer.clone(),
                })
            })
            .collect())
    }

    fn delete_certificate(&self, id: &KeyId) -> Result<bool, KeystoreError> {
        Ok(self
            .entries
            .borrow_mut()
            .get_mut(id)
            .and_then(|e| e.certificate.take())
            .is_some())
    }

    fn delete_key_pair(&self, id: &KeyId) -> Result<bool, KeystoreError> {
        Ok(self.entries.borrow_mut().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::build_identity_certificate;

    fn provision(keystore: &MemoryKeystore, provider: &str) -> KeyId {
        let id = KeyId::generate().unwrap();
        let signer = keystore.generate_key_pair(&id, Curve::P256).unwrap();
        let cert = build_identity_certificate(&id, provider, signer).unwrap();
        keystore.import_certificate(&id, &cert).unwrap();
        id
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let keystore = MemoryKeystore::new();
        let id = KeyId::generate().unwrap();
        keystore.generate_key_pair(&id, Curve::P256).unwrap();

        let result = keystore.generate_key_pair(&id, Curve::P256);
        assert!(matches!(result, Err(KeystoreError::KeyPairExists(_))));
    }

    #[test]
    fn test_import_without_key_pair_rejected() {
        let source = MemoryKeystore::new();
        let id = provision(&source, "acme");
        let cert = source.find_certificate(&id).unwrap().unwrap();

        let empty = MemoryKeystore::new();
        let result = empty.import_certificate(&id, &cert);
        assert!(matches!(result, Err(KeystoreError::KeyPairMissing(_))));
    }

    #[test]
    fn test_enumeration_skips_unpaired_keys() {
        let keystore = MemoryKeystore::new();
        let paired = provision(&keystore, "acme");
        keystore
            .generate_key_pair(&KeyId::generate().unwrap(), Curve::P256)
            .unwrap();

        let records = keystore.find_all_paired_certificates().unwrap();
        assert_eq!(keystore.len(), 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, paired);
    }

    #[test]
    fn test_lookups_miss_without_error() {
        let keystore = MemoryKeystore::new();
        let id = KeyId::generate().unwrap();
        assert!(keystore.find_key_pair(&id).unwrap().is_none());
        assert!(keystore.find_certificate(&id).unwrap().is_none());
        assert!(!keystore.delete_certificate(&id).unwrap());
        assert!(!keystore.delete_key_pair(&id).unwrap());
    }

    #[test]
    fn test_delete_certificate_keeps_key_pair() {
        let keystore = MemoryKeystore::new();
        let id = provision(&keystore, "acme");

        assert!(keystore.delete_certificate(&id).unwrap());
        assert!(keystore.find_certificate(&id).unwrap().is_none());
        assert!(keystore.find_key_pair(&id).unwrap().is_some());
        assert!(keystore.find_all_paired_certificates().unwrap().is_empty());
    }
}
