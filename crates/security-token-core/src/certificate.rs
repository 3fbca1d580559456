//! Self-signed identity certificates.
//!
//! Uses rcgen to build and sign certificates (through the identity's own
//! [`IdentitySigner`], so hardware keys never leave the token) and x509-parser
//! to read them back and verify them.

use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, RemoteKeyPair, SerialNumber, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384,
};
use thiserror::Error;
use tracing::error;
use x509_parser::prelude::{ASN1Time, FromDer, X509Certificate};

use crate::error::{Error, Result};
use crate::keystore::{IdentitySigner, SigningAlgorithm};
use crate::serial::KeyId;

/// Validity window of an identity certificate, in days.
pub const VALIDITY_DAYS: i64 = 3650;

/// OID arcs of the X.520 `serialNumber` attribute (2.5.4.5).
const SUBJECT_SERIAL_NUMBER: [u64; 4] = [2, 5, 4, 5];

const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

/// Errors that can occur while building or reading a certificate.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("certificate subject has no organization")]
    MissingOrganization,

    #[error("failed to sign certificate: {0}")]
    Sign(String),

    #[error("invalid provider name: {0}")]
    InvalidProvider(String),
}

/// A parsed identity certificate.
///
/// Holds the exact DER bytes plus the fields the rest of the crate reads.
/// Construction guarantees at least one subject organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCertificate {
    der: Vec<u8>,
    subject: Vec<u8>,
    organizations: Vec<String>,
    serial: Vec<u8>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_key: Vec<u8>,
}

impl IdentityCertificate {
    /// Parse a DER-encoded certificate.
    pub fn from_der(der: impl Into<Vec<u8>>) -> std::result::Result<Self, CertificateError> {
        let der = der.into();
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| CertificateError::Parse(format!("{:?}", e)))?;

        let organizations = cert
            .subject()
            .iter_organization()
            .map(|attr| {
                attr.as_str()
                    .map(|s| s.to_string())
                    .map_err(|e| CertificateError::Parse(format!("organization: {:?}", e)))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if organizations.is_empty() {
            return Err(CertificateError::MissingOrganization);
        }

        let validity = cert.validity();
        let not_before = asn1_to_utc(&validity.not_before)?;
        let not_after = asn1_to_utc(&validity.not_after)?;

        Ok(Self {
            subject: cert.subject().as_raw().to_vec(),
            serial: cert.tbs_certificate.serial.to_bytes_be(),
            public_key: cert.public_key().subject_public_key.data.to_vec(),
            organizations,
            not_before,
            not_after,
            der,
        })
    }

    /// Parse a PEM-encoded certificate.
    pub fn from_pem(pem_bytes: &[u8]) -> std::result::Result<Self, CertificateError> {
        let block = pem::parse(pem_bytes).map_err(|e| CertificateError::Parse(e.to_string()))?;
        if block.tag() != CERTIFICATE_PEM_TAG {
            return Err(CertificateError::Parse(format!(
                "expected a '{}' PEM block, found '{}'",
                CERTIFICATE_PEM_TAG,
                block.tag()
            )));
        }
        Self::from_der(block.contents())
    }

    /// Raw DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Raw DER encoding of the subject name.
    pub fn subject_der(&self) -> &[u8] {
        &self.subject
    }

    /// All subject organization entries, in order.
    pub fn organizations(&self) -> &[String] {
        &self.organizations
    }

    /// The first subject organization (the provider).
    pub fn organization(&self) -> &str {
        &self.organizations[0]
    }

    /// Serial number as minimal big-endian bytes.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Subject public key (SEC1 point for EC keys).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Export as a PEM `CERTIFICATE` block.
    pub fn to_pem(&self) -> String {
        export_certificate_pem(self)
    }
}

fn asn1_to_utc(time: &ASN1Time) -> std::result::Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| CertificateError::Parse(format!("timestamp out of range: {}", time)))
}

/// Export a certificate as a PEM `CERTIFICATE` block with `\n` line endings.
pub fn export_certificate_pem(certificate: &IdentityCertificate) -> String {
    pem::encode(&pem::Pem::new(CERTIFICATE_PEM_TAG, certificate.der().to_vec())).replace("\r\n", "\n")
}

/// Adapts an [`IdentitySigner`] to rcgen's remote key interface.
struct RemoteIdentityKey<S> {
    signer: S,
    algorithm: SigningAlgorithm,
    public_key: Vec<u8>,
}

impl<S: IdentitySigner> RemoteKeyPair for RemoteIdentityKey<S> {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, rcgen::Error> {
        let raw = self.signer.sign(msg).map_err(|e| {
            error!(error = %e, "Identity key failed to sign certificate");
            rcgen::Error::RemoteKeyError
        })?;

        // X.509 carries ECDSA signatures DER-encoded.
        let der = match self.algorithm {
            SigningAlgorithm::EcdsaP256Sha256 => p256::ecdsa::Signature::from_slice(&raw)
                .map(|sig| sig.to_der().as_bytes().to_vec()),
            SigningAlgorithm::EcdsaP384Sha384 => p384::ecdsa::Signature::from_slice(&raw)
                .map(|sig| sig.to_der().as_bytes().to_vec()),
        };
        der.map_err(|_| rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self.algorithm {
            SigningAlgorithm::EcdsaP256Sha256 => &PKCS_ECDSA_P256_SHA256,
            SigningAlgorithm::EcdsaP384Sha384 => &PKCS_ECDSA_P384_SHA384,
        }
    }
}

/// Build, self-sign and self-verify an identity certificate.
///
/// The serial number is `id`; the subject carries `provider` as its only
/// organization and the colon-hex id as its serial number attribute. The
/// certificate is valid for [`VALIDITY_DAYS`] from now and is returned only
/// if it verifies against a pool holding nothing but itself.
pub fn build_identity_certificate<S>(
    id: &KeyId,
    provider: &str,
    signer: S,
) -> Result<IdentityCertificate>
where
    S: IdentitySigner + Send + Sync + 'static,
{
    if provider.trim().is_empty() {
        return Err(CertificateError::InvalidProvider("provider must not be empty".to_string()).into());
    }

    let now = time::OffsetDateTime::now_utc();

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from(id.as_bytes().to_vec()));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, provider);
    dn.push(
        DnType::CustomDnType(SUBJECT_SERIAL_NUMBER.to_vec()),
        id.to_serial(),
    );
    params.distinguished_name = dn;

    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::Any];

    let public_key = signer.public_key()?;
    let algorithm = signer.algorithm();
    let key_pair = KeyPair::from_remote(Box::new(RemoteIdentityKey {
        signer,
        algorithm,
        public_key,
    }))
        .map_err(|e| CertificateError::Sign(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertificateError::Sign(e.to_string()))?;

    let certificate = IdentityCertificate::from_der(cert.der().to_vec())?;

    TrustPool::with_root(certificate.clone()).verify(&certificate)?;

    Ok(certificate)
}

/// A set of trusted root certificates.
#[derive(Debug, Clone, Default)]
pub struct TrustPool {
    roots: Vec<IdentityCertificate>,
}

impl TrustPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool trusting a single root.
    pub fn with_root(root: IdentityCertificate) -> Self {
        Self { roots: vec![root] }
    }

    /// Add a trusted root.
    pub fn add(&mut self, root: IdentityCertificate) {
        self.roots.push(root);
    }

    /// Number of trusted roots.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Verify that `certificate` is currently valid and signed by a root in
    /// this pool that may sign certificates.
    pub fn verify(&self, certificate: &IdentityCertificate) -> Result<()> {
        let (_, leaf) = X509Certificate::from_der(certificate.der())
            .map_err(|e| Error::CertificateIntegrity(format!("unparsable certificate: {:?}", e)))?;

        if !leaf.validity().is_valid() {
            return Err(Error::CertificateIntegrity(
                "certificate is outside its validity window".to_string(),
            ));
        }

        for root in &self.roots {
            let Ok((_, issuer)) = X509Certificate::from_der(root.der()) else {
                continue;
            };

            if issuer.subject().as_raw() != leaf.issuer().as_raw() {
                continue;
            }

            let may_sign_certificates = match issuer.key_usage() {
                Ok(Some(usage)) => usage.value.key_cert_sign(),
                Ok(None) => true,
                Err(_) => false,
            };
            if !may_sign_certificates {
                continue;
            }

            if leaf.verify_signature(Some(issuer.public_key())).is_ok() {
                return Ok(());
            }
        }

        Err(Error::CertificateIntegrity(
            "no certificate in the trust pool verifies this certificate".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::SoftwareSigner;

    fn generate(provider: &str) -> (KeyId, IdentityCertificate) {
        let id = KeyId::generate().unwrap();
        let cert = build_identity_certificate(&id, provider, SoftwareSigner::generate()).unwrap();
        (id, cert)
    }

    #[test]
    fn test_certificate_fields() {
        let (id, cert) = generate("acme");

        assert_eq!(cert.organizations(), ["acme".to_string()]);
        assert_eq!(cert.organization(), "acme");

        let expected_serial: Vec<u8> = id.as_bytes().iter().copied().skip_while(|b| *b == 0).collect();
        assert_eq!(cert.serial(), expected_serial.as_slice());

        let window = cert.not_after() - cert.not_before();
        assert_eq!(window.num_days(), VALIDITY_DAYS);
        assert!(cert.not_before() <= Utc::now());
    }

    #[test]
    fn test_certificate_extensions() {
        let (id, cert) = generate("acme");
        let (_, parsed) = X509Certificate::from_der(cert.der()).unwrap();

        let serial_attr = parsed
            .subject()
            .iter_attributes()
            .find(|attr| attr.attr_type().to_id_string() == "2.5.4.5")
            .unwrap();
        assert_eq!(serial_attr.as_str().unwrap(), id.to_serial());

        let constraints = parsed.basic_constraints().unwrap().unwrap();
        assert!(!constraints.value.ca);

        let usage = parsed.key_usage().unwrap().unwrap();
        assert!(usage.value.digital_signature());
        assert!(usage.value.key_cert_sign());

        let eku = parsed.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.any);

        assert_eq!(parsed.subject().as_raw(), parsed.issuer().as_raw());
    }

    #[test]
    fn test_self_verification() {
        let (_, cert) = generate("acme");
        assert!(TrustPool::with_root(cert.clone()).verify(&cert).is_ok());
    }

    #[test]
    fn test_empty_pool_rejects() {
        let (_, cert) = generate("acme");
        let result = TrustPool::new().verify(&cert);
        assert!(matches!(result, Err(Error::CertificateIntegrity(_))));
    }

    #[test]
    fn test_foreign_pool_rejects() {
        let (_, cert) = generate("acme");
        let (_, other) = generate("acme");

        let mut pool = TrustPool::new();
        pool.add(other);
        assert_eq!(pool.len(), 1);

        let result = pool.verify(&cert);
        assert!(matches!(result, Err(Error::CertificateIntegrity(_))));
    }

    #[test]
    fn test_empty_provider_rejected() {
        let id = KeyId::generate().unwrap();
        let result = build_identity_certificate(&id, "  ", SoftwareSigner::generate());
        assert!(matches!(
            result,
            Err(Error::Certificate(CertificateError::InvalidProvider(_)))
        ));
    }

    #[test]
    fn test_pem_export_round_trip() {
        let (_, cert) = generate("acme");
        let pem = export_certificate_pem(&cert);

        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));
        assert!(!pem.contains('\r'));

        let parsed = IdentityCertificate::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(parsed.der(), cert.der());
    }

    #[test]
    fn test_missing_organization_rejected() {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "no-org");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let result = IdentityCertificate::from_der(cert.der().to_vec());
        assert!(matches!(result, Err(CertificateError::MissingOrganization)));
    }

    #[test]
    fn test_p384_identity_self_verifies() {
        let generated = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let signer = SoftwareSigner::from_pkcs8_pem(generated.serialize_pem().as_bytes()).unwrap();
        let id = KeyId::generate().unwrap();

        let cert = build_identity_certificate(&id, "acme", signer).unwrap();
        assert_eq!(cert.public_key(), generated.public_key_raw());
        assert!(TrustPool::with_root(cert.clone()).verify(&cert).is_ok());
    }
}
