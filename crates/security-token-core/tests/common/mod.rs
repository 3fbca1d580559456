//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use axum::extract::{Form, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::Verifier;
use serde_json::Value;
use tokio::sync::oneshot;

use security_token_core::keystore::{Curve, IdentityRecord};
use security_token_core::{
    BackendConfig, Core, IdentityCertificate, IdentitySigner, KeyId, Keystore, KeystoreError,
    MemoryKeystore, SigningAlgorithm, SoftwareSigner,
};

pub const TOKEN_PATH: &str = "/oauth/token";

/// Address nothing listens on.
pub const UNREACHABLE_URL: &str = "http://127.0.0.1:9/oauth/token";

#[derive(Clone)]
struct EndpointState {
    status: StatusCode,
    body: String,
    requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

/// A token endpoint answering every POST with a fixed reply.
pub struct MockTokenEndpoint {
    pub url: String,
    requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockTokenEndpoint {
    /// Endpoint issuing `access_token` with HTTP 200.
    pub fn issuing(access_token: &str) -> Self {
        let body = serde_json::json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": 3600,
        });
        Self::start(StatusCode::OK, body.to_string())
    }

    /// Endpoint answering with `status` and `body`.
    pub fn start(status: StatusCode, body: String) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = EndpointState {
            status,
            body,
            requests: Arc::clone(&requests),
        };

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = oneshot::channel::<()>();

        let handle = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async move {
                let app = Router::new()
                    .route(TOKEN_PATH, post(token_handler))
                    .with_state(state);
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = rx.await;
                    })
                    .await
                    .unwrap();
            });
        });

        Self {
            url: format!("http://{}{}", addr, TOKEN_PATH),
            requests,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    /// Form bodies received so far.
    pub fn requests(&self) -> Vec<HashMap<String, String>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Drop for MockTokenEndpoint {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

async fn token_handler(
    State(state): State<EndpointState>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    state.requests.lock().unwrap().push(form);
    (
        state.status,
        [(header::CONTENT_TYPE, "application/json")],
        state.body.clone(),
    )
}

/// Core over an empty in-memory keystore.
pub fn memory_core(token_url: &str) -> Core<MemoryKeystore> {
    Core::with_keystore(
        MemoryKeystore::new(),
        BackendConfig {
            token_url: token_url.to_string(),
        },
    )
    .unwrap()
}

/// Decode a compact JWS and check its signature against `certificate`.
/// Returns the decoded header and claims.
pub fn verify_assertion(jwt: &str, certificate: &IdentityCertificate) -> (Value, Value) {
    let parts: Vec<&str> = jwt.split('.').collect();
    assert_eq!(parts.len(), 3, "assertion is not a compact JWS");

    let header: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
    let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();

    let signature = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let verified = match header["alg"].as_str() {
        Some("ES256") => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(certificate.public_key()).unwrap();
            let signature = p256::ecdsa::Signature::from_slice(&signature).unwrap();
            key.verify(signing_input.as_bytes(), &signature)
        }
        Some("ES384") => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(certificate.public_key()).unwrap();
            let signature = p384::ecdsa::Signature::from_slice(&signature).unwrap();
            key.verify(signing_input.as_bytes(), &signature)
        }
        other => panic!("unexpected alg: {other:?}"),
    };
    verified.expect("assertion signature does not verify");

    (header, claims)
}

/// Keystore that fails the test if it is ever touched.
pub struct UntouchableKeystore;

impl Keystore for UntouchableKeystore {
    type Signer = SoftwareSigner;

    fn generate_key_pair(&self, _: &KeyId, _: Curve) -> Result<SoftwareSigner, KeystoreError> {
        panic!("keystore called: generate_key_pair")
    }

    fn import_certificate(&self, _: &KeyId, _: &IdentityCertificate) -> Result<(), KeystoreError> {
        panic!("keystore called: import_certificate")
    }

    fn find_key_pair(&self, _: &KeyId) -> Result<Option<SoftwareSigner>, KeystoreError> {
        panic!("keystore called: find_key_pair")
    }

    fn find_certificate(&self, _: &KeyId) -> Result<Option<IdentityCertificate>, KeystoreError> {
        panic!("keystore called: find_certificate")
    }

    fn find_all_paired_certificates(
        &self,
    ) -> Result<Vec<IdentityRecord<SoftwareSigner>>, KeystoreError> {
        panic!("keystore called: find_all_paired_certificates")
    }

    fn delete_certificate(&self, _: &KeyId) -> Result<bool, KeystoreError> {
        panic!("keystore called: delete_certificate")
    }

    fn delete_key_pair(&self, _: &KeyId) -> Result<bool, KeystoreError> {
        panic!("keystore called: delete_key_pair")
    }
}

/// Signer that signs a different message than the one it is handed.
#[derive(Clone)]
pub struct MisdirectedSigner(SoftwareSigner);

impl IdentitySigner for MisdirectedSigner {
    fn algorithm(&self) -> SigningAlgorithm {
        self.0.algorithm()
    }

    fn public_key(&self) -> Result<Vec<u8>, KeystoreError> {
        self.0.public_key()
    }

    fn sign(&self, _message: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        self.0.sign(b"some other message")
    }
}

/// Memory keystore whose signers produce signatures that never verify.
/// Counts certificate imports.
#[derive(Default)]
pub struct MisdirectedKeystore {
    pub inner: MemoryKeystore,
    pub imports: Cell<usize>,
}

impl Keystore for MisdirectedKeystore {
    type Signer = MisdirectedSigner;

    fn generate_key_pair(
        &self,
        id: &KeyId,
        curve: Curve,
    ) -> Result<MisdirectedSigner, KeystoreError> {
        self.inner.generate_key_pair(id, curve).map(MisdirectedSigner)
    }

    fn import_certificate(
        &self,
        id: &KeyId,
        cert: &IdentityCertificate,
    ) -> Result<(), KeystoreError> {
        self.imports.set(self.imports.get() + 1);
        self.inner.import_certificate(id, cert)
    }

    fn find_key_pair(&self, id: &KeyId) -> Result<Option<MisdirectedSigner>, KeystoreError> {
        Ok(self.inner.find_key_pair(id)?.map(MisdirectedSigner))
    }

    fn find_certificate(&self, id: &KeyId) -> Result<Option<IdentityCertificate>, KeystoreError> {
        self.inner.find_certificate(id)
    }

    fn find_all_paired_certificates(
        &self,
    ) -> Result<Vec<IdentityRecord<MisdirectedSigner>>, KeystoreError> {
        Ok(self
            .inner
            .find_all_paired_certificates()?
            .into_iter()
            .map(|record| IdentityRecord {
                id: record.id,
                certificate: record.certificate,
                signer: MisdirectedSigner(record.signer),
            })
            .collect())
    }

    fn delete_certificate(&self, id: &KeyId) -> Result<bool, KeystoreError> {
        self.inner.delete_certificate(id)
    }

    fn delete_key_pair(&self, id: &KeyId) -> Result<bool, KeystoreError> {
        self.inner.delete_key_pair(id)
    }
}
