//! Hardware-delegated signing
//!
//! The private half of the app key never leaves the signing gateway (a TPM
//! plugin behind a local socket in production). [`DelegatedSigner`] only
//! chooses the hash and padding parameters, forwards the digest, and returns
//! whatever signature bytes the gateway produced. Checking that signature is
//! left to whoever consumes it.

use crate::errors::{AttestError, AttestResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// PSS salt length sentinel meaning "salt as long as the hash output".
pub const PSS_SALT_LENGTH_EQUALS_HASH: i32 = -1;

/// Default bound on a single gateway round trip.
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Map the caller's requested hash onto a supported algorithm. Unset or
    /// unrecognized requests fall back to SHA-256 with a warning.
    pub fn from_requested(requested: Option<&str>) -> Self {
        let Some(name) = requested else {
            tracing::warn!("no hash algorithm requested, using sha256");
            return HashAlgorithm::Sha256;
        };
        let normalized = name.trim().to_ascii_lowercase().replace(['-', '_'], "");
        match normalized.as_str() {
            "sha256" => HashAlgorithm::Sha256,
            "sha384" => HashAlgorithm::Sha384,
            "sha512" => HashAlgorithm::Sha512,
            _ => {
                tracing::warn!(hash_alg = name, "unsupported hash algorithm, using sha256");
                HashAlgorithm::Sha256
            }
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Padding scheme requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureScheme {
    /// PKCS#1 v1.5, the default.
    #[serde(rename = "rsassa")]
    Pkcs1v15,
    #[serde(rename = "rsapss")]
    Pss,
}

impl SignatureScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureScheme::Pkcs1v15 => "rsassa",
            SignatureScheme::Pss => "rsapss",
        }
    }
}

/// What the caller asks for. Mirrors the options a TLS stack hands a signer:
/// a hash, optionally with PSS parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignerOptions {
    pub hash: Option<String>,
    /// `Some` requests PSS padding with this salt length.
    pub pss_salt_length: Option<i32>,
}

impl SignerOptions {
    pub fn sha256() -> Self {
        Self {
            hash: Some("sha256".to_string()),
            pss_salt_length: None,
        }
    }

    pub fn pss(hash: impl Into<String>, salt_length: i32) -> Self {
        Self {
            hash: Some(hash.into()),
            pss_salt_length: Some(salt_length),
        }
    }
}

/// The fully resolved request forwarded to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub digest: Vec<u8>,
    pub hash: HashAlgorithm,
    pub scheme: SignatureScheme,
    pub salt_length: i32,
}

/// Sole owner of the private key material.
#[async_trait]
pub trait SigningGateway: Send + Sync {
    async fn sign(&self, request: &SignRequest) -> AttestResult<Vec<u8>>;
}

/// Signer backed by a [`SigningGateway`], with the public half of the key
/// parsed once at construction.
pub struct DelegatedSigner {
    gateway: Arc<dyn SigningGateway>,
    public_key: RsaPublicKey,
    public_key_pem: String,
    key_id: String,
    timeout: Duration,
}

impl fmt::Debug for DelegatedSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedSigner")
            .field("key_id", &self.key_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DelegatedSigner {
    /// Accepts an SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`) PEM. Any
    /// other encoding or key type is rejected.
    pub fn new(gateway: Arc<dyn SigningGateway>, public_key_pem: &str) -> AttestResult<Self> {
        let public_key = parse_rsa_public_key(public_key_pem)?;
        let key_id = compute_key_id(&public_key)?;

        Ok(Self {
            gateway,
            public_key,
            public_key_pem: public_key_pem.trim().to_string(),
            key_id,
            timeout: DEFAULT_SIGN_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// `sha256:<hex>` over the SPKI DER encoding.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Resolve caller options into the request the gateway will see.
    pub fn prepare(&self, digest: &[u8], opts: &SignerOptions) -> SignRequest {
        let hash = HashAlgorithm::from_requested(opts.hash.as_deref());
        let (scheme, salt_length) = match opts.pss_salt_length {
            Some(salt) => (SignatureScheme::Pss, salt),
            None => (SignatureScheme::Pkcs1v15, PSS_SALT_LENGTH_EQUALS_HASH),
        };

        if digest.len() != hash.digest_len() {
            tracing::debug!(
                hash_alg = %hash,
                digest_len = digest.len(),
                "digest length does not match hash output size"
            );
        }

        SignRequest {
            digest: digest.to_vec(),
            hash,
            scheme,
            salt_length,
        }
    }

    /// Sign `digest` through the gateway. A gateway that does not answer
    /// within the configured timeout yields [`AttestError::Timeout`].
    pub async fn sign(&self, digest: &[u8], opts: &SignerOptions) -> AttestResult<Vec<u8>> {
        let request = self.prepare(digest, opts);
        tracing::debug!(
            hash_alg = %request.hash,
            scheme = request.scheme.as_str(),
            salt_length = request.salt_length,
            digest_len = request.digest.len(),
            "signing digest via gateway"
        );

        let signature = tokio::time::timeout(self.timeout, self.gateway.sign(&request))
            .await
            .map_err(|_| AttestError::timeout("gateway_sign", self.timeout))??;

        tracing::debug!(signature_len = signature.len(), "gateway produced signature");
        Ok(signature)
    }
}

pub(crate) fn parse_rsa_public_key(pem: &str) -> AttestResult<RsaPublicKey> {
    let pem = pem.trim();
    if pem.contains("BEGIN RSA PUBLIC KEY") {
        return RsaPublicKey::from_pkcs1_pem(pem)
            .map_err(|e| AttestError::key_material(format!("failed to parse PKCS#1 RSA key: {e}")));
    }
    if !pem.contains("BEGIN PUBLIC KEY") {
        return Err(AttestError::key_material("failed to decode PEM public key"));
    }
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| AttestError::key_material(format!("public key is not a usable RSA key: {e}")))
}

pub(crate) fn compute_key_id(key: &RsaPublicKey) -> AttestResult<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| AttestError::key_material(format!("failed to encode SPKI DER: {e}")))?;
    Ok(format!("sha256:{:x}", Sha256::digest(der.as_bytes())))
}

#[derive(Serialize)]
struct SignDataRequest<'a> {
    data: String,
    hash_alg: &'a str,
    is_digest: bool,
    scheme: &'a str,
    salt_length: i32,
}

#[derive(Deserialize)]
struct SignDataResponse {
    status: String,
    #[serde(default)]
    signature: String,
}

/// Gateway binding that talks to the TPM plugin server over HTTP.
pub struct HttpSigningGateway {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpSigningGateway {
    pub fn new(endpoint: impl Into<String>) -> AttestResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(AttestError::config("signing gateway endpoint must be set"));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AttestError::network("build_gateway_client", e))?;
        Ok(Self { endpoint, http })
    }
}

#[async_trait]
impl SigningGateway for HttpSigningGateway {
    async fn sign(&self, request: &SignRequest) -> AttestResult<Vec<u8>> {
        let body = SignDataRequest {
            data: B64.encode(&request.digest),
            hash_alg: request.hash.as_str(),
            // The signer always hands over a digest; the plugin must not hash again.
            is_digest: true,
            scheme: request.scheme.as_str(),
            salt_length: request.salt_length,
        };

        let resp = self
            .http
            .post(format!("{}/sign-data", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| AttestError::network("gateway_sign", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AttestError::gateway(format!(
                "sign-data returned status {}: {text}",
                status.as_u16()
            )));
        }

        let result: SignDataResponse = resp
            .json()
            .await
            .map_err(|e| AttestError::network("gateway_sign_decode", e))?;
        if result.status != "success" {
            return Err(AttestError::gateway(format!(
                "signing failed: status={}",
                result.status
            )));
        }

        B64.decode(result.signature.as_bytes())
            .map_err(|e| AttestError::gateway(format!("invalid base64 signature: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const APP_KEY_PUB: &str = include_str!("../tests/fixtures/app_key.pub.pem");
    const EC_KEY_PUB: &str = include_str!("../tests/fixtures/ec_key.pub.pem");

    #[derive(Default)]
    struct RecordingGateway {
        last: Mutex<Option<SignRequest>>,
    }

    #[async_trait]
    impl SigningGateway for RecordingGateway {
        async fn sign(&self, request: &SignRequest) -> AttestResult<Vec<u8>> {
            *self.last.lock().unwrap() = Some(request.clone());
            Ok(vec![0xAB; 256])
        }
    }

    struct StalledGateway;

    #[async_trait]
    impl SigningGateway for StalledGateway {
        async fn sign(&self, _request: &SignRequest) -> AttestResult<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn signer_with(gateway: Arc<RecordingGateway>) -> DelegatedSigner {
        DelegatedSigner::new(gateway, APP_KEY_PUB).expect("signer")
    }

    #[test]
    fn hash_selection_defaults_to_sha256() {
        assert_eq!(HashAlgorithm::from_requested(Some("SHA-384")), HashAlgorithm::Sha384);
        assert_eq!(HashAlgorithm::from_requested(Some("sha512")), HashAlgorithm::Sha512);
        assert_eq!(HashAlgorithm::from_requested(Some("md5")), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::from_requested(None), HashAlgorithm::Sha256);
    }

    #[tokio::test]
    async fn pss_options_forward_exact_salt_length() {
        let gateway = Arc::new(RecordingGateway::default());
        let signer = signer_with(gateway.clone());

        let sig = signer
            .sign(&[7u8; 48], &SignerOptions::pss("sha384", 48))
            .await
            .expect("sign");
        assert_eq!(sig.len(), 256);

        let seen = gateway.last.lock().unwrap().clone().expect("request recorded");
        assert_eq!(seen.scheme, SignatureScheme::Pss);
        assert_eq!(seen.salt_length, 48);
        assert_eq!(seen.hash, HashAlgorithm::Sha384);
        assert_eq!(seen.digest, vec![7u8; 48]);
    }

    #[tokio::test]
    async fn default_options_use_pkcs1v15_and_sha256() {
        let gateway = Arc::new(RecordingGateway::default());
        let signer = signer_with(gateway.clone());

        let opts = SignerOptions {
            hash: Some("whirlpool".to_string()),
            pss_salt_length: None,
        };
        signer.sign(&[1u8; 32], &opts).await.expect("sign");

        let seen = gateway.last.lock().unwrap().clone().expect("request recorded");
        assert_eq!(seen.scheme, SignatureScheme::Pkcs1v15);
        assert_eq!(seen.hash, HashAlgorithm::Sha256);
        assert_eq!(seen.salt_length, PSS_SALT_LENGTH_EQUALS_HASH);
    }

    #[test]
    fn public_key_is_parsed_once() {
        let signer = signer_with(Arc::new(RecordingGateway::default()));
        let expected = RsaPublicKey::from_public_key_pem(APP_KEY_PUB).expect("parse");
        assert_eq!(signer.public(), &expected);
        assert!(signer.key_id().starts_with("sha256:"));
        assert_eq!(signer.key_id().len(), "sha256:".len() + 64);
    }

    #[test]
    fn construction_rejects_bad_key_material() {
        let gateway: Arc<dyn SigningGateway> = Arc::new(RecordingGateway::default());

        let err = DelegatedSigner::new(gateway.clone(), "not a pem").unwrap_err();
        assert!(matches!(err, AttestError::KeyMaterial { .. }));

        let err = DelegatedSigner::new(gateway, EC_KEY_PUB).unwrap_err();
        assert!(matches!(err, AttestError::KeyMaterial { .. }));
    }

    #[tokio::test]
    async fn stalled_gateway_times_out() {
        let signer = DelegatedSigner::new(Arc::new(StalledGateway), APP_KEY_PUB)
            .expect("signer")
            .with_timeout(Duration::from_millis(20));

        let err = signer.sign(&[0u8; 32], &SignerOptions::sha256()).await.unwrap_err();
        assert!(matches!(err, AttestError::Timeout { .. }));
        assert!(err.is_transient());
    }
}
