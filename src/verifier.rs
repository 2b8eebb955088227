//! Remote verifier client
//!
//! One call per bundle, no retries: a verification attempt is tied to a single
//! session and a retry has to start from a fresh challenge.

use crate::bundle::EvidenceBundle;
use crate::claims::{AttestedClaims, GpuMetrics, HostIntegrityStatus};
use crate::errors::{AttestError, AttestResult};
use crate::evidence::Ring;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const VERIFY_EVIDENCE_PATH: &str = "/v2.4/verify/evidence";
pub const DEFAULT_VERIFIER_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on an encoded quote.
pub const MAX_QUOTE_BYTES: usize = 64 * 1024;
pub const SUBMISSION_TYPE: &str = "PoR/tpm-app-key";
/// Metadata key under which a workload ring reports its code hash.
pub const CODE_HASH_METADATA_KEY: &str = "code_hash";

/// The subset of a bundle the verifier's evidence API understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SovereignAttestation {
    /// Base64 quote of the outermost ring.
    pub tpm_signed_attestation: String,
    pub app_key_public: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key_certificate: Option<String>,
    /// Hex nonce the quote is bound to.
    pub challenge_nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_code_hash: Option<String>,
}

impl SovereignAttestation {
    pub fn from_bundle(bundle: &EvidenceBundle) -> AttestResult<Self> {
        let primary = bundle
            .evidence()
            .first()
            .ok_or_else(|| AttestError::invalid_attestation("bundle carries no evidence"))?;
        let workload_code_hash = bundle
            .evidence_for(Ring::Workload)
            .and_then(|e| e.extra_metadata().get(CODE_HASH_METADATA_KEY).cloned());

        Ok(Self {
            tpm_signed_attestation: B64.encode(primary.quote_bytes()),
            app_key_public: bundle.aggregator_public_key().to_string(),
            app_key_certificate: bundle.app_key_certificate().map(str::to_string),
            challenge_nonce: hex::encode(primary.nonce()),
            workload_code_hash,
        })
    }

    /// Reject attestations the verifier could never accept, before any
    /// network traffic.
    pub fn validate(&self) -> AttestResult<()> {
        if self.tpm_signed_attestation.is_empty() {
            return Err(AttestError::invalid_attestation("tpm_signed_attestation is required"));
        }
        let quote = B64
            .decode(self.tpm_signed_attestation.as_bytes())
            .map_err(|e| AttestError::invalid_attestation(format!("quote is not valid base64: {e}")))?;
        if quote.len() > MAX_QUOTE_BYTES {
            return Err(AttestError::invalid_attestation(format!(
                "quote is {} bytes, limit is {MAX_QUOTE_BYTES}",
                quote.len()
            )));
        }
        if self.challenge_nonce.is_empty() {
            return Err(AttestError::invalid_attestation("challenge_nonce is required"));
        }
        if self.app_key_public.is_empty() {
            return Err(AttestError::invalid_attestation("app_key_public is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct VerifyEvidenceRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: RequestData<'a>,
    metadata: RequestMetadata<'a>,
    evidence_bundle: &'a EvidenceBundle,
}

#[derive(Debug, Serialize)]
struct RequestData<'a> {
    nonce: &'a str,
    quote: &'a str,
    hash_alg: &'static str,
    app_key_public: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_key_certificate: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workload_code_hash: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RequestMetadata<'a> {
    source: &'a str,
    submission_type: &'static str,
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyEvidenceResponse {
    results: VerifyResults,
}

#[derive(Debug, Deserialize)]
struct VerifyResults {
    #[serde(default)]
    verified: bool,
    #[serde(default)]
    verification_details: serde_json::Value,
    #[serde(default)]
    attested_claims: Option<RawClaims>,
    #[serde(default)]
    audit_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    geolocation: Option<String>,
    #[serde(default)]
    host_integrity_status: Option<String>,
    #[serde(default)]
    gpu_metrics_health: Option<RawGpuMetrics>,
}

#[derive(Debug, Deserialize)]
struct RawGpuMetrics {
    #[serde(default)]
    status: String,
    #[serde(default)]
    utilization_pct: f64,
    #[serde(default)]
    memory_mb: i64,
}

impl VerifyResults {
    /// Either complete claims or a typed rejection, never a partial value.
    fn into_claims(self) -> AttestResult<AttestedClaims> {
        if !self.verified {
            let audit_id = self.audit_id.unwrap_or_default();
            tracing::warn!(
                audit_id = %audit_id,
                details = %self.verification_details,
                "verifier rejected evidence"
            );
            return Err(AttestError::verification_failed(format!(
                "evidence not verified (audit_id: {audit_id})"
            )));
        }
        let raw = self
            .attested_claims
            .ok_or_else(|| AttestError::verification_failed("response carries no attested_claims"))?;
        let geolocation = raw
            .geolocation
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| AttestError::verification_failed("attested_claims.geolocation missing"))?;
        let integrity = raw.host_integrity_status.ok_or_else(|| {
            AttestError::verification_failed("attested_claims.host_integrity_status missing")
        })?;
        // Credentials must stay traceable to a verifier decision.
        let audit_id = self
            .audit_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AttestError::verification_failed("results.audit_id missing"))?;

        Ok(AttestedClaims {
            geolocation,
            host_integrity_status: HostIntegrityStatus::parse_lenient(&integrity),
            gpu_metrics_health: raw
                .gpu_metrics_health
                .filter(|gpu| !gpu.status.is_empty())
                .map(|gpu| GpuMetrics {
                    status: gpu.status,
                    utilization_pct: gpu.utilization_pct,
                    memory_mb: gpu.memory_mb,
                }),
            audit_id,
        })
    }
}

/// Turns a bundle into verified claims.
#[async_trait]
pub trait EvidenceVerifier: Send + Sync {
    async fn verify_evidence(&self, bundle: &EvidenceBundle) -> AttestResult<AttestedClaims>;
}

#[derive(Debug, Clone)]
pub struct VerifierClient {
    base_url: String,
    source: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl VerifierClient {
    pub fn new(base_url: impl Into<String>) -> AttestResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| AttestError::config(format!("invalid verifier URL {base_url:?}: {e}")))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AttestError::network("build verifier client", e))?;

        Ok(Self {
            base_url,
            source: "sovereign-identity".to_string(),
            http,
            timeout: DEFAULT_VERIFIER_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name reported to the verifier as the submitting component.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, VERIFY_EVIDENCE_PATH)
    }

    /// Verify within `budget`. When the budget runs out the request is
    /// dropped and [`AttestError::Timeout`] returned.
    pub async fn verify_evidence_within(
        &self,
        bundle: &EvidenceBundle,
        budget: Duration,
    ) -> AttestResult<AttestedClaims> {
        tokio::time::timeout(budget, self.send(bundle))
            .await
            .map_err(|_| AttestError::timeout("verify_evidence", budget))?
    }

    async fn send(&self, bundle: &EvidenceBundle) -> AttestResult<AttestedClaims> {
        let attestation = SovereignAttestation::from_bundle(bundle)?;
        attestation.validate()?;

        let request = VerifyEvidenceRequest {
            kind: "tpm",
            data: RequestData {
                nonce: &attestation.challenge_nonce,
                quote: &attestation.tpm_signed_attestation,
                hash_alg: "sha256",
                app_key_public: &attestation.app_key_public,
                app_key_certificate: attestation.app_key_certificate.as_deref(),
                workload_code_hash: attestation.workload_code_hash.as_deref(),
            },
            metadata: RequestMetadata {
                source: &self.source,
                submission_type: SUBMISSION_TYPE,
                session_id: bundle.session_id(),
            },
            evidence_bundle: bundle,
        };

        tracing::info!(
            session_id = bundle.session_id(),
            endpoint = %self.endpoint(),
            "submitting evidence to verifier"
        );

        let resp = self
            .http
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| AttestError::network("verify_evidence", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), %body, "verifier returned error status");
            return Err(AttestError::VerifierStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| AttestError::network("verify_evidence", e))?;
        // The verifier answered; a body we cannot read is a rejection, not an outage.
        let parsed: VerifyEvidenceResponse = serde_json::from_str(&body).map_err(|e| {
            tracing::error!(error = %e, "verifier response did not decode");
            AttestError::verification_failed(format!("undecodable verifier response: {e}"))
        })?;
        let claims = parsed.results.into_claims()?;

        tracing::info!(
            audit_id = %claims.audit_id,
            geolocation = %claims.geolocation,
            integrity = %claims.host_integrity_status,
            "verifier returned attested claims"
        );
        Ok(claims)
    }
}

#[async_trait]
impl EvidenceVerifier for VerifierClient {
    async fn verify_evidence(&self, bundle: &EvidenceBundle) -> AttestResult<AttestedClaims> {
        self.verify_evidence_within(bundle, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results(value: serde_json::Value) -> VerifyResults {
        serde_json::from_value::<VerifyEvidenceResponse>(value)
            .expect("decode")
            .results
    }

    fn attestation() -> SovereignAttestation {
        SovereignAttestation {
            tpm_signed_attestation: B64.encode(b"quote"),
            app_key_public: "-----BEGIN PUBLIC KEY-----".to_string(),
            app_key_certificate: None,
            challenge_nonce: "00".repeat(32),
            workload_code_hash: None,
        }
    }

    #[test]
    fn validation_rejects_malformed_attestations() {
        attestation().validate().expect("valid");

        let mut att = attestation();
        att.tpm_signed_attestation = "%%%".to_string();
        assert!(matches!(att.validate(), Err(AttestError::InvalidAttestation { .. })));

        let mut att = attestation();
        att.tpm_signed_attestation = B64.encode(vec![0u8; MAX_QUOTE_BYTES + 1]);
        assert!(att.validate().unwrap_err().to_string().contains("limit"));

        let mut att = attestation();
        att.challenge_nonce.clear();
        assert!(att.validate().is_err());

        let mut att = attestation();
        att.app_key_public.clear();
        assert!(att.validate().is_err());
    }

    #[test]
    fn verified_response_yields_claims() {
        let claims = results(json!({
            "results": {
                "verified": true,
                "verification_details": { "nonce_valid": true },
                "attested_claims": {
                    "geolocation": "Spain: N40.4168, W3.7038",
                    "host_integrity_status": "passed_all_checks",
                    "gpu_metrics_health": { "status": "healthy", "utilization_pct": 15.0, "memory_mb": 10240 }
                },
                "audit_id": "a-1"
            }
        }))
        .into_claims()
        .expect("claims");

        assert_eq!(claims.host_integrity_status, HostIntegrityStatus::PassedAllChecks);
        assert_eq!(claims.gpu_metrics_health.expect("gpu").memory_mb, 10240);
        assert_eq!(claims.audit_id, "a-1");
    }

    #[test]
    fn unverified_or_incomplete_responses_fail() {
        let err = results(json!({ "results": { "verified": false, "audit_id": "a-2" } }))
            .into_claims()
            .unwrap_err();
        assert!(matches!(err, AttestError::VerificationFailed { .. }));
        assert!(err.to_string().contains("a-2"));

        let err = results(json!({
            "results": { "verified": true, "attested_claims": { "geolocation": "Spain: x" } }
        }))
        .into_claims()
        .unwrap_err();
        assert!(err.to_string().contains("host_integrity_status"));

        let err = results(json!({ "results": { "verified": true } }))
            .into_claims()
            .unwrap_err();
        assert!(matches!(err, AttestError::VerificationFailed { .. }));
    }

    #[test]
    fn verified_claims_without_audit_id_fail() {
        for audit_id in [None, Some(""), Some("  ")] {
            let mut body = json!({
                "results": {
                    "verified": true,
                    "attested_claims": {
                        "geolocation": "Spain: x",
                        "host_integrity_status": "passed_all_checks"
                    }
                }
            });
            if let Some(id) = audit_id {
                body["results"]["audit_id"] = json!(id);
            }
            let err = results(body).into_claims().unwrap_err();
            assert!(matches!(err, AttestError::VerificationFailed { .. }));
            assert!(err.to_string().contains("audit_id"), "got: {err}");
        }
    }

    #[test]
    fn empty_gpu_status_is_treated_as_absent() {
        let claims = results(json!({
            "results": {
                "verified": true,
                "attested_claims": {
                    "geolocation": "Spain: x",
                    "host_integrity_status": "failed",
                    "gpu_metrics_health": { "status": "", "utilization_pct": 0.0, "memory_mb": 0 }
                },
                "audit_id": "a-3"
            }
        }))
        .into_claims()
        .expect("claims");
        assert!(claims.gpu_metrics_health.is_none());
        assert_eq!(claims.host_integrity_status, HostIntegrityStatus::Failed);
    }

    #[test]
    fn client_rejects_relative_url() {
        assert!(matches!(VerifierClient::new("not a url"), Err(AttestError::Config { .. })));
        let client = VerifierClient::new("http://127.0.0.1:8881/").expect("client");
        assert_eq!(client.endpoint(), "http://127.0.0.1:8881/v2.4/verify/evidence");
    }
}
