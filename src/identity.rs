//! Short-lived identity issuance

use crate::claims::{build_claims_json, AttestedClaims, KeySource};
use crate::errors::{AttestError, AttestResult};
use crate::evidence::Ring;
use crate::policy::PolicyResult;
use crate::session::ConsumedSession;
use crate::verifier::SovereignAttestation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub const DEFAULT_SVID_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub subject_id: String,
    pub parent_id: String,
    pub ring: Ring,
    pub selectors: BTreeSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// The `grc.*` claims document.
    pub claims: serde_json::Value,
    pub audit_id: String,
    pub session_id: String,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What is being identified, supplied by the caller that drove attestation.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub ring: Ring,
    /// Stable identifier of the node or workload inside its ring.
    pub node_id: String,
    pub parent_id: Option<String>,
    pub key_source: KeySource,
    pub workload_public_key_pem: Option<String>,
    pub attestation: Option<SovereignAttestation>,
    /// Per-ring measurement metadata, folded into selectors.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct IdentityIssuer {
    trust_domain: String,
    ttl: Duration,
}

impl IdentityIssuer {
    pub fn new(trust_domain: impl Into<String>, ttl: Duration) -> AttestResult<Self> {
        let trust_domain = trust_domain.into();
        if trust_domain.trim().is_empty() || trust_domain.contains('/') {
            return Err(AttestError::config(format!("invalid trust domain {trust_domain:?}")));
        }
        if ttl.is_zero() {
            return Err(AttestError::config("credential ttl must be non-zero"));
        }
        Ok(Self { trust_domain, ttl })
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    pub fn subject_for(&self, ring: Ring, node_id: &str) -> String {
        format!("spiffe://{}/sovereign/{}/{}", self.trust_domain, ring, node_id)
    }

    /// Issue a credential for an allowed verdict. Taking the consumed session
    /// by value means a session yields at most one credential.
    pub fn issue(
        &self,
        session: ConsumedSession,
        verdict: &PolicyResult,
        claims: &AttestedClaims,
        request: IssueRequest,
    ) -> AttestResult<Credential> {
        if !verdict.allowed() {
            tracing::warn!(
                session_id = session.session_id(),
                reason = verdict.reason(),
                "credential denied"
            );
            return Err(AttestError::policy_denied(verdict.reason()));
        }
        validate_node_id(&request.node_id)?;

        let subject_id = self.subject_for(request.ring, &request.node_id);
        let parent_id = request
            .parent_id
            .unwrap_or_else(|| format!("spiffe://{}/sovereign/server", self.trust_domain));
        let doc = build_claims_json(
            &subject_id,
            request.key_source,
            request.workload_public_key_pem.as_deref(),
            request.attestation.as_ref(),
            Some(claims),
        );

        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AttestError::config(format!("credential ttl out of range: {e}")))?;

        let credential = Credential {
            subject_id,
            parent_id,
            ring: request.ring,
            selectors: fused_selectors(request.ring, claims, &request.metadata),
            issued_at,
            expires_at: issued_at + ttl,
            ttl_secs: self.ttl.as_secs(),
            claims: doc,
            audit_id: claims.audit_id.clone(),
            session_id: session.session_id().to_string(),
        };

        tracing::info!(
            subject_id = %credential.subject_id,
            session_id = %credential.session_id,
            ttl_secs = credential.ttl_secs,
            "credential issued"
        );
        Ok(credential)
    }
}

/// A node id becomes one path segment of the subject: ASCII letters, digits,
/// `.`, `-` and `_` only, and never `.` or `..`.
pub fn validate_node_id(node_id: &str) -> AttestResult<()> {
    if node_id.is_empty() {
        return Err(AttestError::invalid_attestation("node id is required"));
    }
    if node_id == "." || node_id == ".." {
        return Err(AttestError::invalid_attestation(format!(
            "node id {node_id:?} is not a valid path segment"
        )));
    }
    if let Some(bad) = node_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(AttestError::invalid_attestation(format!(
            "node id {node_id:?} contains {bad:?}"
        )));
    }
    Ok(())
}

/// Selectors combining ring identity with the verified hardware claims.
fn fused_selectors(
    ring: Ring,
    claims: &AttestedClaims,
    metadata: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    let mut selectors = BTreeSet::new();
    selectors.insert(format!("sovereign:ring:{ring}"));
    selectors.insert(format!("sovereign:geolocation:{}", claims.geolocation.trim()));
    selectors.insert(format!("sovereign:integrity:{}", claims.host_integrity_status));
    if let Some(gpu) = &claims.gpu_metrics_health {
        selectors.insert(format!("sovereign:gpu:{}", gpu.status));
    }
    for (key, value) in metadata {
        selectors.insert(format!("sovereign:{ring}:{key}:{value}"));
    }
    selectors
}
