//! Verified claims and the unified identity claims document

use crate::verifier::SovereignAttestation;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Register the verifier extends with the location measurement.
pub const GEOLOCATION_PCR_INDEX: u32 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostIntegrityStatus {
    #[default]
    Unknown,
    PassedAllChecks,
    Failed,
    Partial,
}

impl HostIntegrityStatus {
    /// Verifier responses spell these in lower snake case; anything
    /// unrecognised is `Unknown`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "passed_all_checks" => Self::PassedAllChecks,
            "failed" => Self::Failed,
            "partial" => Self::Partial,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::PassedAllChecks => "PASSED_ALL_CHECKS",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
        }
    }
}

impl fmt::Display for HostIntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuMetrics {
    pub status: String,
    pub utilization_pct: f64,
    pub memory_mb: i64,
}

/// Claims a remote verifier vouched for. Only the policy engine and the
/// identity issuer read these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestedClaims {
    pub geolocation: String,
    pub host_integrity_status: HostIntegrityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_metrics_health: Option<GpuMetrics>,
    #[serde(default)]
    pub audit_id: String,
}

/// Which key a credential binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// The hardware-resident app key of an agent.
    TpmAppKey,
    /// A workload's own key; carries no hardware claims.
    WorkloadKey,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::TpmAppKey => "tpm-app-key",
            KeySource::WorkloadKey => "workload-key",
        }
    }
}

/// Build the `grc.*` claims blob embedded in an issued credential.
///
/// Hardware attestation and geolocation are attached only for
/// [`KeySource::TpmAppKey`]; workload credentials inherit those guarantees
/// from their agent and carry just `grc.workload`.
pub fn build_claims_json(
    subject_id: &str,
    key_source: KeySource,
    workload_public_key_pem: Option<&str>,
    attestation: Option<&SovereignAttestation>,
    claims: Option<&AttestedClaims>,
) -> Value {
    let mut doc = Map::new();

    let mut workload = Map::new();
    workload.insert("workload-id".into(), json!(subject_id));
    workload.insert("key-source".into(), json!(key_source.as_str()));
    if key_source == KeySource::WorkloadKey {
        if let Some(pem) = workload_public_key_pem.filter(|p| !p.is_empty()) {
            workload.insert("public-key".into(), json!(pem));
        }
    }
    if let Some(hash) = attestation.and_then(|a| a.workload_code_hash.as_deref()) {
        if !hash.is_empty() {
            workload.insert("workload-code-hash".into(), json!(hash));
        }
    }
    doc.insert("grc.workload".into(), Value::Object(workload));

    if key_source == KeySource::TpmAppKey {
        let mut tpm = Map::new();
        if let Some(att) = attestation {
            insert_non_empty(&mut tpm, "app-key-public", &att.app_key_public);
            if let Some(cert) = att.app_key_certificate.as_deref() {
                insert_non_empty(&mut tpm, "app-key-certificate", cert);
            }
            insert_non_empty(&mut tpm, "quote", &att.tpm_signed_attestation);
            insert_non_empty(&mut tpm, "challenge-nonce", &att.challenge_nonce);
        }
        if let Some(claims) = claims {
            tpm.insert(
                "verified-claims".into(),
                json!({
                    "host-integrity-status": claims.host_integrity_status.as_str(),
                    "gpu-metrics-health": claims.gpu_metrics_health,
                    "audit-id": claims.audit_id,
                }),
            );
            if let Some(geo) = geolocation_claim(&claims.geolocation) {
                doc.insert("grc.geolocation".into(), geo);
            }
        }
        if !tpm.is_empty() {
            doc.insert("grc.tpm-attestation".into(), Value::Object(tpm));
        }
    }

    Value::Object(doc)
}

fn insert_non_empty(map: &mut Map<String, Value>, key: &str, value: &str) {
    if !value.is_empty() {
        map.insert(key.to_string(), json!(value));
    }
}

/// Geolocation strings are `"Country: detail"` or
/// `"country:state:city[:lat:lon]"`.
fn geolocation_claim(raw: &str) -> Option<Value> {
    let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
    let country = parts.first().copied().filter(|c| !c.is_empty())?;

    let mut jurisdiction = Map::new();
    jurisdiction.insert("country".into(), json!(country));
    // A two-part value is a free-form description, not a state.
    if parts.len() >= 3 {
        if !parts[1].is_empty() {
            jurisdiction.insert("state".into(), json!(parts[1]));
        }
        if !parts[2].is_empty() {
            jurisdiction.insert("city".into(), json!(parts[2]));
        }
    }

    let precise = match parts.as_slice() {
        [_, _, _, lat, lon, ..] => lat.parse::<f64>().ok().zip(lon.parse::<f64>().ok()),
        _ => None,
    };
    let physical = match precise {
        Some((latitude, longitude)) => json!({
            "format": "precise",
            "precise": { "latitude": latitude, "longitude": longitude },
        }),
        None => json!({
            "format": "administrative",
            "administrative": Value::Object(jurisdiction.clone()),
        }),
    };

    Some(json!({
        "physical-location": physical,
        "jurisdiction": Value::Object(jurisdiction),
        "tpm-attested-location": true,
        "tpm-attested-pcr-index": GEOLOCATION_PCR_INDEX,
    }))
}
