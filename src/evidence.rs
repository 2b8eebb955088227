//! Per-ring evidence collection and nonce binding
//!
//! Each ring's quote signs `SHA-256(session_id || ring_nonce || claims_digest)`.
//! Tying the quote to both the session and its nonce is what stops a quote
//! from an older challenge being replayed.

use crate::errors::{AttestError, AttestResult};
use crate::session::Session;
use crate::signer::{DelegatedSigner, SignerOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A nested trust boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ring {
    Host,
    Vm,
    Workload,
}

impl Ring {
    pub const ALL: [Ring; 3] = [Ring::Host, Ring::Vm, Ring::Workload];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ring::Host => "host",
            Ring::Vm => "vm",
            Ring::Workload => "workload",
        }
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ring {
    type Err = AttestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Ring::Host),
            "vm" => Ok(Ring::Vm),
            "workload" => Ok(Ring::Workload),
            other => Err(AttestError::config(format!("unknown ring '{other}'"))),
        }
    }
}

/// Measured state of one ring at collection time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasuredState {
    /// Image or sandbox identity.
    pub image_id: String,
    pub integrity_log_summary: String,
    /// Ordered register values, hex encoded.
    pub platform_measurements: Vec<String>,
    #[serde(with = "hex::serde")]
    pub event_log: Vec<u8>,
    /// Role-specific metadata.
    pub metadata: BTreeMap<String, String>,
}

impl MeasuredState {
    /// Digest over everything the ring measured. Each field is length
    /// prefixed so that no two distinct states hash the same.
    pub fn claims_digest(&self, ring: Ring) -> Vec<u8> {
        let mut hasher = Sha256::new();
        update_prefixed(&mut hasher, ring.as_str().as_bytes());
        update_prefixed(&mut hasher, self.image_id.as_bytes());
        update_prefixed(&mut hasher, self.integrity_log_summary.as_bytes());
        hasher.update((self.platform_measurements.len() as u64).to_be_bytes());
        for register in &self.platform_measurements {
            update_prefixed(&mut hasher, register.as_bytes());
        }
        update_prefixed(&mut hasher, &Sha256::digest(&self.event_log));
        hasher.update((self.metadata.len() as u64).to_be_bytes());
        for (key, value) in &self.metadata {
            update_prefixed(&mut hasher, key.as_bytes());
            update_prefixed(&mut hasher, value.as_bytes());
        }
        hasher.finalize().to_vec()
    }
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// The payload a ring's quote must authenticate.
pub fn binding_payload(session_id: &str, nonce: &[u8], claims_digest: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(nonce);
    hasher.update(claims_digest);
    hasher.finalize().to_vec()
}

/// One ring's evidence for one attestation attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    ring: Ring,
    session_id: String,
    #[serde(with = "hex::serde")]
    nonce: Vec<u8>,
    #[serde(with = "hex::serde")]
    quote_bytes: Vec<u8>,
    signer_public_key_id: String,
    platform_measurements: Vec<String>,
    #[serde(with = "hex::serde")]
    event_log: Vec<u8>,
    #[serde(with = "hex::serde")]
    claims_digest: Vec<u8>,
    extra_metadata: BTreeMap<String, String>,
}

impl Evidence {
    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn quote_bytes(&self) -> &[u8] {
        &self.quote_bytes
    }

    pub fn signer_public_key_id(&self) -> &str {
        &self.signer_public_key_id
    }

    pub fn platform_measurements(&self) -> &[String] {
        &self.platform_measurements
    }

    pub fn event_log(&self) -> &[u8] {
        &self.event_log
    }

    pub fn claims_digest(&self) -> &[u8] {
        &self.claims_digest
    }

    pub fn extra_metadata(&self) -> &BTreeMap<String, String> {
        &self.extra_metadata
    }

    /// Recompute the payload the quote claims to authenticate.
    pub fn bound_payload(&self) -> Vec<u8> {
        binding_payload(&self.session_id, &self.nonce, &self.claims_digest)
    }

    /// Check this evidence was produced for `session`: same session id and
    /// the nonce the session issued for this ring.
    pub fn check_binding(&self, session: &Session) -> AttestResult<()> {
        if self.session_id != session.session_id {
            return Err(AttestError::session_mismatch(
                &session.session_id,
                &self.session_id,
            ));
        }
        if self.nonce.as_slice() != session.nonce_for(self.ring) {
            return Err(AttestError::binding(
                self.ring.as_str(),
                "nonce does not match the issued challenge",
            ));
        }
        if self.claims_digest.len() != 32 {
            return Err(AttestError::binding(
                self.ring.as_str(),
                format!("claims digest has {} bytes, expected 32", self.claims_digest.len()),
            ));
        }
        if self.quote_bytes.is_empty() {
            return Err(AttestError::binding(self.ring.as_str(), "quote is empty"));
        }
        Ok(())
    }
}

/// A quote produced by a hardware root over a bound payload.
#[derive(Debug, Clone)]
pub struct Quote {
    pub bytes: Vec<u8>,
    pub signer_key_id: String,
}

/// Produces quotes. Device access sits behind this trait.
#[async_trait]
pub trait Quoter: Send + Sync {
    async fn quote(&self, ring: Ring, payload: &[u8]) -> AttestResult<Quote>;
}

/// Quotes by having the hardware-backed app key sign the bound payload.
pub struct GatewayQuoter {
    signer: Arc<DelegatedSigner>,
}

impl GatewayQuoter {
    pub fn new(signer: Arc<DelegatedSigner>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl Quoter for GatewayQuoter {
    async fn quote(&self, ring: Ring, payload: &[u8]) -> AttestResult<Quote> {
        let bytes = self.signer.sign(payload, &SignerOptions::sha256()).await?;
        tracing::debug!(%ring, quote_len = bytes.len(), "quote produced");
        Ok(Quote {
            bytes,
            signer_key_id: self.signer.key_id().to_string(),
        })
    }
}

/// Supplies the measured state of one ring.
pub trait MeasurementSource: Send + Sync {
    fn measure(&self, ring: Ring) -> AttestResult<MeasuredState>;
}

/// A fixed measurement, for rings whose state is known ahead of time.
pub struct StaticMeasurements(pub MeasuredState);

impl MeasurementSource for StaticMeasurements {
    fn measure(&self, _ring: Ring) -> AttestResult<MeasuredState> {
        Ok(self.0.clone())
    }
}

pub struct EvidenceCollector {
    quoter: Arc<dyn Quoter>,
    sources: HashMap<Ring, Arc<dyn MeasurementSource>>,
}

impl EvidenceCollector {
    pub fn new(quoter: Arc<dyn Quoter>) -> Self {
        Self {
            quoter,
            sources: HashMap::new(),
        }
    }

    pub fn with_source(mut self, ring: Ring, source: Arc<dyn MeasurementSource>) -> Self {
        self.sources.insert(ring, source);
        self
    }

    pub fn rings(&self) -> Vec<Ring> {
        let mut rings: Vec<Ring> = self.sources.keys().copied().collect();
        rings.sort();
        rings
    }

    /// Measure `ring`, bind the measurement to the session's nonce for that
    /// ring and obtain a quote over the result.
    pub async fn collect(&self, session: &Session, ring: Ring) -> AttestResult<Evidence> {
        let source = self.sources.get(&ring).ok_or_else(|| {
            AttestError::binding(ring.as_str(), "no measurement source configured")
        })?;
        if session.is_expired() {
            return Err(AttestError::session_expired(&session.session_id));
        }

        let state = source.measure(ring)?;
        let claims_digest = state.claims_digest(ring);
        let nonce = session.nonce_for(ring).to_vec();
        let payload = binding_payload(&session.session_id, &nonce, &claims_digest);
        let quote = self.quoter.quote(ring, &payload).await?;

        tracing::info!(
            %ring,
            session_id = %session.session_id,
            claims_digest = %hex::encode(&claims_digest),
            "evidence collected"
        );

        Ok(Evidence {
            ring,
            session_id: session.session_id.clone(),
            nonce,
            quote_bytes: quote.bytes,
            signer_public_key_id: quote.signer_key_id,
            platform_measurements: state.platform_measurements,
            event_log: state.event_log,
            claims_digest,
            extra_metadata: state.metadata,
        })
    }
}
