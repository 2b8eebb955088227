//! Multi-ring evidence aggregation
//!
//! A bundle holds one [`Evidence`] per participating ring, all for the same
//! session, and is signed by the aggregator's hardware-backed key so the
//! verifier can authenticate who assembled it. The signature also covers the
//! node id the credential will be issued for.

use crate::errors::{AttestError, AttestResult};
use crate::evidence::{Evidence, Ring};
use crate::identity::validate_node_id;
use crate::session::Session;
use crate::signer::{compute_key_id, parse_rsa_public_key, DelegatedSigner, SignerOptions};
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    session_id: String,
    node_id: String,
    evidence: Vec<Evidence>,
    aggregator_key_id: String,
    aggregator_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_key_certificate: Option<String>,
    #[serde(with = "hex::serde")]
    signature: Vec<u8>,
}

/// Everything the aggregator signature covers.
#[derive(Serialize)]
struct SignedContent<'a> {
    session_id: &'a str,
    node_id: &'a str,
    evidence: &'a [Evidence],
    aggregator_key_id: &'a str,
    aggregator_public_key: &'a str,
    app_key_certificate: Option<&'a str>,
}

impl EvidenceBundle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Node the bundle was sealed for. Covered by the aggregator signature.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Evidence ordered by ring, outermost first.
    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn evidence_for(&self, ring: Ring) -> Option<&Evidence> {
        self.evidence.iter().find(|e| e.ring() == ring)
    }

    pub fn rings(&self) -> BTreeSet<Ring> {
        self.evidence.iter().map(Evidence::ring).collect()
    }

    pub fn aggregator_key_id(&self) -> &str {
        &self.aggregator_key_id
    }

    pub fn aggregator_public_key(&self) -> &str {
        &self.aggregator_public_key
    }

    pub fn app_key_certificate(&self) -> Option<&str> {
        self.app_key_certificate.as_deref()
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// SHA-256 over the canonical JSON of the signed content.
    pub fn signing_digest(&self) -> AttestResult<Vec<u8>> {
        signing_digest(&SignedContent {
            session_id: &self.session_id,
            node_id: &self.node_id,
            evidence: &self.evidence,
            aggregator_key_id: &self.aggregator_key_id,
            aggregator_public_key: &self.aggregator_public_key,
            app_key_certificate: self.app_key_certificate.as_deref(),
        })
    }

    /// Check the aggregator signature against the embedded public key, and
    /// that the advertised key id really is that key.
    pub fn verify_signature(&self) -> AttestResult<()> {
        let key = self.aggregator_key()?;
        let digest = self.signing_digest()?;
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &self.signature)
            .map_err(|_| AttestError::binding("aggregator", "bundle signature is invalid"))
    }

    /// Check every ring's quote authenticates that ring's bound payload, so a
    /// quote produced for another session or another measurement is
    /// rejected even inside a freshly signed bundle. Quotes must come from
    /// the aggregator's app key.
    pub fn verify_quotes(&self) -> AttestResult<()> {
        let key = self.aggregator_key()?;
        for evidence in &self.evidence {
            let ring = evidence.ring().as_str();
            if evidence.signer_public_key_id() != self.aggregator_key_id {
                return Err(AttestError::binding(
                    ring,
                    format!(
                        "quote signer {} is not the aggregator key",
                        evidence.signer_public_key_id()
                    ),
                ));
            }
            key.verify(
                Pkcs1v15Sign::new::<Sha256>(),
                &evidence.bound_payload(),
                evidence.quote_bytes(),
            )
            .map_err(|_| AttestError::binding(ring, "quote does not cover the bound payload"))?;
        }
        Ok(())
    }

    fn aggregator_key(&self) -> AttestResult<RsaPublicKey> {
        let key = parse_rsa_public_key(&self.aggregator_public_key)?;
        let key_id = compute_key_id(&key)?;
        if key_id != self.aggregator_key_id {
            return Err(AttestError::binding(
                "aggregator",
                format!("key id {} does not match embedded key", self.aggregator_key_id),
            ));
        }
        Ok(key)
    }

    /// Check every entry is bound to `session`, entries are strictly ordered
    /// by ring, and every ring in `required` is present.
    pub fn check_binding(&self, session: &Session, required: &BTreeSet<Ring>) -> AttestResult<()> {
        if self.session_id != session.session_id {
            return Err(AttestError::session_mismatch(&session.session_id, &self.session_id));
        }
        if let Some(pair) = self.evidence.windows(2).find(|w| w[0].ring() >= w[1].ring()) {
            return Err(AttestError::binding(
                pair[1].ring().as_str(),
                "evidence is out of ring order or duplicated",
            ));
        }
        check_complete(&self.rings(), required)?;
        for evidence in &self.evidence {
            evidence.check_binding(session)?;
        }
        Ok(())
    }
}

fn signing_digest(content: &SignedContent<'_>) -> AttestResult<Vec<u8>> {
    let bytes = serde_json::to_vec(content)
        .map_err(|e| AttestError::serialization("encoding bundle for signing", e))?;
    Ok(Sha256::digest(bytes).to_vec())
}

fn check_complete(present: &BTreeSet<Ring>, required: &BTreeSet<Ring>) -> AttestResult<()> {
    let missing: Vec<String> = required
        .difference(present)
        .map(|r| r.as_str().to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AttestError::IncompleteBundle { missing })
    }
}

pub struct Bundler {
    required: BTreeSet<Ring>,
    signer: Arc<DelegatedSigner>,
    app_key_certificate: Option<String>,
}

impl Bundler {
    pub fn new(signer: Arc<DelegatedSigner>, required: impl IntoIterator<Item = Ring>) -> Self {
        Self {
            required: required.into_iter().collect(),
            signer,
            app_key_certificate: None,
        }
    }

    pub fn with_certificate(mut self, pem: impl Into<String>) -> Self {
        self.app_key_certificate = Some(pem.into());
        self
    }

    pub fn required(&self) -> &BTreeSet<Ring> {
        &self.required
    }

    /// Aggregate and sign for `node_id`. Fails with `SessionMismatch` if any
    /// entry belongs to another session, `IncompleteBundle` if a required
    /// ring is missing, and `Binding` if a ring appears twice.
    pub async fn seal(
        &self,
        session_id: &str,
        node_id: &str,
        mut evidence: Vec<Evidence>,
    ) -> AttestResult<EvidenceBundle> {
        validate_node_id(node_id)?;
        let mut present = BTreeSet::new();
        for entry in &evidence {
            if entry.session_id() != session_id {
                return Err(AttestError::session_mismatch(session_id, entry.session_id()));
            }
            if !present.insert(entry.ring()) {
                return Err(AttestError::binding(entry.ring().as_str(), "duplicate evidence"));
            }
        }
        check_complete(&present, &self.required)?;
        evidence.sort_by_key(Evidence::ring);

        let digest = signing_digest(&SignedContent {
            session_id,
            node_id,
            evidence: &evidence,
            aggregator_key_id: self.signer.key_id(),
            aggregator_public_key: self.signer.public_key_pem(),
            app_key_certificate: self.app_key_certificate.as_deref(),
        })?;
        let signature = self.signer.sign(&digest, &SignerOptions::sha256()).await?;

        tracing::info!(
            session_id,
            node_id,
            rings = ?present,
            aggregator_key_id = self.signer.key_id(),
            "evidence bundle sealed"
        );

        Ok(EvidenceBundle {
            session_id: session_id.to_string(),
            node_id: node_id.to_string(),
            evidence,
            aggregator_key_id: self.signer.key_id().to_string(),
            aggregator_public_key: self.signer.public_key_pem().to_string(),
            app_key_certificate: self.app_key_certificate.clone(),
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceCollector, GatewayQuoter, MeasuredState, StaticMeasurements};
    use crate::session::SessionManager;
    use crate::tests::test_utils::software_signer;

    fn collector(signer: Arc<DelegatedSigner>) -> EvidenceCollector {
        let state = MeasuredState {
            image_id: "image".to_string(),
            ..MeasuredState::default()
        };
        EvidenceCollector::new(Arc::new(GatewayQuoter::new(signer)))
            .with_source(Ring::Host, Arc::new(StaticMeasurements(state.clone())))
            .with_source(Ring::Vm, Arc::new(StaticMeasurements(state)))
    }

    #[tokio::test]
    async fn sealed_bundle_is_ordered_signed_and_bound() {
        let signer = software_signer();
        let session = SessionManager::default().issue_challenge().expect("issue");
        let collector = collector(Arc::clone(&signer));
        let vm = collector.collect(&session, Ring::Vm).await.expect("vm");
        let host = collector.collect(&session, Ring::Host).await.expect("host");

        let bundler = Bundler::new(signer, [Ring::Host, Ring::Vm]);
        let bundle = bundler
            .seal(&session.session_id, "node-1", vec![vm, host])
            .await
            .expect("seal");

        assert_eq!(bundle.evidence()[0].ring(), Ring::Host);
        assert_eq!(bundle.evidence()[1].ring(), Ring::Vm);
        assert_eq!(bundle.node_id(), "node-1");
        bundle.verify_signature().expect("signature verifies");
        bundle.verify_quotes().expect("quotes verify");
        bundle.check_binding(&session, bundler.required()).expect("bound");
    }

    #[tokio::test]
    async fn tampered_bundle_fails_signature_check() {
        let signer = software_signer();
        let session = SessionManager::default().issue_challenge().expect("issue");
        let host = collector(Arc::clone(&signer)).collect(&session, Ring::Host).await.expect("host");
        let bundle = Bundler::new(signer, [Ring::Host])
            .seal(&session.session_id, "node-1", vec![host])
            .await
            .expect("seal");

        for (field, forged) in [("session_id", "someone-else"), ("node_id", "admin")] {
            let mut value = serde_json::to_value(&bundle).expect("encode");
            value[field] = serde_json::json!(forged);
            let tampered: EvidenceBundle = serde_json::from_value(value).expect("decode");
            assert!(
                matches!(tampered.verify_signature(), Err(AttestError::Binding { .. })),
                "{field} rewrite accepted"
            );
        }
    }

    #[tokio::test]
    async fn seal_rejects_unsafe_node_ids() {
        let signer = software_signer();
        let session = SessionManager::default().issue_challenge().expect("issue");
        let host = collector(Arc::clone(&signer)).collect(&session, Ring::Host).await.expect("host");
        let err = Bundler::new(signer, [Ring::Host])
            .seal(&session.session_id, "victim/../../admin", vec![host])
            .await
            .unwrap_err();
        assert!(matches!(err, AttestError::InvalidAttestation { .. }));
    }

    #[tokio::test]
    async fn out_of_order_evidence_is_not_bound() {
        let signer = software_signer();
        let session = SessionManager::default().issue_challenge().expect("issue");
        let collector = collector(Arc::clone(&signer));
        let host = collector.collect(&session, Ring::Host).await.expect("host");
        let vm = collector.collect(&session, Ring::Vm).await.expect("vm");
        let bundler = Bundler::new(signer, [Ring::Host, Ring::Vm]);
        let bundle = bundler
            .seal(&session.session_id, "node-1", vec![host, vm])
            .await
            .expect("seal");

        let mut value = serde_json::to_value(&bundle).expect("encode");
        let evidence = value["evidence"].as_array_mut().expect("evidence array");
        evidence.swap(0, 1);
        let reordered: EvidenceBundle = serde_json::from_value(value).expect("decode");
        assert!(matches!(
            reordered.check_binding(&session, bundler.required()),
            Err(AttestError::Binding { .. })
        ));
    }

    #[tokio::test]
    async fn quote_from_another_session_fails_quote_check() {
        let signer = software_signer();
        let manager = SessionManager::default();
        let old = manager.issue_challenge().expect("issue");
        let fresh = manager.issue_challenge().expect("issue");
        let collector = collector(Arc::clone(&signer));
        let stale = collector.collect(&old, Ring::Host).await.expect("old host");
        let host = collector.collect(&fresh, Ring::Host).await.expect("fresh host");

        let mut entry = serde_json::to_value(&host).expect("encode");
        entry["quote_bytes"] = serde_json::to_value(&stale).expect("encode")["quote_bytes"].clone();
        let spliced: Evidence = serde_json::from_value(entry).expect("decode");

        let bundle = Bundler::new(signer, [Ring::Host])
            .seal(&fresh.session_id, "node-1", vec![spliced])
            .await
            .expect("seal");
        bundle.verify_signature().expect("outer signature is fresh");
        assert!(matches!(
            bundle.verify_quotes(),
            Err(AttestError::Binding { .. })
        ));
    }

    #[tokio::test]
    async fn missing_required_ring_is_incomplete() {
        let signer = software_signer();
        let session = SessionManager::default().issue_challenge().expect("issue");
        let host = collector(Arc::clone(&signer)).collect(&session, Ring::Host).await.expect("host");

        let err = Bundler::new(signer, [Ring::Host, Ring::Vm])
            .seal(&session.session_id, "node-1", vec![host])
            .await
            .unwrap_err();
        match err {
            AttestError::IncompleteBundle { missing } => assert_eq!(missing, vec!["vm".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn mixed_sessions_and_duplicates_are_rejected() {
        let signer = software_signer();
        let manager = SessionManager::default();
        let first = manager.issue_challenge().expect("issue");
        let second = manager.issue_challenge().expect("issue");
        let collector = collector(Arc::clone(&signer));
        let host = collector.collect(&first, Ring::Host).await.expect("host");
        let vm = collector.collect(&second, Ring::Vm).await.expect("vm");

        let bundler = Bundler::new(signer, [Ring::Host]);
        assert!(matches!(
            bundler.seal(&first.session_id, "node-1", vec![host.clone(), vm]).await,
            Err(AttestError::SessionMismatch { .. })
        ));
        assert!(matches!(
            bundler.seal(&first.session_id, "node-1", vec![host.clone(), host]).await,
            Err(AttestError::Binding { .. })
        ));
    }
}
