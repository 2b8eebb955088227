//! End-to-end attestation flow
//!
//! [`AttestationService`] is the server half: it issues challenges and turns a
//! bound, signed bundle into a credential or a denial. [`AgentAttestor`] is the
//! node half: it triggers the flow over the attestation stream, collects
//! evidence for the issued session and seals it into a bundle.

use crate::bundle::{Bundler, EvidenceBundle};
use crate::claims::KeySource;
use crate::errors::{AttestError, AttestResult};
use crate::evidence::{EvidenceCollector, Ring};
use crate::feature_flags::{FeatureFlags, Flag};
use crate::identity::{Credential, IdentityIssuer, IssueRequest};
use crate::policy::PolicyEngine;
use crate::session::{Session, SessionManager};
use crate::shim::{AttestFrame, AttestationStream, NodeAttestor, UNIFIED_IDENTITY_PAYLOAD};
use crate::verifier::{EvidenceVerifier, SovereignAttestation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Rings every bundle must cover unless configured otherwise.
pub const DEFAULT_REQUIRED_RINGS: [Ring; 2] = [Ring::Host, Ring::Vm];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestRequest {
    /// Carries the node id under the aggregator signature.
    pub bundle: EvidenceBundle,
}

pub struct AttestationService {
    flags: Arc<FeatureFlags>,
    sessions: Arc<SessionManager>,
    verifier: Arc<dyn EvidenceVerifier>,
    policy: PolicyEngine,
    issuer: IdentityIssuer,
    required_rings: BTreeSet<Ring>,
}

impl AttestationService {
    pub fn new(
        flags: Arc<FeatureFlags>,
        sessions: Arc<SessionManager>,
        verifier: Arc<dyn EvidenceVerifier>,
        policy: PolicyEngine,
        issuer: IdentityIssuer,
    ) -> Self {
        Self {
            flags,
            sessions,
            verifier,
            policy,
            issuer,
            required_rings: DEFAULT_REQUIRED_RINGS.into_iter().collect(),
        }
    }

    pub fn with_required_rings(mut self, rings: impl IntoIterator<Item = Ring>) -> Self {
        self.required_rings = rings.into_iter().collect();
        self
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn required_rings(&self) -> &BTreeSet<Ring> {
        &self.required_rings
    }

    pub fn challenge(&self) -> AttestResult<Session> {
        self.flags.require(Flag::UnifiedIdentity)?;
        self.sessions.issue_challenge()
    }

    /// Answer a node's marker payload with a fresh challenge. Returns `None`
    /// if the node terminated the stream without sending anything.
    pub async fn serve_node_stream(
        &self,
        stream: &mut dyn AttestationStream,
    ) -> AttestResult<Option<Session>> {
        self.flags.require(Flag::UnifiedIdentity)?;
        match stream.recv().await? {
            None => Ok(None),
            Some(AttestFrame::Payload(payload)) if payload == UNIFIED_IDENTITY_PAYLOAD => {
                let session = self.sessions.issue_challenge()?;
                let encoded = serde_json::to_vec(&session)
                    .map_err(|e| AttestError::serialization("encoding challenge", e))?;
                stream.send(AttestFrame::Challenge(encoded)).await?;
                Ok(Some(session))
            }
            Some(other) => Err(AttestError::invalid_attestation(format!(
                "unexpected frame on attestation stream: {other:?}"
            ))),
        }
    }

    /// Binding, signature and quote checks run before the session is consumed;
    /// the verifier call runs after, so a session backs exactly one verification
    /// attempt whatever its outcome.
    pub async fn attest(&self, request: AttestRequest) -> AttestResult<Credential> {
        self.flags.require(Flag::UnifiedIdentity)?;
        let bundle = request.bundle;

        let session = self.sessions.get(bundle.session_id())?;
        bundle.check_binding(&session, &self.required_rings)?;
        bundle.verify_signature()?;
        bundle.verify_quotes()?;

        let consumed = self.sessions.consume(bundle.session_id())?;
        let claims = match self.verifier.verify_evidence(&bundle).await {
            Ok(claims) => claims,
            Err(e) => {
                tracing::error!(session_id = consumed.session_id(), error = %e, "verification failed");
                return Err(e);
            }
        };

        let verdict = self.policy.evaluate(&claims);
        let innermost = bundle
            .evidence()
            .last()
            .ok_or_else(|| AttestError::IncompleteBundle {
                missing: self.required_rings.iter().map(|r| r.to_string()).collect(),
            })?;

        self.issuer.issue(
            consumed,
            &verdict,
            &claims,
            IssueRequest {
                ring: innermost.ring(),
                node_id: bundle.node_id().to_string(),
                parent_id: None,
                key_source: KeySource::TpmAppKey,
                workload_public_key_pem: None,
                attestation: Some(SovereignAttestation::from_bundle(&bundle)?),
                metadata: innermost.extra_metadata().clone(),
            },
        )
    }
}

/// Node-side driver.
pub struct AgentAttestor {
    attestor: Arc<dyn NodeAttestor>,
    collector: EvidenceCollector,
    bundler: Bundler,
}

impl AgentAttestor {
    pub fn new(attestor: Arc<dyn NodeAttestor>, collector: EvidenceCollector, bundler: Bundler) -> Self {
        Self {
            attestor,
            collector,
            bundler,
        }
    }

    /// Trigger the flow and wait for the server's challenge.
    pub async fn request_challenge(&self, stream: &mut dyn AttestationStream) -> AttestResult<Session> {
        self.attestor.aid_attestation(stream).await?;
        match stream.recv().await? {
            Some(AttestFrame::Challenge(bytes)) => serde_json::from_slice(&bytes)
                .map_err(|e| AttestError::serialization("decoding challenge", e)),
            Some(AttestFrame::Payload(_)) => Err(AttestError::invalid_attestation(
                "expected a challenge, got a payload frame",
            )),
            None => Err(AttestError::internal("stream terminated before a challenge arrived")),
        }
    }

    /// Collect every required ring against `session` and seal the result for
    /// `node_id`.
    pub async fn build_bundle(&self, session: &Session, node_id: &str) -> AttestResult<EvidenceBundle> {
        let mut evidence = Vec::with_capacity(self.bundler.required().len());
        for ring in self.bundler.required() {
            evidence.push(self.collector.collect(session, *ring).await?);
        }
        self.bundler.seal(&session.session_id, node_id, evidence).await
    }
}
