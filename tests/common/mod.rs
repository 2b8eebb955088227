// tests/common/mod.rs
// Fixture signer and bundle construction shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::Sha256;
use sovereign_identity::bundle::{Bundler, EvidenceBundle};
use sovereign_identity::errors::{AttestError, AttestResult};
use sovereign_identity::evidence::{
    EvidenceCollector, GatewayQuoter, MeasuredState, Ring, StaticMeasurements,
};
use sovereign_identity::session::Session;
use sovereign_identity::signer::{DelegatedSigner, SignRequest, SignatureScheme, SigningGateway};
use std::sync::Arc;

pub const APP_KEY_PEM: &str = include_str!("../fixtures/app_key.pem");
pub const APP_KEY_PUB_PEM: &str = include_str!("../fixtures/app_key.pub.pem");

pub struct FixtureGateway(RsaPrivateKey);

#[async_trait]
impl SigningGateway for FixtureGateway {
    async fn sign(&self, request: &SignRequest) -> AttestResult<Vec<u8>> {
        if request.scheme != SignatureScheme::Pkcs1v15 {
            return Err(AttestError::gateway("fixture gateway only signs rsassa"));
        }
        self.0
            .sign(Pkcs1v15Sign::new::<Sha256>(), &request.digest)
            .map_err(|e| AttestError::gateway(e.to_string()))
    }
}

pub fn fixture_signer() -> Arc<DelegatedSigner> {
    let key = RsaPrivateKey::from_pkcs8_pem(APP_KEY_PEM).expect("fixture key");
    Arc::new(DelegatedSigner::new(Arc::new(FixtureGateway(key)), APP_KEY_PUB_PEM).expect("signer"))
}

pub async fn sealed_bundle(session: &Session, node_id: &str, rings: &[Ring]) -> EvidenceBundle {
    let signer = fixture_signer();
    let mut collector = EvidenceCollector::new(Arc::new(GatewayQuoter::new(Arc::clone(&signer))));
    for ring in rings {
        let state = MeasuredState {
            image_id: format!("{ring}-image"),
            ..MeasuredState::default()
        };
        collector = collector.with_source(*ring, Arc::new(StaticMeasurements(state)));
    }
    let mut evidence = Vec::new();
    for ring in rings {
        evidence.push(collector.collect(session, *ring).await.expect("collect"));
    }
    Bundler::new(signer, rings.iter().copied())
        .seal(&session.session_id, node_id, evidence)
        .await
        .expect("seal")
}
