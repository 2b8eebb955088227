//! Integration tests for VerifierClient against a mocked verifier.

mod common;

use serde_json::json;
use sovereign_identity::claims::HostIntegrityStatus;
use sovereign_identity::errors::AttestError;
use sovereign_identity::evidence::Ring;
use sovereign_identity::session::SessionManager;
use sovereign_identity::verifier::{EvidenceVerifier, VerifierClient, VERIFY_EVIDENCE_PATH};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn verified_body() -> serde_json::Value {
    json!({
        "results": {
            "verified": true,
            "verification_details": {
                "app_key_certificate_valid": true,
                "quote_signature_valid": true,
                "nonce_valid": true
            },
            "attested_claims": {
                "geolocation": "Spain: N40.4168, W3.7038",
                "host_integrity_status": "passed_all_checks",
                "gpu_metrics_health": { "status": "healthy", "utilization_pct": 15.0, "memory_mb": 10240 }
            },
            "audit_id": "audit-42"
        }
    })
}

#[tokio::test]
async fn test_verify_evidence_success() {
    let mock_server = MockServer::start().await;
    let session = SessionManager::default().issue_challenge().expect("issue");
    let bundle = common::sealed_bundle(&session, "edge-node-03", &[Ring::Host, Ring::Vm]).await;

    Mock::given(method("POST"))
        .and(path(VERIFY_EVIDENCE_PATH))
        .and(body_partial_json(json!({
            "data": { "hash_alg": "sha256", "nonce": hex::encode(&session.nonce_host) },
            "metadata": { "submission_type": "PoR/tpm-app-key" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(verified_body()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = VerifierClient::new(mock_server.uri()).expect("client");
    let claims = client.verify_evidence(&bundle).await.expect("claims");

    assert_eq!(claims.geolocation, "Spain: N40.4168, W3.7038");
    assert_eq!(claims.host_integrity_status, HostIntegrityStatus::PassedAllChecks);
    assert_eq!(claims.gpu_metrics_health.expect("gpu").utilization_pct, 15.0);
    assert_eq!(claims.audit_id, "audit-42");
}

#[tokio::test]
async fn test_verify_evidence_status_500() {
    let mock_server = MockServer::start().await;
    let session = SessionManager::default().issue_challenge().expect("issue");
    let bundle = common::sealed_bundle(&session, "edge-node-03", &[Ring::Host]).await;

    Mock::given(method("POST"))
        .and(path(VERIFY_EVIDENCE_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&mock_server)
        .await;

    let client = VerifierClient::new(mock_server.uri()).expect("client");
    let err = client.verify_evidence(&bundle).await.unwrap_err();

    assert!(err.to_string().contains("status 500"), "got: {err}");
    assert!(matches!(err, AttestError::VerifierStatus { status: 500, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_verify_evidence_not_verified() {
    let mock_server = MockServer::start().await;
    let session = SessionManager::default().issue_challenge().expect("issue");
    let bundle = common::sealed_bundle(&session, "edge-node-03", &[Ring::Host]).await;

    Mock::given(method("POST"))
        .and(path(VERIFY_EVIDENCE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": { "verified": false, "verification_details": { "nonce_valid": false }, "audit_id": "audit-43" }
        })))
        .mount(&mock_server)
        .await;

    let client = VerifierClient::new(mock_server.uri()).expect("client");
    let result = client.verify_evidence(&bundle).await;

    assert!(matches!(result, Err(AttestError::VerificationFailed { .. })));
}

#[tokio::test]
async fn test_verify_evidence_undecodable_body_fails_closed() {
    let session = SessionManager::default().issue_challenge().expect("issue");
    let bundle = common::sealed_bundle(&session, "edge-node-03", &[Ring::Host]).await;

    for template in [
        ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" })),
        ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"),
    ] {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(VERIFY_EVIDENCE_PATH))
            .respond_with(template)
            .mount(&mock_server)
            .await;

        let client = VerifierClient::new(mock_server.uri()).expect("client");
        let err = client.verify_evidence(&bundle).await.unwrap_err();

        assert!(matches!(err, AttestError::VerificationFailed { .. }), "got: {err}");
        assert!(err.is_fail_closed());
        assert!(!err.is_transient());
    }
}

#[tokio::test]
async fn test_verify_evidence_respects_budget() {
    let mock_server = MockServer::start().await;
    let session = SessionManager::default().issue_challenge().expect("issue");
    let bundle = common::sealed_bundle(&session, "edge-node-03", &[Ring::Host]).await;

    Mock::given(method("POST"))
        .and(path(VERIFY_EVIDENCE_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(verified_body())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&mock_server)
        .await;

    let client = VerifierClient::new(mock_server.uri()).expect("client");
    let started = std::time::Instant::now();
    let err = client
        .verify_evidence_within(&bundle, Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, AttestError::Timeout { .. }));
    assert!(err.is_transient());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_unreachable_verifier_is_transient() {
    let session = SessionManager::default().issue_challenge().expect("issue");
    let bundle = common::sealed_bundle(&session, "edge-node-03", &[Ring::Host]).await;

    let client = VerifierClient::new("http://127.0.0.1:1").expect("client");
    let err = client.verify_evidence(&bundle).await.unwrap_err();
    assert!(matches!(err, AttestError::Network { .. }));
    assert!(err.is_transient());
}
