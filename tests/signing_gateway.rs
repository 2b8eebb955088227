//! Integration tests for the HTTP signing gateway binding.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::json;
use sovereign_identity::errors::AttestError;
use sovereign_identity::signer::{DelegatedSigner, HttpSigningGateway, SignerOptions};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const APP_KEY_PUB_PEM: &str = include_str!("fixtures/app_key.pub.pem");

fn signer_for(mock_server: &MockServer) -> DelegatedSigner {
    let gateway = HttpSigningGateway::new(mock_server.uri()).expect("gateway");
    DelegatedSigner::new(Arc::new(gateway), APP_KEY_PUB_PEM).expect("signer")
}

#[tokio::test]
async fn test_pkcs1v15_request_shape() {
    let mock_server = MockServer::start().await;
    let digest = [0x11u8; 32];

    Mock::given(method("POST"))
        .and(path("/sign-data"))
        .and(body_json(json!({
            "data": B64.encode(digest),
            "hash_alg": "sha256",
            "is_digest": true,
            "scheme": "rsassa",
            "salt_length": -1
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "signature": B64.encode([0xCDu8; 256])
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let signature = signer_for(&mock_server)
        .sign(&digest, &SignerOptions::default())
        .await
        .expect("sign");
    assert_eq!(signature, vec![0xCDu8; 256]);
}

#[tokio::test]
async fn test_pss_request_forwards_salt() {
    let mock_server = MockServer::start().await;
    let digest = [0x22u8; 48];

    Mock::given(method("POST"))
        .and(path("/sign-data"))
        .and(body_json(json!({
            "data": B64.encode(digest),
            "hash_alg": "sha384",
            "is_digest": true,
            "scheme": "rsapss",
            "salt_length": 48
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "signature": B64.encode([1u8; 256])
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    signer_for(&mock_server)
        .sign(&digest, &SignerOptions::pss("SHA-384", 48))
        .await
        .expect("sign");
}

#[tokio::test]
async fn test_gateway_failure_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sign-data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "error" })))
        .mount(&mock_server)
        .await;

    let err = signer_for(&mock_server)
        .sign(&[0u8; 32], &SignerOptions::sha256())
        .await
        .unwrap_err();
    assert!(matches!(err, AttestError::Gateway { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_gateway_http_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sign-data"))
        .respond_with(ResponseTemplate::new(503).set_body_string("tpm busy"))
        .mount(&mock_server)
        .await;

    let err = signer_for(&mock_server)
        .sign(&[0u8; 32], &SignerOptions::sha256())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn test_slow_gateway_times_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sign-data"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "status": "success", "signature": "" }))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&mock_server)
        .await;

    let err = signer_for(&mock_server)
        .with_timeout(Duration::from_millis(100))
        .sign(&[0u8; 32], &SignerOptions::sha256())
        .await
        .unwrap_err();
    assert!(matches!(err, AttestError::Timeout { .. }));
}
