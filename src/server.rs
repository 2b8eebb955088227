use crate::attestation::{AttestRequest, AttestationService};
use crate::errors::{AttestError, AttestResult};
use crate::feature_flags::Flag;
use crate::identity::Credential;
use crate::session::{Session, SessionManager};
use axum::{
    extract::Extension,
    response::Json,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Router exposing challenge issuance, attestation and health.
pub fn build_router(service: Arc<AttestationService>) -> Router {
    Router::new()
        .route("/v1/challenge", post(challenge))
        .route("/v1/attest", post(attest))
        .route("/healthz", get(healthz))
        .layer(Extension(service))
        .layer(TraceLayer::new_for_http())
}

async fn challenge(
    Extension(service): Extension<Arc<AttestationService>>,
) -> Result<Json<Session>, AttestError> {
    service.challenge().map(Json)
}

async fn attest(
    Extension(service): Extension<Arc<AttestationService>>,
    Json(req): Json<AttestRequest>,
) -> Result<Json<Credential>, AttestError> {
    service.attest(req).await.map(Json)
}

async fn healthz(Extension(service): Extension<Arc<AttestationService>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "unified_identity": service.flags().is_set(Flag::UnifiedIdentity),
        "open_sessions": service.sessions().len(),
    }))
}

/// Periodically drop expired sessions.
pub fn spawn_session_reaper(sessions: Arc<SessionManager>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = sessions.purge_expired() {
                tracing::error!(error = %e, "session purge failed");
            }
        }
    })
}

pub async fn serve(addr: SocketAddr, service: Arc<AttestationService>) -> AttestResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AttestError::config(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "attestation server listening");
    axum::serve(listener, build_router(service))
        .await
        .map_err(|e| AttestError::internal(format!("server error: {e}")))
}
