//! Error taxonomy for the attestation pipeline
//!
//! Every fallible operation in the crate returns [`AttestResult`]. Variants are
//! grouped by how a caller is expected to react: transport failures may be
//! retried with a fresh challenge, binding and verification failures are
//! always fail-closed, configuration failures are fatal.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the attestation pipeline
#[derive(Error, Debug)]
pub enum AttestError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Key material error: {message}")]
    KeyMaterial { message: String },

    #[error("unknown feature flag(s): {names:?}")]
    UnknownFeatureFlag { names: Vec<String> },

    #[error("feature flags have already been loaded")]
    FlagsAlreadyLoaded,

    #[error("feature flags have not been loaded")]
    FlagsNotLoaded,

    #[error("feature flag {flag} is not enabled")]
    FeatureDisabled { flag: String },

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("session {session_id} has expired")]
    SessionExpired { session_id: String },

    #[error("session {session_id} has already been consumed")]
    SessionConsumed { session_id: String },

    #[error("incomplete evidence bundle: missing {missing:?}")]
    IncompleteBundle { missing: Vec<String> },

    #[error("session mismatch: expected {expected}, found {found}")]
    SessionMismatch { expected: String, found: String },

    #[error("evidence binding failed for ring {ring}: {message}")]
    Binding { ring: String, message: String },

    #[error("invalid attestation: {message}")]
    InvalidAttestation { message: String },

    #[error("verifier returned status {status}: {body}")]
    VerifierStatus { status: u16, body: String },

    #[error("verification failed: {reason}")]
    VerificationFailed { reason: String },

    #[error("identity issuance denied by policy: {reason}")]
    PolicyDenied { reason: String },

    #[error("Network operation failed: {operation}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} timed out after {budget:?}")]
    Timeout { operation: String, budget: Duration },

    #[error("Signing gateway error: {message}")]
    Gateway { message: String },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Result with AttestError
pub type AttestResult<T> = Result<T, AttestError>;

impl AttestError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a key material error
    pub fn key_material(message: impl Into<String>) -> Self {
        Self::KeyMaterial {
            message: message.into(),
        }
    }

    pub fn feature_disabled(flag: impl Into<String>) -> Self {
        Self::FeatureDisabled { flag: flag.into() }
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    pub fn session_expired(session_id: impl Into<String>) -> Self {
        Self::SessionExpired {
            session_id: session_id.into(),
        }
    }

    pub fn session_consumed(session_id: impl Into<String>) -> Self {
        Self::SessionConsumed {
            session_id: session_id.into(),
        }
    }

    pub fn session_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::SessionMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an evidence binding error for a ring
    pub fn binding(ring: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Binding {
            ring: ring.into(),
            message: message.into(),
        }
    }

    pub fn invalid_attestation(message: impl Into<String>) -> Self {
        Self::InvalidAttestation {
            message: message.into(),
        }
    }

    /// Create a verification rejection error
    pub fn verification_failed(reason: impl Into<String>) -> Self {
        Self::VerificationFailed {
            reason: reason.into(),
        }
    }

    pub fn policy_denied(reason: impl Into<String>) -> Self {
        Self::PolicyDenied {
            reason: reason.into(),
        }
    }

    /// Create a network error
    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            operation: operation.into(),
            source,
        }
    }

    pub fn timeout(operation: impl Into<String>, budget: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            budget,
        }
    }

    /// Create a signing gateway error
    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Transport failures are the only ones a caller may retry, and only with
    /// a freshly issued challenge.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::Gateway { .. }
        )
    }

    /// Binding and verification failures that must deny issuance outright.
    pub fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound { .. }
                | Self::SessionExpired { .. }
                | Self::SessionConsumed { .. }
                | Self::IncompleteBundle { .. }
                | Self::SessionMismatch { .. }
                | Self::Binding { .. }
                | Self::VerifierStatus { .. }
                | Self::VerificationFailed { .. }
                | Self::PolicyDenied { .. }
        )
    }
}

#[derive(Serialize)]
struct ErrBody {
    error: String,
}

impl IntoResponse for AttestError {
    fn into_response(self) -> Response {
        let status = match self {
            AttestError::InvalidAttestation { .. }
            | AttestError::Serialization { .. }
            | AttestError::IncompleteBundle { .. }
            | AttestError::SessionMismatch { .. }
            | AttestError::Binding { .. } => StatusCode::BAD_REQUEST,
            AttestError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            AttestError::SessionExpired { .. } | AttestError::SessionConsumed { .. } => {
                StatusCode::CONFLICT
            }
            AttestError::VerificationFailed { .. } | AttestError::PolicyDenied { .. } => {
                StatusCode::FORBIDDEN
            }
            AttestError::FeatureDisabled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AttestError::VerifierStatus { .. }
            | AttestError::Network { .. }
            | AttestError::Gateway { .. } => StatusCode::BAD_GATEWAY,
            AttestError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AttestError::Config { .. }
            | AttestError::KeyMaterial { .. }
            | AttestError::UnknownFeatureFlag { .. }
            | AttestError::FlagsAlreadyLoaded
            | AttestError::FlagsNotLoaded
            | AttestError::MutexPoisoned { .. }
            | AttestError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ErrBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Helper trait for safe mutex operations
///
/// Returns an error on a poisoned lock instead of panicking.
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> AttestResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> AttestResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| AttestError::MutexPoisoned {
            resource: "mutex".to_string(),
        })
    }
}

/// Helper trait for safe RwLock read operations
pub trait SafeReadLock<T: ?Sized> {
    fn safe_read(&self) -> AttestResult<std::sync::RwLockReadGuard<'_, T>>;
}

impl<T: ?Sized> SafeReadLock<T> for std::sync::RwLock<T> {
    fn safe_read(&self) -> AttestResult<std::sync::RwLockReadGuard<'_, T>> {
        self.read().map_err(|_| AttestError::MutexPoisoned {
            resource: "rwlock_read".to_string(),
        })
    }
}

/// Helper trait for safe RwLock write operations
pub trait SafeWriteLock<T: ?Sized> {
    fn safe_write(&self) -> AttestResult<std::sync::RwLockWriteGuard<'_, T>>;
}

impl<T: ?Sized> SafeWriteLock<T> for std::sync::RwLock<T> {
    fn safe_write(&self) -> AttestResult<std::sync::RwLockWriteGuard<'_, T>> {
        self.write().map_err(|_| AttestError::MutexPoisoned {
            resource: "rwlock_write".to_string(),
        })
    }
}

/// Convert from serde_json errors
impl From<serde_json::Error> for AttestError {
    fn from(err: serde_json::Error) -> Self {
        AttestError::serialization("json_operation", err)
    }
}

/// Convert from reqwest errors
impl From<reqwest::Error> for AttestError {
    fn from(err: reqwest::Error) -> Self {
        AttestError::network("http_request", err)
    }
}

/// Convert from figment errors
impl From<figment::Error> for AttestError {
    fn from(err: figment::Error) -> Self {
        AttestError::config(err.to_string())
    }
}
