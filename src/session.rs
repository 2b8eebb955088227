//! Challenge issuance and single-use session consumption
//!
//! Sessions live in one table guarded by a mutex. Consumption is a
//! check-and-set under that lock, so of any number of concurrent consumers of
//! the same session exactly one succeeds.

use crate::errors::{AttestError, AttestResult, SafeLock};
use crate::evidence::Ring;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Length in bytes of each ring nonce.
pub const NONCE_LEN: usize = 32;

/// Default challenge lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);

/// Challenges are seconds-scale; anything longer is clamped to this.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(3600);

/// A freshness challenge covering the host and VM rings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    #[serde(with = "hex::serde")]
    pub nonce_host: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub nonce_vm: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl Session {
    /// Nonce a ring must bind into its quote. The workload ring is relayed by
    /// the VM agent and binds to the VM nonce.
    pub fn nonce_for(&self, ring: Ring) -> &[u8] {
        match ring {
            Ring::Host => &self.nonce_host,
            Ring::Vm | Ring::Workload => &self.nonce_vm,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Proof that a session was consumed by the current attestation attempt.
///
/// Only [`SessionManager::consume`] creates one, and identity issuance takes
/// it by value.
#[derive(Debug)]
pub struct ConsumedSession {
    session: Session,
}

impl ConsumedSession {
    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[derive(Debug)]
pub struct SessionManager {
    ttl: chrono::Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl.min(MAX_SESSION_TTL))
                .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh session with unpredictable nonces.
    pub fn issue_challenge(&self) -> AttestResult<Session> {
        let mut rng = rand::rng();
        let mut nonce_host = vec![0u8; NONCE_LEN];
        let mut nonce_vm = vec![0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce_host);
        rng.fill_bytes(&mut nonce_vm);

        let issued_at = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            nonce_host,
            nonce_vm,
            issued_at,
            expires_at: issued_at + self.ttl,
            consumed: false,
        };

        let mut sessions = self.sessions.safe_lock()?;
        sessions.insert(session.session_id.clone(), session.clone());
        tracing::debug!(
            session_id = %session.session_id,
            expires_at = %session.expires_at,
            "challenge issued"
        );
        Ok(session)
    }

    /// Look up a session that is still usable: present, unexpired and not yet
    /// consumed.
    pub fn get(&self, session_id: &str) -> AttestResult<Session> {
        let sessions = self.sessions.safe_lock()?;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AttestError::session_not_found(session_id))?;
        Self::check_usable(session, Utc::now())?;
        Ok(session.clone())
    }

    /// Atomically mark a session consumed.
    pub fn consume(&self, session_id: &str) -> AttestResult<ConsumedSession> {
        let mut sessions = self.sessions.safe_lock()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AttestError::session_not_found(session_id))?;
        Self::check_usable(session, Utc::now())?;

        session.consumed = true;
        tracing::info!(session_id, "session consumed");
        Ok(ConsumedSession {
            session: session.clone(),
        })
    }

    /// Drop every expired session, consumed or not. Returns how many were
    /// removed.
    pub fn purge_expired(&self) -> AttestResult<usize> {
        let now = Utc::now();
        let mut sessions = self.sessions.safe_lock()?;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        let purged = before - sessions.len();
        if purged > 0 {
            tracing::debug!(purged, "purged expired sessions");
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.sessions.safe_lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Expiry wins over consumption.
    fn check_usable(session: &Session, now: DateTime<Utc>) -> AttestResult<()> {
        if session.is_expired_at(now) {
            return Err(AttestError::session_expired(&session.session_id));
        }
        if session.consumed {
            return Err(AttestError::session_consumed(&session.session_id));
        }
        Ok(())
    }
}
