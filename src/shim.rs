//! Node-attestation shim and strategy registry
//!
//! The shim performs no local verification. It only tells the server side to
//! take the out-of-band evidence flow; the decision is made there.

use crate::errors::{AttestError, AttestResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const UNIFIED_IDENTITY_PLUGIN: &str = "unified_identity";
pub const UNIFIED_IDENTITY_PAYLOAD: &[u8] = b"unified_identity";

/// One message on the bidirectional attestation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestFrame {
    /// Attestation data sent by the node.
    Payload(Vec<u8>),
    /// Challenge sent back by the server.
    Challenge(Vec<u8>),
}

#[async_trait]
pub trait AttestationStream: Send {
    async fn send(&mut self, frame: AttestFrame) -> AttestResult<()>;

    /// `None` once the peer has terminated the stream.
    async fn recv(&mut self) -> AttestResult<Option<AttestFrame>>;
}

/// In-process stream endpoint over tokio channels.
pub struct ChannelStream {
    tx: mpsc::Sender<AttestFrame>,
    rx: mpsc::Receiver<AttestFrame>,
}

impl ChannelStream {
    /// Two connected endpoints.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

#[async_trait]
impl AttestationStream for ChannelStream {
    async fn send(&mut self, frame: AttestFrame) -> AttestResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| AttestError::internal("attestation stream closed by peer"))
    }

    async fn recv(&mut self) -> AttestResult<Option<AttestFrame>> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
pub trait NodeAttestor: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, config: &str) -> AttestResult<()>;

    async fn aid_attestation(&self, stream: &mut dyn AttestationStream) -> AttestResult<()>;
}

#[derive(Debug, Default)]
pub struct UnifiedIdentityAttestor;

#[async_trait]
impl NodeAttestor for UnifiedIdentityAttestor {
    fn name(&self) -> &str {
        UNIFIED_IDENTITY_PLUGIN
    }

    /// No options are required; anything supplied is ignored.
    fn configure(&self, _config: &str) -> AttestResult<()> {
        Ok(())
    }

    /// Send the marker payload once. A send failure is returned as is.
    async fn aid_attestation(&self, stream: &mut dyn AttestationStream) -> AttestResult<()> {
        stream
            .send(AttestFrame::Payload(UNIFIED_IDENTITY_PAYLOAD.to_vec()))
            .await?;
        tracing::debug!(plugin = UNIFIED_IDENTITY_PLUGIN, "marker payload sent");
        Ok(())
    }
}

pub type AttestorFactory = fn() -> Arc<dyn NodeAttestor>;

/// Maps configured strategy names to attestor constructors. Populated at
/// startup; selection happens once.
#[derive(Clone, Default)]
pub struct AttestorRegistry {
    factories: BTreeMap<String, AttestorFactory>,
}

impl AttestorRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register(UNIFIED_IDENTITY_PLUGIN, || {
            Arc::new(UnifiedIdentityAttestor) as Arc<dyn NodeAttestor>
        });
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: AttestorFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build and configure the named attestor.
    pub fn select(&self, name: &str, config: &str) -> AttestResult<Arc<dyn NodeAttestor>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            AttestError::config(format!(
                "unknown node attestor {name:?}, known: {:?}",
                self.names()
            ))
        })?;
        let attestor = factory();
        attestor.configure(config)?;
        tracing::info!(attestor = name, "node attestor selected");
        Ok(attestor)
    }
}
