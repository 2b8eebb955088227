//! Library root for the `sovereign_identity` crate
//! Hardware-rooted attestation across host, VM and workload rings, with
//! policy-gated issuance of short-lived identities.

// Core error handling
pub mod errors;

// Configuration & process-wide flags
pub mod config;
pub mod feature_flags;

// Freshness challenges
pub mod session;

// Hardware-delegated signing
pub mod signer;

// Evidence collection & bundling
pub mod bundle;
pub mod evidence;

// Remote verification & claims
pub mod claims;
pub mod verifier;

// Decision & issuance
pub mod identity;
pub mod policy;

// Node-attestation boundary
pub mod shim;

// Orchestration, HTTP surface & CLI
pub mod attestation;
pub mod cli;
pub mod server;


pub use attestation::{AgentAttestor, AttestRequest, AttestationService};
pub use bundle::{Bundler, EvidenceBundle};
pub use claims::{AttestedClaims, GpuMetrics, HostIntegrityStatus};
pub use errors::{AttestError, AttestResult};
pub use evidence::{Evidence, Ring};
pub use identity::{Credential, IdentityIssuer};
pub use policy::{evaluate, PolicyConfig, PolicyResult};
pub use session::{Session, SessionManager};
pub use signer::{DelegatedSigner, SigningGateway};
