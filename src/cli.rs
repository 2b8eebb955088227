use crate::attestation::{AgentAttestor, AttestRequest, AttestationService};
use crate::bundle::Bundler;
use crate::claims::AttestedClaims;
use crate::config::{load_config, IdentityConfig};
use crate::errors::{AttestError, AttestResult};
use crate::evidence::{EvidenceCollector, GatewayQuoter, MeasuredState, Ring, StaticMeasurements};
use crate::feature_flags::{FeatureFlags, Flag};
use crate::identity::{Credential, IdentityIssuer};
use crate::policy::{evaluate, PolicyEngine};
use crate::server::{serve, spawn_session_reaper};
use crate::session::{Session, SessionManager};
use crate::shim::AttestorRegistry;
use crate::signer::{DelegatedSigner, HttpSigningGateway};
use crate::verifier::VerifierClient;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level CLI for the attestation service
#[derive(Parser)]
#[command(
    name = "sovereign-identity",
    version,
    about = "Hardware-rooted attestation and policy-gated identity issuance"
)]
pub struct Cli {
    /// Configuration file; defaults to ./sovereign.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the attestation HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Evaluate the configured policy against a claims JSON file
    Evaluate {
        #[arg(long)]
        claims: PathBuf,
    },

    /// Print the effective feature flags
    Flags,

    /// Attest this node against a running server
    Attest {
        /// Base URL of the attestation server
        #[arg(long)]
        server: String,
        #[arg(long)]
        node_id: String,
        /// PEM public key of the hardware-resident app key
        #[arg(long)]
        app_key: PathBuf,
        /// JSON object mapping ring name to its measured state
        #[arg(long)]
        measurements: PathBuf,
    },
}

pub async fn run(cli: Cli) -> AttestResult<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve { host, port } => run_serve(config, host, port).await,
        Commands::Evaluate { claims } => run_evaluate(&config, &claims),
        Commands::Flags => run_flags(&config),
        Commands::Attest {
            server,
            node_id,
            app_key,
            measurements,
        } => run_attest(&config, &server, node_id, &app_key, &measurements).await,
    }
}

/// Wire the server-side service from configuration.
pub fn build_service(config: &IdentityConfig) -> AttestResult<AttestationService> {
    let flags = Arc::new(FeatureFlags::from_config(config.feature_flags.as_slice())?);
    let sessions = Arc::new(SessionManager::new(config.session_ttl()));
    let verifier =
        VerifierClient::new(&config.verifier.base_url)?.with_timeout(config.verifier_timeout());
    let issuer = IdentityIssuer::new(&config.issuer.trust_domain, config.svid_ttl())?;

    Ok(AttestationService::new(
        flags,
        sessions,
        Arc::new(verifier),
        PolicyEngine::new(config.policy.clone()),
        issuer,
    )
    .with_required_rings(config.session.required_rings.iter().copied()))
}

async fn run_serve(mut config: IdentityConfig, host: Option<String>, port: Option<u16>) -> AttestResult<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let attestor = AttestorRegistry::with_builtins().select(&config.node_attestor, "")?;
    let service = Arc::new(build_service(&config)?);
    if !service.flags().is_set(Flag::UnifiedIdentity) {
        tracing::warn!("Unified-Identity is disabled; attestation requests will be refused");
    }
    tracing::info!(
        node_attestor = attestor.name(),
        trust_domain = %config.issuer.trust_domain,
        verifier = %config.verifier.base_url,
        "starting attestation service"
    );

    spawn_session_reaper(Arc::clone(service.sessions()), config.session_ttl());
    serve(config.server.socket_addr()?, service).await
}

fn run_evaluate(config: &IdentityConfig, path: &Path) -> AttestResult<()> {
    let raw = read_file(path)?;
    let claims: AttestedClaims = serde_json::from_str(&raw)
        .map_err(|e| AttestError::serialization(format!("parsing {}", path.display()), e))?;
    let result = evaluate(&claims, &config.policy, &[]);
    let out = serde_json::to_string_pretty(&result)?;
    println!("{out}");
    Ok(())
}

fn run_flags(config: &IdentityConfig) -> AttestResult<()> {
    let flags = FeatureFlags::from_config(config.feature_flags.as_slice())?;
    for flag in Flag::ALL {
        let state = if flags.is_set(flag) { "on" } else { "off" };
        println!("{flag}: {state}");
    }
    Ok(())
}

async fn run_attest(
    config: &IdentityConfig,
    server: &str,
    node_id: String,
    app_key: &Path,
    measurements: &Path,
) -> AttestResult<()> {
    let server = server.trim_end_matches('/');
    let public_key_pem = read_file(app_key)?;
    let gateway = Arc::new(HttpSigningGateway::new(&config.gateway.endpoint)?);
    let signer = Arc::new(
        DelegatedSigner::new(gateway, &public_key_pem)?.with_timeout(config.gateway_timeout()),
    );

    let raw = read_file(measurements)?;
    let states: BTreeMap<Ring, MeasuredState> = serde_json::from_str(&raw)
        .map_err(|e| AttestError::serialization(format!("parsing {}", measurements.display()), e))?;
    let mut collector = EvidenceCollector::new(Arc::new(GatewayQuoter::new(Arc::clone(&signer))));
    for (ring, state) in states {
        collector = collector.with_source(ring, Arc::new(StaticMeasurements(state)));
    }

    let attestor = AttestorRegistry::with_builtins().select(&config.node_attestor, "")?;
    let agent = AgentAttestor::new(
        attestor,
        collector,
        Bundler::new(signer, config.session.required_rings.iter().copied()),
    );

    let http = reqwest::Client::new();
    let session: Session = http
        .post(format!("{server}/v1/challenge"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let bundle = agent.build_bundle(&session, &node_id).await?;

    let resp = http
        .post(format!("{server}/v1/attest"))
        .json(&AttestRequest { bundle })
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AttestError::internal(format!(
            "attestation rejected with status {}: {body}",
            status.as_u16()
        )));
    }
    let credential: Credential = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&credential)?);
    Ok(())
}

fn read_file(path: &Path) -> AttestResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| AttestError::config(format!("failed to read {}: {e}", path.display())))
}
