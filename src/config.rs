//! Layered runtime configuration
//!
//! Defaults, then `sovereign.toml` (or an explicit file), then `SOVEREIGN_*`
//! environment variables with `__` separating nested keys, e.g.
//! `SOVEREIGN_VERIFIER__BASE_URL`.

use crate::errors::{AttestError, AttestResult};
use crate::evidence::Ring;
use crate::policy::PolicyConfig;
use crate::shim::UNIFIED_IDENTITY_PLUGIN;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "sovereign.toml";
pub const ENV_PREFIX: &str = "SOVEREIGN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub feature_flags: Vec<String>,
    pub node_attestor: String,
    pub session: SessionSettings,
    pub verifier: VerifierSettings,
    pub gateway: GatewaySettings,
    pub issuer: IssuerSettings,
    pub policy: PolicyConfig,
    pub server: ServerSettings,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            feature_flags: vec!["Unified-Identity".to_string()],
            node_attestor: UNIFIED_IDENTITY_PLUGIN.to_string(),
            session: SessionSettings::default(),
            verifier: VerifierSettings::default(),
            gateway: GatewaySettings::default(),
            issuer: IssuerSettings::default(),
            policy: PolicyConfig::default(),
            server: ServerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub ttl_secs: u64,
    pub required_rings: Vec<Ring>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            required_rings: vec![Ring::Host, Ring::Vm],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierSettings {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8881".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9050".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerSettings {
    pub trust_domain: String,
    pub svid_ttl_secs: u64,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            trust_domain: "example.org".to_string(),
            svid_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> AttestResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AttestError::config(format!("invalid listen address: {e}")))
    }
}

impl IdentityConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }

    pub fn verifier_timeout(&self) -> Duration {
        Duration::from_secs(self.verifier.timeout_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.timeout_secs)
    }

    pub fn svid_ttl(&self) -> Duration {
        Duration::from_secs(self.issuer.svid_ttl_secs)
    }

    pub fn validate(&self) -> AttestResult<()> {
        if self.issuer.trust_domain.trim().is_empty() {
            return Err(AttestError::config("issuer.trust_domain must be set"));
        }
        if self.session.ttl_secs == 0 {
            return Err(AttestError::config("session.ttl_secs must be non-zero"));
        }
        if self.session.required_rings.is_empty() {
            return Err(AttestError::config("session.required_rings must not be empty"));
        }
        if self.issuer.svid_ttl_secs == 0 {
            return Err(AttestError::config("issuer.svid_ttl_secs must be non-zero"));
        }
        if self.verifier.timeout_secs == 0 || self.gateway.timeout_secs == 0 {
            return Err(AttestError::config("network timeouts must be non-zero"));
        }
        check_absolute_url("verifier.base_url", &self.verifier.base_url)?;
        check_absolute_url("gateway.endpoint", &self.gateway.endpoint)?;
        if self.policy.min_gpu_utilization_pct > self.policy.max_gpu_utilization_pct {
            return Err(AttestError::config(
                "policy.min_gpu_utilization_pct exceeds policy.max_gpu_utilization_pct",
            ));
        }
        Ok(())
    }
}

fn check_absolute_url(field: &str, raw: &str) -> AttestResult<()> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| AttestError::config(format!("{field} {raw:?} is not a valid URL: {e}")))?;
    if url.host_str().is_none() {
        return Err(AttestError::config(format!("{field} {raw:?} has no host")));
    }
    Ok(())
}

/// Load and validate. `path` overrides the default `sovereign.toml`; a missing
/// file is not an error.
pub fn load_config(path: Option<&Path>) -> AttestResult<IdentityConfig> {
    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let config: IdentityConfig = Figment::from(Serialized::defaults(IdentityConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;

    config.validate()?;
    tracing::debug!(config_file = %file.display(), "configuration loaded");
    Ok(config)
}
