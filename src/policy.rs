//! Policy decision engine
//!
//! [`evaluate`] is a pure function of its inputs. Checks run in a fixed order
//! and the first failure decides the result:
//!
//! 1. geolocation against the allow-list
//! 2. host integrity status
//! 3. GPU health, then the utilization and memory bounds when metrics exist
//! 4. caller-supplied rules, in the order given
//!
//! A denial is an ordinary [`PolicyResult`], not an error.

use crate::claims::{AttestedClaims, HostIntegrityStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const HEALTHY_GPU_STATUS: &str = "healthy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Exact values or `"Country: *"` patterns. Empty allows any location.
    pub allowed_geolocations: BTreeSet<String>,
    pub require_healthy_gpu: bool,
    pub required_integrity_status: HostIntegrityStatus,
    pub min_gpu_utilization_pct: f64,
    pub max_gpu_utilization_pct: f64,
    pub min_gpu_memory_mb: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_geolocations: BTreeSet::from(["Spain: *".to_string()]),
            require_healthy_gpu: true,
            required_integrity_status: HostIntegrityStatus::PassedAllChecks,
            min_gpu_utilization_pct: 0.0,
            max_gpu_utilization_pct: 100.0,
            min_gpu_memory_mb: 0,
        }
    }
}

/// Outcome of one evaluation. Fields are private so a result cannot be
/// altered once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    allowed: bool,
    reason: String,
}

impl PolicyResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "all policy checks passed".to_string(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for PolicyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.allowed { "allow" } else { "deny" };
        write!(f, "{verdict}: {}", self.reason)
    }
}

/// An additional predicate that may veto an otherwise passing evaluation.
pub trait PolicyRule: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(reason)` vetoes.
    fn check(&self, claims: &AttestedClaims) -> Result<(), String>;
}

/// Adapts a closure into a [`PolicyRule`].
pub struct FnRule<F> {
    name: String,
    check: F,
}

impl<F> FnRule<F>
where
    F: Fn(&AttestedClaims) -> Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> PolicyRule for FnRule<F>
where
    F: Fn(&AttestedClaims) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, claims: &AttestedClaims) -> Result<(), String> {
        (self.check)(claims)
    }
}

/// Exact match, or a `"Country: *"` / `"Country:*"` wildcard matching any
/// value that starts with `"Country:"`. Both sides are trimmed.
pub fn matches_geolocation(geolocation: &str, pattern: &str) -> bool {
    let geolocation = geolocation.trim();
    let pattern = pattern.trim();
    if geolocation == pattern {
        return true;
    }
    let prefix = pattern
        .strip_suffix(": *")
        .or_else(|| pattern.strip_suffix(":*"));
    match prefix {
        Some(country) => geolocation
            .strip_prefix(country.trim_end())
            .is_some_and(|rest| rest.starts_with(':')),
        None => false,
    }
}

pub fn evaluate(
    claims: &AttestedClaims,
    config: &PolicyConfig,
    extra_rules: &[&dyn PolicyRule],
) -> PolicyResult {
    tracing::debug!(
        geolocation = %claims.geolocation,
        integrity_status = %claims.host_integrity_status,
        has_gpu_metrics = claims.gpu_metrics_health.is_some(),
        "evaluating policy"
    );

    let result = check_builtin(claims, config).and_then(|()| {
        extra_rules.iter().try_for_each(|rule| {
            rule.check(claims)
                .map_err(|reason| format!("rule {} vetoed: {reason}", rule.name()))
        })
    });

    match result {
        Ok(()) => {
            tracing::info!(audit_id = %claims.audit_id, "policy evaluation passed");
            PolicyResult::allow()
        }
        Err(reason) => {
            tracing::warn!(audit_id = %claims.audit_id, %reason, "policy violation");
            PolicyResult::deny(reason)
        }
    }
}

fn check_builtin(claims: &AttestedClaims, config: &PolicyConfig) -> Result<(), String> {
    if !config.allowed_geolocations.is_empty()
        && !config
            .allowed_geolocations
            .iter()
            .any(|pattern| matches_geolocation(&claims.geolocation, pattern))
    {
        return Err(format!("geolocation {} not in allowed list", claims.geolocation));
    }

    if claims.host_integrity_status != config.required_integrity_status {
        return Err(format!(
            "host integrity status is {}, required {}",
            claims.host_integrity_status, config.required_integrity_status
        ));
    }

    match &claims.gpu_metrics_health {
        None if config.require_healthy_gpu => Err("GPU metrics absent, required healthy".to_string()),
        None => Ok(()),
        Some(gpu) => {
            if config.require_healthy_gpu && gpu.status != HEALTHY_GPU_STATUS {
                return Err(format!("GPU status is {}, required healthy", gpu.status));
            }
            if gpu.utilization_pct < config.min_gpu_utilization_pct {
                return Err(format!(
                    "GPU utilization {:.2}% below minimum {:.2}%",
                    gpu.utilization_pct, config.min_gpu_utilization_pct
                ));
            }
            if gpu.utilization_pct > config.max_gpu_utilization_pct {
                return Err(format!(
                    "GPU utilization {:.2}% above maximum {:.2}%",
                    gpu.utilization_pct, config.max_gpu_utilization_pct
                ));
            }
            if gpu.memory_mb < config.min_gpu_memory_mb {
                return Err(format!(
                    "GPU memory {} MB below minimum {} MB",
                    gpu.memory_mb, config.min_gpu_memory_mb
                ));
            }
            Ok(())
        }
    }
}

/// A configuration plus the extra rules registered at startup.
#[derive(Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
    rules: Vec<Arc<dyn PolicyRule>>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Arc<dyn PolicyRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn evaluate(&self, claims: &AttestedClaims) -> PolicyResult {
        let rules: Vec<&dyn PolicyRule> = self.rules.iter().map(|r| r.as_ref()).collect();
        evaluate(claims, &self.config, &rules)
    }
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.rules.iter().map(|r| r.name()).collect();
        f.debug_struct("PolicyEngine")
            .field("config", &self.config)
            .field("rules", &names)
            .finish()
    }
}
