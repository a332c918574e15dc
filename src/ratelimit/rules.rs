//! Static policy rules: compact policy strings and YAML policy tables.
//!
//! A policy string has the form
//!
//! ```text
//! requestKey:httpMethod:routeTemplate:rate1&rate2:allowOverride[:name]
//! ```
//!
//! where each rate is `limit_Unit`, optionally followed by `_burst` and
//! `_burst_cost`, e.g. `*:GET:/api/values:10_PerSecond_20&500_PerHour:true`.
//! Custom periods cannot be written this way; use a YAML table for those.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::policy::{RateLimitPolicy, WILDCARD};
use super::rate::{AllowedConsumptionRate, RateUnit};
use crate::error::{FloodgateError, Result};

/// Parse one rate, e.g. `100_PerMinute` or `10_PerSecond_20_2`.
pub fn parse_rate(input: &str) -> Result<AllowedConsumptionRate> {
    let invalid = |reason: String| FloodgateError::Config(format!("invalid rate '{}': {}", input, reason));
    let number = |field: &str, what: &str| {
        field
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(format!("{} '{}' is not a number", what, field)))
    };

    let parts: Vec<&str> = input.trim().split('_').collect();
    if !(2..=4).contains(&parts.len()) {
        return Err(invalid("expected limit_Unit[_burst[_cost]]".to_string()));
    }

    let limit = number(parts[0], "limit")?;
    let unit = RateUnit::from_str(parts[1].trim()).map_err(|e| invalid(e.to_string()))?;
    if unit == RateUnit::PerCustomPeriod {
        return Err(invalid("custom periods need a YAML policy table".to_string()));
    }

    let mut rate = AllowedConsumptionRate::new(limit, unit).map_err(|e| invalid(e.to_string()))?;
    if let Some(burst) = parts.get(2) {
        rate = rate.with_max_burst(number(burst, "burst")?);
    }
    if let Some(cost) = parts.get(3) {
        rate = rate
            .with_cost_per_call(number(cost, "cost")?)
            .map_err(|e| invalid(e.to_string()))?;
    }
    Ok(rate)
}

/// Parse a policy string. The name defaults to the policy's identity key.
pub fn parse_policy(input: &str) -> Result<RateLimitPolicy> {
    let invalid = |reason: &str| FloodgateError::Config(format!("invalid policy '{}': {}", input, reason));

    let fields: Vec<&str> = input.trim().splitn(6, ':').collect();
    if fields.len() < 5 {
        return Err(invalid(
            "expected requestKey:httpMethod:routeTemplate:rates:allowOverride[:name]",
        ));
    }

    let rates = fields[3]
        .split('&')
        .filter(|r| !r.trim().is_empty())
        .map(parse_rate)
        .collect::<Result<Vec<_>>>()?;
    if rates.is_empty() {
        return Err(invalid("at least one rate is required"));
    }

    let allow_override = match fields[4].trim().to_ascii_lowercase().as_str() {
        "true" => true,
        "false" => false,
        _ => return Err(invalid("allowOverride must be true or false")),
    };

    let policy = RateLimitPolicy::new(
        fields[0].trim(),
        fields[2],
        fields[1],
        rates,
        allow_override,
        fields.get(5).map(|n| n.trim()).unwrap_or_default(),
    )
    .map_err(|e| invalid(&e.to_string()))?;

    Ok(name_or_key(policy))
}

/// Parse every policy string in order.
pub fn parse_policies<I, S>(inputs: I) -> Result<Vec<RateLimitPolicy>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    inputs
        .into_iter()
        .map(|s| parse_policy(s.as_ref()))
        .collect()
}

fn name_or_key(policy: RateLimitPolicy) -> RateLimitPolicy {
    if !policy.name().is_empty() {
        return policy;
    }
    let name = policy.key().to_string();
    policy.with_name(name)
}

/// A table of structured policies, loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

/// One structured policy entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub request_key: String,
    #[serde(default = "wildcard")]
    pub route: String,
    #[serde(default = "wildcard")]
    pub method: String,
    #[serde(default)]
    pub rates: Vec<AllowedConsumptionRate>,
    #[serde(default = "default_allow_override")]
    pub allow_attribute_override: bool,
    #[serde(default)]
    pub name: Option<String>,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

fn default_allow_override() -> bool {
    true
}

impl PolicyRule {
    pub fn to_policy(&self) -> Result<RateLimitPolicy> {
        for rate in &self.rates {
            rate.validate()?;
        }
        let policy = RateLimitPolicy::new(
            self.request_key.as_str(),
            &self.route,
            &self.method,
            self.rates.clone(),
            self.allow_attribute_override,
            self.name.clone().unwrap_or_default(),
        )?;
        Ok(name_or_key(policy))
    }
}

impl PolicyTable {
    /// Load a policy table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policy table: {}", e)))
    }

    /// Validate every entry and build its policy.
    pub fn to_policies(&self) -> Result<Vec<RateLimitPolicy>> {
        self.policies.iter().map(PolicyRule::to_policy).collect()
    }
}
