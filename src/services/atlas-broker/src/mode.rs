//! Broker operating modes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How plans are generated and how tenants are chosen.
///
/// The mode is fixed for the lifetime of a broker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BrokerMode {
    /// A single tenant whose keys arrive with every request's basic auth
    BasicAuth,
    /// Tenant taken from provisioning parameters, static plan catalog
    MultiGroup,
    /// One plan per instance size and configured tenant
    MultiGroupAutoPlans,
    /// Plans rendered from user-authored templates
    DynamicPlans,
}

impl BrokerMode {
    pub const ALL: [BrokerMode; 4] = [
        BrokerMode::BasicAuth,
        BrokerMode::MultiGroup,
        BrokerMode::MultiGroupAutoPlans,
        BrokerMode::DynamicPlans,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerMode::BasicAuth => "basic-auth",
            BrokerMode::MultiGroup => "multi-group",
            BrokerMode::MultiGroupAutoPlans => "multi-group-auto-plans",
            BrokerMode::DynamicPlans => "dynamic-plans",
        }
    }

    /// Whether requests must carry the tenant's own API keys
    pub fn uses_request_credentials(&self) -> bool {
        matches!(self, BrokerMode::BasicAuth)
    }

    /// Whether tenant resolution looks plans up in the catalog
    pub fn resolves_through_catalog(&self) -> bool {
        matches!(
            self,
            BrokerMode::MultiGroupAutoPlans | BrokerMode::DynamicPlans
        )
    }
}

impl fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        BrokerMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| format!("unknown broker mode: {}", s))
    }
}

impl Default for BrokerMode {
    fn default() -> Self {
        BrokerMode::BasicAuth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trips_through_str() {
        for mode in BrokerMode::ALL {
            assert_eq!(mode.as_str().parse::<BrokerMode>().unwrap(), mode);
        }
        assert_eq!(
            "MULTI_GROUP_AUTO_PLANS".parse::<BrokerMode>().unwrap(),
            BrokerMode::MultiGroupAutoPlans
        );
        assert!("single-group".parse::<BrokerMode>().is_err());
    }

    #[test]
    fn test_mode_serde() {
        let mode: BrokerMode = serde_json::from_str("\"dynamic-plans\"").unwrap();
        assert_eq!(mode, BrokerMode::DynamicPlans);
        assert!(BrokerMode::BasicAuth.uses_request_credentials());
        assert!(!BrokerMode::MultiGroup.uses_request_credentials());
    }

    #[test]
    fn test_catalog_backed_resolution() {
        let modes: Vec<_> = BrokerMode::ALL
            .into_iter()
            .filter(BrokerMode::resolves_through_catalog)
            .collect();
        assert_eq!(
            modes,
            vec![BrokerMode::MultiGroupAutoPlans, BrokerMode::DynamicPlans]
        );
    }
}
