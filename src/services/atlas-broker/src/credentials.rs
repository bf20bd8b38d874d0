//! Tenant credentials
//!
//! Loaded once at startup and shared read-only behind an `Arc` afterwards.
//! Tenants are kept in a `BTreeMap` so every traversal (auto plan expansion,
//! template context serialization) is ordered by tenant ID.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// A programmatic API key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub public_key: String,
    pub private_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub desc: String,
}

impl ApiKey {
    pub fn new(public_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
            desc: String::new(),
        }
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }
}

/// Username/password the platform uses to call the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAuth {
    pub username: String,
    pub password: String,
}

/// All credentials known to the broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Basic auth expected on incoming broker requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerAuth>,

    /// Keys by project (group) ID
    #[serde(default)]
    pub projects: BTreeMap<String, ApiKey>,

    /// Keys by organization ID; only used as template input
    #[serde(default)]
    pub orgs: BTreeMap<String, ApiKey>,
}

impl Credentials {
    /// Parse credentials from a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        let credentials: Credentials = serde_json::from_str(raw)
            .map_err(|e| BrokerError::config(format!("invalid credentials: {}", e)))?;
        credentials.validate()?;
        Ok(credentials)
    }

    /// Read credentials from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::config(format!(
                "cannot read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;

        let credentials = Self::from_json(&raw)?;
        info!(
            projects = credentials.projects.len(),
            orgs = credentials.orgs.len(),
            "Loaded credentials from {}",
            path.display()
        );
        Ok(credentials)
    }

    /// Reject key pairs with empty halves
    pub fn validate(&self) -> Result<()> {
        let keys = self
            .projects
            .iter()
            .map(|(id, key)| ("project", id, key))
            .chain(self.orgs.iter().map(|(id, key)| ("org", id, key)));

        for (kind, id, key) in keys {
            if id.is_empty() {
                return Err(BrokerError::config(format!("{} with an empty ID", kind)));
            }
            if key.public_key.is_empty() || key.private_key.is_empty() {
                return Err(BrokerError::config(format!(
                    "{} {:?} has an incomplete key pair",
                    kind, id
                )));
            }
        }

        if let Some(broker) = &self.broker {
            if broker.username.is_empty() {
                return Err(BrokerError::config("broker username must not be empty"));
            }
        }

        Ok(())
    }

    /// Keys for a project, or `TenantNotFound`
    pub fn project(&self, tenant_id: &str) -> Result<&ApiKey> {
        self.projects
            .get(tenant_id)
            .ok_or_else(|| BrokerError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            })
    }
}
