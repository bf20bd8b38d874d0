//! Catalog types as exposed on `GET /v2/catalog`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of the catalog endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub services: Vec<Service>,
}

/// A service offering (one per backend provider)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub instances_retrievable: bool,
    pub bindings_retrievable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "plan_updateable")]
    pub plan_updatable: bool,
    pub plans: Vec<ServicePlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ServiceMetadata>,
}

/// Display metadata attached to a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
}

/// A purchasable plan inside a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ServicePlanMetadata>,
}

/// Plan metadata.
///
/// `additional` is flattened into the metadata object and carries
/// broker-specific details such as the instance size definition or the name of
/// the template a plan was rendered from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bullets: Vec<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

impl ServicePlanMetadata {
    /// Metadata holding only broker-specific entries
    pub fn with_additional(additional: Map<String, Value>) -> Self {
        Self {
            additional,
            ..Self::default()
        }
    }

    /// Look up a broker-specific entry
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.additional.get(key)
    }
}

impl ServicePlan {
    /// Broker-specific metadata entry of this plan, if any
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}
