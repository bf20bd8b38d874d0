//! Tenant and credential resolution
//!
//! Every instance-scoped operation needs to know which backend project the
//! instance lives in and which key pair to talk to it with. How that is
//! decided depends on the broker mode:
//!
//! | mode                     | tenant source                                          |
//! |--------------------------|--------------------------------------------------------|
//! | `basic-auth`             | the keys the caller authenticated with                 |
//! | `multi-group`            | stored instance record, else `project.id` parameter    |
//! | `multi-group-auto-plans` | the tenant baked into the plan                         |
//! | `dynamic-plans`          | stored instance record, else the re-rendered template  |
//!
//! Except in `basic-auth` mode the key pair always comes from the configured
//! credentials.

use crate::atlas::{AtlasClient, DEFAULT_REQUEST_TIMEOUT};
use crate::catalog::Catalog;
use crate::credentials::Credentials;
use crate::dynamic_plans::PlanContext;
use crate::error::{BrokerError, Result};
use crate::mode::BrokerMode;
use crate::store::{required_string, InstanceStore, GROUP_ID_KEY};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tenant and keys a caller authenticated with
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticatedTenant {
    pub public_key: String,
    pub private_key: String,
    pub group_id: String,
}

impl fmt::Debug for AuthenticatedTenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedTenant")
            .field("public_key", &self.public_key)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

/// Per-request data the resolver may consult
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    tenant: Option<AuthenticatedTenant>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(tenant: AuthenticatedTenant) -> Self {
        Self {
            tenant: Some(tenant),
        }
    }

    pub fn tenant(&self) -> Option<&AuthenticatedTenant> {
        self.tenant.as_ref()
    }
}

/// Outcome of a resolution: a client bound to the tenant, and its ID
#[derive(Debug, Clone)]
pub struct Resolution {
    pub client: AtlasClient,
    pub tenant_id: String,
}

pub struct TenantResolver {
    mode: BrokerMode,
    credentials: Arc<Credentials>,
    base_url: String,
    request_timeout: Duration,
    store: Option<Arc<dyn InstanceStore>>,
}

impl fmt::Debug for TenantResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantResolver")
            .field("mode", &self.mode)
            .field("base_url", &self.base_url)
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl TenantResolver {
    pub fn new(mode: BrokerMode, credentials: Arc<Credentials>, base_url: impl Into<String>) -> Self {
        Self {
            mode,
            credentials,
            base_url: base_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn store(&self) -> Option<&Arc<dyn InstanceStore>> {
        self.store.as_ref()
    }

    /// Decide which tenant an instance operation runs against and build a
    /// client for it.
    ///
    /// `catalog` is only consulted in modes where
    /// [`BrokerMode::resolves_through_catalog`] holds.
    pub async fn resolve(
        &self,
        context: &RequestContext,
        catalog: Option<&Catalog>,
        instance_id: &str,
        plan_id: &str,
        raw_parameters: Option<&Value>,
    ) -> Result<Resolution> {
        let tenant_id = match self.mode {
            BrokerMode::BasicAuth => {
                let tenant = context.tenant().ok_or_else(|| {
                    BrokerError::unauthenticated("request carries no tenant credentials")
                })?;
                let client = self.client(&tenant.public_key, &tenant.private_key)?;
                return Ok(Resolution {
                    client,
                    tenant_id: tenant.group_id.clone(),
                });
            }

            BrokerMode::MultiGroup => match self.stored_tenant(instance_id).await? {
                Some(tenant_id) => tenant_id,
                None => project_id_from_parameters(raw_parameters)?,
            },

            BrokerMode::MultiGroupAutoPlans => require_catalog(catalog)?
                .tenant_for_plan(plan_id)?
                .to_string(),

            BrokerMode::DynamicPlans => match self.stored_tenant(instance_id).await? {
                Some(tenant_id) => tenant_id,
                None => self.rendered_tenant(
                    require_catalog(catalog)?,
                    instance_id,
                    plan_id,
                    raw_parameters,
                )?,
            },
        };

        debug!(
            mode = %self.mode,
            instance_id,
            plan_id,
            tenant_id = %tenant_id,
            "Resolved tenant"
        );

        let key = self.credentials.project(&tenant_id)?;
        let client = self.client(&key.public_key, &key.private_key)?;
        Ok(Resolution { client, tenant_id })
    }

    fn client(&self, public_key: &str, private_key: &str) -> Result<AtlasClient> {
        AtlasClient::with_timeout(public_key, private_key, &self.base_url, self.request_timeout)
    }

    /// Tenant recorded for an existing instance
    async fn stored_tenant(&self, instance_id: &str) -> Result<Option<String>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        match store.instance_metadata(instance_id).await? {
            Some(metadata) => required_string(instance_id, &metadata, GROUP_ID_KEY).map(Some),
            None => Ok(None),
        }
    }

    /// Re-render the plan's template with the request parameters and take the
    /// project it declares
    fn rendered_tenant(
        &self,
        catalog: &Catalog,
        instance_id: &str,
        plan_id: &str,
        raw_parameters: Option<&Value>,
    ) -> Result<String> {
        let plan = catalog.require_plan(plan_id)?;
        let template = plan.origin.template().ok_or_else(|| {
            BrokerError::missing_tenant(format!(
                "plan ID {:?} was not rendered from a template",
                plan_id
            ))
        })?;
        let templates = catalog.templates().ok_or_else(|| {
            BrokerError::internal("catalog holds dynamic plans but no templates")
        })?;

        let context = PlanContext::new(self.credentials.clone())
            .with_instance_id(instance_id)
            .with_provider(&plan.provider_name)
            .with_raw_parameters(raw_parameters)?;

        let rendered = templates.render(template, &context)?;
        rendered
            .tenant_id()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::missing_tenant("missing project ID in plan definition"))
    }
}

fn require_catalog(catalog: Option<&Catalog>) -> Result<&Catalog> {
    catalog.ok_or_else(|| BrokerError::internal("tenant resolution requires the service catalog"))
}

/// `project.id` from raw provisioning parameters
fn project_id_from_parameters(raw_parameters: Option<&Value>) -> Result<String> {
    let parameters = match raw_parameters {
        None | Some(Value::Null) => None,
        Some(Value::Object(parameters)) => Some(parameters),
        Some(_) => {
            return Err(BrokerError::invalid_parameters(
                "parameters must be a JSON object",
            ))
        }
    };

    parameters
        .and_then(|p| p.get("project"))
        .and_then(|project| project.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BrokerError::missing_tenant("project ID not found in parameters"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_id_from_parameters() {
        let params = json!({"project": {"id": "p1"}});
        assert_eq!(project_id_from_parameters(Some(&params)).unwrap(), "p1");

        for missing in [json!({}), json!({"project": {"id": ""}}), Value::Null] {
            assert!(matches!(
                project_id_from_parameters(Some(&missing)),
                Err(BrokerError::MissingTenantReference { .. })
            ));
        }
        assert!(matches!(
            project_id_from_parameters(Some(&json!("p1"))),
            Err(BrokerError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_authenticated_tenant_debug_hides_private_key() {
        let tenant = AuthenticatedTenant {
            public_key: "pub".to_string(),
            private_key: "secret".to_string(),
            group_id: "g1".to_string(),
        };
        assert!(!format!("{:?}", tenant).contains("secret"));
    }
}
