//! Service catalog assembly
//!
//! One service is offered per provider, in the fixed order of
//! [`PROVIDER_NAMES`]. The plans of a service come from the generation
//! strategy selected by the broker mode; the optional whitelist then narrows
//! them down by name. Every plan keeps a [`PlanOrigin`] so instance operations
//! can later recover how it was generated.

use crate::atlas::{InstanceSize, Provider, ProviderSource};
use crate::credentials::Credentials;
use crate::dynamic_plans::{PlanContext, TemplateHandle, TemplateSet};
use crate::error::{BrokerError, Result};
use crate::identifiers::{normalize, plan_id, service_id};
use crate::mode::BrokerMode;
use atlas_broker_shared::{CatalogResponse, Service, ServicePlan, ServicePlanMetadata};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Providers offered by the broker, in catalog order
pub const PROVIDER_NAMES: [&str; 4] = ["AWS", "GCP", "AZURE", SHARED_PROVIDER];

/// Provider of shared-tier clusters; its plans are fixed and never fetched
pub const SHARED_PROVIDER: &str = "TENANT";

/// Instance sizes offered on the shared provider
pub const SHARED_INSTANCE_SIZES: [&str; 2] = ["M2", "M5"];

/// Permitted plan names per provider.
///
/// A provider without an entry is left out of the catalog altogether.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Whitelist(BTreeMap<String, Vec<String>>);

impl Whitelist {
    pub fn new(entries: BTreeMap<String, Vec<String>>) -> Self {
        Self(entries)
    }

    /// Parse a YAML (or JSON) mapping of provider name to plan names
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| BrokerError::config(format!("invalid whitelist: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::config(format!(
                "cannot read whitelist file {}: {}",
                path.display(),
                e
            ))
        })?;

        let whitelist = Self::from_yaml(&raw)?;
        info!(
            providers = whitelist.0.len(),
            "Loaded plan whitelist from {}",
            path.display()
        );
        Ok(whitelist)
    }

    /// Plan names permitted for a provider, `None` when the provider is absent
    pub fn plans_for(&self, provider_name: &str) -> Option<&[String]> {
        self.0.get(provider_name).map(Vec::as_slice)
    }
}

/// How a plan was generated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOrigin {
    Static { instance_size: String },
    Auto { instance_size: String, tenant_id: String },
    Dynamic { template: TemplateHandle, instance_size: String },
    Shared { instance_size: String },
}

impl PlanOrigin {
    pub fn instance_size(&self) -> &str {
        match self {
            PlanOrigin::Static { instance_size }
            | PlanOrigin::Auto { instance_size, .. }
            | PlanOrigin::Dynamic { instance_size, .. }
            | PlanOrigin::Shared { instance_size } => instance_size,
        }
    }

    /// Tenant baked into the plan, for auto-expanded plans
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            PlanOrigin::Auto { tenant_id, .. } => Some(tenant_id),
            _ => None,
        }
    }

    pub fn template(&self) -> Option<&TemplateHandle> {
        match self {
            PlanOrigin::Dynamic { template, .. } => Some(template),
            _ => None,
        }
    }
}

/// A catalog plan together with where it belongs and where it came from
#[derive(Debug, Clone)]
pub struct CatalogPlan {
    pub plan: ServicePlan,
    pub service_id: String,
    pub provider_name: String,
    pub origin: PlanOrigin,
}

/// Immutable, indexed service catalog
#[derive(Debug)]
pub struct Catalog {
    mode: BrokerMode,
    services: Vec<Service>,
    plans: HashMap<String, CatalogPlan>,
    providers: HashMap<String, Provider>,
    templates: Option<Arc<TemplateSet>>,
}

impl Catalog {
    pub fn mode(&self) -> BrokerMode {
        self.mode
    }

    /// Services in provider order
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn response(&self) -> CatalogResponse {
        CatalogResponse {
            services: self.services.clone(),
        }
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }

    pub fn plan(&self, plan_id: &str) -> Option<&CatalogPlan> {
        self.plans.get(plan_id)
    }

    /// Like [`Catalog::plan`], but an unknown ID is an error
    pub fn require_plan(&self, plan_id: &str) -> Result<&CatalogPlan> {
        self.plan(plan_id).ok_or_else(|| BrokerError::UnknownPlan {
            plan_id: plan_id.to_string(),
        })
    }

    /// Provider a service was built from
    pub fn provider_for_service(&self, service_id: &str) -> Option<&Provider> {
        self.providers.get(service_id)
    }

    /// Tenant baked into an auto-expanded plan
    pub fn tenant_for_plan(&self, plan_id: &str) -> Result<&str> {
        let plan = self.require_plan(plan_id)?;
        plan.origin.tenant_id().ok_or_else(|| {
            BrokerError::missing_tenant(format!("plan ID {:?} is not bound to a project", plan_id))
        })
    }

    /// Templates dynamic plans were rendered from
    pub fn templates(&self) -> Option<&Arc<TemplateSet>> {
        self.templates.as_ref()
    }
}

/// Builds a [`Catalog`] for one broker configuration
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    mode: BrokerMode,
    credentials: Arc<Credentials>,
    templates: Option<Arc<TemplateSet>>,
    whitelist: Option<Whitelist>,
}

impl CatalogBuilder {
    pub fn new(mode: BrokerMode, credentials: Arc<Credentials>) -> Self {
        Self {
            mode,
            credentials,
            templates: None,
            whitelist: None,
        }
    }

    pub fn with_templates(mut self, templates: Arc<TemplateSet>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    /// Build the catalog, fetching provider metadata from `source`.
    ///
    /// Fails when a provider cannot be fetched or the mode cannot produce a
    /// catalog. Individual templates that fail to render are skipped.
    pub async fn build(&self, source: &dyn ProviderSource) -> Result<Catalog> {
        let templates = match self.mode {
            BrokerMode::MultiGroup => {
                return Err(BrokerError::UnsupportedMode {
                    mode: self.mode.to_string(),
                })
            }
            BrokerMode::DynamicPlans => Some(self.templates.clone().ok_or_else(|| {
                BrokerError::config("dynamic-plans mode requires plan templates")
            })?),
            BrokerMode::BasicAuth | BrokerMode::MultiGroupAutoPlans => None,
        };

        info!(mode = %self.mode, "Building service catalog");

        let mut catalog = Catalog {
            mode: self.mode,
            services: Vec::with_capacity(PROVIDER_NAMES.len()),
            plans: HashMap::new(),
            providers: HashMap::new(),
            templates,
        };

        for provider_name in PROVIDER_NAMES {
            let whitelisted = match &self.whitelist {
                Some(whitelist) => match whitelist.plans_for(provider_name) {
                    Some(plans) => Some(plans),
                    None => {
                        debug!(provider = provider_name, "Provider not whitelisted, skipping");
                        continue;
                    }
                },
                None => None,
            };

            let (provider, candidates) = if provider_name == SHARED_PROVIDER {
                let provider = shared_provider();
                let plans = self.shared_plans(&provider);
                (provider, plans)
            } else {
                let provider = source.fetch_provider(provider_name).await?;
                let plans = self.plans_for_provider(&provider, catalog.templates.as_deref());
                (provider, plans)
            };

            let service_id = service_id(&provider.name);
            let mut plans = Vec::with_capacity(candidates.len());

            for (plan, origin) in candidates {
                if let Some(allowed) = whitelisted {
                    if !allowed.iter().any(|name| *name == plan.name) {
                        continue;
                    }
                }

                if catalog.plans.contains_key(&plan.id) {
                    warn!(plan_id = %plan.id, "Duplicate plan ID, skipping plan");
                    continue;
                }

                catalog.plans.insert(
                    plan.id.clone(),
                    CatalogPlan {
                        plan: plan.clone(),
                        service_id: service_id.clone(),
                        provider_name: provider.name.clone(),
                        origin,
                    },
                );
                plans.push(plan);
            }

            info!(
                provider = %provider.name,
                plans = plans.len(),
                "Added service to catalog"
            );

            catalog.services.push(build_service(&provider.name, plans));
            catalog.providers.insert(service_id, provider);
        }

        info!(
            services = catalog.services.len(),
            plans = catalog.plans.len(),
            "Service catalog built"
        );

        Ok(catalog)
    }

    fn plans_for_provider(
        &self,
        provider: &Provider,
        templates: Option<&TemplateSet>,
    ) -> Vec<(ServicePlan, PlanOrigin)> {
        match (self.mode, templates) {
            (BrokerMode::BasicAuth, _) => static_plans(provider),
            (BrokerMode::MultiGroupAutoPlans, _) => self.auto_plans(provider),
            (BrokerMode::DynamicPlans, Some(templates)) => self.dynamic_plans(provider, templates),
            (BrokerMode::DynamicPlans, None) | (BrokerMode::MultiGroup, _) => Vec::new(),
        }
    }

    fn shared_plans(&self, provider: &Provider) -> Vec<(ServicePlan, PlanOrigin)> {
        provider
            .instance_sizes
            .iter()
            .map(|size| {
                let plan = ServicePlan {
                    id: plan_id(&provider.name, &size.name, ""),
                    name: size.name.clone(),
                    description: size_description(&size.name),
                    ..ServicePlan::default()
                };
                let origin = PlanOrigin::Shared {
                    instance_size: size.name.clone(),
                };
                (plan, origin)
            })
            .collect()
    }

    /// Expand every instance size into one plan per configured tenant
    fn auto_plans(&self, provider: &Provider) -> Vec<(ServicePlan, PlanOrigin)> {
        let mut plans = Vec::new();

        for size in &provider.instance_sizes {
            for (tenant_id, key) in &self.credentials.projects {
                let suffix = if key.desc.is_empty() {
                    tenant_id.clone()
                } else {
                    normalize(&key.desc)
                };

                let mut metadata = Map::new();
                metadata.insert("groupID".to_string(), json!(tenant_id));
                metadata.insert("instanceSize".to_string(), size_value(size));

                let plan = ServicePlan {
                    id: plan_id(&provider.name, &size.name, tenant_id),
                    name: format!("{}-{}", size.name, suffix),
                    description: size_description(&size.name),
                    metadata: Some(ServicePlanMetadata::with_additional(metadata)),
                    ..ServicePlan::default()
                };
                let origin = PlanOrigin::Auto {
                    instance_size: size.name.clone(),
                    tenant_id: tenant_id.clone(),
                };
                plans.push((plan, origin));
            }
        }

        plans
    }

    fn dynamic_plans(
        &self,
        provider: &Provider,
        templates: &TemplateSet,
    ) -> Vec<(ServicePlan, PlanOrigin)> {
        let context = PlanContext::new(self.credentials.clone()).with_provider(&provider.name);
        let mut seen = HashSet::new();
        let mut plans = Vec::new();

        for handle in templates.handles() {
            let rendered = match templates.render(&handle, &context) {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!(
                        template = handle.name(),
                        provider = %provider.name,
                        error = %e,
                        "Skipping plan template"
                    );
                    continue;
                }
            };

            if let Some(declared) = rendered.provider_name() {
                if declared != provider.name {
                    continue;
                }
            }

            // Validation guarantees an instance size name
            let size_name = rendered
                .instance_size_name()
                .unwrap_or_default()
                .to_string();
            let size = provider.instance_size(&size_name);
            if size.is_none() {
                debug!(
                    template = handle.name(),
                    provider = %provider.name,
                    instance_size = %size_name,
                    "Instance size not listed by provider"
                );
            }

            let id = plan_id(&provider.name, &rendered.name, "");
            if !seen.insert(id.clone()) {
                warn!(
                    template = handle.name(),
                    plan_id = %id,
                    "Duplicate plan ID, skipping plan template"
                );
                continue;
            }

            let mut metadata = Map::new();
            metadata.insert("template".to_string(), json!(handle.name()));
            metadata.insert(
                "instanceSize".to_string(),
                size.map(size_value).unwrap_or(Value::Null),
            );

            let plan = ServicePlan {
                id,
                name: rendered.name,
                description: rendered.description,
                free: rendered.free,
                metadata: Some(ServicePlanMetadata::with_additional(metadata)),
                ..ServicePlan::default()
            };
            let origin = PlanOrigin::Dynamic {
                template: handle,
                instance_size: size_name,
            };
            plans.push((plan, origin));
        }

        plans
    }
}

fn static_plans(provider: &Provider) -> Vec<(ServicePlan, PlanOrigin)> {
    provider
        .instance_sizes
        .iter()
        .map(|size| {
            let mut metadata = Map::new();
            metadata.insert("instanceSize".to_string(), size_value(size));

            let plan = ServicePlan {
                id: plan_id(&provider.name, &size.name, ""),
                name: size.name.clone(),
                description: size_description(&size.name),
                metadata: Some(ServicePlanMetadata::with_additional(metadata)),
                ..ServicePlan::default()
            };
            let origin = PlanOrigin::Static {
                instance_size: size.name.clone(),
            };
            (plan, origin)
        })
        .collect()
}

fn shared_provider() -> Provider {
    Provider::new(
        SHARED_PROVIDER,
        SHARED_INSTANCE_SIZES
            .iter()
            .map(|name| InstanceSize::named(*name))
            .collect(),
    )
}

fn build_service(provider_name: &str, plans: Vec<ServicePlan>) -> Service {
    Service {
        id: service_id(provider_name),
        name: format!("mongodb-atlas-{}", provider_name.to_lowercase()),
        description: format!("Atlas cluster hosted on {:?}", provider_name),
        bindable: true,
        instances_retrievable: false,
        bindings_retrievable: false,
        plan_updatable: true,
        plans,
        ..Service::default()
    }
}

fn size_description(size_name: &str) -> String {
    format!("Instance size {:?}", size_name)
}

fn size_value(size: &InstanceSize) -> Value {
    serde_json::to_value(size).unwrap_or(Value::Null)
}
