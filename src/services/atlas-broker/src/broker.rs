//! Broker façade
//!
//! [`Broker`] owns the configuration-derived pieces (credentials, catalog
//! builder, tenant resolver) and the published catalog. The catalog is built
//! at most once at a time: concurrent callers wait on the build lock and then
//! share the result. A failed build publishes nothing, so the next caller
//! tries again.

use crate::atlas::ProviderSource;
use crate::catalog::{Catalog, CatalogBuilder, Whitelist};
use crate::credentials::Credentials;
use crate::dynamic_plans::TemplateSet;
use crate::error::{BrokerError, Result};
use crate::identifiers;
use crate::mode::BrokerMode;
use crate::resolver::{RequestContext, Resolution, TenantResolver};
use crate::store::{required_string, InstanceMetadata, InstanceStore, CLUSTER_NAME_KEY, GROUP_ID_KEY};
use atlas_broker_shared::Service;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

pub struct Broker {
    mode: BrokerMode,
    credentials: Arc<Credentials>,
    base_url: String,
    source: Arc<dyn ProviderSource>,
    builder: CatalogBuilder,
    resolver: TenantResolver,
    catalog: RwLock<Option<Arc<Catalog>>>,
    build_lock: Mutex<()>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("mode", &self.mode)
            .field("base_url", &self.base_url)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new(
        mode: BrokerMode,
        credentials: Arc<Credentials>,
        base_url: impl Into<String>,
        source: Arc<dyn ProviderSource>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            mode,
            builder: CatalogBuilder::new(mode, credentials.clone()),
            resolver: TenantResolver::new(mode, credentials.clone(), base_url.clone()),
            credentials,
            base_url,
            source,
            catalog: RwLock::new(None),
            build_lock: Mutex::new(()),
        }
    }

    pub fn with_templates(mut self, templates: Arc<TemplateSet>) -> Self {
        self.builder = self.builder.with_templates(templates);
        self
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.builder = self.builder.with_whitelist(whitelist);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.resolver = self.resolver.with_store(store);
        self
    }

    /// Timeout of the per-tenant backend clients
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.resolver = self.resolver.with_request_timeout(timeout);
        self
    }

    pub fn mode(&self) -> BrokerMode {
        self.mode
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether a catalog has been published
    pub async fn catalog_ready(&self) -> bool {
        self.catalog.read().await.is_some()
    }

    /// The published catalog, building it first if there is none
    pub async fn catalog(&self) -> Result<Arc<Catalog>> {
        if let Some(catalog) = self.catalog.read().await.as_ref() {
            return Ok(catalog.clone());
        }

        let _guard = self.build_lock.lock().await;

        // Another caller may have finished a build while we waited
        if let Some(catalog) = self.catalog.read().await.as_ref() {
            return Ok(catalog.clone());
        }

        self.build_and_publish().await
    }

    /// Build a fresh catalog and replace the published one.
    ///
    /// On failure the previously published catalog stays in place.
    pub async fn rebuild_catalog(&self) -> Result<Arc<Catalog>> {
        let _guard = self.build_lock.lock().await;
        self.build_and_publish().await
    }

    async fn build_and_publish(&self) -> Result<Arc<Catalog>> {
        let catalog = match self.builder.build(self.source.as_ref()).await {
            Ok(catalog) => Arc::new(catalog),
            Err(e) => {
                error!(error = %e, "Cannot build service catalog");
                return Err(e);
            }
        };

        *self.catalog.write().await = Some(catalog.clone());
        Ok(catalog)
    }

    /// Services of the catalog, in provider order
    pub async fn services(&self) -> Result<Vec<Service>> {
        info!("Retrieving service catalog");
        Ok(self.catalog().await?.services().to_vec())
    }

    /// Backend client and tenant ID for an instance-scoped operation
    pub async fn resolve_for_instance(
        &self,
        context: &RequestContext,
        instance_id: &str,
        plan_id: &str,
        raw_parameters: Option<&Value>,
    ) -> Result<Resolution> {
        let catalog = if self.mode.resolves_through_catalog() {
            Some(self.catalog().await?)
        } else {
            None
        };
        self.resolver
            .resolve(
                context,
                catalog.as_deref(),
                instance_id,
                plan_id,
                raw_parameters,
            )
            .await
    }

    /// Link to a cluster in the backend UI
    pub fn dashboard_url(&self, tenant_id: &str, cluster_name: &str) -> String {
        format!(
            "{}/v2/{}#clusters/detail/{}",
            self.base_url.trim_end_matches('/'),
            tenant_id,
            cluster_name
        )
    }

    /// Backend cluster name of an instance.
    ///
    /// Without an instance store the name is derived from the instance ID.
    pub async fn cluster_name_for_instance(&self, instance_id: &str) -> Result<String> {
        let Some(store) = self.resolver.store() else {
            return Ok(identifiers::cluster_name(instance_id));
        };

        let metadata = store.instance_metadata(instance_id).await?.ok_or_else(|| {
            BrokerError::instance_metadata(instance_id, "no metadata recorded for instance")
        })?;
        required_string(instance_id, &metadata, CLUSTER_NAME_KEY)
    }

    /// Record the tenant and cluster of a provisioned instance so later
    /// operations resolve to the same tenant
    pub async fn remember_instance(
        &self,
        instance_id: &str,
        tenant_id: &str,
        cluster_name: &str,
    ) -> Result<()> {
        let Some(store) = self.resolver.store() else {
            debug!(instance_id, "No instance store configured, not recording instance");
            return Ok(());
        };

        let mut metadata = InstanceMetadata::new();
        metadata.insert(GROUP_ID_KEY.to_string(), json!(tenant_id));
        metadata.insert(CLUSTER_NAME_KEY.to_string(), json!(cluster_name));
        store.save_instance_metadata(instance_id, metadata).await?;

        info!(instance_id, tenant_id, cluster_name, "Recorded instance");
        Ok(())
    }
}
