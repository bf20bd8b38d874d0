//! End-to-end catalog and tenant resolution tests

use async_trait::async_trait;
use atlas_broker::atlas::{InstanceSize, Provider, ProviderSource};
use atlas_broker::credentials::{ApiKey, Credentials};
use atlas_broker::dynamic_plans::TemplateSet;
use atlas_broker::store::{InMemoryInstanceStore, InstanceStore};
use atlas_broker::{
    AuthenticatedTenant, Broker, BrokerError, BrokerMode, RequestContext, Whitelist,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BASE_URL: &str = "https://cloud.example.com";

/// Serves M10 and M20 for every provider and counts fetches
#[derive(Default)]
struct FakeProviders {
    fetches: AtomicUsize,
    delay: Option<Duration>,
    fail: bool,
}

#[async_trait]
impl ProviderSource for FakeProviders {
    async fn fetch_provider(&self, name: &str) -> atlas_broker::Result<Provider> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(BrokerError::BackendFetch {
                provider: name.to_string(),
                message: "unavailable".to_string(),
            });
        }
        Ok(Provider::new(
            name,
            vec![InstanceSize::named("M10"), InstanceSize::named("M20")],
        ))
    }
}

fn credentials() -> Arc<Credentials> {
    Arc::new(Credentials {
        broker: None,
        projects: BTreeMap::from([
            (
                "p1".to_string(),
                ApiKey::new("pub1", "priv1").with_desc("Alpha"),
            ),
            ("p2".to_string(), ApiKey::new("pub2", "priv2")),
        ]),
        orgs: BTreeMap::from([("org1".to_string(), ApiKey::new("opub", "opriv"))]),
    })
}

fn broker(mode: BrokerMode, source: Arc<FakeProviders>) -> Broker {
    Broker::new(mode, credentials(), BASE_URL, source)
}

const PROJECT_PLAN: &str = r#"
name: project-plan
description: Plan provisioned into a caller-chosen project
project:
  id: "{{project.id}}"
  name: "{{instanceId}}"
  orgId: org1
apiKey: {{toJson (index credentials.orgs "org1")}}
cluster:
  name: "{{instanceId}}"
  providerSettings:
    providerName: AWS
    instanceSizeName: M10
"#;

const PINNED_PLAN: &str = r#"
name: pinned-plan
description: Always provisioned into p2
project:
  id: p2
cluster:
  providerSettings:
    instanceSizeName: M20
"#;

const NO_SIZE_PLAN: &str = r#"
name: no-size
description: Missing instance size
cluster:
  providerSettings:
    providerName: AWS
"#;

fn dynamic_broker(store: Option<Arc<InMemoryInstanceStore>>) -> Broker {
    let templates = TemplateSet::from_sources([
        ("project", PROJECT_PLAN),
        ("pinned", PINNED_PLAN),
        ("no-size", NO_SIZE_PLAN),
    ]);
    let broker = broker(BrokerMode::DynamicPlans, Arc::new(FakeProviders::default()))
        .with_templates(Arc::new(templates));
    match store {
        Some(store) => broker.with_store(store as Arc<dyn InstanceStore>),
        None => broker,
    }
}

fn plan_names(services: &[atlas_broker_shared::Service], index: usize) -> Vec<String> {
    services[index].plans.iter().map(|p| p.name.clone()).collect()
}

#[tokio::test]
async fn rebuilding_yields_identical_catalog() {
    let broker = broker(BrokerMode::MultiGroupAutoPlans, Arc::new(FakeProviders::default()));

    let first = broker.services().await.unwrap();
    broker.rebuild_catalog().await.unwrap();
    let second = broker.services().await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn auto_plans_resolve_back_to_their_tenant() {
    let broker = broker(BrokerMode::MultiGroupAutoPlans, Arc::new(FakeProviders::default()));
    let services = broker.services().await.unwrap();

    assert_eq!(
        plan_names(&services, 0),
        vec!["M10-alpha", "M10-p2", "M20-alpha", "M20-p2"]
    );

    let context = RequestContext::anonymous();
    for (plan_id, tenant) in [
        ("aosb-cluster-plan-aws-m10-p1", "p1"),
        ("aosb-cluster-plan-aws-m10-p2", "p2"),
        ("aosb-cluster-plan-gcp-m20-p1", "p1"),
    ] {
        let resolution = broker
            .resolve_for_instance(&context, "instance-1", plan_id, None)
            .await
            .unwrap();
        assert_eq!(resolution.tenant_id, tenant);
        assert_eq!(
            resolution.client.public_key(),
            format!("pub{}", &tenant[1..])
        );
    }

    let err = broker
        .resolve_for_instance(&context, "instance-1", "aosb-cluster-plan-aws-m99-p1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownPlan { .. }));
}

#[tokio::test]
async fn whitelist_limits_providers_and_plans() {
    let source = Arc::new(FakeProviders::default());
    let whitelist = Whitelist::from_yaml("AWS:\n  - M10\n").unwrap();
    let broker = broker(BrokerMode::BasicAuth, source.clone()).with_whitelist(whitelist);

    let services = broker.services().await.unwrap();

    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, "aosb-cluster-service-aws");
    assert_eq!(plan_names(&services, 0), vec!["M10"]);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dynamic_templates_are_filtered_per_provider() {
    let broker = dynamic_broker(None);
    let services = broker.services().await.unwrap();

    // AWS, GCP, AZURE, TENANT
    assert_eq!(plan_names(&services, 0), vec!["project-plan", "pinned-plan"]);
    assert_eq!(plan_names(&services, 1), vec!["pinned-plan"]);
    assert_eq!(plan_names(&services, 2), vec!["pinned-plan"]);
    assert_eq!(plan_names(&services, 3), vec!["M2", "M5"]);

    let plan = &services[0].plans[0];
    assert_eq!(plan.id, "aosb-cluster-plan-aws-project-plan");
    assert_eq!(plan.metadata_value("template"), Some(&json!("project")));
}

#[tokio::test]
async fn stored_tenant_wins_over_parameters() {
    let store = Arc::new(InMemoryInstanceStore::new().with_instance(
        "existing",
        json!({"groupID": "p2", "clusterName": "existing"})
            .as_object()
            .cloned()
            .unwrap(),
    ));
    let broker = dynamic_broker(Some(store));
    let context = RequestContext::anonymous();
    let params = json!({"project": {"id": "p1"}});

    let resolution = broker
        .resolve_for_instance(
            &context,
            "existing",
            "aosb-cluster-plan-aws-project-plan",
            Some(&params),
        )
        .await
        .unwrap();
    assert_eq!(resolution.tenant_id, "p2");

    let resolution = broker
        .resolve_for_instance(
            &context,
            "new-instance",
            "aosb-cluster-plan-aws-project-plan",
            Some(&params),
        )
        .await
        .unwrap();
    assert_eq!(resolution.tenant_id, "p1");
    assert_eq!(resolution.client.public_key(), "pub1");
}

#[tokio::test]
async fn dynamic_resolution_faults() {
    let broker = dynamic_broker(Some(Arc::new(InMemoryInstanceStore::new())));
    let context = RequestContext::anonymous();
    let plan_id = "aosb-cluster-plan-aws-project-plan";

    let err = broker
        .resolve_for_instance(&context, "i-1", plan_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MissingTenantReference { .. }), "{err:?}");

    let params = json!({"project": {"id": "p9"}});
    let err = broker
        .resolve_for_instance(&context, "i-1", plan_id, Some(&params))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "credentials for project ID \"p9\" not found");

    let err = broker
        .resolve_for_instance(&context, "i-1", plan_id, Some(&json!([1])))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidParameters { .. }));

    // Template-declared project cannot be replaced by parameters
    let resolution = broker
        .resolve_for_instance(
            &context,
            "i-1",
            "aosb-cluster-plan-gcp-pinned-plan",
            Some(&json!({"project": {"id": "p1"}})),
        )
        .await
        .unwrap();
    assert_eq!(resolution.tenant_id, "p2");
}

#[tokio::test]
async fn stored_record_without_tenant_is_rejected() {
    let store = Arc::new(InMemoryInstanceStore::new().with_instance(
        "broken",
        json!({"clusterName": "c"}).as_object().cloned().unwrap(),
    ));
    let broker = dynamic_broker(Some(store));

    let err = broker
        .resolve_for_instance(
            &RequestContext::anonymous(),
            "broken",
            "aosb-cluster-plan-aws-project-plan",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidInstanceMetadata { .. }));
}

#[tokio::test]
async fn remembered_instance_keeps_its_tenant() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let broker = dynamic_broker(Some(store));
    let context = RequestContext::anonymous();
    let plan_id = "aosb-cluster-plan-aws-project-plan";

    let first = broker
        .resolve_for_instance(&context, "i-1", plan_id, Some(&json!({"project": {"id": "p1"}})))
        .await
        .unwrap();
    broker
        .remember_instance("i-1", &first.tenant_id, "cluster-i-1")
        .await
        .unwrap();

    let later = broker
        .resolve_for_instance(&context, "i-1", plan_id, Some(&json!({"project": {"id": "p2"}})))
        .await
        .unwrap();
    assert_eq!(later.tenant_id, "p1");
    assert_eq!(
        broker.cluster_name_for_instance("i-1").await.unwrap(),
        "cluster-i-1"
    );
    assert_eq!(
        broker.dashboard_url(&later.tenant_id, "cluster-i-1"),
        "https://cloud.example.com/v2/p1#clusters/detail/cluster-i-1"
    );
}

#[tokio::test]
async fn multi_group_resolution_uses_stored_tenant_or_parameters() {
    let store = Arc::new(InMemoryInstanceStore::new().with_instance(
        "i-1",
        json!({"groupID": "p1", "clusterName": "c1"})
            .as_object()
            .cloned()
            .unwrap(),
    ));
    let source = Arc::new(FakeProviders {
        fail: true,
        ..FakeProviders::default()
    });
    let broker = broker(BrokerMode::MultiGroup, source.clone())
        .with_store(store as Arc<dyn InstanceStore>);
    let context = RequestContext::anonymous();

    let stored = broker
        .resolve_for_instance(&context, "i-1", "any", Some(&json!({"project": {"id": "p2"}})))
        .await
        .unwrap();
    assert_eq!(stored.tenant_id, "p1");
    assert_eq!(stored.client.public_key(), "pub1");

    let fresh = broker
        .resolve_for_instance(&context, "i-2", "any", Some(&json!({"project": {"id": "p2"}})))
        .await
        .unwrap();
    assert_eq!(fresh.tenant_id, "p2");

    let err = broker
        .resolve_for_instance(&context, "i-3", "any", Some(&json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MissingTenantReference { .. }));

    // Resolution never touched the backend
    assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn basic_auth_resolution_uses_request_tenant() {
    let broker = broker(BrokerMode::BasicAuth, Arc::new(FakeProviders::default()));

    let err = broker
        .resolve_for_instance(&RequestContext::anonymous(), "i-1", "any", None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Unauthenticated { .. }));

    let context = RequestContext::authenticated(AuthenticatedTenant {
        public_key: "tenant-pub".to_string(),
        private_key: "tenant-priv".to_string(),
        group_id: "g-42".to_string(),
    });
    let resolution = broker
        .resolve_for_instance(&context, "i-1", "any", None)
        .await
        .unwrap();
    assert_eq!(resolution.tenant_id, "g-42");
    assert_eq!(resolution.client.public_key(), "tenant-pub");
}

#[tokio::test]
async fn basic_auth_resolution_survives_backend_outage() {
    let source = Arc::new(FakeProviders {
        fail: true,
        ..FakeProviders::default()
    });
    let broker = broker(BrokerMode::BasicAuth, source.clone());
    let context = RequestContext::authenticated(AuthenticatedTenant {
        public_key: "tenant-pub".to_string(),
        private_key: "tenant-priv".to_string(),
        group_id: "g-42".to_string(),
    });

    let resolution = broker
        .resolve_for_instance(&context, "i-1", "any", None)
        .await
        .unwrap();
    assert_eq!(resolution.tenant_id, "g-42");
    assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    assert!(!broker.catalog_ready().await);
}

#[tokio::test]
async fn concurrent_first_requests_share_one_build() {
    let source = Arc::new(FakeProviders {
        delay: Some(Duration::from_millis(20)),
        ..FakeProviders::default()
    });
    let broker = Arc::new(broker(BrokerMode::BasicAuth, source.clone()));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.catalog().await })
        })
        .collect();

    let catalogs: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(catalogs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    // AWS, GCP and AZURE fetched exactly once
    assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_build_publishes_nothing() {
    let source = Arc::new(FakeProviders {
        fail: true,
        ..FakeProviders::default()
    });
    let broker = broker(BrokerMode::BasicAuth, source.clone());

    let err = broker.services().await.unwrap_err();
    assert!(matches!(err, BrokerError::BackendFetch { .. }));
    assert!(!broker.catalog_ready().await);

    // Retried on the next call
    assert!(broker.services().await.is_err());
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn catalog_serializes_protocol_shape() {
    let broker = broker(BrokerMode::BasicAuth, Arc::new(FakeProviders::default()));
    let catalog = broker.catalog().await.unwrap();

    let body: Value = serde_json::to_value(catalog.response()).unwrap();
    let tenant = &body["services"][3];
    assert_eq!(tenant["id"], json!("aosb-cluster-service-tenant"));
    assert_eq!(tenant["plan_updateable"], json!(true));
    assert_eq!(tenant["plans"][0]["id"], json!("aosb-cluster-plan-tenant-m2"));
    assert_eq!(
        body["services"][0]["plans"][0]["metadata"]["instanceSize"],
        json!({"name": "M10"})
    );
}
