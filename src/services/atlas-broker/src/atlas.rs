//! Backend (Atlas) client
//!
//! Only the parts the catalog engine needs live here: fetching provider
//! metadata, and a per-tenant client handle built from a key pair. Provisioning
//! calls and the digest transport are layered on top by the protocol handlers.

use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Path of the unauthenticated provider metadata endpoint, relative to the
/// backend origin
pub const PROVIDER_ENDPOINT: &str = "api/private/unauth/nds/providers";

/// Default timeout for backend requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A named compute/storage tier offered by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSize {
    pub name: String,

    /// Remaining fields of the backend definition, kept verbatim
    #[serde(flatten)]
    pub definition: Map<String, Value>,
}

impl InstanceSize {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: Map::new(),
        }
    }
}

/// A cloud provider and the instance sizes it offers, in backend order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub name: String,
    #[serde(default)]
    pub instance_sizes: Vec<InstanceSize>,
}

impl Provider {
    pub fn new(name: impl Into<String>, instance_sizes: Vec<InstanceSize>) -> Self {
        Self {
            name: name.into(),
            instance_sizes,
        }
    }

    /// Find an instance size by name
    pub fn instance_size(&self, name: &str) -> Option<&InstanceSize> {
        self.instance_sizes.iter().find(|size| size.name == name)
    }
}

/// Source of provider metadata used while building the catalog
#[async_trait]
pub trait ProviderSource: Send + Sync {
    /// Fetch a provider and its instance sizes
    async fn fetch_provider(&self, name: &str) -> Result<Provider>;
}

/// Client handle for one backend tenant
#[derive(Clone)]
pub struct AtlasClient {
    http: reqwest::Client,
    base_url: Url,
    public_key: String,
    private_key: String,
}

impl fmt::Debug for AtlasClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlasClient")
            .field("base_url", &self.base_url.as_str())
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl AtlasClient {
    /// Build a client authenticated with the given key pair
    pub fn new(public_key: &str, private_key: &str, base_url: &str) -> Result<Self> {
        Self::with_timeout(public_key, private_key, base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        public_key: &str,
        private_key: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("atlas-broker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url,
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
        })
    }

    /// Client for the unauthenticated metadata endpoints.
    ///
    /// These endpoints live at the backend origin, so any path on `base_url`
    /// is dropped.
    pub fn metadata(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut origin = Url::parse(base_url)?;
        origin.set_path("");
        origin.set_query(None);
        origin.set_fragment(None);
        Self::with_timeout("", "", origin.as_str(), timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Underlying HTTP client
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn provider_url(&self, name: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BrokerError::config("backend URL cannot be a base"))?
            .pop_if_empty()
            .extend(PROVIDER_ENDPOINT.split('/'))
            .push(name);
        Ok(url)
    }
}

#[async_trait]
impl ProviderSource for AtlasClient {
    async fn fetch_provider(&self, name: &str) -> Result<Provider> {
        let fetch_error = |message: String| BrokerError::BackendFetch {
            provider: name.to_string(),
            message,
        };

        let url = self.provider_url(name)?;
        debug!("Fetching provider metadata from {}", url);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("backend responded with {}", status)));
        }

        let provider: Provider = response
            .json()
            .await
            .map_err(|e| fetch_error(format!("invalid provider document: {}", e)))?;

        if provider.name != name {
            return Err(fetch_error(format!(
                "backend returned provider {:?}",
                provider.name
            )));
        }

        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_provider_document() {
        let provider: Provider = serde_json::from_value(json!({
            "name": "AWS",
            "instanceSizes": [
                {"name": "M10", "defaultDiskSizeGB": 10},
                {"name": "M20"}
            ]
        }))
        .unwrap();

        assert_eq!(provider.instance_sizes.len(), 2);
        assert_eq!(
            provider.instance_size("M10").unwrap().definition["defaultDiskSizeGB"],
            json!(10)
        );
        assert!(provider.instance_size("M30").is_none());
    }

    #[test]
    fn test_metadata_client_drops_path() {
        let client =
            AtlasClient::metadata("https://cloud.example.com/api/atlas/v1.0", DEFAULT_REQUEST_TIMEOUT)
                .unwrap();
        assert_eq!(
            client.provider_url("AWS").unwrap().as_str(),
            "https://cloud.example.com/api/private/unauth/nds/providers/AWS"
        );
        assert_eq!(client.public_key(), "");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            AtlasClient::new("pub", "priv", "not a url"),
            Err(BrokerError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_provider() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/private/unauth/nds/providers/GCP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "GCP",
                "instanceSizes": [{"name": "M10"}, {"name": "M30"}]
            })))
            .mount(&server)
            .await;

        let client = AtlasClient::metadata(&server.uri(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let provider = client.fetch_provider("GCP").await.unwrap();

        assert_eq!(provider.name, "GCP");
        assert_eq!(
            provider
                .instance_sizes
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>(),
            vec!["M10", "M30"]
        );
    }

    #[tokio::test]
    async fn test_fetch_provider_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = AtlasClient::metadata(&server.uri(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let err = client.fetch_provider("AWS").await.unwrap_err();
        assert!(matches!(err, BrokerError::BackendFetch { provider, .. } if provider == "AWS"));
    }
}
