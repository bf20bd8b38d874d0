//! Dynamic plan templates
//!
//! A plan template is a Handlebars document which, once rendered, is a YAML
//! plan definition:
//!
//! ```yaml
//! name: basic-plan
//! description: Basic plan with an M10 cluster
//! free: false
//! project:
//!   name: "{{instanceId}}"
//!   orgId: 5ea0477597999053a5f9cbec
//! apiKey: {{toJson (index credentials.orgs "5ea0477597999053a5f9cbec")}}
//! cluster:
//!   name: "{{instanceId}}"
//!   providerSettings:
//!     providerName: AWS
//!     instanceSizeName: M10
//!     regionName: US_EAST_1
//! ```
//!
//! Templates are rendered in strict mode, so referencing a field the context
//! does not have (or an organization without credentials) is a render error
//! rather than an empty string. Output is never HTML-escaped.
//!
//! A [`TemplateSet`] is immutable once loaded and rendering takes `&self`, so
//! concurrent renders need no coordination. Rendering the same template with
//! the same context always yields the same plan; the resolver relies on this
//! to recover a plan from its ID during instance operations.

use crate::credentials::Credentials;
use crate::error::{BrokerError, Result};
use handlebars::{
    no_escape, Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderError, ScopedJson,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Non-owning reference to a template inside a [`TemplateSet`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateHandle(String);

impl TemplateHandle {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Plan definition decoded from a rendered template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPlan {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Project (tenant) a plan provisions into
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_settings: Option<ProviderSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub instance_size_name: String,
    #[serde(default)]
    pub region_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DynamicPlan {
    fn provider_settings(&self) -> Option<&ProviderSettings> {
        self.cluster.as_ref()?.provider_settings.as_ref()
    }

    /// Declared provider, if the template pins one
    pub fn provider_name(&self) -> Option<&str> {
        self.provider_settings()
            .map(|s| s.provider_name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn instance_size_name(&self) -> Option<&str> {
        self.provider_settings()
            .map(|s| s.instance_size_name.as_str())
            .filter(|name| !name.is_empty())
    }

    /// ID of the project the plan provisions into, if declared
    pub fn tenant_id(&self) -> Option<&str> {
        self.project
            .as_ref()
            .map(|p| p.id.as_str())
            .filter(|id| !id.is_empty())
    }

    fn validate(&self, template: &str) -> Result<()> {
        let invalid = |message: &str| BrokerError::TemplateValidation {
            template: template.to_string(),
            message: message.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid(".name must not be empty"));
        }
        if self.instance_size_name().is_none() {
            return Err(invalid(
                ".cluster.providerSettings.instanceSizeName must not be empty",
            ));
        }
        Ok(())
    }
}

/// Data a template is rendered against.
///
/// Request parameters are merged underneath the values the broker knows for
/// certain: the instance ID, the provider being processed and the credentials
/// can never be replaced by a caller.
#[derive(Debug, Clone)]
pub struct PlanContext {
    credentials: Arc<Credentials>,
    instance_id: String,
    provider_name: Option<String>,
    parameters: Map<String, Value>,
}

impl PlanContext {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            credentials,
            instance_id: String::new(),
            provider_name: None,
            parameters: Map::new(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Scope the render to one provider
    pub fn with_provider(mut self, provider_name: impl Into<String>) -> Self {
        self.provider_name = Some(provider_name.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Merge raw request parameters; `null` and absent are the same
    pub fn with_raw_parameters(self, raw: Option<&Value>) -> Result<Self> {
        match raw {
            None | Some(Value::Null) => Ok(self),
            Some(Value::Object(parameters)) => Ok(self.with_parameters(parameters.clone())),
            Some(other) => Err(BrokerError::invalid_parameters(format!(
                "expected a JSON object, got {}",
                json_kind(other)
            ))),
        }
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    /// Render data for Handlebars.
    ///
    /// Project and cluster fields are always present (empty when unknown) so
    /// templates may reference them before a caller supplied any parameters.
    pub fn to_value(&self) -> Value {
        let mut root = json!({
            "project": { "id": "", "name": "", "orgId": "" },
            "cluster": {
                "name": "",
                "providerSettings": {
                    "providerName": "",
                    "instanceSizeName": "",
                    "regionName": ""
                }
            }
        });
        merge(&mut root, Value::Object(self.parameters.clone()));

        merge(&mut root, json!({ "instanceId": self.instance_id }));
        if let Some(provider_name) = &self.provider_name {
            merge(
                &mut root,
                json!({ "cluster": { "providerSettings": { "providerName": provider_name } } }),
            );
        }

        if let Value::Object(map) = &mut root {
            map.insert(
                "credentials".to_string(),
                json!({
                    "projects": self.credentials.projects,
                    "orgs": self.credentials.orgs,
                }),
            );
        }

        root
    }
}

/// Recursively merge `from` into `into`; objects merge, anything else replaces
fn merge(into: &mut Value, from: Value) {
    match (into, from) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `{{toJson value}}` writes any value as compact JSON
fn to_json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h
        .param(0)
        .ok_or_else(|| RenderError::new("toJson: missing argument"))?;
    if param.is_value_missing() {
        return Err(RenderError::new(format!(
            "toJson: {} is not defined",
            param.relative_path().map(String::as_str).unwrap_or("argument")
        )));
    }

    let encoded = serde_json::to_string(param.value())
        .map_err(|e| RenderError::new(format!("toJson: {}", e)))?;
    out.write(&encoded)?;
    Ok(())
}

/// `(index map key)` yields `map[key]`; a missing key is an error
struct IndexHelper;

impl HelperDef for IndexHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'reg, 'rc>, RenderError> {
        let (map, key) = match (h.param(0), h.param(1)) {
            (Some(map), Some(key)) => (map, key),
            _ => return Err(RenderError::new("index: expects a mapping and a key")),
        };

        let key = match key.value() {
            Value::String(key) => key.clone(),
            Value::Null => return Err(RenderError::new("index: key is not defined")),
            other => other.to_string(),
        };

        map.value()
            .as_object()
            .and_then(|entries| entries.get(&key))
            .cloned()
            .map(ScopedJson::Derived)
            .ok_or_else(|| RenderError::new(format!("index: key {:?} not found", key)))
    }
}

fn new_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(no_escape);
    registry.register_helper("toJson", Box::new(to_json_helper));
    registry.register_helper("index", Box::new(IndexHelper));
    registry
}

/// Ordered, immutable set of compiled plan templates
pub struct TemplateSet {
    registry: Handlebars<'static>,
    names: Vec<String>,
}

impl std::fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateSet")
            .field("names", &self.names)
            .finish()
    }
}

impl TemplateSet {
    /// Compile templates from `(name, source)` pairs, keeping their order.
    ///
    /// A template that does not compile, or reuses an earlier name, is logged
    /// and left out.
    pub fn from_sources<I, N, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: AsRef<str>,
    {
        let mut registry = new_registry();
        let mut names = Vec::new();

        for (name, source) in sources {
            let name = name.into();
            if registry.has_template(&name) {
                warn!(template = %name, "Duplicate plan template name, skipping");
                continue;
            }

            match registry.register_template_string(&name, source.as_ref()) {
                Ok(()) => names.push(name),
                Err(e) => {
                    let err = BrokerError::TemplateLoad {
                        template: name,
                        message: e.to_string(),
                    };
                    warn!(error = %err, "Skipping plan template");
                }
            }
        }

        Self { registry, names }
    }

    /// Load every template file of a directory, ordered by file name.
    ///
    /// The template name is the file stem. Hidden files and subdirectories are
    /// ignored. An unreadable directory or file fails the whole load.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let load_error = |path: &Path, e: std::io::Error| BrokerError::TemplateLoad {
            template: path.display().to_string(),
            message: e.to_string(),
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| load_error(dir, e))? {
            let path = entry.map_err(|e| load_error(dir, e))?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            if path.is_file() && !hidden {
                files.push(path);
            }
        }
        files.sort();

        let mut sources = Vec::with_capacity(files.len());
        for path in files {
            let source = std::fs::read_to_string(&path).map_err(|e| load_error(&path, e))?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            sources.push((name, source));
        }

        let set = Self::from_sources(sources);
        info!(
            count = set.len(),
            "Loaded plan templates from {}",
            dir.display()
        );
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Template names in load order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Handles of all templates, in load order
    pub fn handles(&self) -> impl Iterator<Item = TemplateHandle> + '_ {
        self.names.iter().cloned().map(TemplateHandle)
    }

    pub fn handle(&self, name: &str) -> Option<TemplateHandle> {
        self.names
            .iter()
            .find(|n| n.as_str() == name)
            .cloned()
            .map(TemplateHandle)
    }

    /// Render a template to text
    pub fn render_text(&self, handle: &TemplateHandle, context: &PlanContext) -> Result<String> {
        self.registry
            .render(handle.name(), &context.to_value())
            .map_err(|e| BrokerError::TemplateRender {
                template: handle.name().to_string(),
                message: e.to_string(),
            })
    }

    /// Render, decode and validate a template
    pub fn render(&self, handle: &TemplateHandle, context: &PlanContext) -> Result<DynamicPlan> {
        let rendered = self.render_text(handle, context)?;
        debug!(template = handle.name(), "Rendered plan template");

        let plan: DynamicPlan =
            serde_yaml::from_str(&rendered).map_err(|e| BrokerError::TemplateDecode {
                template: handle.name().to_string(),
                message: e.to_string(),
            })?;

        plan.validate(handle.name())?;
        Ok(plan)
    }
}
