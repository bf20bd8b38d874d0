//! Service and plan identifiers
//!
//! IDs are derived from names only, so rebuilding the catalog from the same
//! inputs always yields the same IDs. The prefix keeps them distinct from IDs
//! issued by other brokers registered on the same platform.

use once_cell::sync::Lazy;
use regex::Regex;

/// Prepended to every service and plan ID
pub const ID_PREFIX: &str = "aosb-cluster";

/// Longest cluster name accepted by the backend
pub const MAX_CLUSTER_NAME_LEN: usize = 64;

static FORBIDDEN_SYMBOLS: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^-a-zA-Z0-9]+").expect("static regex"));

/// Globally unique ID of the service offered for a provider
pub fn service_id(provider_name: &str) -> String {
    format!("{}-service-{}", ID_PREFIX, provider_name.to_lowercase())
}

/// Globally unique ID of a plan.
///
/// `name` is the instance size name for static and auto plans and the plan
/// name for templated plans. The tenant suffix is only appended when `tenant`
/// is non-empty.
pub fn plan_id(provider_name: &str, name: &str, tenant: &str) -> String {
    let id = format!(
        "{}-plan-{}-{}",
        ID_PREFIX,
        provider_name.to_lowercase(),
        name.to_lowercase()
    );

    if tenant.is_empty() {
        return id;
    }

    format!("{}-{}", id, tenant)
}

/// Lower-case `raw` and collapse every run of characters outside
/// `[A-Za-z0-9-]` into a single `_`.
pub fn normalize(raw: &str) -> String {
    FORBIDDEN_SYMBOLS.replace_all(raw, "_").to_lowercase()
}

/// Cluster name derived from an instance ID when none was recorded
pub fn cluster_name(instance_id: &str) -> String {
    let mut name = FORBIDDEN_SYMBOLS.replace_all(instance_id, "-").into_owned();
    name.truncate(MAX_CLUSTER_NAME_LEN);
    name
}
