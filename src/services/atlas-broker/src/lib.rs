//! Atlas Service Broker Library
//!
//! Catalog and plan-resolution engine of an Open Service Broker in front of
//! MongoDB Atlas.
//!
//! - **Catalog**: one service per cloud provider, with plans generated per
//!   operating mode (static instance sizes, one plan per size and project, or
//!   plans rendered from user-authored templates), optionally whitelisted
//! - **Resolution**: for every instance operation, the project (tenant) and
//!   key pair to use against the backend
//! - **HTTP**: the catalog endpoint and a health probe, behind basic auth
//!
//! # Quick Start
//!
//! ```no_run
//! use atlas_broker::{
//!     atlas::AtlasClient, credentials::Credentials, mode::BrokerMode, Broker,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let base_url = "https://cloud.mongodb.com";
//!     let source = AtlasClient::metadata(base_url, Duration::from_secs(30))?;
//!
//!     let broker = Broker::new(
//!         BrokerMode::BasicAuth,
//!         Arc::new(Credentials::default()),
//!         base_url,
//!         Arc::new(source),
//!     );
//!
//!     for service in broker.services().await? {
//!         println!("{} ({} plans)", service.name, service.plans.len());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod atlas;
pub mod auth;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod dynamic_plans;
pub mod error;
pub mod handlers;
pub mod identifiers;
pub mod mode;
pub mod resolver;
pub mod store;

pub use broker::Broker;
pub use catalog::{Catalog, CatalogBuilder, CatalogPlan, PlanOrigin, Whitelist};
pub use error::{BrokerError, FaultClass, Result};
pub use mode::BrokerMode;
pub use resolver::{AuthenticatedTenant, RequestContext, Resolution, TenantResolver};
