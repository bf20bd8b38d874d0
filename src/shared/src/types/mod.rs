//! Open Service Broker type definitions shared by the broker crates
//!
//! These are the wire shapes of the catalog endpoint. They carry no behavior
//! beyond serialization so that the HTTP layer and the catalog engine agree on
//! a single representation.

pub mod catalog;

pub use catalog::{
    CatalogResponse, Service, ServiceMetadata, ServicePlan, ServicePlanMetadata,
};
