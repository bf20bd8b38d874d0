//! HTTP surface of the broker
//!
//! Only catalog discovery and a health probe are served here; `/v2/catalog`
//! sits behind [`auth_middleware`].

use crate::auth::auth_middleware;
use crate::broker::Broker;
use crate::error::BrokerError;
use atlas_broker_shared::CatalogResponse;
use axum::{
    extract::State,
    middleware,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub mode: String,
    pub catalog_ready: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/catalog", get(get_catalog))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// `GET /v2/catalog`
pub async fn get_catalog(
    State(state): State<AppState>,
) -> Result<Json<CatalogResponse>, BrokerError> {
    let services = state.broker.services().await?;
    debug!(services = services.len(), "Serving catalog");
    Ok(Json(CatalogResponse { services }))
}

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let catalog_ready = state.broker.catalog_ready().await;

    Json(HealthResponse {
        status: if catalog_ready { "healthy" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        mode: state.broker.mode().to_string(),
        catalog_ready,
    })
}
