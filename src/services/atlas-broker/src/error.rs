//! Error handling for the Atlas service broker
//!
//! Every failure the engine can produce is a [`BrokerError`]. Variants are
//! grouped into fault classes (see [`FaultClass`]) which decide how a failure
//! is treated: configuration and backend-fetch faults abort catalog
//! construction, template faults only drop the offending template, and
//! resolution faults reject a single request.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// How a failure is handled by its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Fatal at catalog build time; the broker never becomes ready
    Configuration,
    /// Recoverable per template; logged and skipped
    Template,
    /// Fatal for the catalog build in progress; nothing is published
    BackendFetch,
    /// Per-request failure reported to the caller
    Resolution,
    /// Storage, serialization and other infrastructure failures
    Infrastructure,
}

/// Main error type for the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The operating mode has no plan generation strategy
    #[error("Unsupported broker mode: {mode}")]
    UnsupportedMode { mode: String },

    /// A template source could not be read or compiled
    #[error("Cannot load template {template:?}: {message}")]
    TemplateLoad { template: String, message: String },

    /// Variable substitution failed
    #[error("Cannot render template {template:?}: {message}")]
    TemplateRender { template: String, message: String },

    /// Rendered text is not a plan document
    #[error("Cannot decode template {template:?}: {message}")]
    TemplateDecode { template: String, message: String },

    /// Decoded plan is incomplete
    #[error("Invalid template {template:?}: {message}")]
    TemplateValidation { template: String, message: String },

    /// Provider metadata could not be fetched from the backend
    #[error("Cannot fetch provider {provider:?}: {message}")]
    BackendFetch { provider: String, message: String },

    /// Backend request failed outside of catalog construction
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// No credentials exist for the resolved tenant
    #[error("credentials for project ID {tenant_id:?} not found")]
    TenantNotFound { tenant_id: String },

    /// A new instance did not declare the tenant it belongs to
    #[error("Missing tenant reference: {message}")]
    MissingTenantReference { message: String },

    /// The plan ID is not part of the catalog
    #[error("plan ID {plan_id:?} not found in catalog")]
    UnknownPlan { plan_id: String },

    /// Raw request parameters could not be decoded
    #[error("Invalid parameters: {message}")]
    InvalidParameters { message: String },

    /// Persisted instance metadata is malformed
    #[error("Invalid metadata for instance {instance_id:?}: {message}")]
    InvalidInstanceMetadata {
        instance_id: String,
        message: String,
    },

    /// The request carries no usable authentication
    #[error("Authentication error: {message}")]
    Unauthenticated { message: String },

    /// Instance store errors
    #[error("Database error: {message}")]
    Database { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BrokerError {
    /// Fault class of this error
    pub fn fault(&self) -> FaultClass {
        match self {
            BrokerError::Config { .. } | BrokerError::UnsupportedMode { .. } => {
                FaultClass::Configuration
            }
            BrokerError::TemplateLoad { .. }
            | BrokerError::TemplateRender { .. }
            | BrokerError::TemplateDecode { .. }
            | BrokerError::TemplateValidation { .. } => FaultClass::Template,
            BrokerError::BackendFetch { .. } => FaultClass::BackendFetch,
            BrokerError::TenantNotFound { .. }
            | BrokerError::MissingTenantReference { .. }
            | BrokerError::UnknownPlan { .. }
            | BrokerError::InvalidParameters { .. }
            | BrokerError::InvalidInstanceMetadata { .. }
            | BrokerError::Unauthenticated { .. } => FaultClass::Resolution,
            BrokerError::Backend { .. }
            | BrokerError::Database { .. }
            | BrokerError::Serialization { .. }
            | BrokerError::Internal { .. } => FaultClass::Infrastructure,
        }
    }

    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::UnsupportedMode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::TemplateLoad { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::TemplateRender { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BrokerError::TemplateDecode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BrokerError::TemplateValidation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BrokerError::BackendFetch { .. } => StatusCode::BAD_GATEWAY,
            BrokerError::Backend { .. } => StatusCode::BAD_GATEWAY,
            BrokerError::TenantNotFound { .. } => StatusCode::NOT_FOUND,
            BrokerError::MissingTenantReference { .. } => StatusCode::BAD_REQUEST,
            BrokerError::UnknownPlan { .. } => StatusCode::BAD_REQUEST,
            BrokerError::InvalidParameters { .. } => StatusCode::BAD_REQUEST,
            BrokerError::InvalidInstanceMetadata { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            BrokerError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Serialization { .. } => StatusCode::BAD_REQUEST,
            BrokerError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            BrokerError::Config { .. } => "CONFIG_ERROR",
            BrokerError::UnsupportedMode { .. } => "UNSUPPORTED_MODE",
            BrokerError::TemplateLoad { .. } => "TEMPLATE_LOAD_ERROR",
            BrokerError::TemplateRender { .. } => "TEMPLATE_RENDER_ERROR",
            BrokerError::TemplateDecode { .. } => "TEMPLATE_DECODE_ERROR",
            BrokerError::TemplateValidation { .. } => "TEMPLATE_VALIDATION_ERROR",
            BrokerError::BackendFetch { .. } => "BACKEND_FETCH_ERROR",
            BrokerError::Backend { .. } => "BACKEND_ERROR",
            BrokerError::TenantNotFound { .. } => "TENANT_NOT_FOUND",
            BrokerError::MissingTenantReference { .. } => "MISSING_TENANT_REFERENCE",
            BrokerError::UnknownPlan { .. } => "UNKNOWN_PLAN",
            BrokerError::InvalidParameters { .. } => "INVALID_PARAMETERS",
            BrokerError::InvalidInstanceMetadata { .. } => "INVALID_INSTANCE_METADATA",
            BrokerError::Unauthenticated { .. } => "UNAUTHENTICATED",
            BrokerError::Database { .. } => "DATABASE_ERROR",
            BrokerError::Serialization { .. } => "SERIALIZATION_ERROR",
            BrokerError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

// Conversion implementations for external error types

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Backend {
            message: err.to_string(),
        }
    }
}

impl From<mongodb::error::Error> for BrokerError {
    fn from(err: mongodb::error::Error) -> Self {
        BrokerError::Database {
            message: err.to_string(),
        }
    }
}

impl From<mongodb::bson::de::Error> for BrokerError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        BrokerError::Database {
            message: err.to_string(),
        }
    }
}

impl From<mongodb::bson::ser::Error> for BrokerError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        BrokerError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for BrokerError {
    fn from(err: serde_yaml::Error) -> Self {
        BrokerError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        BrokerError::Config {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}

impl From<url::ParseError> for BrokerError {
    fn from(err: url::ParseError) -> Self {
        BrokerError::Config {
            message: format!("invalid URL: {}", err),
        }
    }
}

// Utility functions for creating specific error types

impl BrokerError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a missing tenant reference error
    pub fn missing_tenant<S: Into<String>>(message: S) -> Self {
        Self::MissingTenantReference {
            message: message.into(),
        }
    }

    /// Create an invalid parameters error
    pub fn invalid_parameters<S: Into<String>>(message: S) -> Self {
        Self::InvalidParameters {
            message: message.into(),
        }
    }

    /// Create an instance metadata error
    pub fn instance_metadata<S1: Into<String>, S2: Into<String>>(
        instance_id: S1,
        message: S2,
    ) -> Self {
        Self::InvalidInstanceMetadata {
            instance_id: instance_id.into(),
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn unauthenticated<S: Into<String>>(message: S) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classes() {
        assert_eq!(
            BrokerError::UnsupportedMode {
                mode: "multi-group".to_string()
            }
            .fault(),
            FaultClass::Configuration
        );
        assert_eq!(
            BrokerError::TemplateDecode {
                template: "t".to_string(),
                message: "bad".to_string()
            }
            .fault(),
            FaultClass::Template
        );
        assert_eq!(
            BrokerError::BackendFetch {
                provider: "AWS".to_string(),
                message: "down".to_string()
            }
            .fault(),
            FaultClass::BackendFetch
        );
        assert_eq!(
            BrokerError::missing_tenant("no project").fault(),
            FaultClass::Resolution
        );
        assert_eq!(
            BrokerError::internal("oops").fault(),
            FaultClass::Infrastructure
        );
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            BrokerError::UnknownPlan {
                plan_id: "p".to_string()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BrokerError::TenantNotFound {
                tenant_id: "g".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BrokerError::unauthenticated("no header").status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_error_display() {
        let error = BrokerError::TenantNotFound {
            tenant_id: "5e1b".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "credentials for project ID \"5e1b\" not found"
        );
        assert_eq!(error.error_code(), "TENANT_NOT_FOUND");
    }

    #[test]
    fn test_from_conversions() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: BrokerError = json_error.into();
        assert!(matches!(error, BrokerError::Serialization { .. }));
    }
}
