//! Request authentication
//!
//! With broker credentials configured, every request must present exactly
//! those as HTTP basic auth. Without them the broker runs single-tenant: the
//! basic auth username is `<public key>@<group id>` and the password the
//! private key, and the resulting tenant is attached to the request.

use crate::credentials::BrokerAuth;
use crate::error::{BrokerError, Result};
use crate::handlers::AppState;
use crate::resolver::{AuthenticatedTenant, RequestContext};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, warn};

/// Username and password from a basic auth header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Decode an `Authorization: Basic ...` header value
pub fn parse_basic_auth(header: &str) -> Result<BasicCredentials> {
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| BrokerError::unauthenticated("expected basic authentication"))?;

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| BrokerError::unauthenticated("malformed basic authentication"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| BrokerError::unauthenticated("malformed basic authentication"))?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| BrokerError::unauthenticated("malformed basic authentication"))?;

    Ok(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Split `<public key>@<group id>` / `<private key>` into a tenant
pub fn tenant_from_basic(credentials: BasicCredentials) -> Result<AuthenticatedTenant> {
    let (public_key, group_id) = credentials
        .username
        .rsplit_once('@')
        .filter(|(public_key, group_id)| !public_key.is_empty() && !group_id.is_empty())
        .ok_or_else(|| {
            BrokerError::unauthenticated("username must have the form <public key>@<group id>")
        })?;

    if credentials.password.is_empty() {
        return Err(BrokerError::unauthenticated("private key must not be empty"));
    }

    Ok(AuthenticatedTenant {
        public_key: public_key.to_string(),
        group_id: group_id.to_string(),
        private_key: credentials.password,
    })
}

/// Authenticate a request from its `Authorization` header value
pub fn authenticate(broker: Option<&BrokerAuth>, header: Option<&str>) -> Result<RequestContext> {
    let header = header.ok_or_else(|| BrokerError::unauthenticated("missing credentials"))?;
    let credentials = parse_basic_auth(header)?;

    match broker {
        Some(expected) => {
            if credentials.username != expected.username || credentials.password != expected.password {
                return Err(BrokerError::unauthenticated("invalid broker credentials"));
            }
            Ok(RequestContext::anonymous())
        }
        None => Ok(RequestContext::authenticated(tenant_from_basic(credentials)?)),
    }
}

/// Axum middleware attaching a [`RequestContext`] to authenticated requests
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, BrokerError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let context = match authenticate(state.broker.credentials().broker.as_ref(), header) {
        Ok(context) => context,
        Err(e) => {
            warn!(path = %request.uri().path(), "Rejected request: {}", e);
            return Err(e);
        }
    };

    debug!(
        tenant = context.tenant().map(|t| t.group_id.as_str()),
        "Authenticated request"
    );
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(raw: &str) -> String {
        format!("Basic {}", STANDARD.encode(raw))
    }

    #[test]
    fn test_parse_basic_auth() {
        let parsed = parse_basic_auth(&basic("user:pa:ss")).unwrap();
        assert_eq!(parsed.username, "user");
        assert_eq!(parsed.password, "pa:ss");

        assert!(parse_basic_auth("Bearer abc").is_err());
        assert!(parse_basic_auth("Basic !!!").is_err());
        assert!(parse_basic_auth(&basic("no-colon")).is_err());
    }

    #[test]
    fn test_broker_credentials() {
        let expected = BrokerAuth {
            username: "admin".to_string(),
            password: "secret".to_string(),
        };

        let context = authenticate(Some(&expected), Some(&basic("admin:secret"))).unwrap();
        assert!(context.tenant().is_none());

        assert!(matches!(
            authenticate(Some(&expected), Some(&basic("admin:wrong"))),
            Err(BrokerError::Unauthenticated { .. })
        ));
        assert!(matches!(
            authenticate(Some(&expected), None),
            Err(BrokerError::Unauthenticated { .. })
        ));
    }

    #[test]
    fn test_tenant_credentials() {
        let context = authenticate(None, Some(&basic("pubkey@group1:privkey"))).unwrap();
        let tenant = context.tenant().unwrap();
        assert_eq!(tenant.public_key, "pubkey");
        assert_eq!(tenant.group_id, "group1");
        assert_eq!(tenant.private_key, "privkey");

        assert!(authenticate(None, Some(&basic("pubkey:privkey"))).is_err());
        assert!(authenticate(None, Some(&basic("pubkey@group1:"))).is_err());
    }
}
