//! Seam to the identity collaborator.
//!
//! The relay never issues or stores credentials itself. It asks an
//! [`Authorizer`] whether a control connection may claim a route, and who
//! a public caller is when the target tunnel is private.

use std::collections::HashMap;

use http::{HeaderMap, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::route::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn is_public(&self) -> bool {
        matches!(self, Visibility::Public)
    }
}

/// Outcome of a successful tunnel authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub owner: String,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Unknown or revoked token")]
    InvalidToken,

    #[error("Token is not bound to route {0}")]
    RouteMismatch(String),

    #[error("Authorization backend unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous identity collaborator consulted by the relay core.
pub trait Authorizer: Send + Sync {
    /// Checks token validity and token-to-route binding.
    fn authorize_tunnel(&self, token: &str, route: &Route) -> Result<Grant, AuthError>;

    /// Resolves a caller bearer token to the owner name it belongs to.
    fn identify_caller(&self, bearer: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelGrant {
    pub route: Route,
    pub token: String,
    pub owner: String,
    #[serde(default)]
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGrant {
    pub name: String,
    pub token: String,
}

/// [`Authorizer`] backed by tables loaded from the server configuration.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    tunnels: HashMap<String, TunnelGrant>,
    users: HashMap<String, String>,
}

impl StaticAuthorizer {
    pub fn new(
        tunnels: impl IntoIterator<Item = TunnelGrant>,
        users: impl IntoIterator<Item = UserGrant>,
    ) -> Self {
        Self {
            tunnels: tunnels
                .into_iter()
                .map(|grant| (grant.token.clone(), grant))
                .collect(),
            users: users
                .into_iter()
                .map(|user| (user.token, user.name))
                .collect(),
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize_tunnel(&self, token: &str, route: &Route) -> Result<Grant, AuthError> {
        let grant = self.tunnels.get(token).ok_or(AuthError::InvalidToken)?;
        if &grant.route != route {
            return Err(AuthError::RouteMismatch(route.to_string()));
        }
        Ok(Grant {
            owner: grant.owner.clone(),
            visibility: if grant.public {
                Visibility::Public
            } else {
                Visibility::Private
            },
        })
    }

    fn identify_caller(&self, bearer: &str) -> Option<String> {
        self.users.get(bearer).cloned()
    }
}

/// Extracts the token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn authorizer() -> StaticAuthorizer {
        StaticAuthorizer::new(
            [
                TunnelGrant {
                    route: Route::parse("demo").unwrap(),
                    token: "t-demo".to_string(),
                    owner: "alice".to_string(),
                    public: true,
                },
                TunnelGrant {
                    route: Route::parse("secret").unwrap(),
                    token: "t-secret".to_string(),
                    owner: "bob".to_string(),
                    public: false,
                },
            ],
            [UserGrant {
                name: "bob".to_string(),
                token: "u-bob".to_string(),
            }],
        )
    }

    #[test]
    fn test_authorize_tunnel() {
        let auth = authorizer();
        let demo = Route::parse("demo").unwrap();
        let secret = Route::parse("secret").unwrap();

        assert_eq!(
            auth.authorize_tunnel("t-demo", &demo).unwrap(),
            Grant {
                owner: "alice".to_string(),
                visibility: Visibility::Public
            }
        );
        assert_eq!(
            auth.authorize_tunnel("t-secret", &secret).unwrap().visibility,
            Visibility::Private
        );
        assert_eq!(
            auth.authorize_tunnel("nope", &demo),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            auth.authorize_tunnel("t-demo", &secret),
            Err(AuthError::RouteMismatch("secret".to_string()))
        );
    }

    #[test]
    fn test_identify_caller() {
        let auth = authorizer();
        assert_eq!(auth.identify_caller("u-bob").as_deref(), Some("bob"));
        assert_eq!(auth.identify_caller("t-secret"), None);
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
