//! Public entry point: turns an inbound HTTP call into a relay request on
//! the target tunnel and waits for the correlated response.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, Method, header};
use tracing::{debug, warn};

use crate::{
    auth::{Authorizer, Visibility},
    config::RelayConfig,
    error::RelayError,
    pending::RelayResponse,
    registry::TunnelRegistry,
    transport::{Frame, RelayRequest, timestamp_ms},
};

/// An inbound public request addressed to a route.
#[derive(Debug, Clone)]
pub struct IngressRequest {
    pub route: String,
    /// Path below the route, always starting with `/`.
    pub path: String,
    pub query: Option<String>,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Bearer credential presented by the caller, if any.
    pub caller: Option<String>,
}

pub struct Forwarder {
    registry: Arc<TunnelRegistry>,
    authorizer: Arc<dyn Authorizer>,
    config: RelayConfig,
}

impl Forwarder {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        authorizer: Arc<dyn Authorizer>,
        config: RelayConfig,
    ) -> Self {
        Self {
            registry,
            authorizer,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Relays `request` and resolves with the tunnel client's response.
    ///
    /// The returned body streams as chunks arrive. Hop-by-hop headers are
    /// stripped in both directions.
    pub async fn forward(&self, request: IngressRequest) -> Result<RelayResponse, RelayError> {
        let IngressRequest {
            route,
            path,
            query,
            method,
            mut headers,
            body,
            caller,
        } = request;

        let connection = self
            .registry
            .lookup_connected(&route)
            .ok_or_else(|| RelayError::RouteNotFound(route.clone()))?;

        if connection.visibility() == Visibility::Private {
            let identity = caller
                .as_deref()
                .and_then(|bearer| self.authorizer.identify_caller(bearer));
            if identity.as_deref() != Some(connection.owner()) {
                debug!("Tunnel {}: caller is not the owner", route);
                return Err(RelayError::Forbidden);
            }
        }

        let limit = self.config.max_body_bytes;
        if body.as_ref().is_some_and(|body| body.len() > limit) {
            return Err(RelayError::PayloadTooLarge { limit });
        }

        strip_hop_by_hop(&mut headers);
        let pending = connection.pending().register();
        let correlation_id = pending.correlation_id();
        let frame = Frame::RelayRequest(RelayRequest {
            correlation_id,
            method,
            path,
            query,
            headers,
            body: body.filter(|body| !body.is_empty()),
            received_at_ms: timestamp_ms(),
        });

        if let Err(err) = connection.send(frame) {
            warn!(
                "Tunnel {}: request {} could not be sent: {}",
                route, correlation_id, err
            );
            return Err(err);
        }
        debug!("Tunnel {}: request {} sent", route, correlation_id);

        match pending.wait(self.config.forward_timeout()).await {
            Ok(mut response) => {
                strip_hop_by_hop(&mut response.headers);
                Ok(response)
            }
            Err(err) => {
                warn!("Tunnel {}: request {} failed: {}", route, correlation_id, err);
                Err(err)
            }
        }
    }
}

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 3);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers.get_all(header::SET_COOKIE).iter().count(), 2);
        assert!(headers.get("x-session").is_none());
    }
}
