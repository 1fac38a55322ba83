//! HTTP front of the relay: control WebSocket upgrades, public ingress
//! under `/r/{route}` and a few read-only management endpoints.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, future::ready};
use http::{HeaderValue, Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited, StreamBody, combinators::UnsyncBoxBody};
use hyper::{body::Body, server::conn::http1, service::service_fn};
use hyper_tungstenite::{HyperWebsocket, tungstenite::Message};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    auth::{Authorizer, StaticAuthorizer, bearer_token},
    config::{RelayConfig, ServerConfig},
    control::ControlChannel,
    error::RelayError,
    ingress::{Forwarder, IngressRequest},
    pending::RelayResponse,
    registry::TunnelRegistry,
    transport::TransportError,
};

pub type RelayBody = UnsyncBoxBody<Bytes, RelayError>;

pub const CONTROL_PATH: &str = "/ws/tunnel";
pub const INGRESS_PREFIX: &str = "/r/";

#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<TunnelRegistry>,
    authorizer: Arc<dyn Authorizer>,
    control: ControlChannel,
    forwarder: Forwarder,
}

impl RelayServer {
    pub fn new(config: RelayConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        let registry = Arc::new(TunnelRegistry::new(config.replacement));
        let control = ControlChannel::new(
            Arc::clone(&registry),
            Arc::clone(&authorizer),
            config.clone(),
        );
        let forwarder = Forwarder::new(Arc::clone(&registry), Arc::clone(&authorizer), config);
        Self {
            inner: Arc::new(Inner {
                registry,
                authorizer,
                control,
                forwarder,
            }),
        }
    }

    /// Builds a server whose grants come straight from the config tables.
    pub fn from_config(config: &ServerConfig) -> Self {
        let authorizer = StaticAuthorizer::new(config.tunnels.clone(), config.users.clone());
        Self::new(config.relay.clone(), Arc::new(authorizer))
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.inner.registry
    }

    pub fn control(&self) -> &ControlChannel {
        &self.inner.control
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.inner.forwarder
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Relay listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Failed to accept connection: {}", err);
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!("Connection error from {}: {}", remote_addr, err);
                }
            });
        }

        info!("Relay stopped accepting connections");
        Ok(())
    }

    /// Binds `addr` and serves until `shutdown` resolves.
    pub async fn bind_and_serve<F>(self, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn handle<B>(&self, mut req: Request<B>) -> Response<RelayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        debug!("{} {}", req.method(), path);

        if path == CONTROL_PATH {
            return self.accept_control(&mut req);
        }
        if let Some(rest) = path.strip_prefix(INGRESS_PREFIX) {
            let (route, rest) = match rest.split_once('/') {
                Some((route, rest)) => (route, format!("/{rest}")),
                None => (rest, "/".to_string()),
            };
            let route = route.to_string();
            return match self.ingress(route, rest, req).await {
                Ok(response) => relay_response(response),
                Err(err) => error_response(&err),
            };
        }

        match (req.method(), path.as_str()) {
            (&Method::GET, "/health") => json_response(StatusCode::OK, &json!({ "status": "healthy" })),
            (&Method::GET, "/api/tunnels/public") => {
                json_response(StatusCode::OK, &self.inner.registry.list_public())
            }
            (&Method::GET, "/api/tunnels") => {
                let owner = bearer_token(req.headers())
                    .and_then(|token| self.inner.authorizer.identify_caller(token));
                match owner {
                    Some(owner) => {
                        json_response(StatusCode::OK, &self.inner.registry.list_for_owner(&owner))
                    }
                    None => error_response(&RelayError::Unauthorized),
                }
            }
            _ => json_response(StatusCode::NOT_FOUND, &json!({ "detail": "Not Found" })),
        }
    }

    fn accept_control<B>(&self, req: &mut Request<B>) -> Response<RelayBody> {
        if !hyper_tungstenite::is_upgrade_request(req) {
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "detail": "expected a WebSocket upgrade" }),
            );
        }
        match hyper_tungstenite::upgrade(req, None) {
            Ok((response, websocket)) => {
                let server = self.clone();
                tokio::spawn(async move { server.run_control(websocket).await });
                response.map(|body| body.map_err(|never| match never {}).boxed_unsync())
            }
            Err(err) => {
                warn!("Rejected control upgrade: {}", err);
                json_response(
                    StatusCode::BAD_REQUEST,
                    &json!({ "detail": "invalid WebSocket upgrade" }),
                )
            }
        }
    }

    async fn run_control(&self, websocket: HyperWebsocket) {
        let websocket = match websocket.await {
            Ok(websocket) => websocket,
            Err(err) => {
                warn!("Control upgrade failed: {}", err);
                return;
            }
        };
        let (sink, stream) = websocket.split();
        let reader = Box::pin(stream.filter_map(|message| {
            ready(match message {
                Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::from(err))),
            })
        }));
        let writer = Box::pin(
            sink.with(|bytes: Bytes| ready(Ok::<_, TransportError>(Message::Binary(bytes)))),
        );

        match self.inner.control.run(reader, writer).await {
            Ok(reason) => debug!("Control channel closed: {:?}", reason),
            Err(err) => debug!("Control channel ended with error: {}", err),
        }
    }

    async fn ingress<B>(
        &self,
        route: String,
        path: String,
        req: Request<B>,
    ) -> Result<RelayResponse, RelayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let limit = self.inner.forwarder.config().max_body_bytes;
        let (parts, body) = req.into_parts();

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        if declared.is_some_and(|len| len > limit as u64) {
            return Err(RelayError::PayloadTooLarge { limit });
        }

        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(RelayError::PayloadTooLarge { limit });
            }
            Err(err) => {
                debug!("Failed to read request body for {}: {}", route, err);
                return Err(RelayError::Upstream("failed to read request body".to_string()));
            }
        };

        let caller = bearer_token(&parts.headers).map(str::to_string);
        self.inner
            .forwarder
            .forward(IngressRequest {
                route,
                path,
                query: parts.uri.query().map(str::to_string),
                method: parts.method,
                headers: parts.headers,
                body: (!body.is_empty()).then_some(body),
                caller,
            })
            .await
    }
}

fn relay_response(response: RelayResponse) -> Response<RelayBody> {
    let RelayResponse {
        status,
        headers,
        body,
        ..
    } = response;
    let frames = body.map(|chunk| chunk.map(hyper::body::Frame::data));
    let mut res = Response::new(StreamBody::new(frames).boxed_unsync());
    *res.status_mut() = status;
    *res.headers_mut() = headers;
    res
}

fn error_response(err: &RelayError) -> Response<RelayBody> {
    json_response(err.status_code(), &json!({ "detail": err.to_string() }))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<RelayBody> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, Bytes::from(body)),
        Err(err) => {
            warn!("Failed to serialize response: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
        }
    };
    let mut res = Response::new(full(body));
    *res.status_mut() = status;
    if let Ok(content_type) = HeaderValue::from_str(mime::APPLICATION_JSON.as_ref()) {
        res.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    res
}

fn full(body: Bytes) -> RelayBody {
    Full::new(body).map_err(|never| match never {}).boxed_unsync()
}
