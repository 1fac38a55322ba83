//! Relay engine for route-addressed reverse tunnels.
//!
//! Tunnel clients hold a persistent control connection to the relay and
//! claim a route. Public HTTP calls to `/r/{route}/...` are framed onto that
//! connection and answered with the client's correlated response.

pub mod auth;
pub mod config;
pub mod control;
pub mod error;
pub mod ingress;
pub mod pending;
pub mod registry;
pub mod route;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use auth::{Authorizer, Grant, StaticAuthorizer, Visibility};
pub use config::{RelayConfig, ReplacementPolicy, ServerConfig};
pub use control::{CloseReason, ControlChannel};
pub use error::RelayError;
pub use ingress::{Forwarder, IngressRequest};
pub use pending::{PendingTable, RelayResponse, ResponseBody};
pub use registry::TunnelRegistry;
pub use route::Route;
pub use server::RelayServer;
pub use tunnel::{ConnectionState, TunnelConnection, TunnelInfo};
