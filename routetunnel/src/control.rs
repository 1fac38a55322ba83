//! Lifecycle of one tunnel's control connection.
//!
//! `Connecting` covers the hello handshake and authorization. The tunnel
//! is `Connected` before the registry publishes it, and the handler pumps
//! inbound frames, answers pings and sends its own keepalive pings. Any
//! exit from that loop goes through `Closing`, where every pending request
//! is failed and the route is unregistered, and ends in `Closed`.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    auth::{Authorizer, Grant},
    config::RelayConfig,
    error::RelayError,
    registry::TunnelRegistry,
    route::Route,
    transport::{Frame, FrameError, TransportError, timestamp_ms},
    tunnel::{ConnectionState, TunnelConnection},
};

/// How long teardown waits for the writer to flush and close the socket.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a connected control channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Replaced,
    KeepaliveTimeout,
    SendFailed,
}

pub struct ControlChannel {
    registry: Arc<TunnelRegistry>,
    authorizer: Arc<dyn Authorizer>,
    config: RelayConfig,
}

impl ControlChannel {
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

    /// Drives one control connection from handshake to teardown.
    ///
    /// Handshake failures are answered with a single generic `error` frame
    /// before the socket is closed. A malformed frame after the handshake
    /// is returned as `MalformedFrame` once teardown has completed.
    pub async fn run<R, W>(&self, mut reader: R, mut writer: W) -> Result<CloseReason, RelayError>
    where
        R: Stream<Item = Result<Bytes, TransportError>> + Unpin,
        W: Sink<Bytes, Error = TransportError> + Unpin + Send + 'static,
    {
        let (route, grant) = match self.handshake(&mut reader).await {
            Ok(accepted) => accepted,
            Err(err) => {
                reject(&mut writer, &err).await;
                return Err(err);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(TunnelConnection::new(
            self.registry.next_connection_id(),
            route,
            grant,
            outbound_tx,
        ));
        connection.touch();

        // Live before it becomes visible, with the acknowledgement queued
        // ahead of any relayed request.
        connection.set_state(ConnectionState::Connected);
        let acknowledged = connection.send(Frame::Hello {
            token: String::new(),
            route: connection.route().to_string(),
        });

        let registration = match self.registry.register(Arc::clone(&connection)) {
            Ok(registration) => registration,
            Err(err) => {
                connection.close();
                connection.set_state(ConnectionState::Closed);
                reject(&mut writer, &err).await;
                return Err(err);
            }
        };

        let mut writer_task = tokio::spawn(write_frames(
            outbound_rx,
            writer,
            Arc::clone(&connection),
        ));
        let mut writer_finished = false;

        info!(
            "Tunnel {} connected (connection {}, owner {}, {:?}{})",
            registration.route,
            registration.connection_id,
            connection.owner(),
            connection.visibility(),
            registration
                .replaced
                .map(|old| format!(", replaced {old}"))
                .unwrap_or_default(),
        );

        let outcome = match acknowledged {
            Ok(()) => {
                self.pump(&connection, &mut reader, &mut writer_task, &mut writer_finished)
                    .await
            }
            Err(_) => Ok(CloseReason::SendFailed),
        };

        // Closing: nothing may wait on this tunnel past this point.
        connection.close();
        let failed = connection
            .pending()
            .fail_all(RelayError::TunnelDisconnected);
        self.registry.unregister(connection.route(), connection.id());
        if !writer_finished {
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await;
        }
        connection.set_state(ConnectionState::Closed);

        match &outcome {
            Ok(reason) => info!(
                "Tunnel {} disconnected (connection {}): {:?}, {} pending request(s) failed",
                connection.route(),
                connection.id(),
                reason,
                failed
            ),
            Err(err) => warn!(
                "Tunnel {} dropped (connection {}): {}, {} pending request(s) failed",
                connection.route(),
                connection.id(),
                err,
                failed
            ),
        }
        outcome
    }

    async fn handshake<R>(&self, reader: &mut R) -> Result<(Route, Grant), RelayError>
    where
        R: Stream<Item = Result<Bytes, TransportError>> + Unpin,
    {
        let first = tokio::time::timeout(self.config.keepalive_interval(), reader.next())
            .await
            .map_err(|_| RelayError::TunnelTimeout)?;
        let (token, route) = match first {
            Some(Ok(bytes)) => match Frame::decode(bytes)? {
                Frame::Hello { token, route } => (token, route),
                other => return Err(FrameError::Unexpected(other.kind().as_str()).into()),
            },
            Some(Err(err)) => {
                debug!("Control connection failed before hello: {}", err);
                return Err(RelayError::TunnelDisconnected);
            }
            None => return Err(RelayError::TunnelDisconnected),
        };

        let route = Route::parse(&route)?;
        let grant = self
            .authorizer
            .authorize_tunnel(&token, &route)
            .map_err(|err| {
                warn!("Tunnel {} failed authorization: {}", route, err);
                RelayError::Unauthorized
            })?;
        Ok((route, grant))
    }

    async fn pump<R>(
        &self,
        connection: &Arc<TunnelConnection>,
        reader: &mut R,
        writer_task: &mut JoinHandle<Result<(), TransportError>>,
        writer_finished: &mut bool,
    ) -> Result<CloseReason, RelayError>
    where
        R: Stream<Item = Result<Bytes, TransportError>> + Unpin,
    {
        let interval = self.config.keepalive_interval();
        let deadline = self.config.keepalive_deadline();
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = connection.closed() => return Ok(CloseReason::Replaced),

                result = &mut *writer_task => {
                    *writer_finished = true;
                    match result {
                        Ok(Err(err)) => debug!("Tunnel {} writer failed: {}", connection.route(), err),
                        Err(err) => debug!("Tunnel {} writer panicked: {}", connection.route(), err),
                        Ok(Ok(())) => {}
                    }
                    return Ok(CloseReason::SendFailed);
                }

                inbound = reader.next() => {
                    let bytes = match inbound {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(err)) => {
                            debug!("Tunnel {} read failed: {}", connection.route(), err);
                            return Ok(CloseReason::PeerClosed);
                        }
                        None => return Ok(CloseReason::PeerClosed),
                    };
                    connection.touch();
                    let frame = Frame::decode(bytes)?;
                    self.dispatch(connection, frame)?;
                }

                _ = keepalive.tick() => {
                    if connection.idle_for() >= deadline {
                        warn!(
                            "Tunnel {} silent for {:?}, treating as dead",
                            connection.route(),
                            connection.idle_for()
                        );
                        return Ok(CloseReason::KeepaliveTimeout);
                    }
                    if connection.send(Frame::Ping { timestamp_ms: timestamp_ms() }).is_err() {
                        return Ok(CloseReason::SendFailed);
                    }
                }
            }
        }
    }

    fn dispatch(&self, connection: &Arc<TunnelConnection>, frame: Frame) -> Result<(), RelayError> {
        match frame {
            Frame::Pong { timestamp_ms } => {
                debug!("Tunnel {} pong ({})", connection.route(), timestamp_ms);
            }
            Frame::Ping { timestamp_ms } => {
                let _ = connection.send(Frame::Pong { timestamp_ms });
            }
            Frame::Error {
                correlation_id: 0,
                code,
                message,
            } => {
                warn!(
                    "Tunnel {} reported error {}: {}",
                    connection.route(),
                    code,
                    message
                );
            }
            frame @ (Frame::ResponseHeader(_)
            | Frame::ResponseChunk { .. }
            | Frame::ResponseEnd { .. }
            | Frame::Error { .. }) => {
                connection.pending().resolve(frame);
            }
            frame @ (Frame::Hello { .. } | Frame::RelayRequest(_)) => {
                return Err(FrameError::Unexpected(frame.kind().as_str()).into());
            }
        }
        Ok(())
    }
}

async fn write_frames<W>(
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut writer: W,
    connection: Arc<TunnelConnection>,
) -> Result<(), TransportError>
where
    W: Sink<Bytes, Error = TransportError> + Unpin,
{
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => writer.send(frame.encode()).await?,
                None => break,
            },
            _ = connection.closed() => break,
        }
    }
    writer.close().await
}

async fn reject<W>(writer: &mut W, err: &RelayError)
where
    W: Sink<Bytes, Error = TransportError> + Unpin,
{
    let (code, message) = match err {
        RelayError::Unauthorized => (401, "authentication failed"),
        RelayError::InvalidRoute(_) => (400, "invalid route"),
        RelayError::AlreadyExists(_) => (409, "route already connected"),
        RelayError::TunnelTimeout => (408, "handshake timed out"),
        _ => (400, "protocol error"),
    };
    warn!("Rejecting control connection: {}", err);
    let frame = Frame::Error {
        correlation_id: 0,
        code,
        message: message.to_string(),
    };
    let _ = writer.send(frame.encode()).await;
    let _ = writer.close().await;
}
