//! Tunnel command - claims a route on a relay and serves it from a local server.

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use routetunnel::{
    server::{CONTROL_PATH, INGRESS_PREFIX},
    transport::{Frame, RelayRequest, ResponseHead},
};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;

/// Expose a local server through a tunnel
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Local port to forward to
    #[arg(short, long)]
    port: u16,

    /// Local host (default: 127.0.0.1)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Route to claim on the relay
    #[arg(short, long)]
    route: Option<String>,

    /// Tunnel token bound to the route
    #[arg(long, env = "ROUTETUNNEL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Relay URL override
    #[arg(long, env = "ROUTETUNNEL_SERVER_URL")]
    server_url: Option<String>,
}

// =============================================================================
// Reconnection Constants
// =============================================================================

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 60000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The relay answered the hello with an `error` frame.
#[derive(Debug, Error)]
#[error("Relay rejected the tunnel ({code}): {message}")]
struct Rejected {
    code: u16,
    message: String,
}

impl Rejected {
    /// Bad credentials or a bad route will not fix themselves on retry.
    fn is_permanent(&self) -> bool {
        matches!(self.code, 400 | 401 | 403)
    }
}

// =============================================================================
// Execution
// =============================================================================

pub async fn execute(args: &Args, config: &Config, profile: &str) -> Result<()> {
    let profile_config = config.get_profile(profile).cloned().unwrap_or_default();

    let server_url = args
        .server_url
        .clone()
        .or(profile_config.server_url)
        .context("No relay URL configured. Pass --server-url or set it in the profile.")?;
    let route = args
        .route
        .clone()
        .or(profile_config.route)
        .context("No route configured. Pass --route or set it in the profile.")?;
    let token = args
        .token
        .clone()
        .or(profile_config.token)
        .context("No tunnel token configured. Pass --token or set it in the profile.")?;

    let control_url = control_url(&server_url)?;
    let public_url = public_url(&server_url, &route);

    // Resolve hostname to socket address
    let local_addr: SocketAddr = tokio::net::lookup_host(format!("{}:{}", args.host, args.port))
        .await
        .context("Failed to resolve local address")?
        .next()
        .context("No addresses found for local host")?;

    let client = local_client()?;

    // Run with reconnection
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut first_connect = true;

    loop {
        if !first_connect {
            info!("Reconnecting in {} ms...", backoff_ms);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down tunnel...");
                    break;
                }
            }
        }
        first_connect = false;

        let session = Session {
            control_url: &control_url,
            public_url: &public_url,
            token: &token,
            route: &route,
            local_addr,
            client: &client,
        };
        match session.connect_and_run(&mut backoff_ms).await {
            Ok(()) => {
                info!("Tunnel closed gracefully");
                break;
            }
            Err(e) if e.downcast_ref::<Rejected>().is_some_and(Rejected::is_permanent) => {
                return Err(e);
            }
            Err(e) => {
                error!("Tunnel error: {:#}", e);
                backoff_ms = next_backoff(backoff_ms);
            }
        }
    }

    Ok(())
}

fn next_backoff(current_ms: u64) -> u64 {
    (((current_ms as f64) * BACKOFF_MULTIPLIER) as u64).min(MAX_BACKOFF_MS)
}

/// Control endpoint on the relay for a base `http(s)://` or `ws(s)://` URL.
fn control_url(server_url: &str) -> Result<Url> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("Invalid relay URL: {}", server_url))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("Unsupported relay URL scheme: {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("Cannot switch {} to {}", server_url, scheme))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), CONTROL_PATH);
    url.set_path(&path);
    url.set_query(None);
    Ok(url)
}

fn public_url(server_url: &str, route: &str) -> String {
    format!(
        "{}{}{}/",
        server_url.trim_end_matches('/'),
        INGRESS_PREFIX,
        route
    )
}

fn local_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        // Don't auto-decompress - forward raw bytes to preserve Content-Encoding
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .no_zstd()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build local HTTP client")
}

// =============================================================================
// Tunnel Runtime
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WriteTx = mpsc::UnboundedSender<WsMessage>;

struct Session<'a> {
    control_url: &'a Url,
    public_url: &'a str,
    token: &'a str,
    route: &'a str,
    local_addr: SocketAddr,
    client: &'a reqwest::Client,
}

impl Session<'_> {
    async fn connect_and_run(&self, backoff_ms: &mut u64) -> Result<()> {
        info!("Connecting to {}...", self.control_url);

        let (mut ws_stream, _) = connect_async(self.control_url.as_str())
            .await
            .context("Failed to establish WebSocket connection")?;

        let hello = Frame::Hello {
            token: self.token.to_string(),
            route: self.route.to_string(),
        };
        ws_stream
            .send(WsMessage::Binary(hello.encode()))
            .await
            .context("Failed to send hello")?;

        let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut ws_stream))
            .await
            .context("Timed out waiting for the relay to accept the tunnel")??;
        match ack {
            Frame::Hello { .. } => {}
            Frame::Error { code, message, .. } => return Err(Rejected { code, message }.into()),
            other => bail!("Unexpected {} frame during handshake", other.kind().as_str()),
        }
        *backoff_ms = INITIAL_BACKOFF_MS;

        println!("\n✓ Tunnel established!");
        println!("  Public URL: {}", self.public_url);
        println!("  Forwarding: http://{}", self.local_addr);
        println!("\nPress Ctrl+C to stop the tunnel.\n");

        run_tunnel(ws_stream, self.local_addr, self.client.clone()).await
    }
}

async fn read_frame(ws_stream: &mut WsStream) -> Result<Frame> {
    while let Some(message) = ws_stream.next().await {
        match message.context("WebSocket error")? {
            WsMessage::Binary(data) => return Frame::decode(data).context("Malformed frame from relay"),
            WsMessage::Close(frame) => bail!("Relay closed the connection: {:?}", frame),
            _ => {}
        }
    }
    bail!("WebSocket connection closed unexpectedly")
}

/// Run the tunnel event loop
async fn run_tunnel(ws_stream: WsStream, local_addr: SocketAddr, client: reqwest::Client) -> Result<()> {
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WsMessage>();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = write_rx.recv().await {
            let closing = message.is_close();
            ws_write.send(message).await?;
            if closing {
                break;
            }
        }
        Ok::<_, tokio_tungstenite::tungstenite::Error>(())
    });

    loop {
        tokio::select! {
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => match Frame::decode(data) {
                        Ok(Frame::Ping { timestamp_ms }) => {
                            send_frame(&write_tx, Frame::Pong { timestamp_ms });
                        }
                        Ok(Frame::Pong { .. }) => {
                            debug!("Received pong");
                        }
                        Ok(Frame::RelayRequest(request)) => {
                            // Handle in separate task for concurrent processing
                            let write_tx = write_tx.clone();
                            let client = client.clone();
                            tokio::spawn(async move {
                                forward_request(request, local_addr, &client, &write_tx).await;
                            });
                        }
                        Ok(Frame::Error { code, message, .. }) => {
                            warn!("Relay reported error {}: {}", code, message);
                        }
                        Ok(other) => {
                            debug!("Ignoring {} frame", other.kind().as_str());
                        }
                        Err(e) => {
                            error!("Error decoding frame: {}", e);
                        }
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        bail!("Relay closed the connection: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(anyhow!("WebSocket error: {}", e));
                    }
                    None => {
                        bail!("WebSocket connection closed unexpectedly");
                    }
                }
            }
            result = &mut writer => {
                return match result {
                    Ok(Ok(())) => Err(anyhow!("WebSocket writer stopped")),
                    Ok(Err(e)) => Err(anyhow!("WebSocket write failed: {}", e)),
                    Err(e) => Err(anyhow!("WebSocket writer panicked: {}", e)),
                };
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down tunnel...");
                let _ = write_tx.send(WsMessage::Close(None));
                let _ = tokio::time::timeout(Duration::from_secs(1), &mut writer).await;
                return Ok(());
            }
        }
    }
}

fn send_frame(write_tx: &WriteTx, frame: Frame) -> bool {
    write_tx.send(WsMessage::Binary(frame.encode())).is_ok()
}

// =============================================================================
// Local Forwarding
// =============================================================================

fn request_target(request: &RelayRequest) -> String {
    match &request.query {
        Some(query) => format!("{}?{}", request.path, query),
        None => request.path.clone(),
    }
}

/// Replays one relayed request against the local server and streams the
/// response back as header, chunk and end frames.
async fn forward_request(
    request: RelayRequest,
    local_addr: SocketAddr,
    client: &reqwest::Client,
    write_tx: &WriteTx,
) {
    let id = request.correlation_id;
    let target = request_target(&request);
    let method = request.method;
    let url = format!("http://{}{}", local_addr, target);

    let mut headers = request.headers;
    headers.remove(header::HOST);
    // Keep the local server from compressing; the relay forwards bytes as-is.
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    let mut req = client.request(method.clone(), &url).headers(headers);
    if let Some(body) = request.body {
        req = req.body(body);
    }

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("Request {}: {} {} -> 502 ({})", id, method, target, e);
            send_bad_gateway(write_tx, id, &e.to_string());
            return;
        }
    };

    let status = resp.status();
    let head = Frame::ResponseHeader(ResponseHead {
        correlation_id: id,
        status,
        headers: resp.headers().clone(),
    });
    if !send_frame(write_tx, head) {
        return;
    }

    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(data) if data.is_empty() => {}
            Ok(data) => {
                if !send_frame(write_tx, Frame::ResponseChunk { correlation_id: id, data }) {
                    return;
                }
            }
            Err(e) => {
                warn!("Request {}: {} {} body failed ({})", id, method, target, e);
                send_frame(
                    write_tx,
                    Frame::ResponseEnd {
                        correlation_id: id,
                        error: Some(e.to_string()),
                    },
                );
                return;
            }
        }
    }
    send_frame(
        write_tx,
        Frame::ResponseEnd {
            correlation_id: id,
            error: None,
        },
    );

    info!("Request {}: {} {} -> {}", id, method, target, status.as_u16());
}

fn send_bad_gateway(write_tx: &WriteTx, id: u64, reason: &str) {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    let frames = [
        Frame::ResponseHeader(ResponseHead {
            correlation_id: id,
            status: StatusCode::BAD_GATEWAY,
            headers,
        }),
        Frame::ResponseChunk {
            correlation_id: id,
            data: Bytes::from(format!("Bad Gateway: {}", reason)),
        },
        Frame::ResponseEnd {
            correlation_id: id,
            error: None,
        },
    ];
    for frame in frames {
        if !send_frame(write_tx, frame) {
            break;
        }
    }
}
