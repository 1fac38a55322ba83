use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 1;

/// Version, kind and correlation id.
const HEADER_LEN: usize = 1 + 1 + 8;

/// Upper bound on header entries in one frame.
pub const MAX_HEADERS: usize = 1024;

pub type CorrelationId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame type {0}")]
    UnknownType(u8),

    #[error("frame truncated")]
    Truncated,

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid header")]
    InvalidHeader,

    #[error("too many headers ({0})")]
    TooManyHeaders(usize),

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("invalid method")]
    InvalidMethod,

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("unexpected {0} frame")]
    Unexpected(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 1,
    Ping = 2,
    Pong = 3,
    RelayRequest = 4,
    ResponseHeader = 5,
    ResponseChunk = 6,
    ResponseEnd = 7,
    Error = 8,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => FrameKind::Hello,
            2 => FrameKind::Ping,
            3 => FrameKind::Pong,
            4 => FrameKind::RelayRequest,
            5 => FrameKind::ResponseHeader,
            6 => FrameKind::ResponseChunk,
            7 => FrameKind::ResponseEnd,
            8 => FrameKind::Error,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Hello => "hello",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
            FrameKind::RelayRequest => "relay-request",
            FrameKind::ResponseHeader => "relay-response-header",
            FrameKind::ResponseChunk => "relay-response-chunk",
            FrameKind::ResponseEnd => "relay-response-end",
            FrameKind::Error => "error",
        }
    }
}

/// One unit of forwarded work, as carried to the tunnel client.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub correlation_id: CorrelationId,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub correlation_id: CorrelationId,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello { token: String, route: String },
    Ping { timestamp_ms: u64 },
    Pong { timestamp_ms: u64 },
    RelayRequest(RelayRequest),
    ResponseHeader(ResponseHead),
    ResponseChunk {
        correlation_id: CorrelationId,
        data: Bytes,
    },
    ResponseEnd {
        correlation_id: CorrelationId,
        error: Option<String>,
    },
    Error {
        correlation_id: CorrelationId,
        code: u16,
        message: String,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Hello { .. } => FrameKind::Hello,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::Pong { .. } => FrameKind::Pong,
            Frame::RelayRequest(_) => FrameKind::RelayRequest,
            Frame::ResponseHeader(_) => FrameKind::ResponseHeader,
            Frame::ResponseChunk { .. } => FrameKind::ResponseChunk,
            Frame::ResponseEnd { .. } => FrameKind::ResponseEnd,
            Frame::Error { .. } => FrameKind::Error,
        }
    }

    /// Zero for channel-level frames.
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            Frame::Hello { .. } | Frame::Ping { .. } | Frame::Pong { .. } => 0,
            Frame::RelayRequest(request) => request.correlation_id,
            Frame::ResponseHeader(head) => head.correlation_id,
            Frame::ResponseChunk { correlation_id, .. }
            | Frame::ResponseEnd { correlation_id, .. }
            | Frame::Error { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind() as u8);
        buf.put_u64(self.correlation_id());

        match self {
            Frame::Hello { token, route } => {
                put_str(&mut buf, token);
                put_str(&mut buf, route);
            }
            Frame::Ping { timestamp_ms } | Frame::Pong { timestamp_ms } => {
                buf.put_u64(*timestamp_ms);
            }
            Frame::RelayRequest(request) => {
                put_str(&mut buf, request.method.as_str());
                put_str(&mut buf, &request.path);
                match &request.query {
                    Some(query) => {
                        buf.put_u8(1);
                        put_str(&mut buf, query);
                    }
                    None => buf.put_u8(0),
                }
                put_headers(&mut buf, &request.headers);
                match &request.body {
                    Some(body) => {
                        buf.put_u8(1);
                        put_blob(&mut buf, body);
                    }
                    None => buf.put_u8(0),
                }
                buf.put_u64(request.received_at_ms);
            }
            Frame::ResponseHeader(head) => {
                buf.put_u16(head.status.as_u16());
                put_headers(&mut buf, &head.headers);
            }
            Frame::ResponseChunk { data, .. } => put_blob(&mut buf, data),
            Frame::ResponseEnd { error, .. } => match error {
                Some(message) => {
                    buf.put_u8(1);
                    put_str(&mut buf, message);
                }
                None => buf.put_u8(0),
            },
            Frame::Error { code, message, .. } => {
                buf.put_u16(*code);
                put_str(&mut buf, message);
            }
        }

        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let raw_kind = buf.get_u8();
        let kind = FrameKind::from_u8(raw_kind).ok_or(FrameError::UnknownType(raw_kind))?;
        let correlation_id = buf.get_u64();

        let frame = match kind {
            FrameKind::Hello => Frame::Hello {
                token: get_str(&mut buf, "token")?,
                route: get_str(&mut buf, "route")?,
            },
            FrameKind::Ping => Frame::Ping {
                timestamp_ms: get_u64(&mut buf)?,
            },
            FrameKind::Pong => Frame::Pong {
                timestamp_ms: get_u64(&mut buf)?,
            },
            FrameKind::RelayRequest => {
                let method = get_str(&mut buf, "method")?;
                let method =
                    Method::from_bytes(method.as_bytes()).map_err(|_| FrameError::InvalidMethod)?;
                let path = get_str(&mut buf, "path")?;
                let query = match get_u8(&mut buf)? {
                    0 => None,
                    _ => Some(get_str(&mut buf, "query")?),
                };
                let headers = get_headers(&mut buf)?;
                let body = match get_u8(&mut buf)? {
                    0 => None,
                    _ => Some(get_blob(&mut buf)?),
                };
                let received_at_ms = get_u64(&mut buf)?;
                Frame::RelayRequest(RelayRequest {
                    correlation_id,
                    method,
                    path,
                    query,
                    headers,
                    body,
                    received_at_ms,
                })
            }
            FrameKind::ResponseHeader => {
                let code = get_u16(&mut buf)?;
                let status =
                    StatusCode::from_u16(code).map_err(|_| FrameError::InvalidStatus(code))?;
                let headers = get_headers(&mut buf)?;
                Frame::ResponseHeader(ResponseHead {
                    correlation_id,
                    status,
                    headers,
                })
            }
            FrameKind::ResponseChunk => Frame::ResponseChunk {
                correlation_id,
                data: get_blob(&mut buf)?,
            },
            FrameKind::ResponseEnd => {
                let error = match get_u8(&mut buf)? {
                    0 => None,
                    _ => Some(get_str(&mut buf, "error")?),
                };
                Frame::ResponseEnd {
                    correlation_id,
                    error,
                }
            }
            FrameKind::Error => Frame::Error {
                correlation_id,
                code: get_u16(&mut buf)?,
                message: get_str(&mut buf, "message")?,
            },
        };

        if buf.has_remaining() {
            return Err(FrameError::TrailingBytes(buf.remaining()));
        }
        Ok(frame)
    }
}

impl From<&Frame> for Bytes {
    fn from(value: &Frame) -> Self {
        value.encode()
    }
}

impl TryFrom<Bytes> for Frame {
    type Error = FrameError;

    fn try_from(value: Bytes) -> Result<Self, FrameError> {
        Frame::decode(value)
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    put_blob(buf, value.as_bytes());
}

fn put_blob(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    buf.put_u32(headers.len() as u32);
    for (name, value) in headers {
        put_str(buf, name.as_str());
        put_blob(buf, value.as_bytes());
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8, FrameError> {
    if buf.remaining() < 1 {
        return Err(FrameError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, FrameError> {
    if buf.remaining() < 4 {
        return Err(FrameError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, FrameError> {
    if buf.remaining() < 8 {
        return Err(FrameError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_blob(buf: &mut Bytes) -> Result<Bytes, FrameError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated);
    }
    Ok(buf.split_to(len))
}

fn get_str(buf: &mut Bytes, field: &'static str) -> Result<String, FrameError> {
    let raw = get_blob(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
}

fn get_headers(buf: &mut Bytes) -> Result<HeaderMap, FrameError> {
    let count = get_u32(buf)? as usize;
    // Each entry needs at least two length prefixes.
    if buf.remaining() < count.saturating_mul(8) {
        return Err(FrameError::Truncated);
    }
    if count > MAX_HEADERS {
        return Err(FrameError::TooManyHeaders(count));
    }
    let mut headers =
        HeaderMap::try_with_capacity(count).map_err(|_| FrameError::TooManyHeaders(count))?;
    for _ in 0..count {
        let name = get_blob(buf)?;
        let value = get_blob(buf)?;
        let name = HeaderName::from_bytes(&name).map_err(|_| FrameError::InvalidHeader)?;
        let value = HeaderValue::from_maybe_shared(value).map_err(|_| FrameError::InvalidHeader)?;
        headers
            .try_append(name, value)
            .map_err(|_| FrameError::TooManyHeaders(count))?;
    }
    Ok(headers)
}
