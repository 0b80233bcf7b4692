//! Seams to the secure point-to-point transport that carries signaling.
//!
//! The device never speaks to sockets directly: streams, request/response
//! exchanges, ICE server resolution and byte-stream tunnels all come through
//! the traits below. `mock` provides in-memory implementations for tests and
//! `tcp` plain TCP ones for the standalone binary.

pub mod mock;
pub mod tcp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::IceServer;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("end of stream")]
    Eof,
    #[error("stream aborted")]
    Aborted,
    #[error("stream closed")]
    Closed,
    #[error("connection is not attached to a relay service")]
    NotAttached,
    #[error("request rejected with status {0}")]
    Rejected(u16),
    #[error("transport io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// Identifies the authenticated transport connection a stream or request
/// arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionRef(pub u64);

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One accepted duplex signaling stream.
///
/// A session issues at most one `read_all` and one `write_all` at a time;
/// implementations may rely on that.
#[async_trait]
pub trait SignalingStream: Send + Sync {
    fn connection(&self) -> ConnectionRef;

    /// Complete the stream-level accept handshake.
    async fn accept(&self) -> Result<(), TransportError>;

    /// Read exactly `len` bytes. A stream that is shutting down may return
    /// fewer; `Eof` means nothing could be read at all.
    async fn read_all(&self, len: usize) -> Result<Bytes, TransportError>;

    async fn write_all(&self, data: Bytes) -> Result<(), TransportError>;

    /// Graceful close handshake.
    async fn close(&self) -> Result<(), TransportError>;

    /// Tear the stream down immediately; outstanding operations fail.
    fn abort(&self);
}

#[async_trait]
pub trait StreamListener: Send + Sync {
    /// The port clients open streams on.
    fn port(&self) -> u32;

    async fn accept(&self) -> Result<Arc<dyn SignalingStream>, TransportError>;
}

#[async_trait]
pub trait RequestListener: Send + Sync {
    async fn next_request(&self) -> Result<IncomingRequest, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn parse(text: &str) -> Option<Method> {
        match text {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapRequest {
    pub method: Method,
    pub path: String,
    pub content_format: Option<u16>,
    pub accept: Option<u16>,
    pub payload: Option<Bytes>,
}

impl CoapRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            content_format: None,
            accept: None,
            payload: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapResponse {
    pub status: u16,
    pub content_format: Option<u16>,
    pub payload: Bytes,
}

impl CoapResponse {
    pub fn error(status: u16) -> Self {
        Self {
            status,
            content_format: None,
            payload: Bytes::new(),
        }
    }
}

/// A request waiting for the device to answer it.
pub struct IncomingRequest {
    pub connection: ConnectionRef,
    pub request: CoapRequest,
    responder: oneshot::Sender<CoapResponse>,
}

impl IncomingRequest {
    pub fn new(
        connection: ConnectionRef,
        request: CoapRequest,
    ) -> (IncomingRequest, oneshot::Receiver<CoapResponse>) {
        let (responder, rx) = oneshot::channel();
        (
            IncomingRequest {
                connection,
                request,
                responder,
            },
            rx,
        )
    }

    pub fn respond(self, response: CoapResponse) {
        if self.responder.send(response).is_err() {
            tracing::debug!(connection = %self.connection, "request abandoned before response");
        }
    }
}

impl fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("connection", &self.connection)
            .field("request", &self.request)
            .finish()
    }
}

/// Raw byte tunnel opened on behalf of a `stream-<port>` data channel.
#[async_trait]
pub trait ByteStream: Send + Sync {
    /// Read up to `max` bytes; `Eof` once the remote side finished.
    async fn read_some(&self, max: usize) -> Result<Bytes, TransportError>;
    async fn write_all(&self, data: Bytes) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Services the transport offers to a running device.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn resolve_ice_servers(&self, identifier: &str) -> Result<Vec<IceServer>, TransportError>;

    async fn execute_request(
        &self,
        connection: ConnectionRef,
        request: CoapRequest,
    ) -> Result<CoapResponse, TransportError>;

    async fn open_byte_stream(
        &self,
        connection: ConnectionRef,
        port: u32,
    ) -> Result<Arc<dyn ByteStream>, TransportError>;
}

/// Authorization decision for an action on a connection.
pub trait AccessControl: Send + Sync {
    fn check(&self, connection: ConnectionRef, action: &str) -> bool;
}

impl<F> AccessControl for F
where
    F: Fn(ConnectionRef, &str) -> bool + Send + Sync,
{
    fn check(&self, connection: ConnectionRef, action: &str) -> bool {
        self(connection, action)
    }
}
