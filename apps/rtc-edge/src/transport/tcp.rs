//! Plain TCP stand-ins for the secure transport, used by the standalone
//! binary. Every TCP connection counts as one transport connection.
//!
//! Discovery requests travel as one framed JSON object per TCP connection:
//! `{"method":"GET","path":"/p2p/webrtc-info","accept":50}` answered by
//! `{"statusCode":205,"contentFormat":50,"payload":[..bytes..]}`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, warn};

use super::{
    ByteStream, CoapRequest, CoapResponse, ConnectionRef, DeviceTransport, IncomingRequest,
    Method, RequestListener, SignalingStream, StreamListener, TransportError,
};
use crate::protocol::IceServer;
use crate::protocol::framing::encode_frame;

#[derive(Debug, Default)]
pub struct TcpNetwork {
    next_connection: AtomicU64,
}

impl TcpNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn connection(&self) -> ConnectionRef {
        ConnectionRef(self.next_connection.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub async fn bind_streams(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<Arc<TcpStreamListener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        Ok(Arc::new(TcpStreamListener {
            listener,
            port: u32::from(port),
            network: Arc::clone(self),
        }))
    }

    pub async fn bind_requests(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<Arc<TcpRequestListener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let network = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let connection = network.connection();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_request(socket, connection, tx).await {
                                debug!(%peer, error = %err, "discovery request failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "discovery listener stopped");
                        break;
                    }
                }
            }
        });
        Ok(Arc::new(TcpRequestListener {
            local,
            rx: AsyncMutex::new(rx),
            task,
        }))
    }
}

pub struct TcpStreamListener {
    listener: TcpListener,
    port: u32,
    network: Arc<TcpNetwork>,
}

#[async_trait]
impl StreamListener for TcpStreamListener {
    fn port(&self) -> u32 {
        self.port
    }

    async fn accept(&self) -> Result<Arc<dyn SignalingStream>, TransportError> {
        let (socket, peer) = self.listener.accept().await?;
        socket.set_nodelay(true)?;
        let connection = self.network.connection();
        debug!(%peer, %connection, "tcp signaling stream accepted");
        let (reader, writer) = socket.into_split();
        let (abort, _) = watch::channel(false);
        Ok(Arc::new(TcpSignalingStream {
            connection,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            abort,
        }))
    }
}

pub struct TcpSignalingStream {
    connection: ConnectionRef,
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    abort: watch::Sender<bool>,
}

impl TcpSignalingStream {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if *self.abort.borrow() {
            return Err(TransportError::Aborted);
        }
        Ok(())
    }

    async fn aborted(&self) {
        let mut rx = self.abort.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
impl SignalingStream for TcpSignalingStream {
    fn connection(&self) -> ConnectionRef {
        self.connection
    }

    async fn accept(&self) -> Result<(), TransportError> {
        self.ensure_open()
    }

    async fn read_all(&self, len: usize) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = tokio::select! {
                read = reader.read(&mut buf[filled..]) => read?,
                _ = self.aborted() => return Err(TransportError::Aborted),
            };
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 && len > 0 {
            return Err(TransportError::Eof);
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn write_all(&self, data: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        tokio::select! {
            written = writer.write_all(&data) => Ok(written?),
            _ = self.aborted() => Err(TransportError::Aborted),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    fn abort(&self) {
        self.abort.send_replace(true);
    }
}

pub struct TcpRequestListener {
    local: SocketAddr,
    rx: AsyncMutex<mpsc::UnboundedReceiver<IncomingRequest>>,
    task: tokio::task::JoinHandle<()>,
}

impl TcpRequestListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for TcpRequestListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl RequestListener for TcpRequestListener {
    async fn next_request(&self) -> Result<IncomingRequest, TransportError> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}

#[derive(Debug, Deserialize)]
struct WireRequest {
    method: String,
    path: String,
    #[serde(default)]
    accept: Option<u16>,
    #[serde(default, rename = "contentFormat")]
    content_format: Option<u16>,
    #[serde(default)]
    payload: Option<Vec<u8>>,
}

#[derive(Debug, Serialize)]
struct WireResponse {
    #[serde(rename = "statusCode")]
    status: u16,
    #[serde(rename = "contentFormat", skip_serializing_if = "Option::is_none")]
    content_format: Option<u16>,
    payload: Vec<u8>,
}

async fn serve_request(
    mut socket: TcpStream,
    connection: ConnectionRef,
    tx: mpsc::UnboundedSender<IncomingRequest>,
) -> Result<(), TransportError> {
    let len = socket.read_u32_le().await?;
    let mut body = vec![0u8; len as usize];
    socket.read_exact(&mut body).await?;
    let response = match serde_json::from_slice::<WireRequest>(&body) {
        Ok(wire) => match Method::parse(&wire.method) {
            Some(method) => {
                let request = CoapRequest {
                    method,
                    path: wire.path,
                    content_format: wire.content_format,
                    accept: wire.accept,
                    payload: wire.payload.map(Bytes::from),
                };
                let (incoming, answer) = IncomingRequest::new(connection, request);
                tx.send(incoming).map_err(|_| TransportError::Closed)?;
                answer.await.map_err(|_| TransportError::Closed)?
            }
            None => CoapResponse::error(405),
        },
        Err(err) => {
            debug!(%connection, error = %err, "malformed discovery request");
            CoapResponse::error(400)
        }
    };
    let wire = WireResponse {
        status: response.status,
        content_format: response.content_format,
        payload: response.payload.to_vec(),
    };
    let body = serde_json::to_vec(&wire).map_err(|err| TransportError::Setup(err.to_string()))?;
    let frame = encode_frame(&body).map_err(|err| TransportError::Setup(err.to_string()))?;
    socket.write_all(&frame).await?;
    socket.shutdown().await?;
    Ok(())
}

/// Transport services for a device that is not attached to a relay service:
/// ICE servers come from configuration and byte streams reach local TCP
/// services on the loopback interface.
pub struct LocalTransport {
    ice_servers: Vec<IceServer>,
}

impl LocalTransport {
    pub fn new(ice_servers: Vec<IceServer>) -> Arc<Self> {
        Arc::new(Self { ice_servers })
    }
}

#[async_trait]
impl DeviceTransport for LocalTransport {
    async fn resolve_ice_servers(&self, _identifier: &str) -> Result<Vec<IceServer>, TransportError> {
        if self.ice_servers.is_empty() {
            return Err(TransportError::NotAttached);
        }
        Ok(self.ice_servers.clone())
    }

    async fn execute_request(
        &self,
        connection: ConnectionRef,
        request: CoapRequest,
    ) -> Result<CoapResponse, TransportError> {
        debug!(%connection, method = request.method.as_str(), path = %request.path, "no local request handlers");
        Ok(CoapResponse::error(404))
    }

    async fn open_byte_stream(
        &self,
        connection: ConnectionRef,
        port: u32,
    ) -> Result<Arc<dyn ByteStream>, TransportError> {
        let port = u16::try_from(port).map_err(|_| TransportError::Rejected(404))?;
        let socket = TcpStream::connect(("127.0.0.1", port)).await?;
        debug!(%connection, port, "byte stream opened");
        let (reader, writer) = socket.into_split();
        Ok(Arc::new(TcpByteStream {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
        }))
    }
}

struct TcpByteStream {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
}

#[async_trait]
impl ByteStream for TcpByteStream {
    async fn read_some(&self, max: usize) -> Result<Bytes, TransportError> {
        let mut buf = vec![0u8; max];
        let n = self.reader.lock().await.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Eof);
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write_all(&self, data: Bytes) -> Result<(), TransportError> {
        self.writer.lock().await.write_all(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn signaling_stream_reports_eof_after_peer_shutdown() {
        let network = TcpNetwork::new();
        let listener = network
            .bind_streams("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let port = listener.port() as u16;
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let stream = listener.accept().await.unwrap();
        stream.accept().await.unwrap();

        client.write_all(&[3, 0, 0, 0, b'a', b'b']).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(&stream.read_all(4).await.unwrap()[..], &[3, 0, 0, 0]);
        assert_eq!(&stream.read_all(3).await.unwrap()[..], b"ab");
        assert!(matches!(stream.read_all(4).await, Err(TransportError::Eof)));
    }

    #[tokio::test]
    async fn discovery_requests_are_answered_over_tcp() {
        let network = TcpNetwork::new();
        let listener = network
            .bind_requests("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(async move {
            let request = listener.next_request().await.unwrap();
            assert_eq!(request.request.path, "/p2p/webrtc-info");
            request.respond(CoapResponse {
                status: 205,
                content_format: Some(50),
                payload: Bytes::from_static(b"{}"),
            });
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let body = serde_json::to_vec(&json!({"method": "GET", "path": "/p2p/webrtc-info"})).unwrap();
        client.write_all(&encode_frame(&body).unwrap()).await.unwrap();
        let len = client.read_u32_le().await.unwrap();
        let mut reply = vec![0u8; len as usize];
        client.read_exact(&mut reply).await.unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["statusCode"], 205);
        assert_eq!(reply["payload"], json!([b'{', b'}']));
        server.await.unwrap();
    }
}
