//! In-memory transport used by tests.
//!
//! Streams are backed by `tokio::io::duplex` pipes. The device half is
//! instrumented through a [`StreamStats`] so tests can assert on how many
//! reads and writes were outstanding at once, and writes can be held back
//! with a gate to observe the session while a write is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc, oneshot, watch};

use super::{
    ByteStream, CoapRequest, CoapResponse, ConnectionRef, DeviceTransport, IncomingRequest,
    RequestListener, SignalingStream, StreamListener, TransportError,
};
use crate::protocol::IceServer;
use crate::protocol::framing::encode_frame;

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_EPHEMERAL_PORT: u32 = 0x8000_0000;

/// Allocates ports and connection refs the way a device transport would.
#[derive(Debug)]
pub struct MockNetwork {
    next_port: AtomicU32,
    next_connection: AtomicU64,
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self {
            next_port: AtomicU32::new(FIRST_EPHEMERAL_PORT),
            next_connection: AtomicU64::new(1),
        }
    }
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection(&self) -> ConnectionRef {
        ConnectionRef(self.next_connection.fetch_add(1, Ordering::SeqCst))
    }

    pub fn stream_listener(&self) -> Arc<MockStreamListener> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        MockStreamListener::new(port)
    }
}

/// Counters describing what the device did with one stream.
#[derive(Debug, Default)]
pub struct StreamStats {
    reads: AtomicUsize,
    writes: AtomicUsize,
    max_reads: AtomicUsize,
    max_writes: AtomicUsize,
    completed_writes: AtomicUsize,
    accepted: AtomicBool,
    closed: AtomicBool,
    aborted: AtomicBool,
}

impl StreamStats {
    pub fn max_concurrent_reads(&self) -> usize {
        self.max_reads.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_writes(&self) -> usize {
        self.max_writes.load(Ordering::SeqCst)
    }

    pub fn writes_in_flight(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn completed_writes(&self) -> usize {
        self.completed_writes.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub refuse_accept: bool,
    /// Each device write waits for one permit.
    pub write_gate: Option<Arc<Semaphore>>,
}

/// Device half of an in-memory signaling stream.
pub struct MemoryStream {
    connection: ConnectionRef,
    reader: AsyncMutex<ReadHalf<DuplexStream>>,
    writer: AsyncMutex<WriteHalf<DuplexStream>>,
    abort: watch::Sender<bool>,
    options: StreamOptions,
    stats: Arc<StreamStats>,
}

impl MemoryStream {
    pub fn pair(
        connection: ConnectionRef,
        options: StreamOptions,
    ) -> (Arc<MemoryStream>, ClientStream, Arc<StreamStats>) {
        let (device, client) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(device);
        let (abort, _) = watch::channel(false);
        let stats = Arc::new(StreamStats::default());
        let stream = Arc::new(MemoryStream {
            connection,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            abort,
            options,
            stats: Arc::clone(&stats),
        });
        (stream, ClientStream::new(client), stats)
    }

    fn check_aborted(&self) -> Result<(), TransportError> {
        if *self.abort.borrow() {
            Err(TransportError::Aborted)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SignalingStream for MemoryStream {
    fn connection(&self) -> ConnectionRef {
        self.connection
    }

    async fn accept(&self) -> Result<(), TransportError> {
        self.check_aborted()?;
        if self.options.refuse_accept {
            return Err(TransportError::Setup("accept refused".into()));
        }
        self.stats.accepted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_all(&self, len: usize) -> Result<Bytes, TransportError> {
        let _in_flight = InFlight::enter(&self.stats.reads, &self.stats.max_reads);
        self.check_aborted()?;
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = tokio::select! {
                read = reader.read(&mut buf[filled..]) => read?,
                _ = aborted(self.abort.subscribe()) => return Err(TransportError::Aborted),
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
        let _in_flight = InFlight::enter(&self.stats.writes, &self.stats.max_writes);
        self.check_aborted()?;
        if let Some(gate) = &self.options.write_gate {
            tokio::select! {
                permit = gate.acquire() => permit.map_err(|_| TransportError::Closed)?.forget(),
                _ = aborted(self.abort.subscribe()) => return Err(TransportError::Aborted),
            }
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        self.stats.completed_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.check_aborted()?;
        self.stats.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    fn abort(&self) {
        self.stats.aborted.store(true, Ordering::SeqCst);
        self.abort.send_replace(true);
    }
}

async fn aborted(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Client half of an in-memory signaling stream.
pub struct ClientStream {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
}

impl ClientStream {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self { reader, writer }
    }

    pub async fn send_json(&mut self, message: &Value) -> std::io::Result<()> {
        let body = serde_json::to_vec(message)?;
        let frame = encode_frame(&body)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        self.writer.write_all(&frame).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await
    }

    /// Read one frame and parse its body.
    pub async fn recv_json(&mut self) -> std::io::Result<Value> {
        let len = self.reader.read_u32_le().await?;
        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// True once the device closed its write direction.
    pub async fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.reader.read(&mut byte).await, Ok(0) | Err(_))
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}

pub struct MockStreamListener {
    port: u32,
    tx: mpsc::UnboundedSender<Arc<dyn SignalingStream>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Arc<dyn SignalingStream>>>,
}

impl MockStreamListener {
    pub fn new(port: u32) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            port,
            tx,
            rx: AsyncMutex::new(rx),
        })
    }

    pub fn connect(&self, connection: ConnectionRef) -> (ClientStream, Arc<StreamStats>) {
        self.connect_with(connection, StreamOptions::default())
    }

    pub fn connect_with(
        &self,
        connection: ConnectionRef,
        options: StreamOptions,
    ) -> (ClientStream, Arc<StreamStats>) {
        let (stream, client, stats) = MemoryStream::pair(connection, options);
        if self.tx.send(stream).is_err() {
            tracing::debug!(port = self.port, "stream listener dropped");
        }
        (client, stats)
    }
}

#[async_trait]
impl StreamListener for MockStreamListener {
    fn port(&self) -> u32 {
        self.port
    }

    async fn accept(&self) -> Result<Arc<dyn SignalingStream>, TransportError> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}

pub struct MockRequestListener {
    tx: mpsc::UnboundedSender<IncomingRequest>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<IncomingRequest>>,
}

impl MockRequestListener {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: AsyncMutex::new(rx),
        })
    }

    pub fn request(
        &self,
        connection: ConnectionRef,
        request: CoapRequest,
    ) -> oneshot::Receiver<CoapResponse> {
        let (incoming, response) = IncomingRequest::new(connection, request);
        if self.tx.send(incoming).is_err() {
            tracing::debug!("request listener dropped");
        }
        response
    }
}

#[async_trait]
impl RequestListener for MockRequestListener {
    async fn next_request(&self) -> Result<IncomingRequest, TransportError> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}

/// How `resolve_ice_servers` answers.
#[derive(Debug, Clone)]
pub enum IceResolution {
    Servers(Vec<IceServer>),
    NotAttached,
    Fail,
}

type RequestHandler = Box<dyn Fn(ConnectionRef, &CoapRequest) -> CoapResponse + Send + Sync>;

pub struct MockTransport {
    ice: Mutex<IceResolution>,
    ice_gate: Option<Arc<Semaphore>>,
    handler: Mutex<Option<RequestHandler>>,
    requests: Mutex<Vec<(ConnectionRef, CoapRequest)>>,
    byte_streams: Mutex<HashMap<u32, Arc<MemoryByteStream>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::build(IceResolution::Servers(Vec::new()), None)
    }

    pub fn with_ice(resolution: IceResolution) -> Arc<Self> {
        Self::build(resolution, None)
    }

    /// ICE resolution waits for one permit of `gate` per request.
    pub fn with_ice_gate(resolution: IceResolution, gate: Arc<Semaphore>) -> Arc<Self> {
        Self::build(resolution, Some(gate))
    }

    fn build(resolution: IceResolution, ice_gate: Option<Arc<Semaphore>>) -> Arc<Self> {
        Arc::new(Self {
            ice: Mutex::new(resolution),
            ice_gate,
            handler: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            byte_streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn on_request<F>(&self, handler: F)
    where
        F: Fn(ConnectionRef, &CoapRequest) -> CoapResponse + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub fn requests(&self) -> Vec<(ConnectionRef, CoapRequest)> {
        self.requests.lock().clone()
    }

    /// Make `port` available to `open_byte_stream`; returns the service end.
    pub fn serve_byte_stream(&self, port: u32) -> ByteStreamService {
        let (device, service) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(device);
        self.byte_streams.lock().insert(
            port,
            Arc::new(MemoryByteStream {
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
            }),
        );
        ByteStreamService { stream: service }
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn resolve_ice_servers(&self, _identifier: &str) -> Result<Vec<IceServer>, TransportError> {
        if let Some(gate) = &self.ice_gate {
            gate.acquire()
                .await
                .map_err(|_| TransportError::Closed)?
                .forget();
        }
        match self.ice.lock().clone() {
            IceResolution::Servers(servers) => Ok(servers),
            IceResolution::NotAttached => Err(TransportError::NotAttached),
            IceResolution::Fail => Err(TransportError::Setup("ice server request failed".into())),
        }
    }

    async fn execute_request(
        &self,
        connection: ConnectionRef,
        request: CoapRequest,
    ) -> Result<CoapResponse, TransportError> {
        let response = match self.handler.lock().as_ref() {
            Some(handler) => handler(connection, &request),
            None => CoapResponse::error(404),
        };
        self.requests.lock().push((connection, request));
        Ok(response)
    }

    async fn open_byte_stream(
        &self,
        _connection: ConnectionRef,
        port: u32,
    ) -> Result<Arc<dyn ByteStream>, TransportError> {
        match self.byte_streams.lock().remove(&port) {
            Some(stream) => Ok(stream as Arc<dyn ByteStream>),
            None => Err(TransportError::Rejected(404)),
        }
    }
}

struct MemoryByteStream {
    reader: AsyncMutex<ReadHalf<DuplexStream>>,
    writer: AsyncMutex<WriteHalf<DuplexStream>>,
}

#[async_trait]
impl ByteStream for MemoryByteStream {
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

/// The service side of a byte stream opened through [`MockTransport`].
pub struct ByteStreamService {
    stream: DuplexStream,
}

impl ByteStreamService {
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data).await
    }

    /// Signal end of stream to the device.
    pub async fn finish(mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}
