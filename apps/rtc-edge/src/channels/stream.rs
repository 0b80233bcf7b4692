//! One-way byte stream bridge: device stream → `stream-<port>` channel.
//!
//! Inbound channel messages are not forwarded to the stream. The bridge
//! reports once the pump ends so its owner can release it.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::peer::{ChannelMessage, MessageKind, RtcDataChannel};
use crate::transport::{ConnectionRef, DeviceTransport, TransportError};

pub struct StreamBridge {
    channel: Arc<dyn RtcDataChannel>,
    pump: JoinHandle<()>,
}

impl StreamBridge {
    pub fn start(
        channel: Arc<dyn RtcDataChannel>,
        connection: ConnectionRef,
        port: u32,
        transport: Arc<dyn DeviceTransport>,
        runtime: &Handle,
        chunk_size: usize,
        on_finished: impl FnOnce() + Send + 'static,
    ) -> Self {
        channel.set_message_sink(Some(Arc::new(move |message: ChannelMessage| {
            tracing::debug!(%connection, port, len = message.data.len(), "dropping message on stream channel");
        })));
        let pump = runtime.spawn({
            let channel = Arc::clone(&channel);
            async move {
                pump(channel, connection, port, transport, chunk_size.max(1)).await;
                on_finished();
            }
        });
        Self { channel, pump }
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        self.pump.abort();
        self.channel.set_message_sink(None);
    }
}

async fn pump(
    channel: Arc<dyn RtcDataChannel>,
    connection: ConnectionRef,
    port: u32,
    transport: Arc<dyn DeviceTransport>,
    chunk_size: usize,
) {
    let stream = match transport.open_byte_stream(connection, port).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(%connection, port, error = %err, "failed to open byte stream");
            channel.close().await;
            return;
        }
    };
    tracing::debug!(%connection, port, "byte stream opened");
    loop {
        match stream.read_some(chunk_size).await {
            Ok(data) => {
                let message = ChannelMessage {
                    kind: MessageKind::Binary,
                    data,
                };
                if let Err(err) = channel.send(message).await {
                    tracing::warn!(%connection, port, error = %err, "stream channel send failed");
                    break;
                }
            }
            Err(TransportError::Eof) => {
                tracing::debug!(%connection, port, "byte stream finished");
                break;
            }
            Err(err) => {
                tracing::warn!(%connection, port, error = %err, "byte stream read failed");
                break;
            }
        }
    }
    if let Err(err) = stream.close().await {
        tracing::debug!(%connection, port, error = %err, "byte stream close failed");
    }
    channel.close().await;
}
