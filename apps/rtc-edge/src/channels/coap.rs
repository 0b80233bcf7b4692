//! Request/response bridge over the `coap` data channel.
//!
//! Requests are JSON text messages:
//! `{"type":0,"requestId":..,"method":"GET","path":"/x","contentType":50,"payload":[..]}`
//! and are answered on the same channel with
//! `{"type":1,"requestId":..,"statusCode":205,"contentType":50,"payload":[..]}`.
//! Each request runs as its own task; responses may arrive out of order.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::peer::{ChannelMessage, MessageKind, RtcDataChannel};
use crate::transport::{CoapRequest, ConnectionRef, DeviceTransport, Method};

const REQUEST: i64 = 0;
const RESPONSE: i64 = 1;

#[derive(Debug, Deserialize)]
struct ChannelRequest {
    #[serde(rename = "requestId", default)]
    request_id: Value,
    method: String,
    path: String,
    #[serde(rename = "contentType", default)]
    content_type: Option<u16>,
    #[serde(default)]
    payload: Option<Payload>,
}

/// Browsers send either a plain byte array or a serialized `Uint8Array`
/// wrapper.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Payload {
    Bytes(Vec<u8>),
    Wrapped { data: Vec<u8> },
}

impl Payload {
    fn into_bytes(self) -> Bytes {
        match self {
            Payload::Bytes(data) | Payload::Wrapped { data } => Bytes::from(data),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChannelResponse {
    #[serde(rename = "type")]
    kind: i64,
    #[serde(rename = "requestId")]
    request_id: Value,
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    content_type: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ChannelResponse {
    fn error(request_id: Value, error: impl Into<String>) -> Self {
        Self {
            kind: RESPONSE,
            request_id,
            status_code: None,
            content_type: None,
            payload: None,
            error: Some(error.into()),
        }
    }
}

pub struct CoapBridge {
    channel: Arc<dyn RtcDataChannel>,
}

impl CoapBridge {
    pub fn new(
        channel: Arc<dyn RtcDataChannel>,
        connection: ConnectionRef,
        transport: Arc<dyn DeviceTransport>,
        runtime: Handle,
    ) -> Self {
        let weak = Arc::downgrade(&channel);
        channel.set_message_sink(Some(Arc::new(move |message: ChannelMessage| {
            let Some(channel) = weak.upgrade() else {
                return;
            };
            let transport = Arc::clone(&transport);
            runtime.spawn(async move {
                let Some(response) = handle_message(connection, transport.as_ref(), &message.data).await
                else {
                    return;
                };
                match serde_json::to_vec(&response) {
                    Ok(body) => {
                        let reply = ChannelMessage {
                            kind: MessageKind::Text,
                            data: Bytes::from(body),
                        };
                        if let Err(err) = channel.send(reply).await {
                            tracing::debug!(%connection, error = %err, "failed to send coap response");
                        }
                    }
                    Err(err) => tracing::warn!(%connection, error = %err, "failed to encode coap response"),
                }
            });
        })));
        tracing::debug!(%connection, "coap channel opened");
        Self { channel }
    }
}

impl Drop for CoapBridge {
    fn drop(&mut self) {
        self.channel.set_message_sink(None);
    }
}

async fn handle_message(
    connection: ConnectionRef,
    transport: &dyn DeviceTransport,
    data: &[u8],
) -> Option<ChannelResponse> {
    let message: Value = match serde_json::from_slice(data) {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!(%connection, error = %err, "malformed coap channel message");
            return None;
        }
    };
    let kind = message.get("type").and_then(Value::as_i64);
    if kind != Some(REQUEST) {
        tracing::debug!(%connection, ?kind, "unhandled coap channel message type");
        return None;
    }
    let request: ChannelRequest = match serde_json::from_value(message) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!(%connection, error = %err, "invalid coap request");
            return None;
        }
    };
    let Some(method) = Method::parse(&request.method) else {
        tracing::info!(%connection, method = %request.method, "invalid coap method");
        return Some(ChannelResponse::error(request.request_id, "Invalid method"));
    };
    let (content_format, payload) = match request.payload {
        Some(payload) => (request.content_type, Some(payload.into_bytes())),
        None => (None, None),
    };
    let coap = CoapRequest {
        method,
        path: request.path,
        content_format,
        accept: None,
        payload,
    };
    match transport.execute_request(connection, coap).await {
        Ok(response) => Some(ChannelResponse {
            kind: RESPONSE,
            request_id: request.request_id,
            status_code: Some(response.status),
            content_type: response.content_format,
            payload: Some(response.payload.to_vec()),
            error: None,
        }),
        Err(err) => {
            tracing::warn!(%connection, error = %err, "coap request failed");
            Some(ChannelResponse::error(request.request_id, err.to_string()))
        }
    }
}
