//! Background loops feeding accepted streams and discovery requests into
//! the device worker.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::device::Device;
use crate::protocol::ProtocolVersion;
use crate::protocol::discovery::{INFO_PATH, SignalingInfo};
use crate::scheduler::Scheduler;
use crate::transport::{CoapRequest, CoapResponse, Method, RequestListener, StreamListener};

pub(crate) const STATUS_CONTENT: u16 = 205;
pub(crate) const STATUS_UNAUTHORIZED: u16 = 401;
pub(crate) const STATUS_NOT_FOUND: u16 = 404;
pub(crate) const STATUS_INTERNAL: u16 = 500;

/// Accept streams until the listener fails. The accept loop holds one unit
/// of scheduler work for as long as it runs.
pub(crate) fn spawn_accept_loop(
    scheduler: Scheduler<Device>,
    runtime: &Handle,
    version: ProtocolVersion,
    listener: Arc<dyn StreamListener>,
) -> JoinHandle<()> {
    let work = scheduler.work();
    runtime.spawn(async move {
        let _work = work;
        tracing::info!(%version, port = listener.port(), "accepting signaling streams");
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    scheduler.post(move |device| device.stream_accepted(version, stream));
                }
                Err(err) => {
                    tracing::warn!(%version, error = %err, "signaling listener stopped");
                    break;
                }
            }
        }
    })
}

pub(crate) fn spawn_request_loop(
    scheduler: Scheduler<Device>,
    runtime: &Handle,
    listener: Arc<dyn RequestListener>,
) -> JoinHandle<()> {
    let work = scheduler.work();
    runtime.spawn(async move {
        let _work = work;
        loop {
            match listener.next_request().await {
                Ok(request) => scheduler.post(move |device| device.handle_info_request(request)),
                Err(err) => {
                    tracing::debug!(error = %err, "request listener stopped");
                    break;
                }
            }
        }
    })
}

/// Answer one discovery request. `allowed` is the access decision for the
/// requesting connection.
pub(crate) fn info_response(request: &CoapRequest, allowed: bool, info: &SignalingInfo) -> CoapResponse {
    if request.method != Method::Get || request.path != INFO_PATH {
        return CoapResponse::error(STATUS_NOT_FOUND);
    }
    if !allowed {
        return CoapResponse::error(STATUS_UNAUTHORIZED);
    }
    match info.encode(request.accept) {
        Ok((content_format, payload)) => CoapResponse {
            status: STATUS_CONTENT,
            content_format: Some(content_format),
            payload,
        },
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode signaling info");
            CoapResponse::error(STATUS_INTERNAL)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::discovery::{CONTENT_FORMAT_CBOR, CONTENT_FORMAT_JSON};
    use serde_json::{Value, json};

    fn info() -> SignalingInfo {
        SignalingInfo {
            v1_port: Some(0x8000_0001),
            v2_port: Some(0x8000_0002),
        }
    }

    #[test]
    fn answers_with_both_ports_as_json() {
        let response = info_response(&CoapRequest::get(INFO_PATH), true, &info());
        assert_eq!(response.status, STATUS_CONTENT);
        assert_eq!(response.content_format, Some(CONTENT_FORMAT_JSON));
        let body: Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(
            body,
            json!({"SignalingStreamPort": 0x8000_0001u32, "SignalingV2StreamPort": 0x8000_0002u32})
        );
    }

    #[test]
    fn honors_cbor_accept() {
        let mut request = CoapRequest::get(INFO_PATH);
        request.accept = Some(CONTENT_FORMAT_CBOR);
        let response = info_response(&request, true, &info());
        assert_eq!(response.content_format, Some(CONTENT_FORMAT_CBOR));
        assert_eq!(response.payload[0], 0xa2);
    }

    #[test]
    fn denied_and_unknown_requests() {
        assert_eq!(
            info_response(&CoapRequest::get(INFO_PATH), false, &info()).status,
            STATUS_UNAUTHORIZED
        );
        assert_eq!(
            info_response(&CoapRequest::get("/other"), true, &info()).status,
            STATUS_NOT_FOUND
        );
        let mut post = CoapRequest::get(INFO_PATH);
        post.method = Method::Post;
        assert_eq!(info_response(&post, true, &info()).status, STATUS_NOT_FOUND);
    }
}
