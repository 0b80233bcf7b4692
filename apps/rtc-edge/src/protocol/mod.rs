//! Signaling wire vocabulary.
//!
//! Two message sets share the same framing: the integer-tagged v1 set and
//! the string-tagged v2 set. Each decodes into its own sum type; unknown tags
//! survive decoding as an explicit `Unknown` variant so the session can log
//! and move on.

pub mod discovery;
pub mod framing;
pub mod v1;
pub mod v2;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("frame of {0} bytes exceeds the length prefix")]
    FrameTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "v1",
            ProtocolVersion::V2 => "v2",
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

/// A resolved STUN/TURN server in the `RTCIceServer` shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Self::default()
        }
    }
}

/// Messages the negotiation engine asks the session to deliver. The session
/// renders them in its own protocol version.
pub trait SignalOut {
    fn send_description(&mut self, description: &SessionDescription, metadata: &Value);
    fn send_candidate(&mut self, candidate: &IceCandidate, metadata: &Value);
}

/// Sink used once a session is gone; signals have nowhere to go.
pub struct Discard;

impl SignalOut for Discard {
    fn send_description(&mut self, _: &SessionDescription, _: &Value) {}
    fn send_candidate(&mut self, _: &IceCandidate, _: &Value) {}
}

pub(crate) fn to_frame<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(message)?;
    framing::encode_frame(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ice_server_omits_missing_credentials() {
        let value = serde_json::to_value(IceServer::stun("stun:stun.example.net")).unwrap();
        assert_eq!(value, json!({"urls": ["stun:stun.example.net"]}));
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate: IceCandidate =
            serde_json::from_value(json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0"}))
                .unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    }
}
