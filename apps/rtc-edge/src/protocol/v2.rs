//! String-tagged (second generation) signaling messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{IceCandidate, IceServer, ProtocolError, SessionDescription};

const KNOWN_TAGS: &[&str] = &[
    "SETUP_REQUEST",
    "SETUP_RESPONSE",
    "CANDIDATE",
    "DESCRIPTION",
    "METADATA",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum Tagged {
    SetupRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        polite: Option<bool>,
    },
    SetupResponse {
        polite: bool,
        id: String,
        #[serde(rename = "iceServers", default)]
        ice_servers: Vec<IceServer>,
    },
    Candidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Description {
        description: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Metadata {
        #[serde(default)]
        metadata: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum V2Message {
    /// `polite` is the role the client asks for; `None` means the default.
    SetupRequest { polite: Option<bool> },
    SetupResponse {
        polite: bool,
        id: String,
        ice_servers: Vec<IceServer>,
    },
    Candidate {
        candidate: IceCandidate,
        metadata: Option<Value>,
    },
    Description {
        description: SessionDescription,
        metadata: Option<Value>,
    },
    Metadata(String),
    Unknown(Value),
}

impl V2Message {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let raw: Value = serde_json::from_slice(body)?;
        let tag = raw
            .get("type")
            .ok_or(ProtocolError::MissingField("type"))?
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "type",
                reason: "expected a string".into(),
            })?;
        if !KNOWN_TAGS.contains(&tag) {
            return Ok(V2Message::Unknown(raw));
        }
        let message = match serde_json::from_value::<Tagged>(raw)? {
            Tagged::SetupRequest { polite } => V2Message::SetupRequest { polite },
            Tagged::SetupResponse {
                polite,
                id,
                ice_servers,
            } => V2Message::SetupResponse {
                polite,
                id,
                ice_servers,
            },
            Tagged::Candidate {
                candidate,
                metadata,
            } => V2Message::Candidate {
                candidate,
                metadata: metadata.filter(|m| !m.is_null()),
            },
            Tagged::Description {
                description,
                metadata,
            } => V2Message::Description {
                description,
                metadata: metadata.filter(|m| !m.is_null()),
            },
            Tagged::Metadata { metadata } => V2Message::Metadata(match metadata {
                Value::String(text) => text,
                Value::Null => String::new(),
                other => other.to_string(),
            }),
        };
        Ok(message)
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let tagged = match self {
            V2Message::SetupRequest { polite } => Tagged::SetupRequest { polite: *polite },
            V2Message::SetupResponse {
                polite,
                id,
                ice_servers,
            } => Tagged::SetupResponse {
                polite: *polite,
                id: id.clone(),
                ice_servers: ice_servers.clone(),
            },
            V2Message::Candidate {
                candidate,
                metadata,
            } => Tagged::Candidate {
                candidate: candidate.clone(),
                metadata: metadata.clone(),
            },
            V2Message::Description {
                description,
                metadata,
            } => Tagged::Description {
                description: description.clone(),
                metadata: metadata.clone(),
            },
            V2Message::Metadata(text) => Tagged::Metadata {
                metadata: Value::String(text.clone()),
            },
            V2Message::Unknown(raw) => return Ok(raw.clone()),
        };
        Ok(serde_json::to_value(tagged)?)
    }

    pub fn encode(&self) -> Result<bytes::Bytes, ProtocolError> {
        super::to_frame(&self.to_value()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SdpType;
    use serde_json::json;

    fn decode(value: Value) -> V2Message {
        V2Message::decode(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn setup_request_polite_is_optional() {
        assert_eq!(
            decode(json!({"type": "SETUP_REQUEST"})),
            V2Message::SetupRequest { polite: None }
        );
        assert_eq!(
            decode(json!({"type": "SETUP_REQUEST", "polite": false})),
            V2Message::SetupRequest {
                polite: Some(false)
            }
        );
    }

    #[test]
    fn setup_response_uses_ice_servers_key() {
        let value = V2Message::SetupResponse {
            polite: true,
            id: "abc".into(),
            ice_servers: vec![IceServer::stun("stun:stun.example.net")],
        }
        .to_value()
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "SETUP_RESPONSE",
                "polite": true,
                "id": "abc",
                "iceServers": [{"urls": ["stun:stun.example.net"]}],
            })
        );
    }

    #[test]
    fn description_carries_metadata() {
        let message = decode(json!({
            "type": "DESCRIPTION",
            "description": {"type": "offer", "sdp": "v=0\r\n"},
            "metadata": {"tracks": [{"mid": "0", "trackId": "frontdoor-video"}]},
        }));
        let V2Message::Description {
            description,
            metadata,
        } = message
        else {
            panic!("expected description");
        };
        assert_eq!(description.sdp_type, SdpType::Offer);
        assert_eq!(metadata.unwrap()["tracks"][0]["trackId"], "frontdoor-video");
    }

    #[test]
    fn candidate_without_metadata_omits_field() {
        let value = V2Message::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.2 4000 typ host".into(),
                sdp_mid: Some("0".into()),
            },
            metadata: None,
        }
        .to_value()
        .unwrap();
        assert!(value.get("metadata").is_none());
        assert_eq!(value["candidate"]["sdpMid"], "0");
    }

    #[test]
    fn metadata_text_is_passed_through() {
        assert_eq!(
            decode(json!({"type": "METADATA", "metadata": "hello"})),
            V2Message::Metadata("hello".into())
        );
    }

    #[test]
    fn unknown_string_tag_is_preserved() {
        let raw = json!({"type": "RENEGOTIATE"});
        assert_eq!(decode(raw.clone()), V2Message::Unknown(raw));
    }

    #[test]
    fn malformed_known_message_is_an_error() {
        let err = V2Message::decode(br#"{"type":"DESCRIPTION","description":42}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
