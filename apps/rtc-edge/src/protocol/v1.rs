//! Integer-tagged (first generation) signaling messages.
//!
//! Descriptions and candidates travel as a JSON *string* inside `data`, the
//! way the first browser clients produced them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{IceCandidate, IceServer, ProtocolError, SessionDescription};

pub const OFFER: i64 = 0;
pub const ANSWER: i64 = 1;
pub const ICE: i64 = 2;
pub const TURN_REQUEST: i64 = 3;
pub const TURN_RESPONSE: i64 = 4;

const DEFAULT_TURN_PORT: u16 = 3478;

#[derive(Debug, Clone, PartialEq)]
pub enum V1Message {
    Offer {
        description: SessionDescription,
        metadata: Option<Value>,
    },
    Answer {
        description: SessionDescription,
        metadata: Option<Value>,
    },
    Ice {
        candidate: IceCandidate,
        metadata: Option<Value>,
    },
    TurnRequest,
    TurnResponse {
        servers: Vec<LegacyTurnServer>,
        ice_servers: Vec<IceServer>,
    },
    Unknown(Value),
}

/// Flattened server entry kept for clients that predate `iceServers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTurnServer {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl LegacyTurnServer {
    /// One entry per URL of every server.
    pub fn flatten(servers: &[IceServer]) -> Vec<LegacyTurnServer> {
        servers
            .iter()
            .flat_map(|server| {
                server.urls.iter().map(move |url| {
                    let (hostname, port) = split_host_port(url);
                    LegacyTurnServer {
                        hostname,
                        port,
                        username: server.username.clone().unwrap_or_default(),
                        password: server.credential.clone().unwrap_or_default(),
                    }
                })
            })
            .collect()
    }
}

fn split_host_port(url: &str) -> (String, u16) {
    let without_scheme = url
        .split_once(':')
        .filter(|(scheme, _)| matches!(*scheme, "turn" | "turns" | "stun" | "stuns"))
        .map_or(url, |(_, rest)| rest);
    let authority = without_scheme.split('?').next().unwrap_or(without_scheme);
    if let Some((host, port)) = authority.rsplit_once(':') {
        // Bare IPv6 literals have colons but no port.
        if !host.contains(':') || host.ends_with(']') {
            if let Ok(port) = port.parse() {
                return (host.to_owned(), port);
            }
        }
    }
    (authority.to_owned(), DEFAULT_TURN_PORT)
}

impl V1Message {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let raw: Value = serde_json::from_slice(body)?;
        let tag = raw
            .get("type")
            .ok_or(ProtocolError::MissingField("type"))?
            .as_i64()
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "type",
                reason: "expected an integer".into(),
            })?;
        let metadata = raw.get("metadata").filter(|m| !m.is_null()).cloned();
        let message = match tag {
            OFFER => V1Message::Offer {
                description: embedded(&raw)?,
                metadata,
            },
            ANSWER => V1Message::Answer {
                description: embedded(&raw)?,
                metadata,
            },
            ICE => V1Message::Ice {
                candidate: embedded(&raw)?,
                metadata,
            },
            TURN_REQUEST => V1Message::TurnRequest,
            TURN_RESPONSE => V1Message::TurnResponse {
                servers: field(&raw, "servers")?,
                ice_servers: field(&raw, "iceServers")?,
            },
            _ => V1Message::Unknown(raw),
        };
        Ok(message)
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            V1Message::Offer {
                description,
                metadata,
            } => json!({
                "type": OFFER,
                "data": serde_json::to_string(description)?,
                "metadata": metadata,
            }),
            V1Message::Answer {
                description,
                metadata,
            } => json!({
                "type": ANSWER,
                "data": serde_json::to_string(description)?,
                "metadata": metadata,
            }),
            V1Message::Ice {
                candidate,
                metadata,
            } => json!({
                "type": ICE,
                "data": serde_json::to_string(candidate)?,
                "metadata": metadata,
            }),
            V1Message::TurnRequest => json!({ "type": TURN_REQUEST }),
            V1Message::TurnResponse {
                servers,
                ice_servers,
            } => json!({
                "type": TURN_RESPONSE,
                "servers": servers,
                "iceServers": ice_servers,
            }),
            V1Message::Unknown(raw) => raw.clone(),
        };
        Ok(value)
    }

    pub fn encode(&self) -> Result<bytes::Bytes, ProtocolError> {
        super::to_frame(&self.to_value()?)
    }
}

fn embedded<T: for<'de> Deserialize<'de>>(raw: &Value) -> Result<T, ProtocolError> {
    let data = raw
        .get("data")
        .ok_or(ProtocolError::MissingField("data"))?
        .as_str()
        .ok_or_else(|| ProtocolError::InvalidField {
            field: "data",
            reason: "expected a json string".into(),
        })?;
    Ok(serde_json::from_str(data)?)
}

fn field<T: for<'de> Deserialize<'de> + Default>(
    raw: &Value,
    name: &'static str,
) -> Result<T, ProtocolError> {
    match raw.get(name) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value.clone())?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SdpType;

    #[test]
    fn offer_data_is_a_nested_json_string() {
        let body = json!({
            "type": 0,
            "data": "{\"sdp\":\"v=0\\r\\n\",\"type\":\"offer\"}",
            "metadata": {"noTrickle": true},
        });
        let message = V1Message::decode(body.to_string().as_bytes()).unwrap();
        let V1Message::Offer {
            description,
            metadata,
        } = message
        else {
            panic!("expected offer, got {message:?}");
        };
        assert_eq!(description.sdp_type, SdpType::Offer);
        assert_eq!(description.sdp, "v=0\r\n");
        assert_eq!(metadata, Some(json!({"noTrickle": true})));
    }

    #[test]
    fn answer_encodes_data_as_string() {
        let message = V1Message::Answer {
            description: SessionDescription::answer("v=0\r\n"),
            metadata: Some(json!({"status": "OK"})),
        };
        let value = message.to_value().unwrap();
        assert_eq!(value["type"], 1);
        let data: Value = serde_json::from_str(value["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["type"], "answer");
        assert_eq!(value["metadata"]["status"], "OK");
    }

    #[test]
    fn ice_candidate_decodes() {
        let body = json!({
            "type": 2,
            "data": "{\"candidate\":\"candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host\",\"sdpMid\":\"0\"}",
        });
        match V1Message::decode(body.to_string().as_bytes()).unwrap() {
            V1Message::Ice {
                candidate,
                metadata,
            } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert!(metadata.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_integer_tag_is_preserved() {
        let body = json!({"type": 42, "extra": true});
        assert_eq!(
            V1Message::decode(body.to_string().as_bytes()).unwrap(),
            V1Message::Unknown(body)
        );
    }

    #[test]
    fn string_tag_is_rejected() {
        let err = V1Message::decode(br#"{"type":"OFFER"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "type", .. }));
    }

    #[test]
    fn empty_turn_response_has_both_arrays() {
        let value = V1Message::TurnResponse {
            servers: Vec::new(),
            ice_servers: Vec::new(),
        }
        .to_value()
        .unwrap();
        assert_eq!(value, json!({"type": 4, "servers": [], "iceServers": []}));
    }

    #[test]
    fn legacy_servers_split_host_and_port() {
        let servers = vec![IceServer {
            urls: vec![
                "turn:turn.example.net:443?transport=tcp".into(),
                "turn:relay.example.net".into(),
            ],
            username: Some("user:1".into()),
            credential: Some("secret".into()),
        }];
        let flat = LegacyTurnServer::flatten(&servers);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].hostname, "turn.example.net");
        assert_eq!(flat[0].port, 443);
        assert_eq!(flat[0].username, "user:1");
        assert_eq!(flat[1].hostname, "relay.example.net");
        assert_eq!(flat[1].port, DEFAULT_TURN_PORT);
    }
}
