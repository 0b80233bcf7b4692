//! The `GET /p2p/webrtc-info` exchange that tells a client which stream
//! ports accept signaling.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::ProtocolError;

pub const INFO_PATH: &str = "/p2p/webrtc-info";
pub const CONTENT_FORMAT_JSON: u16 = 50;
pub const CONTENT_FORMAT_CBOR: u16 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SignalingInfo {
    #[serde(rename = "SignalingStreamPort", skip_serializing_if = "Option::is_none")]
    pub v1_port: Option<u32>,
    #[serde(rename = "SignalingV2StreamPort", skip_serializing_if = "Option::is_none")]
    pub v2_port: Option<u32>,
}

impl SignalingInfo {
    /// Encode for the requested content format. Anything other than CBOR
    /// gets JSON.
    pub fn encode(&self, accept: Option<u16>) -> Result<(u16, Bytes), ProtocolError> {
        if accept == Some(CONTENT_FORMAT_CBOR) {
            return Ok((CONTENT_FORMAT_CBOR, self.to_cbor()));
        }
        let body = serde_json::to_vec(self)?;
        Ok((CONTENT_FORMAT_JSON, Bytes::from(body)))
    }

    fn entries(&self) -> Vec<(&'static str, u32)> {
        let mut entries = Vec::with_capacity(2);
        if let Some(port) = self.v1_port {
            entries.push(("SignalingStreamPort", port));
        }
        if let Some(port) = self.v2_port {
            entries.push(("SignalingV2StreamPort", port));
        }
        entries
    }

    // Definite-length map of text keys to unsigned integers (RFC 8949).
    fn to_cbor(&self) -> Bytes {
        let entries = self.entries();
        let mut buf = BytesMut::new();
        cbor_head(&mut buf, 5, entries.len() as u64);
        for (key, port) in entries {
            cbor_head(&mut buf, 3, key.len() as u64);
            buf.put_slice(key.as_bytes());
            cbor_head(&mut buf, 0, u64::from(port));
        }
        buf.freeze()
    }
}

fn cbor_head(buf: &mut BytesMut, major: u8, value: u64) {
    let major = major << 5;
    match value {
        0..=23 => buf.put_u8(major | value as u8),
        24..=0xff => {
            buf.put_u8(major | 24);
            buf.put_u8(value as u8);
        }
        0x100..=0xffff => {
            buf.put_u8(major | 25);
            buf.put_u16(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(major | 26);
            buf.put_u32(value as u32);
        }
        _ => {
            buf.put_u8(major | 27);
            buf.put_u64(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payload_names_both_ports() {
        let info = SignalingInfo {
            v1_port: Some(0x8000_0001),
            v2_port: Some(0x8000_0002),
        };
        let (format, body) = info.encode(None).unwrap();
        assert_eq!(format, CONTENT_FORMAT_JSON);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["SignalingStreamPort"], 0x8000_0001u32);
        assert_eq!(value["SignalingV2StreamPort"], 0x8000_0002u32);
    }

    #[test]
    fn unregistered_versions_are_omitted() {
        let info = SignalingInfo {
            v1_port: None,
            v2_port: Some(7),
        };
        let (_, body) = info.encode(Some(CONTENT_FORMAT_JSON)).unwrap();
        assert_eq!(&body[..], br#"{"SignalingV2StreamPort":7}"#);
    }

    #[test]
    fn cbor_payload_is_a_text_keyed_map() {
        let info = SignalingInfo {
            v1_port: Some(0x8000_0000),
            v2_port: None,
        };
        let (format, body) = info.encode(Some(CONTENT_FORMAT_CBOR)).unwrap();
        assert_eq!(format, CONTENT_FORMAT_CBOR);
        let mut expected = vec![0xa1, 0x60 | 19];
        expected.extend_from_slice(b"SignalingStreamPort");
        expected.extend_from_slice(&[0x1a, 0x80, 0x00, 0x00, 0x00]);
        assert_eq!(&body[..], &expected[..]);
    }
}
