//! Codec selection for tracks.
//!
//! A negotiator knows one codec. When a client offers a track it picks the
//! best matching payload type and strips every other codec from the track's
//! media section; when the device offers a track it produces the section.

use std::sync::Arc;

use super::MediaTrack;
use super::sdp::{self, attribute_for_payload, with_media_prefix};
use crate::ids::IdGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device only sends.
    SendOnly,
    /// Device only receives.
    RecvOnly,
    SendRecv,
}

impl Direction {
    fn attribute(self) -> &'static str {
        match self {
            Direction::SendOnly => "a=sendonly",
            Direction::RecvOnly => "a=recvonly",
            Direction::SendRecv => "a=sendrecv",
        }
    }

    fn sends(self) -> bool {
        matches!(self, Direction::SendOnly | Direction::SendRecv)
    }
}

pub trait TrackNegotiator: Send + Sync {
    /// Restrict `track` to this codec. Rewrites the track's SDP in place and
    /// returns the chosen payload type, or 0 when nothing matched (the SDP
    /// is then left untouched).
    fn match_track(&self, track: &MediaTrack) -> u8;

    /// A fresh `m=` section for a device-offered track.
    fn create_media(&self) -> String;

    /// Payload type the local media source produces.
    fn payload_type(&self) -> u8;

    fn ssrc(&self) -> u32;

    fn direction(&self) -> Direction;
}

/// Static description of a supported codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecProfile {
    pub kind: &'static str,
    pub name: &'static str,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    pub fmtp: Option<&'static str>,
    /// Parameters a perfect match carries; a plain name match is accepted
    /// when no offered payload has all of them.
    pub preferred: &'static [&'static str],
    pub unsupported_feedback: &'static [&'static str],
    pub default_payload_type: u8,
}

pub const H264: CodecProfile = CodecProfile {
    kind: "video",
    name: "H264",
    clock_rate: 90_000,
    channels: None,
    fmtp: Some("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
    preferred: &[
        "profile-level-id=42e01f",
        "level-asymmetry-allowed=1",
        "packetization-mode=1",
    ],
    unsupported_feedback: &["nack", "goog-remb", "transport-cc", "ccm fir"],
    default_payload_type: 96,
};

pub const VP8: CodecProfile = CodecProfile {
    kind: "video",
    name: "VP8",
    clock_rate: 90_000,
    channels: None,
    fmtp: None,
    preferred: &[],
    unsupported_feedback: &["nack", "goog-remb", "transport-cc"],
    default_payload_type: 97,
};

pub const OPUS: CodecProfile = CodecProfile {
    kind: "audio",
    name: "opus",
    clock_rate: 48_000,
    channels: Some(2),
    fmtp: Some("minptime=10;useinbandfec=1"),
    preferred: &[],
    unsupported_feedback: &["transport-cc"],
    default_payload_type: 111,
};

pub const PCMU: CodecProfile = CodecProfile {
    kind: "audio",
    name: "PCMU",
    clock_rate: 8_000,
    channels: None,
    fmtp: None,
    preferred: &[],
    unsupported_feedback: &[],
    default_payload_type: 0,
};

pub fn profile_by_name(name: &str) -> Option<CodecProfile> {
    [H264, VP8, OPUS, PCMU]
        .into_iter()
        .find(|profile| profile.name.eq_ignore_ascii_case(name))
}

pub struct CodecNegotiator {
    profile: CodecProfile,
    payload_type: u8,
    ssrc: u32,
    direction: Direction,
    ids: Arc<dyn IdGenerator>,
}

impl CodecNegotiator {
    pub fn new(profile: CodecProfile, direction: Direction, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            profile,
            payload_type: profile.default_payload_type,
            ssrc: ids.ssrc(),
            direction,
            ids,
        }
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn profile(&self) -> &CodecProfile {
        &self.profile
    }

    fn is_candidate(&self, map: &sdp::RtpMap) -> bool {
        map.codec.eq_ignore_ascii_case(self.profile.name)
            && map.clock_rate == self.profile.clock_rate
    }

    fn is_preferred(&self, map: &sdp::RtpMap) -> bool {
        !self.profile.preferred.is_empty()
            && map.fmtp.as_deref().is_some_and(|fmtp| {
                self.profile
                    .preferred
                    .iter()
                    .all(|param| fmtp.contains(param))
            })
    }

    fn rewrite(&self, section: &str, chosen: u8, track_id: &str) -> String {
        let mut out = Vec::new();
        for (index, line) in sdp::lines(section).enumerate() {
            if line.is_empty() {
                continue;
            }
            if index == 0 {
                let head: Vec<&str> = line.split_whitespace().take(3).collect();
                out.push(format!("{} {chosen}", head.join(" ")));
                continue;
            }
            if line.starts_with("a=ssrc:") || line.starts_with("a=ssrc-group:") {
                continue;
            }
            let payload_attr = ["a=rtpmap:", "a=fmtp:", "a=rtcp-fb:"]
                .into_iter()
                .find_map(|prefix| attribute_for_payload(line, prefix).map(|hit| (prefix, hit)));
            if let Some((prefix, (pt, value))) = payload_attr {
                if pt != chosen {
                    continue;
                }
                if prefix == "a=rtcp-fb:" && self.profile.unsupported_feedback.contains(&value) {
                    continue;
                }
            }
            out.push(line.to_owned());
        }
        if self.direction.sends() {
            out.push(format!("a=ssrc:{} cname:{track_id}", self.ssrc));
            out.push(format!("a=ssrc:{} msid:{track_id} {track_id}", self.ssrc));
        }
        let mut sdp = out.join("\r\n");
        sdp.push_str("\r\n");
        sdp
    }
}

impl TrackNegotiator for CodecNegotiator {
    fn match_track(&self, track: &MediaTrack) -> u8 {
        let section = with_media_prefix(&track.sdp());
        if sdp::media_kind(&section) != Some(self.profile.kind) {
            return 0;
        }
        let candidates: Vec<_> = sdp::rtp_maps(&section)
            .into_iter()
            .filter(|map| self.is_candidate(map))
            .collect();
        let Some(chosen) = candidates
            .iter()
            .find(|map| self.is_preferred(map))
            .or_else(|| candidates.first())
        else {
            tracing::debug!(track = track.track_id(), codec = self.profile.name, "no matching payload type");
            return 0;
        };
        let payload_type = chosen.payload_type;
        track.set_sdp(self.rewrite(&section, payload_type, track.track_id()));
        payload_type
    }

    fn create_media(&self) -> String {
        let mid = self.ids.mid();
        let pt = self.payload_type;
        let profile = &self.profile;
        let mut lines = vec![
            format!("m={} 9 UDP/TLS/RTP/SAVPF {pt}", profile.kind),
            "c=IN IP4 0.0.0.0".to_owned(),
            format!("a=mid:{mid}"),
            self.direction.attribute().to_owned(),
            "a=rtcp-mux".to_owned(),
        ];
        lines.push(match profile.channels {
            Some(channels) => format!("a=rtpmap:{pt} {}/{}/{channels}", profile.name, profile.clock_rate),
            None => format!("a=rtpmap:{pt} {}/{}", profile.name, profile.clock_rate),
        });
        if let Some(fmtp) = profile.fmtp {
            lines.push(format!("a=fmtp:{pt} {fmtp}"));
        }
        if profile.kind == "video" {
            lines.push(format!("a=rtcp-fb:{pt} nack pli"));
        }
        if self.direction.sends() {
            lines.push(format!("a=ssrc:{} cname:{mid}", self.ssrc));
        }
        let mut sdp = lines.join("\r\n");
        sdp.push_str("\r\n");
        sdp
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;

    const CHROME_VIDEO: &str = "m=video 9 UDP/TLS/RTP/SAVPF 96 102 106\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 nack\r\n\
a=rtcp-fb:102 nack pli\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f\r\n\
a=rtpmap:106 H264/90000\r\n\
a=rtcp-fb:106 nack pli\r\n\
a=fmtp:106 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
a=ssrc:1234 cname:browser\r\n";

    fn negotiator(profile: CodecProfile) -> CodecNegotiator {
        CodecNegotiator::new(profile, Direction::SendRecv, Arc::new(SequentialIds::new()))
    }

    #[test]
    fn picks_the_preferred_h264_profile() {
        let track = MediaTrack::new("frontdoor-video", CHROME_VIDEO);
        assert_eq!(negotiator(H264).match_track(&track), 106);

        let sdp = track.sdp();
        assert!(sdp.starts_with("m=video 9 UDP/TLS/RTP/SAVPF 106\r\n"));
        assert!(!sdp.contains("VP8"));
        assert!(!sdp.contains("a=rtpmap:102"));
        assert!(sdp.contains("a=rtcp-fb:106 nack pli"));
        assert!(!sdp.contains("a=rtcp-fb:106 nack\r\n"));
        assert!(!sdp.contains("cname:browser"));
        assert!(sdp.contains("a=ssrc:1 cname:frontdoor-video"));
    }

    #[test]
    fn missing_codec_leaves_track_untouched() {
        let track = MediaTrack::new("mic", "m=audio 9 UDP/TLS/RTP/SAVPF 0\r\na=rtpmap:0 PCMU/8000\r\n");
        assert_eq!(negotiator(OPUS).match_track(&track), 0);
        assert!(track.sdp().contains("PCMU"));
        assert_eq!(negotiator(H264).match_track(&track), 0);
    }

    #[test]
    fn accepts_sections_without_media_prefix() {
        let track = MediaTrack::new("cam", CHROME_VIDEO.trim_start_matches("m="));
        assert_eq!(negotiator(VP8).match_track(&track), 96);
        assert!(track.sdp().starts_with("m=video"));
    }

    #[test]
    fn created_media_uses_injected_ids() {
        let ids = Arc::new(SequentialIds::new());
        let opus = CodecNegotiator::new(OPUS, Direction::SendOnly, ids.clone());
        let media = opus.create_media();
        assert!(media.starts_with("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"));
        assert!(media.contains("a=mid:device-0\r\n"));
        assert!(media.contains("a=sendonly\r\n"));
        assert!(media.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(media.contains("a=ssrc:1 cname:device-0"));
        assert_eq!(opus.ssrc(), 1);

        let second = CodecNegotiator::new(H264, Direction::RecvOnly, ids);
        let media = second.create_media();
        assert!(media.contains("a=mid:device-1"));
        assert!(!media.contains("a=ssrc:"));
    }

    #[test]
    fn payload_type_override_applies_to_created_media() {
        let vp8 = negotiator(VP8).with_payload_type(120);
        assert_eq!(vp8.payload_type(), 120);
        let media = vp8.create_media();
        assert!(media.starts_with("m=video 9 UDP/TLS/RTP/SAVPF 120\r\n"));
        assert!(media.contains("a=rtpmap:120 VP8/90000\r\n"));
        assert!(media.contains("a=rtcp-fb:120 nack pli\r\n"));
    }

    #[test]
    fn profiles_resolve_by_name() {
        assert_eq!(profile_by_name("h264"), Some(H264));
        assert_eq!(profile_by_name("OPUS"), Some(OPUS));
        assert!(profile_by_name("av1").is_none());
    }
}
