//! Line-level helpers for media sections of an SDP.
//!
//! Only what track negotiation needs: splitting a description into `m=`
//! sections, reading mids and payload maps, and rewriting a section.

/// Iterate lines without their `\r\n` / `\n` terminators.
pub fn lines(sdp: &str) -> impl Iterator<Item = &str> {
    sdp.lines().map(|line| line.trim_end_matches('\r'))
}

/// Every `m=` section of `sdp`, each including its `m=` line.
pub fn media_sections(sdp: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in lines(sdp) {
        if line.starts_with("m=") {
            if let Some(section) = current.take() {
                sections.push(join(&section));
            }
            current = Some(vec![line]);
        } else if let Some(section) = current.as_mut() {
            if !line.is_empty() {
                section.push(line);
            }
        }
    }
    if let Some(section) = current {
        sections.push(join(&section));
    }
    sections
}

pub fn section_for_mid(sdp: &str, mid: &str) -> Option<String> {
    media_sections(sdp)
        .into_iter()
        .find(|section| media_mid(section) == Some(mid))
}

pub fn media_mid(section: &str) -> Option<&str> {
    lines(section).find_map(|line| line.strip_prefix("a=mid:").map(str::trim))
}

/// `audio`, `video` or `application`.
pub fn media_kind(section: &str) -> Option<&str> {
    lines(section)
        .next()?
        .strip_prefix("m=")?
        .split_whitespace()
        .next()
}

/// Some clients hand over a section without its leading `m=`.
pub fn strip_media_prefix(fragment: &str) -> &str {
    fragment.strip_prefix("m=").unwrap_or(fragment)
}

/// Normalize a fragment so it starts with `m=`.
pub fn with_media_prefix(fragment: &str) -> String {
    if fragment.starts_with("m=") {
        fragment.to_owned()
    } else {
        format!("m={fragment}")
    }
}

pub fn direction(section: &str) -> Option<&str> {
    lines(section).find_map(|line| match line {
        "a=sendrecv" | "a=sendonly" | "a=recvonly" | "a=inactive" => Some(&line[2..]),
        _ => None,
    })
}

/// Replace (or add) the `a=mid:` attribute.
pub fn set_mid(section: &str, mid: &str) -> String {
    let mut replaced = false;
    let mut out: Vec<String> = lines(section)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if line.starts_with("a=mid:") {
                replaced = true;
                format!("a=mid:{mid}")
            } else {
                line.to_owned()
            }
        })
        .collect();
    if !replaced {
        out.push(format!("a=mid:{mid}"));
    }
    join(&out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub codec: String,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    pub fmtp: Option<String>,
    pub feedback: Vec<String>,
}

/// Payload maps in the order the `m=` line lists them.
pub fn rtp_maps(section: &str) -> Vec<RtpMap> {
    let order: Vec<u8> = lines(section)
        .next()
        .map(|m| {
            m.split_whitespace()
                .skip(3)
                .filter_map(|pt| pt.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    let mut maps: Vec<RtpMap> = Vec::new();
    for line in lines(section) {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let Some((pt, encoding)) = rest.split_once(' ') else {
                continue;
            };
            let Ok(payload_type) = pt.parse() else {
                continue;
            };
            let mut parts = encoding.split('/');
            let codec = parts.next().unwrap_or_default().to_owned();
            let clock_rate = parts.next().and_then(|c| c.parse().ok()).unwrap_or(90_000);
            let channels = parts.next().and_then(|c| c.parse().ok());
            maps.push(RtpMap {
                payload_type,
                codec,
                clock_rate,
                channels,
                fmtp: None,
                feedback: Vec::new(),
            });
        }
    }
    for line in lines(section) {
        if let Some((pt, value)) = attribute_for_payload(line, "a=fmtp:") {
            if let Some(map) = maps.iter_mut().find(|m| m.payload_type == pt) {
                map.fmtp = Some(value.to_owned());
            }
        } else if let Some((pt, value)) = attribute_for_payload(line, "a=rtcp-fb:") {
            if let Some(map) = maps.iter_mut().find(|m| m.payload_type == pt) {
                map.feedback.push(value.to_owned());
            }
        }
    }
    maps.sort_by_key(|m| {
        order
            .iter()
            .position(|pt| *pt == m.payload_type)
            .unwrap_or(usize::MAX)
    });
    maps
}

/// `a=<attr>:<pt> <value>` for a numeric payload type.
pub(crate) fn attribute_for_payload<'a>(line: &'a str, prefix: &str) -> Option<(u8, &'a str)> {
    let rest = line.strip_prefix(prefix)?;
    let (pt, value) = rest.split_once(' ')?;
    Some((pt.parse().ok()?, value))
}

fn join<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push_str("\r\n");
    }
    out
}
