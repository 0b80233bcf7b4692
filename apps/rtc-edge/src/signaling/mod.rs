//! Signaling streams: accepting them and speaking the framed protocol.

pub(crate) mod listener;
pub(crate) mod session;

use std::fmt;

/// Access-control action checked before a signaling stream is served.
pub const SIGNALING_ACTION: &str = "Webrtc:Signaling";
/// Access-control action checked before answering the discovery request.
pub const GET_INFO_ACTION: &str = "Webrtc:GetInfo";

/// Registry key of one signaling session and, later, its draining engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}
