//! Seam between the negotiation engine and a WebRTC implementation.
//!
//! Event delivery follows two paths, chosen by type:
//!
//! * Remote tracks announced by a remote description are *returned* from
//!   [`PeerConnection::set_remote_description`]. The engine handles them in
//!   the same scheduler task that observes the completion, before any answer
//!   is created.
//! * Everything else arrives as a [`PeerEvent`] through the [`PeerEventSink`]
//!   and is posted to the scheduler.
//!
//! Track and data-channel handles own a [`MessageRelay`] that buffers inbound
//! messages until a consumer is attached, so data the remote sends right
//! after opening a channel is never dropped.

pub mod mock;
pub mod webrtc;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("invalid ice server configuration: {0}")]
    Configuration(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ice candidate: {0}")]
    InvalidCandidate(String),
    #[error("peer connection failed: {0}")]
    Engine(String),
    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE server entry in the form the WebRTC implementation consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Binary,
    Text,
}

#[derive(Clone)]
pub struct ChannelMessage {
    pub kind: MessageKind,
    pub data: Bytes,
}

impl fmt::Debug for ChannelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelMessage")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .finish()
    }
}

pub type MessageSink<M> = Arc<dyn Fn(M) + Send + Sync>;

/// Holds inbound messages until a sink is attached, then forwards directly.
pub struct MessageRelay<M> {
    inner: Mutex<RelayState<M>>,
}

struct RelayState<M> {
    pending: VecDeque<M>,
    sink: Option<MessageSink<M>>,
}

impl<M> Default for MessageRelay<M> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RelayState {
                pending: VecDeque::new(),
                sink: None,
            }),
        }
    }
}

impl<M> MessageRelay<M> {
    pub fn push(&self, message: M) {
        let sink = {
            let mut inner = self.inner.lock();
            match &inner.sink {
                Some(sink) => Arc::clone(sink),
                None => {
                    inner.pending.push_back(message);
                    return;
                }
            }
        };
        sink(message);
    }

    pub fn has_sink(&self) -> bool {
        self.inner.lock().sink.is_some()
    }

    /// Attach (or detach with `None`) the consumer. Buffered messages are
    /// flushed to the new sink in arrival order.
    pub fn set_sink(&self, sink: Option<MessageSink<M>>) {
        let drained: Vec<M> = {
            let mut inner = self.inner.lock();
            inner.sink = sink.clone();
            if sink.is_some() {
                inner.pending.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        if let Some(sink) = sink {
            for message in drained {
                sink(message);
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

/// A media transceiver bound to the peer connection.
#[async_trait]
pub trait RtcTrack: Send + Sync {
    /// Current media id; `None` until negotiation assigned one.
    fn mid(&self) -> Option<String>;

    /// The track's `m=` section as negotiated so far.
    fn sdp(&self) -> String;

    /// Apply a rewritten media section (codec restriction) before answering.
    async fn apply_sdp(&self, media_sdp: &str) -> Result<(), PeerError>;

    /// Queue an outbound RTP packet. Returns false when the track cannot
    /// carry media (not connected, closed, or receive only).
    fn send(&self, packet: Bytes) -> bool;

    fn set_message_sink(&self, sink: Option<MessageSink<Bytes>>);
}

#[async_trait]
pub trait RtcDataChannel: Send + Sync {
    fn label(&self) -> String;

    async fn send(&self, message: ChannelMessage) -> Result<(), PeerError>;

    async fn close(&self);

    fn set_message_sink(&self, sink: Option<MessageSink<ChannelMessage>>);

    fn set_close_sink(&self, sink: Option<Box<dyn FnOnce() + Send>>);
}

/// Events posted back to the scheduler.
pub enum PeerEvent {
    StateChanged(PeerState),
    SignalingStateChanged(SignalingState),
    LocalCandidate(IceCandidate),
    GatheringStateChanged(GatheringState),
    DataChannel(Arc<dyn RtcDataChannel>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            PeerEvent::SignalingStateChanged(state) => {
                f.debug_tuple("SignalingStateChanged").field(state).finish()
            }
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::GatheringStateChanged(state) => {
                f.debug_tuple("GatheringStateChanged").field(state).finish()
            }
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
        }
    }
}

#[derive(Clone)]
pub struct PeerEventSink {
    deliver: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl PeerEventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(PeerEvent) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.deliver)(event);
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Apply a remote description. For an offer arriving while a local offer
    /// is pending the implementation rolls the local offer back first.
    /// Returns the remote tracks this description introduced.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<Vec<Arc<dyn RtcTrack>>, PeerError>;

    /// Create and apply an offer or answer, whichever the signaling state
    /// calls for, and return it.
    async fn set_local_description(&self) -> Result<SessionDescription, PeerError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;

    fn gathering_state(&self) -> GatheringState;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Add a device track described by one `m=` section.
    async fn add_track(&self, media_sdp: &str) -> Result<Arc<dyn RtcTrack>, PeerError>;

    async fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: RtcConfiguration,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn relay_buffers_until_sink_is_attached() {
        let relay = MessageRelay::<u32>::default();
        relay.push(1);
        relay.push(2);
        assert_eq!(relay.buffered(), 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        relay.set_sink(Some(Arc::new(move |m| record.lock().push(m))));
        relay.push(3);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(relay.buffered(), 0);
    }

    #[test]
    fn detached_relay_buffers_again() {
        let relay = MessageRelay::<u32>::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        relay.set_sink(Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        relay.push(1);
        relay.set_sink(None);
        relay.push(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(relay.buffered(), 1);
    }
}
