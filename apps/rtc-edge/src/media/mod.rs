//! Application-facing track and data-channel handles.
//!
//! Both are cheap to clone and may be used from any thread: media sources
//! call [`MediaTrack::send`] from their own I/O tasks while the scheduler
//! worker binds, refreshes and closes the same track. State is guarded by a
//! `parking_lot` mutex and callbacks are always invoked with the lock
//! released.

pub mod negotiator;
pub mod sdp;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::peer::{ChannelMessage, MessageKind, RtcDataChannel, RtcTrack};

/// Per-track outcome reported to the client in description metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackError {
    #[default]
    Ok,
    AccessDenied,
    UnknownTrackId,
    InvalidCodecs,
    UnknownError,
}

impl TrackError {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackError::Ok => "OK",
            TrackError::AccessDenied => "ACCESS_DENIED",
            TrackError::UnknownTrackId => "UNKNOWN_TRACK_ID",
            TrackError::InvalidCodecs => "INVALID_CODECS",
            TrackError::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn is_ok(self) -> bool {
        self == TrackError::Ok
    }
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ReceiveCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
type CloseCallback = Box<dyn FnOnce() + Send>;

/// A media track bound (or about to be bound) to one peer connection.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    track_id: String,
    state: Mutex<TrackState>,
}

#[derive(Default)]
struct TrackState {
    sdp: String,
    error: TrackError,
    on_receive: Option<ReceiveCallback>,
    on_close: Option<CloseCallback>,
    rtc: Option<Arc<dyn RtcTrack>>,
    closed: bool,
}

impl MediaTrack {
    /// `sdp` is one `m=` section; a leading `m=` is optional.
    pub fn new(track_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                track_id: track_id.into(),
                state: Mutex::new(TrackState {
                    sdp: sdp.into(),
                    ..TrackState::default()
                }),
            }),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.inner.track_id
    }

    pub fn sdp(&self) -> String {
        self.inner.state.lock().sdp.clone()
    }

    pub fn set_sdp(&self, sdp: impl Into<String>) {
        self.inner.state.lock().sdp = sdp.into();
    }

    pub fn error_state(&self) -> TrackError {
        self.inner.state.lock().error
    }

    pub fn set_error_state(&self, error: TrackError) {
        self.inner.state.lock().error = error;
    }

    pub fn set_receive_callback<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.state.lock().on_receive = Some(Arc::new(callback));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.state.lock().on_close = Some(Box::new(callback));
    }

    /// Send one RTP packet. False when the track is not bound to an open
    /// connection.
    pub fn send(&self, packet: &[u8]) -> bool {
        let rtc = {
            let state = self.inner.state.lock();
            if state.closed {
                return false;
            }
            state.rtc.clone()
        };
        match rtc {
            Some(rtc) => rtc.send(Bytes::copy_from_slice(packet)),
            None => false,
        }
    }

    /// The negotiated mid, falling back to the one written in the SDP.
    pub fn mid(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state
            .rtc
            .as_ref()
            .and_then(|rtc| rtc.mid())
            .or_else(|| sdp::media_mid(&state.sdp).map(str::to_owned))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub(crate) fn bind(&self, rtc: Arc<dyn RtcTrack>) {
        self.inner.state.lock().rtc = Some(rtc);
    }

    pub(crate) fn rtc(&self) -> Option<Arc<dyn RtcTrack>> {
        self.inner.state.lock().rtc.clone()
    }

    pub(crate) fn deliver(&self, packet: &[u8]) {
        let callback = self.inner.state.lock().on_receive.clone();
        if let Some(callback) = callback {
            callback(packet);
        }
    }

    /// The owning connection is gone. Runs the close callback once and
    /// releases the transceiver.
    pub(crate) fn connection_closed(&self) {
        let (on_close, rtc) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.on_receive = None;
            (state.on_close.take(), state.rtc.take())
        };
        if let Some(rtc) = rtc {
            rtc.set_message_sink(None);
        }
        if let Some(on_close) = on_close {
            on_close();
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MediaTrack")
            .field("track_id", &self.inner.track_id)
            .field("error", &state.error)
            .field("bound", &state.rtc.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

type MessageCallback = Arc<dyn Fn(MessageKind, &[u8]) + Send + Sync>;

/// A data channel opened by the remote peer with an application label.
#[derive(Clone)]
pub struct Datachannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    label: String,
    rtc: Arc<dyn RtcDataChannel>,
    /// Drained in order by a single sender task.
    outgoing: mpsc::UnboundedSender<ChannelMessage>,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    on_message: Option<MessageCallback>,
    on_close: Option<CloseCallback>,
    closed: bool,
}

impl Datachannel {
    pub(crate) fn new(rtc: Arc<dyn RtcDataChannel>, runtime: Handle) -> Self {
        let label = rtc.label();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<ChannelMessage>();
        let sender = Arc::clone(&rtc);
        let send_label = label.clone();
        runtime.spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(err) = sender.send(message).await {
                    tracing::debug!(label = %send_label, error = %err, "datachannel send failed");
                }
            }
        });
        Self {
            inner: Arc::new(ChannelInner {
                label,
                rtc,
                outgoing,
                state: Mutex::new(ChannelState::default()),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Queue a message; false once the channel closed.
    pub fn send(&self, data: &[u8], kind: MessageKind) -> bool {
        if self.inner.state.lock().closed {
            return false;
        }
        let message = ChannelMessage {
            kind,
            data: Bytes::copy_from_slice(data),
        };
        self.inner.outgoing.send(message).is_ok()
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(MessageKind, &[u8]) + Send + Sync + 'static,
    {
        self.inner.state.lock().on_message = Some(Arc::new(callback));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.state.lock().on_close = Some(Box::new(callback));
    }

    pub(crate) fn deliver(&self, message: &ChannelMessage) {
        let callback = self.inner.state.lock().on_message.clone();
        if let Some(callback) = callback {
            callback(message.kind, &message.data);
        }
    }

    pub(crate) fn connection_closed(&self) {
        let on_close = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.on_message = None;
            state.on_close.take()
        };
        self.inner.rtc.set_message_sink(None);
        if let Some(on_close) = on_close {
            on_close();
        }
    }
}

impl fmt::Debug for Datachannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datachannel")
            .field("label", &self.inner.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unbound_track_refuses_to_send() {
        let track = MediaTrack::new("front-door", "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n");
        assert!(!track.send(&[0x80, 0x60]));
        assert_eq!(track.mid().as_deref(), Some("0"));
        assert_eq!(track.error_state(), TrackError::Ok);
    }

    #[test]
    fn close_callback_runs_once() {
        let track = MediaTrack::new("mic", "m=audio 9 RTP 111\r\n");
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        track.set_close_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        track.connection_closed();
        track.connection_closed();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(track.is_closed());
    }

    #[test]
    fn receive_callback_sees_delivered_packets() {
        let track = MediaTrack::new("cam", "");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        track.set_receive_callback(move |packet| sink.lock().push(packet.to_vec()));
        track.deliver(&[1, 2, 3]);
        assert_eq!(*seen.lock(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn error_names_match_wire_strings() {
        assert_eq!(TrackError::InvalidCodecs.as_str(), "INVALID_CODECS");
        assert_eq!(TrackError::AccessDenied.to_string(), "ACCESS_DENIED");
    }
}
