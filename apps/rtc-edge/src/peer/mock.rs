//! Scriptable in-memory peer connection.
//!
//! Descriptions are real enough for the engine: each one carries the
//! `m=` sections of the tracks the peer knows about, a remote offer rolls
//! back a pending local offer, and candidates plus the gathering-complete
//! event follow a local description after a short delay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use super::{
    ChannelMessage, GatheringState, MessageKind, MessageRelay, MessageSink, PeerConnection,
    PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink, PeerState, RtcConfiguration,
    RtcDataChannel, RtcTrack, SignalingState,
};
use crate::media::sdp;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

const SESSION_HEADER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// What every peer created by a [`MockPeerFactory`] does on its own.
#[derive(Clone)]
pub struct PeerScript {
    /// Emitted as local candidates after each local description.
    pub candidates: Vec<String>,
    /// Report gathering complete after the candidates.
    pub gather_complete: bool,
    pub gather_delay: Duration,
    /// Each local description waits for one permit.
    pub local_gate: Option<Arc<Semaphore>>,
    pub fail_create: bool,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            candidates: vec!["candidate:1 1 udp 2122260223 192.0.2.10 50000 typ host".to_owned()],
            gather_complete: true,
            gather_delay: Duration::from_millis(10),
            local_gate: None,
            fail_create: false,
        }
    }
}

/// Build an SDP with one section per entry.
pub fn session_sdp<S: AsRef<str>>(sections: &[S]) -> String {
    let mut sdp = SESSION_HEADER.to_owned();
    for section in sections {
        sdp.push_str(&sdp::with_media_prefix(section.as_ref()));
        if !sdp.ends_with("\r\n") {
            sdp.push_str("\r\n");
        }
    }
    sdp
}

#[derive(Default)]
pub struct MockPeerFactory {
    script: PeerScript,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    created: Notify,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Self::with_script(PeerScript::default())
    }

    pub fn with_script(script: PeerScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Self::default()
        })
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    /// Wait until at least `index + 1` peers were created.
    pub async fn peer(&self, index: usize) -> Arc<MockPeer> {
        loop {
            let notified = self.created.notified();
            if let Some(peer) = self.peers.lock().get(index) {
                return Arc::clone(peer);
            }
            notified.await;
        }
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create(
        &self,
        config: RtcConfiguration,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if self.script.fail_create {
            return Err(PeerError::Engine("scripted create failure".into()));
        }
        let peer = Arc::new(MockPeer {
            config,
            events,
            script: self.script.clone(),
            state: Arc::new(Mutex::new(PeerInner::default())),
        });
        self.peers.lock().push(Arc::clone(&peer));
        self.created.notify_waiters();
        Ok(peer)
    }
}

#[derive(Default)]
struct PeerInner {
    signaling: Option<SignalingState>,
    gathering: Option<GatheringState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// Every known `m=` section in negotiation order, keyed by its mid or,
    /// for a device track not yet negotiated, a placeholder.
    sections: Vec<(String, String)>,
    tracks: Vec<Arc<MockTrack>>,
    remote_candidates: Vec<IceCandidate>,
    remote_descriptions: Vec<SessionDescription>,
    local_descriptions: Vec<SessionDescription>,
    next_mid: u32,
    closed: bool,
}

impl PeerInner {
    fn signaling(&self) -> SignalingState {
        self.signaling.unwrap_or(SignalingState::Stable)
    }

    fn gathering(&self) -> GatheringState {
        self.gathering.unwrap_or(GatheringState::New)
    }

    fn assign_mids(&mut self) {
        for track in &self.tracks {
            let mut mid = track.mid.lock();
            if mid.is_some() {
                continue;
            }
            let assigned = format!("local-{}", self.next_mid);
            self.next_mid += 1;
            let mut section = track.sdp.lock();
            *section = sdp::set_mid(&section, &assigned);
            *mid = Some(assigned);
        }
    }

    fn render(&self) -> String {
        let sections: Vec<String> = self
            .sections
            .iter()
            .map(|(key, section)| {
                self.tracks
                    .iter()
                    .find(|track| &track.key == key)
                    .map(|track| track.sdp())
                    .unwrap_or_else(|| section.clone())
            })
            .collect();
        session_sdp(&sections)
    }
}

pub struct MockPeer {
    config: RtcConfiguration,
    events: PeerEventSink,
    script: PeerScript,
    state: Arc<Mutex<PeerInner>>,
}

impl MockPeer {
    pub fn config(&self) -> &RtcConfiguration {
        &self.config
    }

    pub fn emit(&self, event: PeerEvent) {
        self.events.emit(event);
    }

    pub fn set_state(&self, state: PeerState) {
        self.emit(PeerEvent::StateChanged(state));
    }

    /// Simulate the remote opening a data channel.
    pub fn open_datachannel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = Arc::new(MockDataChannel::new(label));
        self.emit(PeerEvent::DataChannel(channel.clone()));
        channel
    }

    pub fn tracks(&self) -> Vec<Arc<MockTrack>> {
        self.state.lock().tracks.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().local_descriptions.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn set_signaling(&self, inner: &mut PeerInner, state: SignalingState) -> Option<PeerEvent> {
        if inner.signaling() == state {
            return None;
        }
        inner.signaling = Some(state);
        Some(PeerEvent::SignalingStateChanged(state))
    }

    fn start_gathering(&self) {
        {
            let mut inner = self.state.lock();
            if inner.gathering() != GatheringState::New {
                return;
            }
            inner.gathering = Some(GatheringState::Gathering);
        }
        self.emit(PeerEvent::GatheringStateChanged(GatheringState::Gathering));
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let script = self.script.clone();
        tokio::spawn(async move {
            tokio::time::sleep(script.gather_delay).await;
            for candidate in script.candidates {
                if state.lock().closed {
                    return;
                }
                events.emit(PeerEvent::LocalCandidate(IceCandidate {
                    candidate,
                    sdp_mid: Some("0".to_owned()),
                }));
            }
            if script.gather_complete {
                state.lock().gathering = Some(GatheringState::Complete);
                events.emit(PeerEvent::GatheringStateChanged(GatheringState::Complete));
            }
        });
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<Vec<Arc<dyn RtcTrack>>, PeerError> {
        if !description.sdp.starts_with("v=0") {
            return Err(PeerError::InvalidDescription("missing version line".into()));
        }
        let mut added: Vec<Arc<dyn RtcTrack>> = Vec::new();
        let event = {
            let mut inner = self.state.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            let next = match (description.sdp_type, inner.signaling()) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    // Implicit rollback of a pending local offer.
                    inner.local = None;
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, state) => {
                    return Err(PeerError::InvalidDescription(format!(
                        "{} in state {state:?}",
                        sdp_type.as_str()
                    )));
                }
            };
            for section in sdp::media_sections(&description.sdp) {
                let Some(mid) = sdp::media_mid(&section).map(str::to_owned) else {
                    continue;
                };
                let known = inner.sections.iter().any(|(key, _)| *key == mid)
                    || inner.tracks.iter().any(|track| track.mid().as_deref() == Some(mid.as_str()));
                if known {
                    continue;
                }
                let media = matches!(sdp::media_kind(&section), Some("audio" | "video"));
                inner.sections.push((mid.clone(), section.clone()));
                if media {
                    let track = Arc::new(MockTrack::new(mid.clone(), Some(mid), section));
                    inner.tracks.push(Arc::clone(&track));
                    added.push(track);
                }
            }
            inner.remote = Some(description.clone());
            inner.remote_descriptions.push(description);
            self.set_signaling(&mut inner, next)
        };
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(added)
    }

    async fn set_local_description(&self) -> Result<SessionDescription, PeerError> {
        let answering = self.state.lock().signaling() == SignalingState::HaveRemoteOffer;
        if let Some(gate) = &self.script.local_gate {
            gate.acquire()
                .await
                .map_err(|_| PeerError::Engine("local gate closed".into()))?
                .forget();
        }
        let (description, event) = {
            let mut inner = self.state.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            inner.assign_mids();
            let description = match (answering, inner.signaling()) {
                (true, SignalingState::HaveRemoteOffer) => SessionDescription::answer(inner.render()),
                (false, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SessionDescription::offer(inner.render())
                }
                (_, state) => {
                    return Err(PeerError::Engine(format!("signaling state changed to {state:?}")));
                }
            };
            let next = if answering {
                SignalingState::Stable
            } else {
                SignalingState::HaveLocalOffer
            };
            inner.local = Some(description.clone());
            inner.local_descriptions.push(description.clone());
            (description, self.set_signaling(&mut inner, next))
        };
        if let Some(event) = event {
            self.emit(event);
        }
        self.start_gathering();
        Ok(description)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling()
    }

    fn gathering_state(&self) -> GatheringState {
        self.state.lock().gathering()
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut inner = self.state.lock();
        if inner.closed {
            return Err(PeerError::Closed);
        }
        if inner.remote.is_none() {
            return Err(PeerError::InvalidCandidate("no remote description".into()));
        }
        inner.remote_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, media_sdp: &str) -> Result<Arc<dyn RtcTrack>, PeerError> {
        let mut inner = self.state.lock();
        if inner.closed {
            return Err(PeerError::Closed);
        }
        if sdp::media_kind(media_sdp).is_none() {
            return Err(PeerError::InvalidDescription("not a media section".into()));
        }
        // The mid is only assigned by the next local description.
        let key = format!("pending-{}", inner.sections.len());
        let section = sdp::with_media_prefix(media_sdp);
        inner.sections.push((key.clone(), section.clone()));
        let track = Arc::new(MockTrack::new(key, None, section));
        inner.tracks.push(Arc::clone(&track));
        Ok(track)
    }

    async fn close(&self) {
        let event = {
            let mut inner = self.state.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            self.set_signaling(&mut inner, SignalingState::Closed)
        };
        if let Some(event) = event {
            self.emit(event);
        }
        self.set_state(PeerState::Closed);
    }
}

pub struct MockTrack {
    key: String,
    mid: Mutex<Option<String>>,
    sdp: Mutex<String>,
    applied: Mutex<Vec<String>>,
    sent: Mutex<Vec<Bytes>>,
    relay: MessageRelay<Bytes>,
}

impl MockTrack {
    fn new(key: String, mid: Option<String>, sdp: String) -> Self {
        Self {
            key,
            mid: Mutex::new(mid),
            sdp: Mutex::new(sdp),
            applied: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            relay: MessageRelay::default(),
        }
    }

    /// Deliver an RTP packet as if it arrived from the remote.
    pub fn receive(&self, packet: &[u8]) {
        self.relay.push(Bytes::copy_from_slice(packet));
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Sections passed to `apply_sdp`, oldest first.
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl RtcTrack for MockTrack {
    fn mid(&self) -> Option<String> {
        self.mid.lock().clone()
    }

    fn sdp(&self) -> String {
        self.sdp.lock().clone()
    }

    async fn apply_sdp(&self, media_sdp: &str) -> Result<(), PeerError> {
        let section = sdp::with_media_prefix(media_sdp);
        if sdp::media_kind(&section).is_none() {
            return Err(PeerError::InvalidDescription("not a media section".into()));
        }
        self.applied.lock().push(media_sdp.to_owned());
        *self.sdp.lock() = section;
        Ok(())
    }

    fn send(&self, packet: Bytes) -> bool {
        self.sent.lock().push(packet);
        true
    }

    fn set_message_sink(&self, sink: Option<MessageSink<Bytes>>) {
        self.relay.set_sink(sink);
    }
}

pub struct MockDataChannel {
    label: String,
    relay: MessageRelay<ChannelMessage>,
    close_sink: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    sent: Mutex<Vec<ChannelMessage>>,
    changed: Notify,
    closed: AtomicBool,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            relay: MessageRelay::default(),
            close_sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            changed: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn receive(&self, kind: MessageKind, data: impl Into<Bytes>) {
        self.relay.push(ChannelMessage {
            kind,
            data: data.into(),
        });
    }

    pub fn receive_text(&self, text: &str) {
        self.receive(MessageKind::Text, Bytes::copy_from_slice(text.as_bytes()));
    }

    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.sent.lock().clone()
    }

    /// Wait until at least `count` messages were sent.
    pub async fn wait_sent(&self, count: usize) -> Vec<ChannelMessage> {
        loop {
            let changed = self.changed.notified();
            {
                let sent = self.sent.lock();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            changed.await;
        }
    }

    pub async fn wait_closed(&self) {
        loop {
            let changed = self.changed.notified();
            if self.is_closed() {
                return;
            }
            changed.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a consumer currently receives this channel's messages.
    pub fn is_attached(&self) -> bool {
        self.relay.has_sink()
    }

    /// Simulate the remote closing the channel.
    pub fn remote_close(&self) {
        self.mark_closed();
    }

    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sink = self.close_sink.lock().take();
        if let Some(sink) = sink {
            sink();
        }
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl RtcDataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        self.sent.lock().push(message);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.mark_closed();
    }

    fn set_message_sink(&self, sink: Option<MessageSink<ChannelMessage>>) {
        self.relay.set_sink(sink);
    }

    fn set_close_sink(&self, sink: Option<Box<dyn FnOnce() + Send>>) {
        *self.close_sink.lock() = sink;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUDIO: &str = "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\na=sendrecv";
    const DATA: &str = "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:1";

    fn peer(script: PeerScript) -> Arc<MockPeer> {
        let factory = MockPeerFactory::with_script(script);
        factory
            .create(RtcConfiguration::default(), PeerEventSink::new(|_| {}))
            .unwrap();
        factory.peers().remove(0)
    }

    #[tokio::test]
    async fn offer_then_answer_reports_media_tracks_only() {
        let peer = peer(PeerScript::default());
        let tracks = peer
            .set_remote_description(SessionDescription::offer(session_sdp(&[AUDIO, DATA])))
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].mid().as_deref(), Some("0"));
        assert_eq!(peer.signaling_state(), SignalingState::HaveRemoteOffer);

        let answer = peer.set_local_description().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert!(answer.sdp.contains("a=mid:0"));
        assert!(answer.sdp.contains("a=mid:1"));
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn remote_offer_rolls_back_local_offer() {
        let peer = peer(PeerScript::default());
        let offer = peer.set_local_description().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        peer.set_remote_description(SessionDescription::offer(session_sdp(&[AUDIO])))
            .await
            .unwrap();
        assert_eq!(peer.signaling_state(), SignalingState::HaveRemoteOffer);
    }

    #[tokio::test]
    async fn rejects_answers_without_an_offer_and_garbage() {
        let peer = peer(PeerScript::default());
        assert!(
            peer.set_remote_description(SessionDescription::answer(session_sdp(&[AUDIO])))
                .await
                .is_err()
        );
        assert!(
            peer.set_remote_description(SessionDescription::offer("garbage"))
                .await
                .is_err()
        );
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
        };
        assert!(peer.add_remote_candidate(candidate).await.is_err());
    }

    #[tokio::test]
    async fn added_tracks_get_mids_from_the_local_description() {
        let peer = peer(PeerScript::default());
        let track = peer
            .add_track("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:device-4\r\na=rtpmap:111 opus/48000/2")
            .await
            .unwrap();
        assert_eq!(track.mid(), None);

        let offer = peer.set_local_description().await.unwrap();
        assert_eq!(track.mid().as_deref(), Some("local-0"));
        assert!(offer.sdp.contains("a=mid:local-0"));
        assert!(!offer.sdp.contains("device-4"));
        assert!(track.sdp().contains("a=mid:local-0"));

        let echoed = sdp::set_mid(AUDIO, "local-0");
        let remote = peer
            .set_remote_description(SessionDescription::answer(session_sdp(&[echoed])))
            .await
            .unwrap();
        assert!(remote.is_empty());
        assert_eq!(peer.tracks().len(), 1);
    }
}
