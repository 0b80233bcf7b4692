//! [`PeerConnection`] backed by the `webrtc` crate.
//!
//! Creating an `RTCPeerConnection` is async while [`PeerConnectionFactory`]
//! is not, so the connection is built on first use. Until then the
//! synchronous state getters report the initial states.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use super::{
    ChannelMessage, GatheringState, MessageKind, MessageRelay, MessageSink, PeerConnection,
    PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink, PeerState, RtcConfiguration,
    RtcDataChannel, RtcTrack, SignalingState,
};
use crate::media::sdp;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

fn engine(err: webrtc::Error) -> PeerError {
    PeerError::Engine(err.to_string())
}

pub struct WebRtcPeerFactory {
    api: Arc<API>,
    runtime: Handle,
}

impl WebRtcPeerFactory {
    /// Default codecs and interceptors.
    pub fn new(runtime: Handle) -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(engine)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api: Arc::new(api),
            runtime,
        })
    }
}

impl PeerConnectionFactory for WebRtcPeerFactory {
    fn create(
        &self,
        config: RtcConfiguration,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let ice_servers = config
            .ice_servers
            .into_iter()
            .map(|server| RTCIceServer {
                urls: vec![server.url],
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        Ok(Arc::new(WebRtcPeer {
            api: Arc::clone(&self.api),
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            pc: OnceCell::new(),
            shared: Arc::new(Shared {
                events,
                runtime: self.runtime.clone(),
                tracks: Mutex::new(HashMap::new()),
            }),
            track_ids: AtomicU64::new(0),
        }))
    }
}

/// State reachable from `webrtc` callbacks.
struct Shared {
    events: PeerEventSink,
    runtime: Handle,
    /// Tracks by mid, so inbound RTP finds its relay.
    tracks: Mutex<HashMap<String, Arc<WebRtcTrack>>>,
}

pub struct WebRtcPeer {
    api: Arc<API>,
    config: RTCConfiguration,
    pc: OnceCell<Arc<RTCPeerConnection>>,
    shared: Arc<Shared>,
    track_ids: AtomicU64,
}

impl WebRtcPeer {
    async fn pc(&self) -> Result<&Arc<RTCPeerConnection>, PeerError> {
        self.pc
            .get_or_try_init(|| async {
                let pc = Arc::new(
                    self.api
                        .new_peer_connection(self.config.clone())
                        .await
                        .map_err(engine)?,
                );
                register_callbacks(&pc, &self.shared);
                Ok::<_, PeerError>(pc)
            })
            .await
    }
}

fn register_callbacks(pc: &RTCPeerConnection, shared: &Arc<Shared>) {
    let events = shared.events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let state = match state {
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        };
        events.emit(PeerEvent::StateChanged(state));
        Box::pin(async {})
    }));

    let events = shared.events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        events.emit(PeerEvent::SignalingStateChanged(signaling_state(state)));
        Box::pin(async {})
    }));

    let events = shared.events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => events.emit(PeerEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                })),
                Err(err) => tracing::warn!(error = %err, "failed to serialize local candidate"),
            }
        }
        Box::pin(async {})
    }));

    let events = shared.events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let state = match state {
            RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
            RTCIceGathererState::Complete => Some(GatheringState::Complete),
            RTCIceGathererState::New => Some(GatheringState::New),
            _ => None,
        };
        if let Some(state) = state {
            events.emit(PeerEvent::GatheringStateChanged(state));
        }
        Box::pin(async {})
    }));

    let events = shared.events.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        tracing::debug!(label = channel.label(), "remote data channel");
        events.emit(PeerEvent::DataChannel(WebRtcDataChannel::wrap(channel)));
        Box::pin(async {})
    }));

    let shared_for_tracks = Arc::clone(shared);
    pc.on_track(Box::new(
        move |remote: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, transceiver: Arc<RTCRtpTransceiver>| {
            let shared = Arc::clone(&shared_for_tracks);
            Box::pin(async move {
                let Some(mid) = transceiver.mid().map(|mid| mid.to_string()) else {
                    return;
                };
                let track = shared.tracks.lock().get(&mid).cloned();
                let Some(track) = track else {
                    tracing::debug!(%mid, "inbound media for unknown track");
                    return;
                };
                shared.runtime.spawn(async move {
                    while let Ok((packet, _)) = remote.read_rtp().await {
                        match packet.marshal() {
                            Ok(data) => track.relay.push(data),
                            Err(err) => tracing::trace!(error = %err, "dropping unmarshalable packet"),
                        }
                    }
                    tracing::debug!(mid = ?track.mid(), "inbound media ended");
                });
            })
        },
    ));
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let sdp = description.sdp.clone();
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    };
    converted.map_err(|err| PeerError::InvalidDescription(err.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::Engine("unspecified description type".into()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

/// Codec parameters for every `a=rtpmap` of a media section.
fn codec_parameters(section: &str) -> Vec<RTCRtpCodecParameters> {
    let kind = sdp::media_kind(section).unwrap_or("video");
    sdp::rtp_maps(section)
        .into_iter()
        .map(|map| RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: format!("{kind}/{}", map.codec),
                clock_rate: map.clock_rate,
                channels: map.channels.unwrap_or(0),
                sdp_fmtp_line: map.fmtp.unwrap_or_default(),
                rtcp_feedback: Vec::new(),
            },
            payload_type: map.payload_type,
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<Vec<Arc<dyn RtcTrack>>, PeerError> {
        let pc = self.pc().await?;
        if description.sdp_type == SdpType::Offer
            && pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            pc.set_local_description(rollback).await.map_err(engine)?;
        }
        pc.set_remote_description(to_rtc(&description)?)
            .await
            .map_err(engine)?;

        let mut added: Vec<Arc<dyn RtcTrack>> = Vec::new();
        for transceiver in pc.get_transceivers().await {
            let Some(mid) = transceiver.mid().map(|mid| mid.to_string()) else {
                continue;
            };
            if self.shared.tracks.lock().contains_key(&mid) {
                continue;
            }
            let Some(section) = sdp::section_for_mid(&description.sdp, &mid) else {
                continue;
            };
            if !matches!(sdp::media_kind(&section), Some("audio" | "video")) {
                continue;
            }
            let track = Arc::new(WebRtcTrack::new(
                transceiver,
                None,
                section,
                self.shared.runtime.clone(),
            ));
            self.shared.tracks.lock().insert(mid, Arc::clone(&track));
            added.push(track);
        }
        Ok(added)
    }

    async fn set_local_description(&self) -> Result<SessionDescription, PeerError> {
        let pc = self.pc().await?;
        let description = if pc.signaling_state() == RTCSignalingState::HaveRemoteOffer {
            pc.create_answer(None).await.map_err(engine)?
        } else {
            pc.create_offer(None).await.map_err(engine)?
        };
        pc.set_local_description(description.clone())
            .await
            .map_err(engine)?;
        let applied = pc.local_description().await.unwrap_or(description);
        // Device tracks learn their mid from the applied description.
        {
            let mut tracks = self.shared.tracks.lock();
            let entries: Vec<(String, Arc<WebRtcTrack>)> = tracks.drain().collect();
            for (key, track) in entries {
                track.refresh_mid();
                tracks.insert(track.mid().unwrap_or(key), track);
            }
        }
        from_rtc(applied)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let pc = self.pc.get()?;
        pc.local_description()
            .await
            .and_then(|description| from_rtc(description).ok())
    }

    fn signaling_state(&self) -> SignalingState {
        self.pc
            .get()
            .map(|pc| signaling_state(pc.signaling_state()))
            .unwrap_or(SignalingState::Stable)
    }

    fn gathering_state(&self) -> GatheringState {
        match self.pc.get().map(|pc| pc.ice_gathering_state()) {
            Some(RTCIceGatheringState::Gathering) => GatheringState::Gathering,
            Some(RTCIceGatheringState::Complete) => GatheringState::Complete,
            _ => GatheringState::New,
        }
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let pc = self.pc().await?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: None,
            username_fragment: None,
        })
        .await
        .map_err(|err| PeerError::InvalidCandidate(err.to_string()))
    }

    async fn add_track(&self, media_sdp: &str) -> Result<Arc<dyn RtcTrack>, PeerError> {
        let pc = self.pc().await?;
        let Some(codec) = codec_parameters(media_sdp).into_iter().next() else {
            return Err(PeerError::InvalidDescription("media section without codecs".into()));
        };
        let direction = match sdp::direction(media_sdp) {
            Some("sendrecv") => RTCRtpTransceiverDirection::Sendrecv,
            _ => RTCRtpTransceiverDirection::Sendonly,
        };
        let n = self.track_ids.fetch_add(1, Ordering::Relaxed);
        let local = Arc::new(TrackLocalStaticRTP::new(
            codec.capability,
            format!("track-{n}"),
            "rtc-edge".to_owned(),
        ));
        let transceiver = pc
            .add_transceiver_from_track(
                Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(engine)?;
        let track = Arc::new(WebRtcTrack::new(
            transceiver,
            Some(local),
            sdp::with_media_prefix(media_sdp),
            self.shared.runtime.clone(),
        ));
        // Keyed by mid once the next local description assigns one.
        self.shared
            .tracks
            .lock()
            .insert(format!("pending-{n}"), Arc::clone(&track));
        Ok(track)
    }

    async fn close(&self) {
        if let Some(pc) = self.pc.get() {
            if let Err(err) = pc.close().await {
                tracing::debug!(error = %err, "peer connection close failed");
            }
        }
        self.shared.tracks.lock().clear();
    }
}

pub struct WebRtcTrack {
    transceiver: Arc<RTCRtpTransceiver>,
    local: Option<Arc<TrackLocalStaticRTP>>,
    sdp: Mutex<String>,
    mid: Mutex<Option<String>>,
    relay: MessageRelay<Bytes>,
    runtime: Handle,
}

impl WebRtcTrack {
    fn new(
        transceiver: Arc<RTCRtpTransceiver>,
        local: Option<Arc<TrackLocalStaticRTP>>,
        sdp: String,
        runtime: Handle,
    ) -> Self {
        let mid = transceiver.mid().map(|mid| mid.to_string());
        Self {
            transceiver,
            local,
            sdp: Mutex::new(sdp),
            mid: Mutex::new(mid),
            relay: MessageRelay::default(),
            runtime,
        }
    }

    fn refresh_mid(&self) {
        if let Some(mid) = self.transceiver.mid() {
            let mid = mid.to_string();
            let mut section = self.sdp.lock();
            *section = sdp::set_mid(&section, &mid);
            *self.mid.lock() = Some(mid);
        }
    }
}

#[async_trait]
impl RtcTrack for WebRtcTrack {
    fn mid(&self) -> Option<String> {
        self.mid.lock().clone()
    }

    fn sdp(&self) -> String {
        self.sdp.lock().clone()
    }

    async fn apply_sdp(&self, media_sdp: &str) -> Result<(), PeerError> {
        let section = sdp::with_media_prefix(media_sdp);
        let codecs = codec_parameters(&section);
        if codecs.is_empty() {
            return Err(PeerError::InvalidDescription("media section without codecs".into()));
        }
        self.transceiver
            .set_codec_preferences(codecs)
            .await
            .map_err(engine)?;
        *self.sdp.lock() = section;
        Ok(())
    }

    fn send(&self, packet: Bytes) -> bool {
        let Some(local) = self.local.clone() else {
            return false;
        };
        self.runtime.spawn(async move {
            if let Err(err) = local.write(&packet).await {
                tracing::trace!(error = %err, "rtp write failed");
            }
        });
        true
    }

    fn set_message_sink(&self, sink: Option<MessageSink<Bytes>>) {
        self.relay.set_sink(sink);
    }
}

pub struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
    relay: Arc<MessageRelay<ChannelMessage>>,
    close_sink: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl WebRtcDataChannel {
    fn wrap(channel: Arc<RTCDataChannel>) -> Arc<Self> {
        let relay = Arc::new(MessageRelay::default());
        let inbound = Arc::clone(&relay);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let kind = if message.is_string {
                MessageKind::Text
            } else {
                MessageKind::Binary
            };
            inbound.push(ChannelMessage {
                kind,
                data: message.data,
            });
            Box::pin(async {})
        }));
        let close_sink: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> = Arc::new(Mutex::new(None));
        let on_close = Arc::clone(&close_sink);
        channel.on_close(Box::new(move || {
            let sink = on_close.lock().take();
            if let Some(sink) = sink {
                sink();
            }
            Box::pin(async {})
        }));
        Arc::new(Self {
            channel,
            relay,
            close_sink,
        })
    }
}

#[async_trait]
impl RtcDataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_owned()
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), PeerError> {
        let sent = match message.kind {
            MessageKind::Binary => self.channel.send(&message.data).await,
            MessageKind::Text => {
                self.channel
                    .send_text(String::from_utf8_lossy(&message.data).into_owned())
                    .await
            }
        };
        sent.map(|_| ()).map_err(engine)
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            tracing::debug!(label = self.channel.label(), error = %err, "data channel close failed");
        }
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

    #[test]
    fn codec_parameters_follow_rtpmaps() {
        let section = "m=video 9 UDP/TLS/RTP/SAVPF 102\r\na=mid:0\r\na=rtpmap:102 H264/90000\r\n\
                       a=fmtp:102 packetization-mode=1;profile-level-id=42e01f\r\n";
        let codecs = codec_parameters(section);
        assert_eq!(codecs.len(), 1);
        assert_eq!(codecs[0].payload_type, 102);
        assert_eq!(codecs[0].capability.mime_type, "video/H264");
        assert_eq!(codecs[0].capability.clock_rate, 90000);
        assert_eq!(
            codecs[0].capability.sdp_fmtp_line,
            "packetization-mode=1;profile-level-id=42e01f"
        );
    }

    #[test]
    fn description_types_convert() {
        let description =
            SessionDescription::answer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        let rtc = to_rtc(&description).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        assert_eq!(from_rtc(rtc).unwrap(), description);
    }
}
