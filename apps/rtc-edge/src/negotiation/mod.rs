//! Per-connection negotiation engine.
//!
//! Drives one peer connection through offer/answer and ICE exchange using
//! the perfect negotiation pattern: a polite engine yields to colliding
//! remote offers, an impolite one ignores them. All methods run on the
//! scheduler worker; asynchronous peer-connection calls re-enter through
//! [`Env::spawn_then`] and find the engine again by its session id.

pub mod ice;
pub mod metadata;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::channels::{ChannelRoute, CoapBridge, StreamBridge};
use crate::device::Env;
use crate::media::{Datachannel, MediaTrack, TrackError, sdp};
use crate::peer::{
    ChannelMessage, GatheringState, PeerConnection, PeerError, PeerEvent, PeerEventSink,
    PeerState, RtcConfiguration, RtcDataChannel, RtcTrack, SignalingState,
};
use crate::protocol::{IceCandidate, IceServer, SdpType, SessionDescription, SignalOut};
use crate::scheduler::WorkGuard;
use crate::signaling::SessionId;
use crate::transport::ConnectionRef;

use self::metadata::ConnectionMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Identifies a local offer so a late completion can tell whether it is
/// still the current one.
#[derive(Debug, Clone, Copy)]
struct OfferTicket {
    generation: u64,
    remote_offers: u64,
}

pub(crate) struct NegotiationEngine {
    id: SessionId,
    env: Env,
    connection: ConnectionRef,
    peer_id: String,
    rtc_config: Option<RtcConfiguration>,
    state: ConnectionState,
    changes: Vec<ConnectionState>,

    polite: bool,
    making_offer: bool,
    ignore_offer: bool,
    can_trickle: bool,
    offer_generation: u64,
    remote_offers: u64,
    answer_pending: bool,
    renegotiate: bool,

    metadata: ConnectionMetadata,
    pc: Option<Arc<dyn PeerConnection>>,
    stopping: bool,
    tracks: Vec<MediaTrack>,
    channels: Vec<Datachannel>,
    coap: Option<CoapBridge>,
    streams: Vec<(u64, StreamBridge)>,
    next_stream: u64,
    _work: WorkGuard<crate::device::Device>,
}

impl NegotiationEngine {
    pub(crate) fn new(
        env: Env,
        id: SessionId,
        connection: ConnectionRef,
        servers: &[IceServer],
    ) -> Self {
        let mut engine = Self {
            id,
            connection,
            peer_id: env.ids.connection_id(),
            rtc_config: None,
            state: ConnectionState::Created,
            changes: Vec::new(),
            polite: false,
            making_offer: false,
            ignore_offer: false,
            can_trickle: true,
            offer_generation: 0,
            remote_offers: 0,
            answer_pending: false,
            renegotiate: false,
            metadata: ConnectionMetadata::default(),
            pc: None,
            stopping: false,
            tracks: Vec::new(),
            channels: Vec::new(),
            coap: None,
            streams: Vec::new(),
            next_stream: 0,
            _work: env.scheduler.work(),
            env,
        };
        match ice::peer_ice_servers(servers, &engine.env.config.fallback_stun_url) {
            Ok(ice_servers) => engine.rtc_config = Some(RtcConfiguration { ice_servers }),
            Err(err) => {
                tracing::error!(session = %id, error = %err, "failed to parse ice servers");
                engine.set_state(ConnectionState::Failed);
            }
        }
        engine
    }

    pub(crate) fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub(crate) fn set_polite(&mut self, polite: bool) {
        self.polite = polite;
    }

    /// State transitions since the last call, oldest first.
    pub(crate) fn take_changes(&mut self) -> Vec<ConnectionState> {
        std::mem::take(&mut self.changes)
    }

    /// True while a peer connection exists that has not been torn down.
    pub(crate) fn has_peer(&self) -> bool {
        self.pc.is_some()
    }

    pub(crate) fn set_metadata(&mut self, metadata: &Value) {
        if self.metadata.merge_remote(metadata) == Some(true) && self.can_trickle {
            tracing::debug!(session = %self.id, "client disabled trickle ice");
            self.can_trickle = false;
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(session = %self.id, from = ?self.state, to = ?state, "connection state");
            self.state = state;
            self.changes.push(state);
        }
    }

    fn ensure_pc(&mut self) -> Option<Arc<dyn PeerConnection>> {
        if let Some(pc) = &self.pc {
            return Some(Arc::clone(pc));
        }
        if self.state.is_terminal() || self.stopping {
            return None;
        }
        let config = self.rtc_config.clone()?;
        let scheduler = self.env.scheduler.clone();
        let id = self.id;
        let events = PeerEventSink::new(move |event| {
            scheduler.post(move |device| device.engine_event(id, event));
        });
        match self.env.peers.create(config, events) {
            Ok(pc) => {
                tracing::debug!(session = %self.id, "peer connection created");
                self.pc = Some(Arc::clone(&pc));
                Some(pc)
            }
            Err(err) => {
                tracing::warn!(session = %self.id, error = %err, "failed to create peer connection");
                self.set_state(ConnectionState::Failed);
                None
            }
        }
    }

    pub(crate) fn handle_description(&mut self, description: SessionDescription) {
        let Some(pc) = self.ensure_pc() else {
            tracing::debug!(session = %self.id, "no peer connection for remote description");
            return;
        };
        let offer = description.sdp_type == SdpType::Offer;
        let collision =
            offer && (self.making_offer || pc.signaling_state() != SignalingState::Stable);
        self.ignore_offer = !self.polite && collision;
        if self.ignore_offer {
            tracing::debug!(session = %self.id, "ignoring colliding offer");
            return;
        }
        if offer {
            if collision {
                tracing::debug!(session = %self.id, "yielding to colliding offer");
                self.renegotiate = true;
            }
            self.remote_offers += 1;
            self.answer_pending = true;
        }
        let sdp_type = description.sdp_type;
        let id = self.id;
        self.env.spawn_then(
            async move { pc.set_remote_description(description).await },
            move |device, result| {
                device.with_engine(id, |engine, _| engine.on_remote_description(sdp_type, result));
            },
        );
    }

    fn on_remote_description(
        &mut self,
        sdp_type: SdpType,
        result: Result<Vec<Arc<dyn RtcTrack>>, PeerError>,
    ) {
        let remote_tracks = match result {
            Ok(remote_tracks) => remote_tracks,
            Err(err) => {
                tracing::warn!(session = %self.id, ?sdp_type, error = %err, "failed to apply remote description");
                if sdp_type == SdpType::Offer {
                    self.answer_pending = false;
                }
                return;
            }
        };
        let Some(pc) = self.pc.clone() else {
            return;
        };
        let accepted: Vec<MediaTrack> = remote_tracks
            .into_iter()
            .map(|rtc| self.accept_track(rtc))
            .collect();
        if sdp_type != SdpType::Offer {
            return;
        }
        let rewrites: Vec<(Arc<dyn RtcTrack>, String)> = accepted
            .iter()
            .filter_map(|track| {
                let rtc = track.rtc()?;
                let wanted = track.sdp();
                (sdp::with_media_prefix(&wanted) != sdp::with_media_prefix(&rtc.sdp()))
                    .then_some((rtc, wanted))
            })
            .collect();
        let id = self.id;
        self.env.spawn_then(
            async move {
                for (rtc, media) in rewrites {
                    if let Err(err) = rtc.apply_sdp(&media).await {
                        tracing::warn!(session = %id, mid = ?rtc.mid(), error = %err, "failed to restrict track codecs");
                    }
                }
                pc.set_local_description().await
            },
            move |device, result| {
                device.with_engine(id, |engine, out| engine.on_local_description(result, None, out));
            },
        );
    }

    /// Inbound track announced by the remote description. Runs inline in
    /// the description's completion so the application can restrict codecs
    /// before the answer exists.
    fn accept_track(&mut self, rtc: Arc<dyn RtcTrack>) -> MediaTrack {
        let mid = rtc.mid();
        let track_id = mid
            .as_deref()
            .and_then(|mid| self.metadata.track_id_for(mid))
            .unwrap_or_default()
            .to_owned();
        if track_id.is_empty() {
            tracing::debug!(session = %self.id, ?mid, "track has no metadata entry");
        }
        let track = MediaTrack::new(track_id, rtc.sdp());
        track.bind(Arc::clone(&rtc));
        self.tracks.push(track.clone());
        match &self.env.handlers.on_track {
            Some(on_track) => on_track(self.connection, track.clone()),
            None => track.set_error_state(TrackError::UnknownError),
        }
        let error = track.error_state();
        if error.is_ok() {
            self.wire_track(&track, rtc.as_ref());
        } else {
            tracing::info!(session = %self.id, ?mid, %error, "track rejected");
        }
        track
    }

    fn wire_track(&self, track: &MediaTrack, rtc: &dyn RtcTrack) {
        let scheduler = self.env.scheduler.clone();
        let track = track.clone();
        rtc.set_message_sink(Some(Arc::new(move |packet: Bytes| {
            let track = track.clone();
            scheduler.post(move |_| track.deliver(&packet));
        })));
    }

    /// Add device tracks and offer them.
    pub(crate) fn create_tracks(&mut self, tracks: Vec<MediaTrack>) {
        if tracks.is_empty() {
            return;
        }
        let Some(pc) = self.ensure_pc() else {
            tracing::warn!(session = %self.id, "cannot add tracks without a peer connection");
            for track in tracks {
                track.set_error_state(TrackError::UnknownError);
            }
            return;
        };
        let ticket = self.begin_offer();
        let sections: Vec<(MediaTrack, String)> = tracks
            .into_iter()
            .map(|track| {
                let media = sdp::with_media_prefix(&track.sdp());
                (track, media)
            })
            .collect();
        let id = self.id;
        self.env.spawn_then(
            async move {
                let mut added = Vec::with_capacity(sections.len());
                for (track, media) in sections {
                    let result = pc.add_track(&media).await;
                    added.push((track, result));
                }
                added
            },
            move |device, added| {
                device.with_engine(id, |engine, _| engine.on_tracks_added(added, ticket));
            },
        );
    }

    fn on_tracks_added(
        &mut self,
        added: Vec<(MediaTrack, Result<Arc<dyn RtcTrack>, PeerError>)>,
        ticket: OfferTicket,
    ) {
        for (track, result) in added {
            match result {
                Ok(rtc) => {
                    track.bind(Arc::clone(&rtc));
                    self.metadata.push_track(rtc.mid(), track.track_id());
                    self.wire_track(&track, rtc.as_ref());
                }
                Err(err) => {
                    tracing::warn!(session = %self.id, track = track.track_id(), error = %err, "failed to add track");
                    track.set_error_state(TrackError::UnknownError);
                }
            }
            self.tracks.push(track);
        }
        self.send_offer(ticket);
    }

    fn begin_offer(&mut self) -> OfferTicket {
        self.making_offer = true;
        self.offer_generation += 1;
        OfferTicket {
            generation: self.offer_generation,
            remote_offers: self.remote_offers,
        }
    }

    fn send_offer(&mut self, ticket: OfferTicket) {
        let Some(pc) = self.pc.clone() else {
            self.making_offer = false;
            return;
        };
        let id = self.id;
        self.env.spawn_then(
            async move { pc.set_local_description().await },
            move |device, result| {
                device.with_engine(id, |engine, out| {
                    engine.on_local_description(result, Some(ticket), out)
                });
            },
        );
    }

    fn on_local_description(
        &mut self,
        result: Result<SessionDescription, PeerError>,
        offer: Option<OfferTicket>,
        out: &mut dyn SignalOut,
    ) {
        if let Some(ticket) = offer {
            if ticket.generation == self.offer_generation {
                self.making_offer = false;
            }
            if ticket.remote_offers != self.remote_offers {
                tracing::debug!(session = %self.id, "local offer superseded by a remote offer");
                self.renegotiate = true;
                self.maybe_renegotiate();
                return;
            }
        } else {
            self.answer_pending = false;
        }
        let description = match result {
            Ok(description) => description,
            Err(err) => {
                tracing::warn!(session = %self.id, error = %err, "failed to create local description");
                return;
            }
        };
        self.send_description(&description, out);
        if description.sdp_type == SdpType::Answer {
            self.maybe_renegotiate();
        }
    }

    /// Offer again after yielding to a remote offer, once its answer went
    /// out and no other offer is in progress.
    fn maybe_renegotiate(&mut self) {
        if !self.renegotiate || self.answer_pending || self.making_offer || self.pc.is_none() {
            return;
        }
        self.renegotiate = false;
        tracing::debug!(session = %self.id, "renegotiating");
        let ticket = self.begin_offer();
        self.send_offer(ticket);
    }

    fn send_description(&mut self, description: &SessionDescription, out: &mut dyn SignalOut) {
        let gathered = self
            .pc
            .as_ref()
            .is_some_and(|pc| pc.gathering_state() == GatheringState::Complete);
        if !self.can_trickle && !gathered {
            tracing::debug!(session = %self.id, "holding description until gathering completes");
            return;
        }
        self.metadata.refresh(&self.tracks);
        tracing::debug!(session = %self.id, sdp_type = description.sdp_type.as_str(), "sending description");
        out.send_description(description, &self.metadata.to_value());
    }

    pub(crate) fn handle_candidate(&mut self, candidate: IceCandidate) {
        let Some(pc) = self.ensure_pc() else {
            return;
        };
        let ignoring = self.ignore_offer;
        let id = self.id;
        self.env.spawn_then(
            async move { pc.add_remote_candidate(candidate).await },
            move |_, result| {
                if let Err(err) = result {
                    if ignoring {
                        tracing::debug!(session = %id, error = %err, "candidate for ignored offer");
                    } else {
                        tracing::warn!(session = %id, error = %err, "failed to add remote candidate");
                    }
                }
            },
        );
    }

    pub(crate) fn on_event(&mut self, event: PeerEvent, out: &mut dyn SignalOut) {
        match event {
            PeerEvent::StateChanged(state) => match state {
                PeerState::New => {}
                PeerState::Connecting => self.set_state(ConnectionState::Connecting),
                PeerState::Connected => self.set_state(ConnectionState::Connected),
                PeerState::Disconnected => {
                    tracing::debug!(session = %self.id, "peer connection disconnected");
                }
                PeerState::Failed => self.set_state(ConnectionState::Failed),
                PeerState::Closed => self.teardown(),
            },
            PeerEvent::SignalingStateChanged(state) => {
                tracing::trace!(session = %self.id, ?state, "signaling state");
            }
            PeerEvent::LocalCandidate(candidate) => {
                if self.can_trickle {
                    self.metadata.refresh(&self.tracks);
                    out.send_candidate(&candidate, &self.metadata.to_value());
                }
            }
            PeerEvent::GatheringStateChanged(state) => {
                tracing::trace!(session = %self.id, ?state, "gathering state");
                if state == GatheringState::Complete && !self.can_trickle {
                    self.send_gathered_description();
                }
            }
            PeerEvent::DataChannel(channel) => self.route_channel(channel),
        }
    }

    fn send_gathered_description(&mut self) {
        let Some(pc) = self.pc.clone() else {
            return;
        };
        let id = self.id;
        self.env.spawn_then(
            async move { pc.local_description().await },
            move |device, description| {
                device.with_engine(id, |engine, out| match description {
                    Some(description) => engine.send_description(&description, out),
                    None => tracing::debug!(session = %id, "gathering completed before a local description"),
                });
            },
        );
    }

    fn route_channel(&mut self, rtc: Arc<dyn RtcDataChannel>) {
        let label = rtc.label();
        let env = &self.env;
        match ChannelRoute::classify(&label) {
            ChannelRoute::Coap => {
                self.coap = Some(CoapBridge::new(
                    rtc,
                    self.connection,
                    Arc::clone(&env.transport),
                    env.runtime.clone(),
                ));
            }
            ChannelRoute::Stream(port) => {
                tracing::debug!(session = %self.id, port, "stream channel opened");
                let serial = self.next_stream;
                self.next_stream += 1;
                let id = self.id;
                let scheduler = env.scheduler.clone();
                let bridge = StreamBridge::start(
                    rtc,
                    self.connection,
                    port,
                    Arc::clone(&env.transport),
                    &env.runtime,
                    env.config.stream_chunk_size,
                    move || {
                        scheduler.post(move |device| {
                            device.with_engine(id, |engine, _| engine.stream_finished(serial));
                        });
                    },
                );
                self.streams.push((serial, bridge));
            }
            ChannelRoute::Application => {
                let Some(on_datachannel) = env.handlers.on_datachannel.clone() else {
                    tracing::info!(session = %self.id, %label, "no datachannel handler, closing channel");
                    env.runtime.spawn(async move { rtc.close().await });
                    return;
                };
                let channel = Datachannel::new(Arc::clone(&rtc), env.runtime.clone());
                let scheduler = env.scheduler.clone();
                let receiver = channel.clone();
                rtc.set_message_sink(Some(Arc::new(move |message: ChannelMessage| {
                    let receiver = receiver.clone();
                    scheduler.post(move |_| receiver.deliver(&message));
                })));
                let scheduler = env.scheduler.clone();
                let closer = channel.clone();
                rtc.set_close_sink(Some(Box::new(move || {
                    scheduler.post(move |_| closer.connection_closed());
                })));
                self.channels.push(channel.clone());
                on_datachannel(self.connection, channel);
            }
        }
    }

    fn stream_finished(&mut self, serial: u64) {
        self.streams.retain(|(live, _)| *live != serial);
        tracing::debug!(session = %self.id, remaining = self.streams.len(), "stream bridge released");
    }

    /// Close the peer connection; the engine tears down once it is closed.
    pub(crate) fn stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        match self.pc.clone() {
            Some(pc) => {
                let id = self.id;
                self.env.spawn_then(async move { pc.close().await }, move |device, ()| {
                    device.engine_closed(id);
                });
            }
            None => self.teardown(),
        }
    }

    /// Release everything tied to the peer connection. Safe to call again.
    pub(crate) fn teardown(&mut self) {
        self.set_state(ConnectionState::Closed);
        for track in &self.tracks {
            track.connection_closed();
        }
        for channel in &self.channels {
            channel.connection_closed();
        }
        self.coap = None;
        self.streams.clear();
        if let Some(pc) = self.pc.take() {
            tracing::debug!(session = %self.id, "peer connection released");
            if !self.stopping {
                self.env.runtime.spawn(async move { pc.close().await });
            }
        }
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
