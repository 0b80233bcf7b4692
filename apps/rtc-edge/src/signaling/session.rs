//! One signaling stream: framing, the read/write state machine, message
//! dispatch and the close handshake.
//!
//! Reads and writes never overlap with themselves: one length-or-body read
//! and one frame write are outstanding at most. Every completion re-enters
//! through the scheduler and finds the session by id; a session that has
//! already been removed simply drops the completion.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::device::{Device, Env};
use crate::media::MediaTrack;
use crate::negotiation::{ConnectionState, NegotiationEngine};
use crate::protocol::framing::{self, BodyRead, LENGTH_PREFIX_LEN, LengthPrefix};
use crate::protocol::v1::{LegacyTurnServer, V1Message};
use crate::protocol::v2::V2Message;
use crate::protocol::{
    IceCandidate, IceServer, ProtocolError, ProtocolVersion, SdpType, SessionDescription,
    SignalOut,
};
use crate::scheduler::WorkGuard;
use crate::telemetry::logging::FrameDump;
use crate::transport::{ConnectionRef, SignalingStream, TransportError};

use super::SessionId;

pub(crate) struct SignalingSession {
    id: SessionId,
    env: Env,
    version: ProtocolVersion,
    stream: Arc<dyn SignalingStream>,
    connection: ConnectionRef,
    accepted: bool,
    ice_servers: Option<Vec<IceServer>>,
    engine: Option<NegotiationEngine>,
    deferred_tracks: Vec<MediaTrack>,
    outbox: VecDeque<Bytes>,
    /// Kept until the transport reports the write finished.
    in_flight: Option<Bytes>,
    reading: bool,
    closed: bool,
    closing: bool,
    finished: bool,
    _work: WorkGuard<Device>,
}

impl SignalingSession {
    pub(crate) fn new(
        env: Env,
        id: SessionId,
        version: ProtocolVersion,
        stream: Arc<dyn SignalingStream>,
    ) -> Self {
        Self {
            id,
            version,
            connection: stream.connection(),
            stream,
            accepted: false,
            ice_servers: None,
            engine: None,
            deferred_tracks: Vec::new(),
            outbox: VecDeque::new(),
            in_flight: None,
            reading: false,
            closed: false,
            closing: false,
            finished: false,
            _work: env.scheduler.work(),
            env,
        }
    }

    pub(crate) fn connection(&self) -> ConnectionRef {
        self.connection
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn take_engine(&mut self) -> Option<NegotiationEngine> {
        self.engine.take()
    }

    /// Accept the stream and resolve ICE servers in parallel. Whichever
    /// finishes last creates the engine and starts reading.
    pub(crate) fn start(&mut self) {
        tracing::debug!(session = %self.id, connection = %self.connection, version = %self.version, "signaling stream opened");
        let id = self.id;
        let stream = Arc::clone(&self.stream);
        self.env.spawn_then(
            async move { stream.accept().await },
            move |device, result| device.with_session(id, |session| session.on_accepted(result)),
        );
        let transport = Arc::clone(&self.env.transport);
        let identifier = self.env.config.ice_identifier.clone();
        self.env.spawn_then(
            async move { transport.resolve_ice_servers(&identifier).await },
            move |device, result| {
                device.with_session(id, |session| session.on_ice_servers(result));
            },
        );
    }

    fn on_accepted(&mut self, result: Result<(), TransportError>) {
        match result {
            Ok(()) => {
                self.accepted = true;
                self.maybe_begin();
            }
            Err(err) => {
                tracing::warn!(session = %self.id, error = %err, "failed to accept signaling stream");
                self.cleanup();
            }
        }
    }

    fn on_ice_servers(&mut self, result: Result<Vec<IceServer>, TransportError>) {
        match result {
            Ok(servers) => {
                tracing::debug!(session = %self.id, count = servers.len(), "ice servers resolved");
                self.ice_servers = Some(servers);
                self.maybe_begin();
            }
            Err(TransportError::NotAttached) => {
                tracing::info!(session = %self.id, "device not attached, continuing without turn servers");
                self.ice_servers = Some(Vec::new());
                self.maybe_begin();
            }
            Err(err) => {
                tracing::warn!(session = %self.id, error = %err, "failed to resolve ice servers");
                self.cleanup();
            }
        }
    }

    fn maybe_begin(&mut self) {
        if self.closed || self.engine.is_some() || !self.accepted {
            return;
        }
        let Some(servers) = self.ice_servers.as_deref() else {
            return;
        };
        let mut engine = NegotiationEngine::new(self.env.clone(), self.id, self.connection, servers);
        let deferred = std::mem::take(&mut self.deferred_tracks);
        if !deferred.is_empty() {
            tracing::debug!(session = %self.id, count = deferred.len(), "adding deferred tracks");
            engine.create_tracks(deferred);
        }
        self.engine = Some(engine);
        self.read_length();
    }

    /// Queue tracks for the engine, creating them right away when it exists.
    pub(crate) fn add_tracks(&mut self, tracks: Vec<MediaTrack>) {
        match self.engine.as_mut() {
            Some(engine) => engine.create_tracks(tracks),
            None => self.deferred_tracks.extend(tracks),
        }
    }

    pub(crate) fn with_engine<R>(
        &mut self,
        f: impl FnOnce(&mut NegotiationEngine, &mut dyn SignalOut) -> R,
    ) -> Option<R> {
        let engine = self.engine.as_mut()?;
        let mut out = FrameWriter {
            session: self.id,
            version: self.version,
            outbox: &mut self.outbox,
        };
        Some(f(engine, &mut out))
    }

    /// Apply engine state changes and push queued frames out. Runs after
    /// every task that touched the session.
    pub(crate) fn settle(&mut self) {
        let changes = self
            .engine
            .as_mut()
            .map(NegotiationEngine::take_changes)
            .unwrap_or_default();
        for state in changes {
            match state {
                ConnectionState::Failed => {
                    if let Some(engine) = self.engine.as_mut() {
                        engine.stop();
                    }
                    self.close_stream();
                }
                ConnectionState::Closed => self.close_stream(),
                ConnectionState::Created | ConnectionState::Connecting | ConnectionState::Connected => {}
            }
        }
        self.try_write();
    }

    fn read_length(&mut self) {
        if self.closed {
            self.finish_if_idle();
            return;
        }
        self.reading = true;
        let id = self.id;
        let stream = Arc::clone(&self.stream);
        self.env.spawn_then(
            async move { stream.read_all(LENGTH_PREFIX_LEN).await },
            move |device, result| device.with_session(id, |session| session.on_length(result)),
        );
    }

    fn on_length(&mut self, result: Result<Bytes, TransportError>) {
        self.reading = false;
        if self.closed {
            self.finish_if_idle();
            return;
        }
        let buf = match result {
            Ok(buf) => buf,
            Err(TransportError::Eof) => {
                tracing::debug!(session = %self.id, "signaling stream ended");
                self.close_stream();
                return;
            }
            Err(err) => {
                tracing::warn!(session = %self.id, error = %err, "signaling read failed");
                self.cleanup();
                return;
            }
        };
        match framing::decode_length(&buf) {
            LengthPrefix::Body(len) if len as usize > self.env.config.max_frame_len => {
                tracing::warn!(session = %self.id, len, max = self.env.config.max_frame_len, "frame too large, closing");
                self.close_stream();
            }
            LengthPrefix::Body(len) => self.read_body(len),
            LengthPrefix::Empty => {
                tracing::debug!(session = %self.id, "empty frame");
                self.read_length();
            }
            LengthPrefix::Truncated { read } => {
                tracing::debug!(session = %self.id, read, "short length prefix");
                self.read_length();
            }
        }
    }

    fn read_body(&mut self, len: u32) {
        self.reading = true;
        let id = self.id;
        let stream = Arc::clone(&self.stream);
        self.env.spawn_then(
            async move { stream.read_all(len as usize).await },
            move |device, result| device.with_session(id, |session| session.on_body(len, result)),
        );
    }

    fn on_body(&mut self, expected: u32, result: Result<Bytes, TransportError>) {
        self.reading = false;
        if self.closed {
            self.finish_if_idle();
            return;
        }
        let buf = match result {
            Ok(buf) => buf,
            Err(TransportError::Eof) => {
                tracing::debug!(session = %self.id, "signaling stream ended mid frame");
                self.close_stream();
                return;
            }
            Err(err) => {
                tracing::warn!(session = %self.id, error = %err, "signaling read failed");
                self.cleanup();
                return;
            }
        };
        match framing::check_body(expected, buf) {
            BodyRead::Complete(body) => {
                self.handle_frame(&body);
                self.read_length();
            }
            // The stream is going away; the next read reports how.
            BodyRead::Truncated { expected, read } => {
                tracing::debug!(session = %self.id, expected, read, "short frame body");
                self.read_length();
            }
        }
    }

    fn handle_frame(&mut self, body: &[u8]) {
        let handled = match self.version {
            ProtocolVersion::V1 => V1Message::decode(body).map(|message| self.handle_v1(message)),
            ProtocolVersion::V2 => V2Message::decode(body).map(|message| self.handle_v2(message)),
        };
        if let Err(err) = handled {
            tracing::info!(session = %self.id, error = %err, "dropping malformed signaling message");
            tracing::trace!(session = %self.id, frame = %FrameDump(body), "malformed frame");
        }
    }

    fn handle_v1(&mut self, message: V1Message) {
        match message {
            V1Message::Offer {
                description,
                metadata,
            }
            | V1Message::Answer {
                description,
                metadata,
            } => self.remote_description(description, metadata),
            V1Message::Ice { candidate, .. } => self.remote_candidate(candidate),
            V1Message::TurnRequest => {
                let servers = self.ice_servers.clone().unwrap_or_default();
                let response = V1Message::TurnResponse {
                    servers: LegacyTurnServer::flatten(&servers),
                    ice_servers: servers,
                };
                self.queue(response.encode());
            }
            V1Message::TurnResponse { .. } => {
                tracing::info!(session = %self.id, "ignoring TURN_RESPONSE from client");
            }
            V1Message::Unknown(raw) => {
                let tag = raw.get("type").cloned().unwrap_or_default();
                tracing::info!(session = %self.id, %tag, "unknown v1 message");
            }
        }
    }

    fn handle_v2(&mut self, message: V2Message) {
        match message {
            V2Message::SetupRequest { polite } => {
                let requested = polite.unwrap_or(true);
                let Some(engine) = self.engine.as_mut() else {
                    return;
                };
                // The device takes the role opposite to the one the client asked for.
                engine.set_polite(!requested);
                let response = V2Message::SetupResponse {
                    polite: requested,
                    id: engine.peer_id().to_owned(),
                    ice_servers: self.ice_servers.clone().unwrap_or_default(),
                };
                self.queue(response.encode());
            }
            V2Message::Description {
                description,
                metadata,
            } => self.remote_description(description, metadata),
            V2Message::Candidate { candidate, .. } => self.remote_candidate(candidate),
            V2Message::Metadata(text) => match &self.env.handlers.on_metadata {
                Some(on_metadata) => on_metadata(self.connection, &text),
                None => tracing::debug!(session = %self.id, "no metadata handler"),
            },
            V2Message::SetupResponse { .. } => {
                tracing::info!(session = %self.id, "ignoring SETUP_RESPONSE from client");
            }
            V2Message::Unknown(raw) => {
                let tag = raw.get("type").cloned().unwrap_or_default();
                tracing::info!(session = %self.id, %tag, "unknown v2 message");
            }
        }
    }

    fn remote_description(&mut self, description: SessionDescription, metadata: Option<Value>) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if let Some(metadata) = &metadata {
            engine.set_metadata(metadata);
        }
        engine.handle_description(description);
    }

    fn remote_candidate(&mut self, candidate: IceCandidate) {
        if let Some(engine) = self.engine.as_mut() {
            engine.handle_candidate(candidate);
        }
    }

    fn queue(&mut self, frame: Result<Bytes, ProtocolError>) {
        match frame {
            Ok(frame) => self.outbox.push_back(frame),
            Err(err) => tracing::warn!(session = %self.id, error = %err, "failed to encode signaling message"),
        }
    }

    fn try_write(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        if self.closed {
            if !self.outbox.is_empty() {
                tracing::debug!(session = %self.id, dropped = self.outbox.len(), "discarding writes on closed stream");
                self.outbox.clear();
            }
            self.finish_if_idle();
            return;
        }
        let Some(frame) = self.outbox.pop_front() else {
            return;
        };
        self.in_flight = Some(frame.clone());
        let id = self.id;
        let stream = Arc::clone(&self.stream);
        self.env.spawn_then(
            async move { stream.write_all(frame).await },
            move |device, result| device.with_session(id, |session| session.on_written(result)),
        );
    }

    fn on_written(&mut self, result: Result<(), TransportError>) {
        self.in_flight = None;
        if let Err(err) = result {
            if !self.closed {
                tracing::warn!(session = %self.id, error = %err, "signaling write failed");
                self.cleanup();
                return;
            }
            tracing::debug!(session = %self.id, error = %err, "write failed on closed stream");
        }
        if self.closed {
            self.close_stream();
        } else {
            self.try_write();
        }
    }

    /// Graceful close: run the stream close handshake, then finish once no
    /// I/O is outstanding.
    pub(crate) fn close_stream(&mut self) {
        if self.closed {
            self.finish_if_idle();
            return;
        }
        self.closed = true;
        self.closing = true;
        tracing::debug!(session = %self.id, "closing signaling stream");
        let id = self.id;
        let stream = Arc::clone(&self.stream);
        self.env.spawn_then(
            async move { stream.close().await },
            move |device, result| device.with_session(id, |session| session.on_closed(result)),
        );
    }

    fn on_closed(&mut self, result: Result<(), TransportError>) {
        self.closing = false;
        if let Err(err) = result {
            tracing::debug!(session = %self.id, error = %err, "close handshake failed");
        }
        if self.reading {
            // Only the remote's termination is left to read.
            self.stream.abort();
        }
        self.finish_if_idle();
    }

    /// Hard cleanup: no handshake, stop the engine, abort outstanding I/O.
    pub(crate) fn cleanup(&mut self) {
        self.closed = true;
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        self.stream.abort();
        self.finish_if_idle();
    }

    /// Stop negotiating and close the stream, as on device shutdown.
    pub(crate) fn shutdown(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        self.close_stream();
    }

    fn finish_if_idle(&mut self) {
        if self.closed && !self.reading && !self.closing && self.in_flight.is_none() {
            if !self.finished {
                tracing::debug!(session = %self.id, "signaling session finished");
            }
            self.finished = true;
        }
    }
}

/// Renders engine output in the session's protocol version.
struct FrameWriter<'a> {
    session: SessionId,
    version: ProtocolVersion,
    outbox: &'a mut VecDeque<Bytes>,
}

impl FrameWriter<'_> {
    fn push(&mut self, frame: Result<Bytes, ProtocolError>) {
        match frame {
            Ok(frame) => self.outbox.push_back(frame),
            Err(err) => {
                tracing::warn!(session = %self.session, error = %err, "failed to encode signaling message");
            }
        }
    }
}

impl SignalOut for FrameWriter<'_> {
    fn send_description(&mut self, description: &SessionDescription, metadata: &Value) {
        let description = description.clone();
        let metadata = Some(metadata.clone());
        let frame = match self.version {
            ProtocolVersion::V1 if description.sdp_type == SdpType::Answer => V1Message::Answer {
                description,
                metadata,
            }
            .encode(),
            ProtocolVersion::V1 => V1Message::Offer {
                description,
                metadata,
            }
            .encode(),
            ProtocolVersion::V2 => V2Message::Description {
                description,
                metadata,
            }
            .encode(),
        };
        self.push(frame);
    }

    fn send_candidate(&mut self, candidate: &IceCandidate, metadata: &Value) {
        let candidate = candidate.clone();
        let metadata = Some(metadata.clone());
        let frame = match self.version {
            ProtocolVersion::V1 => V1Message::Ice {
                candidate,
                metadata,
            }
            .encode(),
            ProtocolVersion::V2 => V2Message::Candidate {
                candidate,
                metadata,
            }
            .encode(),
        };
        self.push(frame);
    }
}
