//! The device: registry of signaling sessions and their negotiation engines.
//!
//! All mutable state lives in [`Device`] and is only touched from tasks run
//! by its [`Worker`]. Async operations go through [`Env::spawn_then`], whose
//! continuation looks the session or engine up again by [`SessionId`]; if it
//! is gone by then the completion is dropped.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::SignalingConfig;
use crate::ids::{IdGenerator, RandomIds};
use crate::media::{Datachannel, MediaTrack};
use crate::negotiation::{ConnectionState, NegotiationEngine};
use crate::peer::{PeerConnectionFactory, PeerEvent};
use crate::protocol::discovery::SignalingInfo;
use crate::protocol::{Discard, ProtocolVersion, SignalOut};
use crate::scheduler::{Scheduler, WorkGuard, Worker};
use crate::signaling::listener;
use crate::signaling::session::SignalingSession;
use crate::signaling::{GET_INFO_ACTION, SIGNALING_ACTION, SessionId};
use crate::transport::{
    AccessControl, ConnectionRef, DeviceTransport, IncomingRequest, RequestListener,
    SignalingStream, StreamListener,
};

pub type TrackHandler = Arc<dyn Fn(ConnectionRef, MediaTrack) + Send + Sync>;
pub type DatachannelHandler = Arc<dyn Fn(ConnectionRef, Datachannel) + Send + Sync>;
pub type MetadataHandler = Arc<dyn Fn(ConnectionRef, &str) + Send + Sync>;

/// Application callbacks. They run on the worker and must not block.
pub(crate) struct Handlers {
    pub(crate) on_track: Option<TrackHandler>,
    pub(crate) on_datachannel: Option<DatachannelHandler>,
    pub(crate) on_metadata: Option<MetadataHandler>,
    pub(crate) check_access: Arc<dyn AccessControl>,
}

struct DenyAll;

impl AccessControl for DenyAll {
    fn check(&self, _: ConnectionRef, _: &str) -> bool {
        false
    }
}

/// Everything a session or engine needs to start async work and find its
/// way back to the worker.
#[derive(Clone)]
pub(crate) struct Env {
    pub(crate) scheduler: Scheduler<Device>,
    pub(crate) runtime: Handle,
    pub(crate) transport: Arc<dyn DeviceTransport>,
    pub(crate) peers: Arc<dyn PeerConnectionFactory>,
    pub(crate) handlers: Arc<Handlers>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) config: Arc<SignalingConfig>,
}

impl Env {
    /// Run `future` on the runtime, then post `then` with its output. The
    /// worker stays alive until the continuation is queued.
    pub(crate) fn spawn_then<T, Fut, F>(&self, future: Fut, then: F)
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        F: FnOnce(&mut Device, T) + Send + 'static,
    {
        let work = self.scheduler.work();
        let scheduler = self.scheduler.clone();
        self.runtime.spawn(async move {
            let output = future.await;
            scheduler.post(move |device| then(device, output));
            drop(work);
        });
    }
}

pub struct DeviceBuilder {
    runtime: Handle,
    transport: Arc<dyn DeviceTransport>,
    peers: Arc<dyn PeerConnectionFactory>,
    on_track: Option<TrackHandler>,
    on_datachannel: Option<DatachannelHandler>,
    on_metadata: Option<MetadataHandler>,
    check_access: Arc<dyn AccessControl>,
    ids: Arc<dyn IdGenerator>,
    config: SignalingConfig,
}

impl DeviceBuilder {
    /// Called for every track the client offers. Set an error state on the
    /// track to reject it.
    pub fn on_track<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionRef, MediaTrack) + Send + Sync + 'static,
    {
        self.on_track = Some(Arc::new(handler));
        self
    }

    /// Called for client-opened channels not claimed by the built-in
    /// `coap` and `stream-<port>` bridges.
    pub fn on_datachannel<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionRef, Datachannel) + Send + Sync + 'static,
    {
        self.on_datachannel = Some(Arc::new(handler));
        self
    }

    pub fn on_metadata<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionRef, &str) + Send + Sync + 'static,
    {
        self.on_metadata = Some(Arc::new(handler));
        self
    }

    /// Access policy for signaling and discovery. Without one, everything is
    /// denied.
    pub fn access_control<A>(mut self, access: A) -> Self
    where
        A: AccessControl + 'static,
    {
        self.check_access = Arc::new(access);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(mut self, config: SignalingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> (Device, Worker<Device>) {
        let (scheduler, worker) = Scheduler::new();
        let handlers = Handlers {
            on_track: self.on_track,
            on_datachannel: self.on_datachannel,
            on_metadata: self.on_metadata,
            check_access: self.check_access,
        };
        let env = Env {
            scheduler: scheduler.clone(),
            runtime: self.runtime,
            transport: self.transport,
            peers: self.peers,
            handlers: Arc::new(handlers),
            ids: self.ids,
            config: Arc::new(self.config),
        };
        let device = Device {
            keepalive: Some(scheduler.work()),
            env,
            sessions: BTreeMap::new(),
            draining: BTreeMap::new(),
            next_session: 1,
            info: SignalingInfo::default(),
            loops: Vec::new(),
            shutting_down: false,
        };
        (device, worker)
    }
}

pub struct Device {
    env: Env,
    sessions: BTreeMap<SessionId, SignalingSession>,
    /// Engines whose signaling stream is gone but whose peer connection is
    /// still up.
    draining: BTreeMap<SessionId, NegotiationEngine>,
    next_session: u64,
    info: SignalingInfo,
    loops: Vec<JoinHandle<()>>,
    keepalive: Option<WorkGuard<Device>>,
    shutting_down: bool,
}

impl Device {
    pub fn builder(
        runtime: Handle,
        transport: Arc<dyn DeviceTransport>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> DeviceBuilder {
        DeviceBuilder {
            runtime,
            transport,
            peers,
            on_track: None,
            on_datachannel: None,
            on_metadata: None,
            check_access: Arc::new(DenyAll),
            ids: Arc::new(RandomIds::new()),
            config: SignalingConfig::default(),
        }
    }

    /// Drive the device until [`Device::shutdown`] has run and all sessions,
    /// engines and listeners have finished.
    pub async fn run(mut self, mut worker: Worker<Device>) {
        worker.run(&mut self).await;
        tracing::debug!("device worker stopped");
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            scheduler: self.env.scheduler.clone(),
        }
    }

    /// Serve signaling streams of `version` from `listener`. The port is
    /// reported by the discovery request.
    pub fn listen(&mut self, version: ProtocolVersion, listener: Arc<dyn StreamListener>) {
        let port = listener.port();
        match version {
            ProtocolVersion::V1 => self.info.v1_port = Some(port),
            ProtocolVersion::V2 => self.info.v2_port = Some(port),
        }
        let task = listener::spawn_accept_loop(
            self.env.scheduler.clone(),
            &self.env.runtime,
            version,
            listener,
        );
        self.loops.push(task);
    }

    /// Answer discovery requests arriving on `listener`.
    pub fn serve_info(&mut self, listener: Arc<dyn RequestListener>) {
        let task = listener::spawn_request_loop(self.env.scheduler.clone(), &self.env.runtime, listener);
        self.loops.push(task);
    }

    pub fn signaling_info(&self) -> SignalingInfo {
        self.info
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    /// Add device-sent tracks to the newest open session on `connection`.
    /// Tracks given before the session has its engine are created once it
    /// does. Returns `false` when the connection has no open session.
    pub fn connection_add_media_tracks(
        &mut self,
        connection: ConnectionRef,
        tracks: Vec<MediaTrack>,
    ) -> bool {
        let id = self
            .sessions
            .iter()
            .rev()
            .find(|(_, session)| session.connection() == connection && !session.is_closed())
            .map(|(id, _)| *id);
        let Some(id) = id else {
            tracing::info!(%connection, "no signaling session for tracks");
            return false;
        };
        self.with_session(id, |session| session.add_tracks(tracks));
        true
    }

    /// Stop accepting, close every session and stop every engine. The worker
    /// returns once all of them have wound down.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        tracing::info!(sessions = self.sessions.len(), draining = self.draining.len(), "device shutting down");
        for task in self.loops.drain(..) {
            task.abort();
        }
        self.keepalive = None;
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.with_session(id, SignalingSession::shutdown);
        }
        let ids: Vec<SessionId> = self.draining.keys().copied().collect();
        for id in ids {
            self.with_engine(id, |engine, _| engine.stop());
        }
    }

    pub(crate) fn stream_accepted(&mut self, version: ProtocolVersion, stream: Arc<dyn SignalingStream>) {
        let connection = stream.connection();
        if self.shutting_down {
            stream.abort();
            return;
        }
        if !self.env.handlers.check_access.check(connection, SIGNALING_ACTION) {
            tracing::info!(%connection, %version, "signaling access denied");
            stream.abort();
            return;
        }
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let mut session = SignalingSession::new(self.env.clone(), id, version, stream);
        session.start();
        self.sessions.insert(id, session);
    }

    pub(crate) fn handle_info_request(&mut self, request: IncomingRequest) {
        let allowed = self
            .env
            .handlers
            .check_access
            .check(request.connection, GET_INFO_ACTION);
        let response = listener::info_response(&request.request, allowed, &self.info);
        tracing::debug!(connection = %request.connection, status = response.status, "signaling info request");
        request.respond(response);
    }

    pub(crate) fn with_session(&mut self, id: SessionId, f: impl FnOnce(&mut SignalingSession)) {
        let Some(session) = self.sessions.get_mut(&id) else {
            tracing::trace!(session = %id, "completion for removed session");
            return;
        };
        f(session);
        self.settle(id);
    }

    /// Run `f` against the engine of `id`, wherever it currently lives.
    /// Signals from a draining engine are discarded.
    pub(crate) fn with_engine(
        &mut self,
        id: SessionId,
        f: impl FnOnce(&mut NegotiationEngine, &mut dyn SignalOut),
    ) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.with_engine(f).is_none() {
                tracing::trace!(session = %id, "session has no engine yet");
            }
            self.settle(id);
            return;
        }
        let Some(engine) = self.draining.get_mut(&id) else {
            tracing::trace!(session = %id, "completion for removed engine");
            return;
        };
        f(engine, &mut Discard);
        if engine.take_changes().contains(&ConnectionState::Failed) {
            engine.stop();
        }
        if !engine.has_peer() {
            tracing::debug!(session = %id, "draining engine released");
            self.draining.remove(&id);
        }
    }

    pub(crate) fn engine_event(&mut self, id: SessionId, event: PeerEvent) {
        self.with_engine(id, |engine, out| engine.on_event(event, out));
    }

    pub(crate) fn engine_closed(&mut self, id: SessionId) {
        self.with_engine(id, |engine, _| engine.teardown());
    }

    /// Flush the session and retire it once finished. An engine that still
    /// has a live peer connection moves to the draining set.
    fn settle(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.settle();
        if !session.is_finished() {
            return;
        }
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        tracing::debug!(session = %id, "signaling session removed");
        if let Some(engine) = session.take_engine() {
            if engine.has_peer() {
                tracing::debug!(session = %id, "peer connection outlives signaling");
                self.draining.insert(id, engine);
            }
        }
    }
}

/// Cloneable access to a running device from outside the worker.
#[derive(Clone)]
pub struct DeviceHandle {
    scheduler: Scheduler<Device>,
}

impl DeviceHandle {
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&mut Device) + Send + 'static,
    {
        self.scheduler.post(task);
    }

    /// Run `f` on the worker and return its result; `None` if the worker
    /// has stopped.
    pub async fn query<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Device) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.scheduler.post(move |device| {
            let _ = tx.send(f(device));
        });
        rx.await.ok()
    }

    pub async fn add_media_tracks(&self, connection: ConnectionRef, tracks: Vec<MediaTrack>) -> bool {
        self.query(move |device| device.connection_add_media_tracks(connection, tracks))
            .await
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        self.scheduler.post(Device::shutdown);
    }
}
