#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rtc_edge::device::DeviceBuilder;
use rtc_edge::ids::SequentialIds;
use rtc_edge::peer::mock::{MockPeerFactory, PeerScript, session_sdp};
use rtc_edge::protocol::discovery::SignalingInfo;
use rtc_edge::transport::mock::{
    ClientStream, MockNetwork, MockRequestListener, MockStreamListener, MockTransport,
    StreamOptions, StreamStats,
};
use rtc_edge::{ConnectionRef, Device, DeviceHandle, ProtocolVersion};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

pub const AUDIO: &str = "m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10;useinbandfec=1\r\na=rtpmap:0 PCMU/8000\r\na=sendrecv";
pub const VIDEO: &str = "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=rtpmap:96 VP8/90000\r\na=sendrecv";
pub const DATA: &str = "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:2";
pub const DEVICE_AUDIO: &str = "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=sendonly";

/// A running device wired to in-memory transport and peers.
pub struct Harness {
    pub network: Arc<MockNetwork>,
    pub transport: Arc<MockTransport>,
    pub peers: Arc<MockPeerFactory>,
    pub v1: Arc<MockStreamListener>,
    pub v2: Arc<MockStreamListener>,
    pub requests: Arc<MockRequestListener>,
    pub handle: DeviceHandle,
    pub info: SignalingInfo,
    running: JoinHandle<()>,
}

impl Harness {
    pub async fn start() -> Harness {
        Self::start_with(MockTransport::new(), PeerScript::default(), |builder| builder).await
    }

    /// Everything is allowed unless `configure` installs another policy.
    pub async fn start_with<F>(transport: Arc<MockTransport>, script: PeerScript, configure: F) -> Harness
    where
        F: FnOnce(DeviceBuilder) -> DeviceBuilder,
    {
        let network = MockNetwork::new();
        let peers = MockPeerFactory::with_script(script);
        let builder = Device::builder(tokio::runtime::Handle::current(), transport.clone(), peers.clone())
            .ids(Arc::new(SequentialIds::new()))
            .access_control(|_: ConnectionRef, _: &str| true);
        let (mut device, worker) = configure(builder).build();
        let v1 = network.stream_listener();
        let v2 = network.stream_listener();
        let requests = MockRequestListener::new();
        device.listen(ProtocolVersion::V1, v1.clone());
        device.listen(ProtocolVersion::V2, v2.clone());
        device.serve_info(requests.clone());
        let info = device.signaling_info();
        let handle = device.handle();
        let running = tokio::spawn(device.run(worker));
        Harness {
            network,
            transport,
            peers,
            v1,
            v2,
            requests,
            handle,
            info,
            running,
        }
    }

    pub fn connect_v1(&self) -> (ConnectionRef, ClientStream, Arc<StreamStats>) {
        let connection = self.network.connection();
        let (client, stats) = self.v1.connect(connection);
        (connection, client, stats)
    }

    pub fn connect_v2(&self) -> (ConnectionRef, ClientStream, Arc<StreamStats>) {
        self.connect_v2_with(StreamOptions::default())
    }

    pub fn connect_v2_with(&self, options: StreamOptions) -> (ConnectionRef, ClientStream, Arc<StreamStats>) {
        let connection = self.network.connection();
        let (client, stats) = self.v2.connect_with(connection, options);
        (connection, client, stats)
    }

    pub async fn session_count(&self) -> usize {
        self.handle.query(|device| device.session_count()).await.unwrap_or(0)
    }

    pub async fn draining_count(&self) -> usize {
        self.handle.query(|device| device.draining_count()).await.unwrap_or(0)
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        while self.session_count().await != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_draining(&self, count: usize) {
        while self.draining_count().await != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Shut the device down and wait for its worker to return.
    pub async fn stop(self) {
        self.handle.shutdown();
        self.running.await.unwrap();
    }
}

/// Poll `check` until it holds. The test timeout bounds the wait.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    while !check().await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// True when nothing arrives on `client` for a little while.
pub async fn stays_quiet(client: &mut ClientStream) -> bool {
    tokio::time::timeout(Duration::from_millis(150), client.recv_json())
        .await
        .is_err()
}

pub fn v1_offer(sdp: &str, metadata: Value) -> Value {
    json!({
        "type": 0,
        "data": json!({"type": "offer", "sdp": sdp}).to_string(),
        "metadata": metadata,
    })
}

pub fn v2_offer(sdp: &str, metadata: Value) -> Value {
    json!({
        "type": "DESCRIPTION",
        "description": {"type": "offer", "sdp": sdp},
        "metadata": metadata,
    })
}

pub fn offer_sdp(sections: &[&str]) -> String {
    session_sdp(sections)
}

/// Send `SETUP_REQUEST` and return the `SETUP_RESPONSE`.
pub async fn setup(client: &mut ClientStream, polite: Option<bool>) -> Value {
    let mut request = json!({"type": "SETUP_REQUEST"});
    if let Some(polite) = polite {
        request["polite"] = json!(polite);
    }
    client.send_json(&request).await.unwrap();
    let response = client.recv_json().await.unwrap();
    assert_eq!(response["type"], "SETUP_RESPONSE", "unexpected {response}");
    response
}

/// Next v2 `DESCRIPTION`, skipping candidates.
pub async fn next_description(client: &mut ClientStream) -> Value {
    loop {
        let message = client.recv_json().await.unwrap();
        match message["type"].as_str() {
            Some("DESCRIPTION") => return message,
            Some("CANDIDATE") => continue,
            _ => panic!("unexpected message {message}"),
        }
    }
}
