mod support;

use std::sync::Arc;

use parking_lot::Mutex;
use rtc_edge::ids::RandomIds;
use rtc_edge::media::negotiator::{self, CodecNegotiator, Direction, TrackNegotiator};
use rtc_edge::peer::mock::PeerScript;
use rtc_edge::protocol::IceServer;
use rtc_edge::transport::mock::{IceResolution, MockTransport};
use rtc_edge::{ConnectionRef, MediaTrack, TrackError};
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};

use support::{AUDIO, DATA, DEVICE_AUDIO, Harness, VIDEO, next_description, offer_sdp, setup, stays_quiet, v2_offer};

#[test_timeout::tokio_timeout_test]
async fn setup_response_echoes_requested_role() {
    let transport = MockTransport::with_ice(IceResolution::Servers(vec![IceServer {
        urls: vec!["turn:turn.example.net:3478".into()],
        username: Some("u".into()),
        credential: Some("p".into()),
    }]));
    let harness = Harness::start_with(transport, PeerScript::default(), |builder| builder).await;

    let (_, mut client, _) = harness.connect_v2();
    let response = setup(&mut client, Some(true)).await;
    assert_eq!(response["polite"], true);
    assert_eq!(response["id"], "connection-1");
    assert_eq!(
        response["iceServers"],
        json!([{"urls": ["turn:turn.example.net:3478"], "username": "u", "credential": "p"}])
    );

    let (_, mut client, _) = harness.connect_v2();
    assert_eq!(setup(&mut client, Some(false)).await["polite"], false);

    let (_, mut client, _) = harness.connect_v2();
    let response = setup(&mut client, None).await;
    assert_eq!(response["polite"], true);
    assert_eq!(response["id"], "connection-3");
}

#[test_timeout::tokio_timeout_test]
async fn offer_gets_answer_and_trickled_candidates() {
    let harness = Harness::start().await;
    let (_, mut client, _) = harness.connect_v2();
    setup(&mut client, None).await;

    client
        .send_json(&v2_offer(&offer_sdp(&[DATA]), json!({"noTrickle": false})))
        .await
        .unwrap();
    let answer = client.recv_json().await.unwrap();
    assert_eq!(answer["type"], "DESCRIPTION");
    assert_eq!(answer["description"]["type"], "answer");
    assert_eq!(answer["metadata"]["status"], "OK");

    let candidate = client.recv_json().await.unwrap();
    assert_eq!(candidate["type"], "CANDIDATE");
    assert_eq!(candidate["candidate"]["sdpMid"], "0");
    assert_eq!(candidate["metadata"]["noTrickle"], false);
}

#[test_timeout::tokio_timeout_test]
async fn no_trickle_answer_waits_for_gathering() {
    let script = PeerScript {
        candidates: vec![
            "candidate:1 1 udp 2122260223 192.0.2.10 50000 typ host".into(),
            "candidate:2 1 udp 1686052607 203.0.113.4 50001 typ srflx".into(),
        ],
        ..PeerScript::default()
    };
    let harness = Harness::start_with(MockTransport::new(), script, |builder| builder).await;
    let (_, mut client, _) = harness.connect_v2();
    setup(&mut client, None).await;

    client
        .send_json(&v2_offer(&offer_sdp(&[DATA]), json!({"noTrickle": true})))
        .await
        .unwrap();
    let answer = client.recv_json().await.unwrap();
    assert_eq!(answer["type"], "DESCRIPTION", "candidate leaked before the answer: {answer}");
    assert_eq!(answer["description"]["type"], "answer");
    assert_eq!(answer["metadata"]["noTrickle"], true);
    assert!(stays_quiet(&mut client).await, "no candidates without trickle");

    let peer = harness.peers.peer(0).await;
    assert_eq!(peer.local_descriptions().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn impolite_device_ignores_colliding_offer() {
    let gate = Arc::new(Semaphore::new(0));
    let script = PeerScript {
        local_gate: Some(gate.clone()),
        ..PeerScript::default()
    };
    let harness = Harness::start_with(MockTransport::new(), script, |builder| builder).await;
    let (connection, mut client, _) = harness.connect_v2();
    // Client stays polite, so the device is impolite.
    assert_eq!(setup(&mut client, Some(true)).await["polite"], true);

    let track = MediaTrack::new("doorbell-audio", DEVICE_AUDIO);
    assert!(harness.handle.add_media_tracks(connection, vec![track.clone()]).await);
    client
        .send_json(&v2_offer(&offer_sdp(&[AUDIO]), json!({})))
        .await
        .unwrap();
    gate.add_permits(4);

    let offer = next_description(&mut client).await;
    assert_eq!(offer["description"]["type"], "offer");
    assert_eq!(
        offer["metadata"]["tracks"],
        json!([{"mid": "local-0", "trackId": "doorbell-audio"}])
    );
    assert!(offer["description"]["sdp"].as_str().unwrap().contains("a=mid:local-0"));

    let peer = harness.peers.peer(0).await;
    assert!(peer.remote_descriptions().is_empty());
    assert_eq!(track.mid().as_deref(), Some("local-0"));
}

#[test_timeout::tokio_timeout_test]
async fn polite_device_answers_colliding_offer_then_offers_again() {
    let gate = Arc::new(Semaphore::new(0));
    let script = PeerScript {
        local_gate: Some(gate.clone()),
        ..PeerScript::default()
    };
    let harness = Harness::start_with(MockTransport::new(), script, |builder| builder).await;
    let (connection, mut client, _) = harness.connect_v2();
    assert_eq!(setup(&mut client, Some(false)).await["polite"], false);

    let track = MediaTrack::new("doorbell-audio", DEVICE_AUDIO);
    assert!(harness.handle.add_media_tracks(connection, vec![track]).await);
    client
        .send_json(&v2_offer(&offer_sdp(&[DATA]), json!({})))
        .await
        .unwrap();

    let peer = harness.peers.peer(0).await;
    support::eventually(|| {
        let peer = peer.clone();
        async move { !peer.remote_descriptions().is_empty() }
    })
    .await;
    gate.add_permits(8);

    let answer = next_description(&mut client).await;
    assert_eq!(answer["description"]["type"], "answer");
    let offer = next_description(&mut client).await;
    assert_eq!(offer["description"]["type"], "offer");
    assert!(offer["description"]["sdp"].as_str().unwrap().contains("a=mid:local-0"));
}

#[test_timeout::tokio_timeout_test]
async fn metadata_message_reaches_the_application() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let harness = Harness::start_with(MockTransport::new(), PeerScript::default(), move |builder| {
        builder.on_metadata(move |connection, text| {
            let _ = tx.send((connection, text.to_owned()));
        })
    })
    .await;
    let (connection, mut client, _) = harness.connect_v2();

    client
        .send_json(&json!({"type": "METADATA", "metadata": "hello device"}))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), (connection, "hello device".to_owned()));
}

#[test_timeout::tokio_timeout_test]
async fn rejected_track_marks_metadata_failed() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let record = seen.clone();
    let harness = Harness::start_with(MockTransport::new(), PeerScript::default(), move |builder| {
        builder.on_track(move |_: ConnectionRef, track: MediaTrack| {
            record.lock().push(track.track_id().to_owned());
            track.set_error_state(TrackError::InvalidCodecs);
        })
    })
    .await;
    let (_, mut client, _) = harness.connect_v2();
    setup(&mut client, None).await;

    client
        .send_json(&v2_offer(
            &offer_sdp(&[VIDEO]),
            json!({"tracks": [{"mid": "1", "trackId": "frontdoor-video"}]}),
        ))
        .await
        .unwrap();
    let answer = next_description(&mut client).await;
    assert_eq!(answer["description"]["type"], "answer");
    assert_eq!(answer["metadata"]["status"], "FAILED");
    assert_eq!(
        answer["metadata"]["tracks"],
        json!([{"mid": "1", "trackId": "frontdoor-video", "error": "INVALID_CODECS"}])
    );
    assert_eq!(*seen.lock(), vec!["frontdoor-video".to_owned()]);
}

#[test_timeout::tokio_timeout_test]
async fn accepted_track_is_restricted_before_answering() {
    let opus = CodecNegotiator::new(negotiator::OPUS, Direction::RecvOnly, Arc::new(RandomIds::new()));
    let harness = Harness::start_with(MockTransport::new(), PeerScript::default(), move |builder| {
        builder.on_track(move |_, track| {
            assert_eq!(opus.match_track(&track), 111);
        })
    })
    .await;
    let (_, mut client, _) = harness.connect_v2();
    setup(&mut client, None).await;

    client
        .send_json(&v2_offer(
            &offer_sdp(&[AUDIO]),
            json!({"tracks": [{"mid": "0", "trackId": "mic"}]}),
        ))
        .await
        .unwrap();
    let answer = next_description(&mut client).await;
    assert_eq!(answer["metadata"]["status"], "OK");
    let sdp = answer["description"]["sdp"].as_str().unwrap();
    assert!(sdp.contains("opus/48000/2"));
    assert!(!sdp.contains("PCMU"), "unsupported codec left in answer:\n{sdp}");

    let peer = harness.peers.peer(0).await;
    let tracks = peer.tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].applied().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn unattached_device_uses_only_the_fallback_stun_server() {
    let transport = MockTransport::with_ice(IceResolution::NotAttached);
    let harness = Harness::start_with(transport, PeerScript::default(), |builder| builder).await;
    let (_, mut client, _) = harness.connect_v2();
    let response = setup(&mut client, None).await;
    assert_eq!(response["iceServers"], json!([]));

    client
        .send_json(&v2_offer(&offer_sdp(&[DATA]), json!({})))
        .await
        .unwrap();
    next_description(&mut client).await;
    let peer = harness.peers.peer(0).await;
    let servers = &peer.config().ice_servers;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].url, rtc_edge::config::DEFAULT_STUN_URL);
}

#[test_timeout::tokio_timeout_test]
async fn failed_ice_resolution_aborts_the_stream() {
    let transport = MockTransport::with_ice(IceResolution::Fail);
    let harness = Harness::start_with(transport, PeerScript::default(), |builder| builder).await;
    let (_, mut client, stats) = harness.connect_v2();

    assert!(client.at_eof().await);
    assert!(stats.aborted());
    assert!(harness.peers.peers().is_empty());
    harness.wait_for_sessions(0).await;
}

#[test_timeout::tokio_timeout_test]
async fn denied_signaling_stream_is_aborted() {
    let harness = Harness::start_with(MockTransport::new(), PeerScript::default(), |builder| {
        builder.access_control(|_: ConnectionRef, action: &str| action != rtc_edge::signaling::SIGNALING_ACTION)
    })
    .await;
    let (_, mut client, stats) = harness.connect_v2();

    assert!(client.at_eof().await);
    assert!(stats.aborted());
    assert!(!stats.accepted());
    assert_eq!(harness.session_count().await, 0);
}

#[test_timeout::tokio_timeout_test]
async fn malformed_description_is_dropped() {
    let harness = Harness::start().await;
    let (_, mut client, _) = harness.connect_v2();
    setup(&mut client, None).await;

    client
        .send_json(&json!({"type": "DESCRIPTION", "description": 42}))
        .await
        .unwrap();
    client
        .send_json(&v2_offer(&offer_sdp(&[DATA]), json!({})))
        .await
        .unwrap();
    let answer = next_description(&mut client).await;
    assert_eq!(answer["description"]["type"], "answer");
}

#[test_timeout::tokio_timeout_test]
async fn unknown_v2_type_is_ignored() {
    let harness = Harness::start().await;
    let (_, mut client, _) = harness.connect_v2();

    client.send_json(&json!({"type": "REBOOT", "data": "?"})).await.unwrap();
    assert_eq!(setup(&mut client, Some(true)).await["polite"], true);
}
