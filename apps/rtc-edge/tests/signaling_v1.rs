mod support;

use rtc_edge::protocol::IceServer;
use rtc_edge::transport::mock::{IceResolution, MockTransport};
use rtc_edge::peer::mock::PeerScript;
use serde_json::{Value, json};

use support::{DATA, Harness, offer_sdp, stays_quiet, v1_offer};

#[test_timeout::tokio_timeout_test]
async fn turn_request_without_servers_gets_empty_arrays() {
    let harness = Harness::start().await;
    let (_, mut client, _) = harness.connect_v1();

    client.send_json(&json!({"type": 3})).await.unwrap();
    let response = client.recv_json().await.unwrap();
    assert_eq!(response, json!({"type": 4, "servers": [], "iceServers": []}));

    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn turn_response_lists_resolved_servers_in_both_shapes() {
    let transport = MockTransport::with_ice(IceResolution::Servers(vec![IceServer {
        urls: vec!["turn:turn.example.net:4433?transport=tcp".into()],
        username: Some("device:42".into()),
        credential: Some("secret".into()),
    }]));
    let harness = Harness::start_with(transport, PeerScript::default(), |builder| builder).await;
    let (_, mut client, _) = harness.connect_v1();

    client.send_json(&json!({"type": 3})).await.unwrap();
    let response = client.recv_json().await.unwrap();
    assert_eq!(response["type"], 4);
    assert_eq!(
        response["servers"],
        json!([{"hostname": "turn.example.net", "port": 4433, "username": "device:42", "password": "secret"}])
    );
    assert_eq!(
        response["iceServers"],
        json!([{"urls": ["turn:turn.example.net:4433?transport=tcp"], "username": "device:42", "credential": "secret"}])
    );
}

#[test_timeout::tokio_timeout_test]
async fn offer_is_answered_once_then_candidates_trickle() {
    let harness = Harness::start().await;
    let (_, mut client, _) = harness.connect_v1();

    let sdp = offer_sdp(&[DATA]);
    client
        .send_json(&v1_offer(&sdp, json!({"session": "s-1"})))
        .await
        .unwrap();

    let answer = client.recv_json().await.unwrap();
    assert_eq!(answer["type"], 1, "expected ANSWER, got {answer}");
    let description: Value = serde_json::from_str(answer["data"].as_str().unwrap()).unwrap();
    assert_eq!(description["type"], "answer");
    assert!(description["sdp"].as_str().unwrap().contains("a=mid:2"));
    assert_eq!(
        answer["metadata"],
        json!({"session": "s-1", "tracks": [], "status": "OK"})
    );

    let ice = client.recv_json().await.unwrap();
    assert_eq!(ice["type"], 2, "expected ICE, got {ice}");
    let candidate: Value = serde_json::from_str(ice["data"].as_str().unwrap()).unwrap();
    assert_eq!(candidate["sdpMid"], "0");
    assert!(candidate["candidate"].as_str().unwrap().starts_with("candidate:"));

    assert!(stays_quiet(&mut client).await);
    let peer = harness.peers.peer(0).await;
    assert_eq!(peer.remote_descriptions().len(), 1);
    assert_eq!(peer.local_descriptions().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn remote_candidates_reach_the_peer() {
    let harness = Harness::start().await;
    let (_, mut client, _) = harness.connect_v1();
    client
        .send_json(&v1_offer(&offer_sdp(&[DATA]), json!({})))
        .await
        .unwrap();
    let answer = client.recv_json().await.unwrap();
    assert_eq!(answer["type"], 1);

    let candidate = json!({"candidate": "candidate:7 1 udp 1 198.51.100.7 4000 typ host", "sdpMid": "2"});
    client
        .send_json(&json!({"type": 2, "data": candidate.to_string()}))
        .await
        .unwrap();

    let peer = harness.peers.peer(0).await;
    support::eventually(|| {
        let peer = peer.clone();
        async move { !peer.remote_candidates().is_empty() }
    })
    .await;
    assert_eq!(peer.remote_candidates()[0].sdp_mid.as_deref(), Some("2"));
}

#[test_timeout::tokio_timeout_test]
async fn unknown_v1_type_is_ignored() {
    let harness = Harness::start().await;
    let (_, mut client, _) = harness.connect_v1();

    client.send_json(&json!({"type": 17, "data": "?"})).await.unwrap();
    client.send_json(&json!({"type": 3})).await.unwrap();
    let response = client.recv_json().await.unwrap();
    assert_eq!(response["type"], 4);
}
