// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Client façade: session caching, sent-token dedup, rebuild-once retry and
// OBSERVE-backed /sync.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, ResponseType};

use lbgate::mapping::{encode_uint_option, ACCESS_TOKEN_OPTION};
use lbgate::{CborCodec, ConnectionParams, LbClient, PathSet};

use support::*;

/// A Content response carrying the CBOR encoding of `json`.
fn cbor_response(codec: &CborCodec, json: &str) -> Packet {
    let mut msg = Packet::new();
    msg.header.set_type(MessageType::Acknowledgement);
    msg.header.code = MessageClass::Response(ResponseType::Content);
    msg.add_option(CoapOption::ContentFormat, encode_uint_option(60));
    msg.payload = codec.json_to_cbor(json.as_bytes()).unwrap();
    msg
}

fn client_with(
    params: ConnectionParams,
    sessions: Vec<Arc<MockSession>>,
) -> (LbClient, Arc<MockDialer>) {
    let codec = Arc::new(CborCodec::v1(false));
    let paths = Arc::new(PathSet::v1());
    let dialer = MockDialer::new(sessions);
    (
        LbClient::new(params, codec, paths, dialer.clone()),
        dialer,
    )
}

fn has_access_token_option(msg: &Packet) -> bool {
    msg.get_option(CoapOption::from(ACCESS_TOKEN_OPTION)).is_some()
}

#[tokio::test]
async fn requests_round_trip_and_reuse_the_session() {
    let codec = CborCodec::v1(false);
    let session = MockSession::new(cbor_response(&codec, r#"{"ok":true}"#), None);
    let (client, dialer) = client_with(ConnectionParams::default(), vec![session.clone()]);

    let res = client
        .send_request("GET", "https://hs.example:5683/_matrix/client/versions", "tok", "")
        .await
        .unwrap();
    assert_eq!(res.code, 200);
    assert_eq!(res.body, r#"{"ok":true}"#);

    let res = client
        .send_request("POST", "https://hs.example:5683/_matrix/client/r0/createRoom", "tok", "{}")
        .await
        .unwrap();
    assert_eq!(res.code, 200);

    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1, "session is cached");
    assert_eq!(session.exchange_count(), 2);
    // The compressed path went on the wire.
    let sent = session.exchange_at(1);
    let path: Vec<Vec<u8>> = sent
        .get_option(CoapOption::UriPath)
        .unwrap()
        .iter()
        .cloned()
        .collect();
    assert_eq!(path, vec![b"G".to_vec()]);
}

#[tokio::test]
async fn access_token_is_sent_only_when_it_changes() {
    let codec = CborCodec::v1(false);
    let session = MockSession::new(cbor_response(&codec, "{}"), None);
    let (client, _) = client_with(ConnectionParams::default(), vec![session.clone()]);

    let url = "https://hs.example/_matrix/client/r0/sync";
    client.send_request("GET", url, "tok-a", "").await.unwrap();
    client.send_request("GET", url, "tok-a", "").await.unwrap();
    client.send_request("GET", url, "tok-b", "").await.unwrap();

    assert!(has_access_token_option(&session.exchange_at(0)));
    assert!(!has_access_token_option(&session.exchange_at(1)));
    assert!(has_access_token_option(&session.exchange_at(2)));
}

#[tokio::test]
async fn closed_sessions_are_rebuilt_once() {
    let codec = CborCodec::v1(false);
    let dead = MockSession::new(cbor_response(&codec, "{}"), None);
    dead.fail_next_and_close();
    let fresh = MockSession::new(cbor_response(&codec, r#"{"ok":true}"#), None);
    let (client, dialer) = client_with(ConnectionParams::default(), vec![dead, fresh.clone()]);

    let res = client
        .send_request("GET", "https://hs.example/_matrix/client/versions", "tok", "")
        .await
        .unwrap();
    assert_eq!(res.body, r#"{"ok":true}"#);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    // The replayed request re-sends the credential on the new session.
    assert!(has_access_token_option(&fresh.exchange_at(0)));
}

#[tokio::test]
async fn idle_observe_synthesizes_an_empty_sync() {
    let codec = CborCodec::v1(false);
    // The session never pushes anything.
    let session = MockSession::new(cbor_response(&codec, "{}"), None);
    let params = ConnectionParams {
        observe_enabled: true,
        observe_no_response_timeout_secs: 1,
        ..Default::default()
    };
    let (client, _) = client_with(params, vec![session.clone()]);

    let res = client
        .send_request(
            "GET",
            "https://hs.example/_matrix/client/r0/sync?since=s9&timeout=30000",
            "tok",
            "",
        )
        .await
        .unwrap();
    assert_eq!(res.code, 200);
    let v: serde_json::Value = serde_json::from_str(&res.body).unwrap();
    assert_eq!(v["next_batch"], "s9");
    assert_eq!(v["rooms"]["join"], serde_json::json!({}));

    assert_eq!(session.observe_count(), 1);
    let register = &session.observe_requests.lock()[0];
    assert!(has_access_token_option(register));
    let observed_path: Vec<Vec<u8>> = register
        .get_option(CoapOption::UriPath)
        .unwrap()
        .iter()
        .cloned()
        .collect();
    assert_eq!(observed_path, vec![b"7".to_vec()]);

    // A second sync call reuses the existing observation.
    client
        .send_request("GET", "https://hs.example/_matrix/client/r0/sync?since=s9", "tok", "")
        .await
        .unwrap();
    assert_eq!(session.observe_count(), 1);
}

#[tokio::test]
async fn pushed_observe_data_is_returned_decoded() {
    let codec = CborCodec::v1(false);
    let pushed = cbor_response(&codec, r#"{"next_batch":"s10"}"#);
    let session = MockSession::new(cbor_response(&codec, "{}"), Some(pushed));
    let params = ConnectionParams {
        observe_enabled: true,
        observe_no_response_timeout_secs: 5,
        ..Default::default()
    };
    let (client, _) = client_with(params, vec![session]);

    let res = client
        .send_request("GET", "https://hs.example/_matrix/client/r0/sync?since=s9", "tok", "")
        .await
        .unwrap();
    assert_eq!(res.code, 200);
    let v: serde_json::Value = serde_json::from_str(&res.body).unwrap();
    assert_eq!(v["next_batch"], "s10");
}

#[tokio::test]
async fn urls_without_hosts_are_rejected() {
    let (client, _) = client_with(ConnectionParams::default(), Vec::new());
    assert!(client
        .send_request("GET", "not a url", "tok", "")
        .await
        .is_err());
}
