// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Server-side dispatch: translation, transcoding at both boundaries,
// connection-scoped credentials, and observe/block-wise delegation.

mod support;

use std::sync::Arc;

use coap_lite::{CoapOption, MessageClass, Packet, RequestType, ResponseType};

use lbgate::http::{AUTHORIZATION, CONTENT_TYPE};
use lbgate::mapping::{decode_uint_option, encode_uint_option, ACCESS_TOKEN_OPTION};
use lbgate::observe::sync_observations;
use lbgate::{CborCodec, CoapHttpMapper, Gateway, PathSet};

use support::*;

fn gateway(upstream: Arc<ScriptedUpstream>) -> (Gateway, Arc<CborCodec>) {
    let codec = Arc::new(CborCodec::v1(false));
    let paths = Arc::new(PathSet::v1());
    let mapper = Arc::new(CoapHttpMapper::new(paths.clone()));
    let observations = Arc::new(sync_observations(upstream.clone(), paths, codec.clone()));
    (
        Gateway::new(mapper, codec.clone(), upstream, observations),
        codec,
    )
}

#[tokio::test]
async fn plain_request_round_trips_through_upstream() {
    let upstream = ScriptedUpstream::new(
        vec![json_response(r#"{"versions":["r0.6.1"]}"#)],
        WhenEmpty::Park,
    );
    let (gw, codec) = gateway(upstream.clone());
    let client = RecordingClient::new("10.1.0.1:4000");

    let msg = coap_get("/0", &[5], None);
    let reply = gw
        .handle_message(client, msg, true)
        .await
        .expect("request gets a reply");

    assert_eq!(response_code(&reply), ResponseType::Content);
    assert_eq!(reply.header.message_id, 42);
    assert_eq!(reply.get_token(), &[5u8][..]);
    // JSON is rewritten to CBOR at the response boundary.
    let format = reply
        .get_option(CoapOption::ContentFormat)
        .and_then(|v| v.front())
        .map(|v| decode_uint_option(v))
        .unwrap();
    assert_eq!(format, 60);
    let body = codec.cbor_to_json(reply.payload.as_slice()).unwrap();
    assert_eq!(body, br#"{"versions":["r0.6.1"]}"#);

    assert_eq!(upstream.request(0).path, "/_matrix/client/versions");
    assert_eq!(upstream.request(0).method, "GET");
}

#[tokio::test]
async fn cbor_request_bodies_are_decoded_for_the_origin() {
    let upstream = ScriptedUpstream::new(vec![json_response("{}")], WhenEmpty::Park);
    let (gw, codec) = gateway(upstream.clone());
    let client = RecordingClient::new("10.1.0.2:4000");

    let mut msg = Packet::new();
    msg.header.code = MessageClass::Request(RequestType::Post);
    msg.header.set_type(coap_lite::MessageType::Confirmable);
    msg.set_token(vec![1]);
    msg.add_option(CoapOption::UriPath, b"G".to_vec());
    msg.add_option(CoapOption::ContentFormat, encode_uint_option(60));
    msg.payload = codec.json_to_cbor(&br#"{"name":"room"}"#[..]).unwrap();

    gw.handle_message(client, msg, true).await.unwrap();

    let seen = upstream.request(0);
    assert_eq!(seen.path, "/_matrix/client/r0/createRoom");
    assert_eq!(seen.header(CONTENT_TYPE), Some("application/json"));
    assert_eq!(seen.body, br#"{"name":"room"}"#);
}

#[tokio::test]
async fn malformed_cbor_body_yields_a_proxy_error() {
    let upstream = ScriptedUpstream::new(Vec::new(), WhenEmpty::Park);
    let (gw, codec) = gateway(upstream.clone());
    let client = RecordingClient::new("10.1.0.3:4000");

    let mut msg = coap_get("/G", &[1], None);
    msg.header.code = MessageClass::Request(RequestType::Post);
    msg.add_option(CoapOption::ContentFormat, encode_uint_option(60));
    msg.payload = vec![0xff, 0xff, 0xff];

    let reply = gw.handle_message(client, msg, true).await.unwrap();
    assert_eq!(response_code(&reply), ResponseType::BadGateway);
    let body = codec.cbor_to_json(reply.payload.as_slice()).unwrap();
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["errcode"], "PROXY");
    // The origin was never called.
    assert_eq!(upstream.request_count(), 0);
}

#[tokio::test]
async fn connection_remembers_the_access_token() {
    let upstream = ScriptedUpstream::new(
        vec![json_response("{}"), json_response("{}")],
        WhenEmpty::Park,
    );
    let (gw, _) = gateway(upstream.clone());
    let client = RecordingClient::new("10.1.0.4:4000");

    // First request carries the credential in the private option.
    let mut msg = coap_get("/7", &[1], None);
    msg.add_option(CoapOption::from(ACCESS_TOKEN_OPTION), b"seekrit".to_vec());
    gw.handle_message(client.clone(), msg, true).await.unwrap();
    assert_eq!(
        upstream.request(0).header(AUTHORIZATION),
        Some("Bearer seekrit")
    );

    // The second one does not, and still reaches the origin authorized.
    let msg = coap_get("/7", &[2], None);
    gw.handle_message(client, msg, true).await.unwrap();
    assert_eq!(
        upstream.request(1).header(AUTHORIZATION),
        Some("Bearer seekrit")
    );
}

#[tokio::test]
async fn observe_option_is_delegated_to_registrations() {
    let upstream = ScriptedUpstream::new(Vec::new(), WhenEmpty::Park);
    let (gw, _) = gateway(upstream);
    let client = RecordingClient::new("10.1.0.5:4000");

    let msg = coap_get("/7", &[1], Some(0));
    let ack = gw.handle_message(client.clone(), msg, true).await.unwrap();
    assert_eq!(response_code(&ack), ResponseType::Content);
    assert_eq!(gw.observations().registration_count(), 1);

    let msg = coap_get("/7", &[1], Some(1));
    let ack = gw.handle_message(client, msg, true).await.unwrap();
    assert_eq!(response_code(&ack), ResponseType::Deleted);
    assert_eq!(gw.observations().registration_count(), 0);
}

#[tokio::test]
async fn non_confirmable_messages_only_hit_the_cache() {
    let upstream = ScriptedUpstream::new(Vec::new(), WhenEmpty::Park);
    let (gw, _) = gateway(upstream.clone());
    let client = RecordingClient::new("10.1.0.6:4000");

    let msg = coap_get("/7", &[1], None);
    let reply = gw.handle_message(client, msg, false).await;
    assert!(reply.is_none(), "nothing cached, nothing sent");
    assert_eq!(upstream.request_count(), 0);
}

#[tokio::test]
async fn unmappable_messages_are_dropped() {
    let upstream = ScriptedUpstream::new(Vec::new(), WhenEmpty::Park);
    let (gw, _) = gateway(upstream.clone());
    let client = RecordingClient::new("10.1.0.7:4000");

    // A response code is not a request.
    let mut msg = coap_get("/7", &[1], None);
    msg.header.code = MessageClass::Response(ResponseType::Content);
    assert!(gw.handle_message(client, msg, true).await.is_none());
    assert_eq!(upstream.request_count(), 0);
}
