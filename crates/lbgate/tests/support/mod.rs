// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Shared test doubles: a scripted upstream origin, a recording client
// endpoint, and an in-memory CoAP session.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use lbgate::bridge::{ClientHandle, CoapSession, SessionDialer, UpstreamHandler};
use lbgate::http::{HttpRequest, HttpResponse, APPLICATION_JSON};
use lbgate::mapping::encode_uint_option;
use lbgate::{Error, Result};

/// What a scripted upstream does once its response queue runs dry.
pub enum WhenEmpty {
    /// Block forever, like a long poll with no data.
    Park,
    /// Keep returning a copy of this response.
    Repeat(HttpResponse),
}

/// An upstream origin that replays a fixed list of responses and records
/// every request it sees.
pub struct ScriptedUpstream {
    responses: Mutex<VecDeque<HttpResponse>>,
    when_empty: WhenEmpty,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedUpstream {
    pub fn new(responses: Vec<HttpResponse>, when_empty: WhenEmpty) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            when_empty,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request(&self, i: usize) -> HttpRequest {
        self.requests.lock()[i].clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl UpstreamHandler for ScriptedUpstream {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        self.requests.lock().push(req);
        let next = self.responses.lock().pop_front();
        match next {
            Some(res) => res,
            None => match &self.when_empty {
                WhenEmpty::Repeat(res) => res.clone(),
                WhenEmpty::Park => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            },
        }
    }
}

/// JSON 200 response helper.
pub fn json_response(body: &str) -> HttpResponse {
    HttpResponse::with_body(200, APPLICATION_JSON, body)
}

/// A client endpoint that records written notifications and can be told to
/// fail sends.
pub struct RecordingClient {
    addr: String,
    pub written: Mutex<Vec<Packet>>,
    pub attempts: AtomicUsize,
    fail_sends: AtomicBool,
    auth: Mutex<Option<String>>,
}

impl RecordingClient {
    pub fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            written: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            auth: Mutex::new(None),
        })
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }

    pub fn written_at(&self, i: usize) -> Packet {
        self.written.lock()[i].clone()
    }
}

#[async_trait]
impl ClientHandle for RecordingClient {
    fn remote_addr(&self) -> String {
        self.addr.clone()
    }

    async fn write_message(&self, msg: Packet) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("peer reset".into()));
        }
        self.written.lock().push(msg);
        Ok(())
    }

    fn cached_auth(&self) -> Option<String> {
        self.auth.lock().clone()
    }

    fn store_auth(&self, value: &str) {
        *self.auth.lock() = Some(value.to_string());
    }
}

/// Build a confirmable GET for a CoAP path such as "/7", with an optional
/// Observe option value and request token.
pub fn coap_get(coap_path: &str, token: &[u8], observe: Option<u32>) -> Packet {
    let mut msg = Packet::new();
    msg.header.set_type(MessageType::Confirmable);
    msg.header.code = MessageClass::Request(RequestType::Get);
    msg.header.message_id = 42;
    msg.set_token(token.to_vec());
    for segment in coap_path.split('/').filter(|s| !s.is_empty()) {
        msg.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    if let Some(v) = observe {
        msg.add_option(CoapOption::Observe, encode_uint_option(v));
    }
    msg
}

pub fn response_code(msg: &Packet) -> ResponseType {
    match msg.header.code {
        MessageClass::Response(code) => code,
        other => panic!("expected a response code, got {:?}", other),
    }
}

pub fn observe_seq(msg: &Packet) -> u32 {
    let values = msg
        .get_option(CoapOption::Observe)
        .expect("message carries an Observe option");
    lbgate::mapping::decode_uint_option(values.front().expect("observe option has a value"))
}

/// An in-memory client session returning a fixed response, with switchable
/// failure behavior.
pub struct MockSession {
    pub exchanges: Mutex<Vec<Packet>>,
    pub observe_requests: Mutex<Vec<Packet>>,
    response: Packet,
    fail_next_and_close: AtomicBool,
    closed: AtomicBool,
    push_on_observe: Option<Packet>,
}

impl MockSession {
    pub fn new(response: Packet, push_on_observe: Option<Packet>) -> Arc<Self> {
        Arc::new(Self {
            exchanges: Mutex::new(Vec::new()),
            observe_requests: Mutex::new(Vec::new()),
            response,
            fail_next_and_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            push_on_observe,
        })
    }

    /// Make the next exchange fail and mark the session closed, as a dead
    /// DTLS session would.
    pub fn fail_next_and_close(&self) {
        self.fail_next_and_close.store(true, Ordering::SeqCst);
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.lock().len()
    }

    pub fn exchange_at(&self, i: usize) -> Packet {
        self.exchanges.lock()[i].clone()
    }

    pub fn observe_count(&self) -> usize {
        self.observe_requests.lock().len()
    }
}

#[async_trait]
impl CoapSession for MockSession {
    async fn exchange(&self, msg: Packet) -> Result<Packet> {
        if self.fail_next_and_close.swap(false, Ordering::SeqCst) {
            self.closed.store(true, Ordering::SeqCst);
            return Err(Error::Transport("session torn down".into()));
        }
        self.exchanges.lock().push(msg);
        Ok(self.response.clone())
    }

    async fn observe(&self, msg: Packet, notifications: mpsc::Sender<Packet>) -> Result<()> {
        self.observe_requests.lock().push(msg);
        if let Some(push) = &self.push_on_observe {
            let _ = notifications.send(push.clone()).await;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out sessions from a queue, recording how often it dialed.
pub struct MockDialer {
    sessions: Mutex<VecDeque<Arc<MockSession>>>,
    pub dials: AtomicUsize,
}

impl MockDialer {
    pub fn new(sessions: Vec<Arc<MockSession>>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            dials: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SessionDialer for MockDialer {
    async fn dial(&self, _host: &str) -> Result<Arc<dyn CoapSession>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let session = self
            .sessions
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Transport("no more scripted sessions".into()))?;
        Ok(session)
    }
}
