// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CoAP OBSERVE handling and the long-poll engine.
//!
//! A client registers once for a resource; the gateway then runs the HTTP
//! long poll against the origin on the client's behalf and pushes only
//! meaningful state changes back as confirmable notifications. Between
//! notifications the datagram link stays idle apart from keepalives, which
//! is where the bandwidth win over HTTP long-polling comes from.
//!
//! Each registration is driven by its own task running an explicit state
//! machine (`Idle -> Polling -> PendingAck -> Recovering/Closed`), with
//! deregistration and shutdown delivered as cancellation observed at state
//! boundaries.

mod sync;

pub use sync::sync_observations;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, ResponseType};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::{ClientHandle, UpstreamHandler};
use crate::codec::CborCodec;
use crate::error::Result;
use crate::http::{HttpRequest, AUTHORIZATION};
use crate::mapping::{coap_code_from_status, encode_uint_option, uri_path, MediaType};

/// Returns true when `curr` is an update the client should see.
/// `prev` is `None` on the first poll.
pub type HasUpdatedFn = Arc<dyn Fn(&str, Option<&[u8]>, &[u8]) -> bool + Send + Sync>;

/// Rewrites the long-poll request between calls, e.g. lifting a paging
/// token out of the previous response body into the next query string.
/// `prev` is `None` on the first poll.
pub type UpdateRequestFn = Arc<dyn Fn(&str, Option<&[u8]>, &mut HttpRequest) + Send + Sync>;

/// Observe sequence numbers are 24-bit per RFC 7641.
const SEQ_MASK: u32 = 0x00FF_FFFF;

/// First notification sequence number. 0 and 1 are taken by the
/// register/deregister option values on the inbound side.
const INITIAL_SEQ: u32 = 2;

struct RegistrationHandle {
    client: Arc<dyn ClientHandle>,
    cancel: watch::Sender<bool>,
}

/// The registration table and the per-token stream counts form a single
/// invariant, so they live behind one lock and check-and-remove is one
/// critical section.
#[derive(Default)]
struct RegistrationTable {
    regs: HashMap<String, RegistrationHandle>,
    token_refs: HashMap<String, usize>,
}

impl RegistrationTable {
    fn remove(&mut self, reg_id: &str, access_token: &str) -> bool {
        match self.regs.remove(reg_id) {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                if let Some(count) = self.token_refs.get_mut(access_token) {
                    *count -= 1;
                    if *count == 0 {
                        self.token_refs.remove(access_token);
                    }
                }
                true
            }
            None => false,
        }
    }
}

enum FailAction {
    /// Other streams exist for this token; the failed one goes away.
    Remove,
    /// Last stream for the token: keep it and retry after a long pause.
    Retry,
}

/// Handles OBSERVE registrations and long-polls the upstream handler on the
/// client's behalf.
pub struct Observations {
    inner: Arc<Inner>,
}

struct Inner {
    upstream: Arc<dyn UpstreamHandler>,
    codec: Arc<CborCodec>,
    has_updated: Option<HasUpdatedFn>,
    update_fns: Vec<UpdateRequestFn>,
    table: Mutex<RegistrationTable>,
    /// remote + path -> last notification bytes, for block-wise follow-ups.
    last_responses: DashMap<String, Vec<u8>>,
    poll_interval: Duration,
    recover_interval: Duration,
}

impl Observations {
    /// Create an observation engine. `upstream` is the handler invoked on
    /// behalf of the client. `has_updated` decides whether a response is
    /// worth a notification (absent means every response is); `update_fns`
    /// may rewrite the request between polls.
    pub fn new(
        upstream: Arc<dyn UpstreamHandler>,
        codec: Arc<CborCodec>,
        has_updated: Option<HasUpdatedFn>,
        update_fns: Vec<UpdateRequestFn>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                upstream,
                codec,
                has_updated,
                update_fns,
                table: Mutex::new(RegistrationTable::default()),
                last_responses: DashMap::new(),
                poll_interval: Duration::from_secs(1),
                recover_interval: Duration::from_secs(60),
            }),
        }
    }

    /// Override the poll and recovery pauses. Meant for tests; the defaults
    /// are 1s and 60s.
    pub fn with_intervals(mut self, poll: Duration, recover: Duration) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_intervals must be called before the engine is shared");
        inner.poll_interval = poll;
        inner.recover_interval = recover;
        self
    }

    /// Handle a registration (`register` true, Observe option 0) or a
    /// deregistration (false, option 1). Returns the acknowledgement to
    /// send. Duplicate registrations are ignored; the existing entry keeps
    /// running.
    pub fn handle_registration(
        &self,
        req: HttpRequest,
        client: Arc<dyn ClientHandle>,
        msg: &Packet,
        register: bool,
    ) -> Option<Packet> {
        let path = uri_path(msg);
        let reg_id = registration_id(&client.remote_addr(), &path, msg.get_token());
        let access_token = req.header(AUTHORIZATION).unwrap_or_default().to_string();

        if register {
            let added = {
                let mut table = self.inner.table.lock();
                if table.regs.contains_key(&reg_id) {
                    false
                } else {
                    let (cancel, cancelled) = watch::channel(false);
                    table.regs.insert(
                        reg_id.clone(),
                        RegistrationHandle {
                            client: client.clone(),
                            cancel,
                        },
                    );
                    let count = {
                        let count = table.token_refs.entry(access_token.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    info!(
                        "OBSERVE[{}]: add registration {} (token streams={})",
                        table.regs.len(),
                        reg_id,
                        count
                    );
                    let inner = self.inner.clone();
                    let token = msg.get_token().to_vec();
                    tokio::spawn(async move {
                        inner.long_poll(reg_id, path, token, req, cancelled).await;
                    });
                    true
                }
            };
            if !added {
                debug!("ignoring duplicate observe registration");
            }
            Some(plain_ack(msg, ResponseType::Content))
        } else {
            self.remove_registration(&reg_id, &access_token);
            Some(plain_ack(msg, ResponseType::Deleted))
        }
    }

    /// Answer a non-confirmable continuation GET from the last response
    /// cache, letting the CoAP layer resume a block-wise transfer. Returns
    /// `None` when nothing was cached for this endpoint and path.
    pub fn handle_blockwise(&self, remote: &str, msg: &Packet) -> Option<Packet> {
        let id = format!("{}{}", remote, uri_path(msg));
        let data = self.inner.last_responses.get(&id)?.clone();
        let mut reply = ack(msg, ResponseType::Content);
        reply.header.set_type(MessageType::NonConfirmable);
        reply.add_option(
            CoapOption::ContentFormat,
            encode_uint_option(MediaType::AppCbor.code().into()),
        );
        reply.payload = data;
        Some(reply)
    }

    /// Cancel every registration and drop all cached responses.
    pub fn shutdown(&self) {
        let mut table = self.inner.table.lock();
        for (_, handle) in table.regs.drain() {
            let _ = handle.cancel.send(true);
        }
        table.token_refs.clear();
        self.inner.last_responses.clear();
    }

    pub fn registration_count(&self) -> usize {
        self.inner.table.lock().regs.len()
    }

    /// Live registrations for an `Authorization` value.
    pub fn token_ref_count(&self, access_token: &str) -> usize {
        self.inner
            .table
            .lock()
            .token_refs
            .get(access_token)
            .copied()
            .unwrap_or(0)
    }

    fn remove_registration(&self, reg_id: &str, access_token: &str) {
        let mut table = self.inner.table.lock();
        if table.remove(reg_id, access_token) {
            info!(
                "OBSERVE[{}]: remove registration {}",
                table.regs.len(),
                reg_id
            );
        }
    }
}

/// Long-poll worker states.
enum PollState {
    /// Pause between polls.
    Idle,
    /// Run one upstream request and classify the response.
    Polling,
    /// Push the pending notification and wait for the acknowledgement.
    PendingAck { snapshot: Option<Vec<u8>> },
    /// Transmission failed on the token's only stream; back off.
    Recovering,
    /// Tear down and exit.
    Closed,
}

impl Inner {
    async fn long_poll(
        self: Arc<Self>,
        reg_id: String,
        path: String,
        token: Vec<u8>,
        mut req: HttpRequest,
        mut cancelled: watch::Receiver<bool>,
    ) {
        let access_token = req.header(AUTHORIZATION).unwrap_or_default().to_string();
        let mut prev: Option<Vec<u8>> = None;
        let mut pending: Vec<u8> = Vec::new();
        let mut seq = INITIAL_SEQ;
        let mut state = PollState::Polling;

        loop {
            match state {
                PollState::Idle => {
                    state = if pause(self.poll_interval, &mut cancelled).await {
                        PollState::Closed
                    } else {
                        PollState::Polling
                    };
                }

                PollState::Polling => {
                    if self.registration(&reg_id).is_none() {
                        debug!("LongPoll[{}]: registration gone, stopping", reg_id);
                        state = PollState::Closed;
                        continue;
                    }
                    // The update functions work on JSON, but notification
                    // bodies are CBOR; convert the retained body if needed.
                    let prev_json = match self.as_json(prev.as_deref()) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("LongPoll[{}]: cannot decode previous response: {}", reg_id, e);
                            None
                        }
                    };
                    for f in &self.update_fns {
                        f(&path, prev_json.as_deref(), &mut req);
                    }

                    let res = self.upstream.handle(req.clone()).await;
                    if *cancelled.borrow() {
                        // The in-flight response is discarded.
                        state = PollState::Closed;
                        continue;
                    }

                    if res.status != 200 {
                        warn!(
                            "LongPoll[{}]: upstream returned {}, stopping: {}",
                            reg_id,
                            res.status,
                            String::from_utf8_lossy(&res.body)
                        );
                        let code = coap_code_from_status(res.status)
                            .unwrap_or(MessageClass::Response(ResponseType::BadGateway));
                        let _ = self
                            .transmit(&reg_id, &path, &token, seq, code, Vec::new())
                            .await;
                        state = PollState::Closed;
                        continue;
                    }

                    if let Some(has_updated) = &self.has_updated {
                        let curr_json = self.as_json(Some(&res.body)).ok().flatten();
                        // A body that cannot be decoded counts as an update.
                        let updated = match curr_json {
                            Some(curr) => has_updated(&path, prev_json.as_deref(), &curr),
                            None => true,
                        };
                        if !updated {
                            debug!("LongPoll[{}]: response is not an update", reg_id);
                            prev = Some(res.body);
                            state = PollState::Idle;
                            continue;
                        }
                    }

                    let snapshot = prev.take();
                    prev = Some(res.body.clone());
                    pending = res.body;
                    state = PollState::PendingAck { snapshot };
                }

                PollState::PendingAck { snapshot } => {
                    let sent = tokio::select! {
                        r = self.transmit(
                            &reg_id,
                            &path,
                            &token,
                            seq,
                            MessageClass::Response(ResponseType::Content),
                            pending.clone(),
                        ) => r,
                        _ = cancelled.changed() => {
                            state = PollState::Closed;
                            continue;
                        }
                    };
                    seq = (seq + 1) & SEQ_MASK;
                    state = match sent {
                        Ok(()) => PollState::Idle,
                        Err(e) => match self.fail_policy(&reg_id, &access_token) {
                            FailAction::Remove => {
                                info!(
                                    "LongPoll[{}]: removing registration after send failure: {}",
                                    reg_id, e
                                );
                                PollState::Closed
                            }
                            FailAction::Retry => {
                                warn!(
                                    "LongPoll[{}]: send failed on the only live stream, keeping: {}",
                                    reg_id, e
                                );
                                // Do not lose the unacknowledged update.
                                prev = snapshot;
                                PollState::Recovering
                            }
                        },
                    };
                }

                PollState::Recovering => {
                    state = if pause(self.recover_interval, &mut cancelled).await {
                        PollState::Closed
                    } else {
                        PollState::Polling
                    };
                }

                PollState::Closed => {
                    let mut table = self.table.lock();
                    if table.remove(&reg_id, &access_token) {
                        info!("OBSERVE[{}]: remove registration {}", table.regs.len(), reg_id);
                    }
                    return;
                }
            }
        }
    }

    /// Build and push one notification, remembering the payload for
    /// block-wise continuations. Blocks until the client acknowledges.
    async fn transmit(
        &self,
        reg_id: &str,
        path: &str,
        token: &[u8],
        seq: u32,
        code: MessageClass,
        body: Vec<u8>,
    ) -> Result<()> {
        let client = match self.registration(reg_id) {
            Some(c) => c,
            None => return Ok(()),
        };
        // Notification bodies go out as CBOR.
        let data = if body.first() == Some(&b'{') {
            self.codec.json_to_cbor(body.as_slice())?
        } else {
            body
        };

        let mut msg = Packet::new();
        msg.header.set_type(MessageType::Confirmable);
        msg.header.code = code;
        msg.set_token(token.to_vec());
        msg.add_option(
            CoapOption::ContentFormat,
            encode_uint_option(MediaType::AppCbor.code().into()),
        );
        msg.add_option(CoapOption::Observe, encode_uint_option(seq));
        msg.payload = data.clone();

        // Must be cached before the client can possibly ask for more
        // blocks of it.
        self.last_responses
            .insert(format!("{}{}", client.remote_addr(), path), data);

        // A client that silently forgot the observation answers the next
        // notification with Reset, which surfaces here as an error and
        // garbage-collects the registration (RFC 7641 section 3.6).
        client.write_message(msg).await
    }

    fn registration(&self, reg_id: &str) -> Option<Arc<dyn ClientHandle>> {
        self.table.lock().regs.get(reg_id).map(|h| h.client.clone())
    }

    /// Decide, atomically with the table state, what a failed transmission
    /// means for this registration.
    fn fail_policy(&self, reg_id: &str, access_token: &str) -> FailAction {
        let mut table = self.table.lock();
        let refs = table.token_refs.get(access_token).copied().unwrap_or(0);
        if refs > 1 {
            table.remove(reg_id, access_token);
            FailAction::Remove
        } else {
            FailAction::Retry
        }
    }

    fn as_json(&self, body: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        match body {
            None => Ok(None),
            Some(b) if b.is_empty() => Ok(None),
            Some(b) if b[0] == b'{' => Ok(Some(b.to_vec())),
            Some(b) => Ok(Some(self.codec.cbor_to_json(b)?)),
        }
    }
}

/// Sleep, returning early with true when the registration is cancelled.
async fn pause(duration: Duration, cancelled: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancelled.changed() => true,
    }
}

fn ack(reply_to: &Packet, code: ResponseType) -> Packet {
    let mut msg = Packet::new();
    msg.header.set_type(MessageType::Acknowledgement);
    msg.header.code = MessageClass::Response(code);
    msg.header.message_id = reply_to.header.message_id;
    msg.set_token(reply_to.get_token().to_vec());
    msg
}

fn plain_ack(reply_to: &Packet, code: ResponseType) -> Packet {
    let mut msg = ack(reply_to, code);
    msg.add_option(
        CoapOption::ContentFormat,
        encode_uint_option(MediaType::TextPlain.code().into()),
    );
    msg
}

/// One list entry per client endpoint and token: re-registration with the
/// same pair updates rather than duplicates (RFC 7641 section 4.1).
fn registration_id(remote: &str, path: &str, token: &[u8]) -> String {
    let token_hex: String = token.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}@{}", remote, path, token_hex)
}
