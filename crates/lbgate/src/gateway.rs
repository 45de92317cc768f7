// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side façade: CoAP in, HTTP out.
//!
//! One dispatch entry point per inbound message. Confirmable messages
//! without an Observe option translate to an upstream HTTP call with CBOR
//! decoded at the request boundary and re-encoded at the response boundary.
//! Messages with an Observe option go to the observation engine, and
//! non-confirmable messages are treated as block-wise continuations served
//! from the last-response cache.

use std::sync::Arc;

use coap_lite::Packet;
use tracing::debug;

use crate::bridge::{ClientHandle, UpstreamHandler};
use crate::codec::CborCodec;
use crate::http::{proxy_error, APPLICATION_CBOR, APPLICATION_JSON, AUTHORIZATION, CONTENT_TYPE};
use crate::mapping::{observe_value, CoapHttpMapper};
use crate::observe::Observations;

/// Wires the mapper, codec and observation engine into a single CoAP
/// dispatcher.
pub struct Gateway {
    mapper: Arc<CoapHttpMapper>,
    codec: Arc<CborCodec>,
    upstream: Arc<dyn UpstreamHandler>,
    observations: Arc<Observations>,
}

impl Gateway {
    pub fn new(
        mapper: Arc<CoapHttpMapper>,
        codec: Arc<CborCodec>,
        upstream: Arc<dyn UpstreamHandler>,
        observations: Arc<Observations>,
    ) -> Self {
        Self {
            mapper,
            codec,
            upstream,
            observations,
        }
    }

    pub fn observations(&self) -> &Arc<Observations> {
        &self.observations
    }

    /// Handle one inbound message and return the reply to send, if any.
    ///
    /// `confirmable` distinguishes regular requests from the
    /// non-confirmable continuation GETs a client issues to fetch further
    /// blocks of an earlier observable response.
    pub async fn handle_message(
        &self,
        client: Arc<dyn ClientHandle>,
        msg: Packet,
        confirmable: bool,
    ) -> Option<Packet> {
        if !confirmable {
            return self.observations.handle_blockwise(&client.remote_addr(), &msg);
        }

        let mut req = match self.mapper.coap_to_http_request(&msg) {
            Ok(req) => req,
            Err(e) => {
                debug!("failed to map CoAP request to HTTP, ignoring: {}", e);
                return None;
            }
        };

        // Requests arriving without a credential reuse the one last seen on
        // this connection; requests carrying one refresh it.
        match req.header(AUTHORIZATION) {
            Some(auth) => client.store_auth(auth),
            None => {
                if let Some(auth) = client.cached_auth() {
                    req.set_header(AUTHORIZATION, auth);
                }
            }
        }

        // Observe option 0 registers, 1 deregisters (RFC 7641 section 2).
        if let Some(observe) = observe_value(&msg) {
            debug!("client wants to observe {}", req.path);
            return self
                .observations
                .handle_registration(req, client, &msg, observe == 0);
        }

        // Plain request: decode the body for the JSON-speaking origin.
        if req.header(CONTENT_TYPE) == Some(APPLICATION_CBOR) && !req.body.is_empty() {
            match self.codec.cbor_to_json(req.body.as_slice()) {
                Ok(body) => {
                    req.body = body;
                    req.set_header(CONTENT_TYPE, APPLICATION_JSON);
                }
                Err(e) => {
                    let res = proxy_error(502, &format!("cannot decode request body: {}", e));
                    return Some(self.finish(res, &msg));
                }
            }
        }

        let res = self.upstream.handle(req).await;
        Some(self.finish(res, &msg))
    }

    fn finish(&self, mut res: crate::http::HttpResponse, reply_to: &Packet) -> Packet {
        if let Err(e) = self.codec.encode_response(&mut res) {
            res = proxy_error(502, &format!("cannot encode response body: {}", e));
            let _ = self.codec.encode_response(&mut res);
        }
        self.mapper.http_response_to_coap(&res, reply_to)
    }
}
