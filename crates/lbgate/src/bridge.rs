// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime seams.
//!
//! The library stays agnostic of the datagram runtime: DTLS, block-wise
//! transfer and retransmission all live behind these traits. The bundled
//! binaries plug in a plain-UDP implementation; production deployments
//! provide their own.

use std::sync::Arc;

use async_trait::async_trait;
use coap_lite::Packet;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::http::{HttpRequest, HttpResponse};

/// The upstream HTTP origin the gateway fronts.
///
/// Implementations encode their own failures as HTTP responses (typically
/// 502); the gateway never retries upstream calls.
#[async_trait]
pub trait UpstreamHandler: Send + Sync {
    async fn handle(&self, req: HttpRequest) -> HttpResponse;
}

/// Server-side handle to one connected client endpoint.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Stable identifier of the remote endpoint, e.g. `ip:port`.
    fn remote_addr(&self) -> String;

    /// Send a confirmable message and wait for the acknowledgement.
    /// Returns an error when the peer answers with Reset or the runtime
    /// gives up retransmitting.
    async fn write_message(&self, msg: Packet) -> Result<()>;

    /// The last `Authorization` value seen on this connection, if any.
    fn cached_auth(&self) -> Option<String>;

    /// Remember an `Authorization` value for later requests on this
    /// connection that arrive without one.
    fn store_auth(&self, value: &str);
}

/// Client-side handle to one established CoAP session.
#[async_trait]
pub trait CoapSession: Send + Sync {
    /// Send a confirmable request and wait for the response.
    async fn exchange(&self, msg: Packet) -> Result<Packet>;

    /// Register an observation. Notifications are delivered through
    /// `notifications`; a full buffer blocks delivery, which withholds
    /// acknowledgements and throttles the server.
    async fn observe(&self, msg: Packet, notifications: mpsc::Sender<Packet>) -> Result<()>;

    /// Whether the session has been torn down. Cached sessions reporting
    /// true are evicted and re-dialed.
    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// Establishes CoAP sessions to remote hosts.
#[async_trait]
pub trait SessionDialer: Send + Sync {
    async fn dial(&self, host: &str) -> Result<Arc<dyn CoapSession>>;
}
