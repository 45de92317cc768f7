// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plain-UDP CoAP serving loop.
//!
//! One task per inbound message. Confirmable requests are normally answered
//! with a piggybacked ACK; when the upstream handler outlives the ACK
//! window, an empty ACK goes out early and the response follows as its own
//! confirmable exchange. DTLS is left to the deployment (e.g. a terminating
//! tunnel in front of this socket); retransmission here is the minimal
//! stop-and-wait needed for notifications.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{MessageClass, MessageType, Packet};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use lbgate::bridge::ClientHandle;
use lbgate::{ConnectionParams, Error, Gateway, Result};

pub struct UdpCoapServer {
    socket: UdpSocket,
    gateway: Gateway,
    params: ConnectionParams,
    /// message id -> waiter; resolved true on ACK, false on Reset.
    pending: DashMap<u16, oneshot::Sender<bool>>,
    next_mid: AtomicU16,
    /// Last Authorization value per remote endpoint.
    auth: DashMap<String, String>,
}

impl UdpCoapServer {
    pub async fn bind(addr: &str, gateway: Gateway, params: ConnectionParams) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Self {
            socket,
            gateway,
            params,
            pending: DashMap::new(),
            next_mid: AtomicU16::new(1),
            auth: DashMap::new(),
        }))
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            let msg = match Packet::from_bytes(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("dropping undecodable datagram from {}: {:?}", peer, e);
                    continue;
                }
            };
            match msg.header.get_type() {
                MessageType::Acknowledgement => self.complete(msg.header.message_id, true),
                MessageType::Reset => self.complete(msg.header.message_id, false),
                kind => {
                    let server = self.clone();
                    let confirmable = kind == MessageType::Confirmable;
                    tokio::spawn(async move {
                        server.serve_one(peer, msg, confirmable).await;
                    });
                }
            }
        }
    }

    fn complete(&self, message_id: u16, acked: bool) {
        if let Some((_, tx)) = self.pending.remove(&message_id) {
            let _ = tx.send(acked);
        }
    }

    async fn serve_one(self: Arc<Self>, peer: SocketAddr, msg: Packet, confirmable: bool) {
        let handle = Arc::new(UdpClientHandle {
            server: self.clone(),
            peer,
        });
        let request_mid = msg.header.message_id;
        let processed = Arc::new(AtomicBool::new(false));
        let early_acked = Arc::new(AtomicBool::new(false));

        if confirmable {
            // If the upstream handler is still running when the window
            // closes, ACK now so the client does not retransmit; otherwise
            // the ACK piggybacks on the response.
            let server = self.clone();
            let processed = processed.clone();
            let early_acked = early_acked.clone();
            let window = Duration::from_secs(self.params.piggyback_ack_window_secs);
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if processed.load(Ordering::SeqCst) {
                    return;
                }
                warn!(
                    "upstream still running for mid {}, sending separate ACK",
                    request_mid
                );
                early_acked.store(true, Ordering::SeqCst);
                let mut ack = Packet::new();
                ack.header.set_type(MessageType::Acknowledgement);
                ack.header.code = MessageClass::Empty;
                ack.header.message_id = request_mid;
                if let Err(e) = server.send_to(&ack, peer).await {
                    warn!("failed to send early ACK to {}: {}", peer, e);
                }
            });
        }

        let reply = self.gateway.handle_message(handle.clone(), msg, confirmable).await;
        processed.store(true, Ordering::SeqCst);

        let Some(mut reply) = reply else { return };
        if early_acked.load(Ordering::SeqCst) {
            // The request was already acknowledged; the response becomes
            // its own confirmable exchange.
            reply.header.set_type(MessageType::Confirmable);
            if let Err(e) = handle.write_message(reply).await {
                warn!("failed to deliver late response to {}: {}", peer, e);
            }
        } else if let Err(e) = self.send_to(&reply, peer).await {
            warn!("failed to send response to {}: {}", peer, e);
        }
    }

    async fn send_to(&self, msg: &Packet, peer: SocketAddr) -> Result<()> {
        let bytes = msg
            .to_bytes()
            .map_err(|e| Error::Message(format!("{:?}", e)))?;
        self.socket.send_to(&bytes, peer).await?;
        Ok(())
    }
}

/// Per-peer handle passed into the gateway.
struct UdpClientHandle {
    server: Arc<UdpCoapServer>,
    peer: SocketAddr,
}

#[async_trait]
impl ClientHandle for UdpClientHandle {
    fn remote_addr(&self) -> String {
        self.peer.to_string()
    }

    async fn write_message(&self, mut msg: Packet) -> Result<()> {
        let mid = self.server.next_mid.fetch_add(1, Ordering::SeqCst);
        msg.header.message_id = mid;
        let timeout = Duration::from_secs(self.server.params.transmission_ack_timeout_secs);
        let attempts = self.server.params.transmission_max_retransmits + 1;

        for attempt in 0..attempts {
            let (tx, rx) = oneshot::channel();
            self.server.pending.insert(mid, tx);
            self.server.send_to(&msg, self.peer).await?;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {
                    return Err(Error::Transport(format!("reset by peer {}", self.peer)));
                }
                Ok(Err(_)) => {
                    return Err(Error::Transport("ack channel dropped".into()));
                }
                Err(_) => {
                    debug!(
                        "no ACK from {} for mid {} (attempt {}/{})",
                        self.peer,
                        mid,
                        attempt + 1,
                        attempts
                    );
                }
            }
        }
        self.server.pending.remove(&mid);
        Err(Error::Transport(format!(
            "retransmits exhausted towards {}",
            self.peer
        )))
    }

    fn cached_auth(&self) -> Option<String> {
        self.server
            .auth
            .get(&self.remote_addr())
            .map(|v| v.clone())
    }

    fn store_auth(&self, value: &str) {
        self.server.auth.insert(self.remote_addr(), value.to_string());
    }
}
