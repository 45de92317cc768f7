// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plain-UDP CoAP client session.
//!
//! Implements the session seam with stop-and-wait retransmission and
//! separate-response handling: a piggybacked ACK resolves the exchange
//! immediately, while an empty ACK switches the exchange into a long wait
//! for the confirmable response. Inbound confirmable messages carrying an
//! observed token are acknowledged only after the notification buffer
//! accepts them, so a full buffer throttles the server. DTLS is left to
//! the deployment.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{MessageClass, MessageType, Packet};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use lbgate::bridge::{CoapSession, SessionDialer};
use lbgate::{ConnectionParams, Error, Result};

/// How long to keep waiting for a separate response once the request was
/// acknowledged. Covers long /sync polls.
const SEPARATE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct UdpCoapSession {
    socket: Arc<UdpSocket>,
    /// request token -> response waiter.
    pending: Arc<DashMap<Vec<u8>, oneshot::Sender<Packet>>>,
    /// message ids that received an empty (separate) ACK.
    separate: Arc<DashMap<u16, ()>>,
    /// observed token -> notification channel.
    observers: Arc<DashMap<Vec<u8>, mpsc::Sender<Packet>>>,
    next_mid: AtomicU16,
    closed: Arc<AtomicBool>,
    ack_timeout: Duration,
    max_retransmits: u32,
}

impl UdpCoapSession {
    pub async fn connect(host: &str, params: &ConnectionParams) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(host).await?;
        let session = Arc::new(Self {
            socket: Arc::new(socket),
            pending: Arc::new(DashMap::new()),
            separate: Arc::new(DashMap::new()),
            observers: Arc::new(DashMap::new()),
            next_mid: AtomicU16::new(1),
            closed: Arc::new(AtomicBool::new(false)),
            ack_timeout: Duration::from_secs(params.transmission_ack_timeout_secs),
            max_retransmits: params.transmission_max_retransmits,
        });
        tokio::spawn(session.clone().receive_loop());
        Ok(session)
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = match self.socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("session socket error, closing: {}", e);
                    self.closed.store(true, Ordering::SeqCst);
                    self.observers.clear();
                    return;
                }
            };
            let msg = match Packet::from_bytes(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping undecodable datagram: {:?}", e);
                    continue;
                }
            };
            self.dispatch(msg).await;
        }
    }

    async fn dispatch(&self, msg: Packet) {
        match msg.header.get_type() {
            MessageType::Acknowledgement => {
                if msg.header.code == MessageClass::Empty {
                    // Separate-response mode: the real answer follows.
                    self.separate.insert(msg.header.message_id, ());
                } else {
                    self.resolve_exchange(msg);
                }
            }
            MessageType::Confirmable | MessageType::NonConfirmable => {
                let confirmable = msg.header.get_type() == MessageType::Confirmable;
                let mid = msg.header.message_id;
                let token = msg.get_token().to_vec();
                let observer = self.observers.get(&token).map(|tx| tx.value().clone());
                if let Some(tx) = observer {
                    // Deliver before acknowledging: a full buffer withholds
                    // the ACK and pushes back on the server.
                    if tx.send(msg).await.is_err() {
                        self.observers.remove(&token);
                        self.send_bare(MessageType::Reset, mid).await;
                        return;
                    }
                    if confirmable {
                        self.send_bare(MessageType::Acknowledgement, mid).await;
                    }
                } else if self.pending.contains_key(&token) {
                    self.resolve_exchange(msg);
                    if confirmable {
                        self.send_bare(MessageType::Acknowledgement, mid).await;
                    }
                } else if confirmable {
                    // Unknown token: tell the server to forget us.
                    self.send_bare(MessageType::Reset, mid).await;
                }
            }
            MessageType::Reset => {
                debug!("peer reset mid {}", msg.header.message_id);
            }
        }
    }

    fn resolve_exchange(&self, msg: Packet) {
        let token = msg.get_token().to_vec();
        if let Some((_, tx)) = self.pending.remove(&token) {
            let _ = tx.send(msg);
        } else {
            debug!("response with unknown token, dropping");
        }
    }

    async fn send_bare(&self, kind: MessageType, message_id: u16) {
        let mut msg = Packet::new();
        msg.header.set_type(kind);
        msg.header.code = MessageClass::Empty;
        msg.header.message_id = message_id;
        if let Ok(bytes) = msg.to_bytes() {
            let _ = self.socket.send(&bytes).await;
        }
    }

    async fn send(&self, msg: &Packet) -> Result<()> {
        let bytes = msg
            .to_bytes()
            .map_err(|e| Error::Message(format!("{:?}", e)))?;
        self.socket.send(&bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl CoapSession for UdpCoapSession {
    async fn exchange(&self, mut msg: Packet) -> Result<Packet> {
        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        msg.header.message_id = mid;
        let token = msg.get_token().to_vec();
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(token.clone(), tx);

        let attempts = self.max_retransmits + 1;
        for _ in 0..attempts {
            self.send(&msg).await?;
            match tokio::time::timeout(self.ack_timeout, &mut rx).await {
                Ok(Ok(res)) => return Ok(res),
                Ok(Err(_)) => {
                    return Err(Error::Transport("response channel dropped".into()));
                }
                Err(_) => {
                    if self.separate.remove(&mid).is_some() {
                        // Acknowledged; stop retransmitting and wait for
                        // the real response.
                        return match tokio::time::timeout(SEPARATE_RESPONSE_TIMEOUT, &mut rx).await
                        {
                            Ok(Ok(res)) => Ok(res),
                            _ => {
                                self.pending.remove(&token);
                                Err(Error::Transport("separate response never arrived".into()))
                            }
                        };
                    }
                    debug!("no ACK for mid {}, retransmitting", mid);
                }
            }
        }
        self.pending.remove(&token);
        Err(Error::Transport("retransmits exhausted".into()))
    }

    async fn observe(&self, msg: Packet, notifications: mpsc::Sender<Packet>) -> Result<()> {
        self.observers
            .insert(msg.get_token().to_vec(), notifications);
        // The registration itself is a plain exchange; its ACK carries no
        // notification payload.
        self.exchange(msg).await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Dials plain-UDP sessions.
pub struct UdpDialer {
    params: ConnectionParams,
}

impl UdpDialer {
    pub fn new(params: ConnectionParams) -> Arc<Self> {
        Arc::new(Self { params })
    }
}

#[async_trait]
impl SessionDialer for UdpDialer {
    async fn dial(&self, host: &str) -> Result<Arc<dyn CoapSession>> {
        let session = UdpCoapSession::connect(host, &self.params).await?;
        Ok(session)
    }
}
