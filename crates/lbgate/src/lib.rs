// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # lbgate - Low-Bandwidth Matrix Gateway
//!
//! A bidirectional gateway carrying the Matrix client-server HTTP+JSON API
//! over CoAP datagrams, for links where every byte counts (mobile, LoRa-ish
//! backhauls, congested networks).
//!
//! Three coordinated techniques shrink the traffic:
//!
//! 1. **Binary encoding**: JSON bodies become CBOR, and well-known object
//!    keys are replaced by small integers from a fixed dictionary.
//! 2. **Path compression**: long static URL prefixes fold into single-byte
//!    enum codes, keeping dynamic segments (`/_matrix/client/r0/sync`
//!    becomes `/7`).
//! 3. **Long-poll elimination**: the /sync endpoint maps onto CoAP OBSERVE,
//!    so the server pushes only meaningful changes instead of the client
//!    re-polling.
//!
//! ## Architecture
//!
//! ```text
//!  client device                 gateway (this crate)            homeserver
//!       |                               |                            |
//!       |-- CoAP/DTLS request --------->| CoAP -> HTTP, CBOR -> JSON |
//!       |                               |--- HTTP request ---------->|
//!       |                               |<-- HTTP JSON response -----|
//!       |<- CoAP response (CBOR) -------| JSON -> CBOR at the edge   |
//!       |                               |                            |
//!       |-- OBSERVE register ---------->| long-polls on your behalf  |
//!       |<- notification (seq=2) -------|<-- /sync with ?since= -----|
//! ```
//!
//! The datagram runtime (DTLS, retransmission, block-wise transfer) stays
//! outside the library, behind the traits in [`bridge`]. The workspace
//! binaries provide a plain-UDP runtime, the `jc` converter and the two
//! proxy CLIs.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CborCodec`] | JSON <-> CBOR conversion under the key dictionary |
//! | [`PathSet`] | HTTP <-> CoAP path translation table |
//! | [`CoapHttpMapper`] | CoAP message <-> HTTP request/response mapping |
//! | [`Observations`] | OBSERVE registrations and the long-poll engine |
//! | [`Gateway`] | Server-side dispatch façade |
//! | [`LbClient`] | Client-side request façade with session caching |

/// Runtime seams: upstream handler, client handles, sessions, dialers.
pub mod bridge;
/// Client-side façade and the per-host session cache.
pub mod client;
/// JSON <-> CBOR conversion with the enum key dictionary.
pub mod codec;
/// Connection parameter set, loadable from TOML.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Server-side dispatch façade.
pub mod gateway;
/// Minimal HTTP request/response model used at the seams.
pub mod http;
/// CoAP <-> HTTP message mapping (RFC 8075 tables, access-token option).
pub mod mapping;
/// OBSERVE registrations and the long-poll engine.
pub mod observe;
/// HTTP <-> CoAP path translation with the enum path table.
pub mod paths;

pub use client::{ClientResponse, LbClient};
pub use codec::CborCodec;
pub use config::ConnectionParams;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use http::{HttpRequest, HttpResponse};
pub use mapping::{CoapHttpMapper, MediaType, ACCESS_TOKEN_OPTION};
pub use observe::{sync_observations, Observations};
pub use paths::PathSet;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
