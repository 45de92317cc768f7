// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side low-bandwidth proxy.
//!
//! Accepts plain HTTP from a Matrix client and forwards every request over
//! CoAP/UDP to a low-bandwidth homeserver proxy, transparently converting
//! JSON to CBOR and compressing paths. Point any unmodified client at this
//! proxy and it talks the low-bandwidth dialect without knowing.
//!
//! # Usage
//!
//! ```bash
//! lbgate-client --homeserver lb.example.com:5683
//!
//! # With OBSERVE-backed /sync
//! LB_OBSERVE_ENABLED=true lbgate-client --homeserver lb.example.com:5683
//! ```
//!
//! Every connection tunable is also settable through `LB_*` environment
//! variables, mirroring the flags.

mod session;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lbgate::{CborCodec, ConnectionParams, LbClient, PathSet};

use crate::session::UdpDialer;

/// Low-bandwidth Matrix proxy (client side)
#[derive(Parser, Debug)]
#[command(name = "lbgate-client")]
#[command(about = "Low-bandwidth Matrix proxy: HTTP in, CoAP/UDP out")]
#[command(version)]
struct Args {
    /// HTTP listen address for local clients
    #[arg(long, default_value = "0.0.0.0:8008")]
    http_bind_addr: String,

    /// The homeserver proxy to forward to, host:port without a scheme
    #[arg(long)]
    homeserver: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Skip DTLS certificate checks
    #[arg(long, env = "LB_INSECURE_SKIP_VERIFY")]
    insecure_skip_verify: Option<bool>,

    /// DTLS handshake retransmit interval (seconds)
    #[arg(long, env = "LB_FLIGHT_INTERVAL_SECS")]
    flight_interval_secs: Option<u64>,

    /// CoAP keepalive period (seconds)
    #[arg(long, env = "LB_HEARTBEAT_TIMEOUT_SECS")]
    heartbeat_timeout_secs: Option<u64>,

    #[arg(long, env = "LB_KEEP_ALIVE_MAX_RETRIES")]
    keepalive_max_retries: Option<u32>,

    #[arg(long, env = "LB_KEEP_ALIVE_TIMEOUT_SECS")]
    keepalive_timeout_secs: Option<u64>,

    /// Max concurrent outstanding requests per session
    #[arg(long, env = "LB_TRANSMISSION_NSTART")]
    transmission_nstart: Option<u32>,

    /// Wait-for-ACK before retransmit (seconds)
    #[arg(long, env = "LB_TRANSMISSION_ACK_TIMEOUT_SECS")]
    transmission_ack_timeout_secs: Option<u64>,

    #[arg(long, env = "LB_TRANSMISSION_MAX_RETRANSMITS")]
    transmission_max_retransmits: Option<u32>,

    /// Use OBSERVE for /sync instead of long-polling
    #[arg(long, env = "LB_OBSERVE_ENABLED")]
    observe_enabled: Option<bool>,

    /// Pushed /sync notification buffer length
    #[arg(long, env = "LB_OBSERVE_BUFFER_SIZE")]
    observe_buffer_size: Option<usize>,

    /// Synthesize an empty /sync response after this idle period (seconds)
    #[arg(long, env = "LB_OBSERVE_NO_RESPONSE_TIMEOUT_SECS")]
    observe_no_response_timeout_secs: Option<u64>,
}

impl Args {
    fn connection_params(&self) -> ConnectionParams {
        let mut p = ConnectionParams::default();
        macro_rules! apply {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    p.$field = v;
                }
            };
        }
        apply!(insecure_skip_verify);
        apply!(flight_interval_secs);
        apply!(heartbeat_timeout_secs);
        apply!(keepalive_max_retries);
        apply!(keepalive_timeout_secs);
        apply!(transmission_nstart);
        apply!(transmission_ack_timeout_secs);
        apply!(transmission_max_retransmits);
        apply!(observe_enabled);
        apply!(observe_buffer_size);
        apply!(observe_no_response_timeout_secs);
        p
    }
}

struct AppState {
    client: LbClient,
    homeserver: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let params = args.connection_params();
    params.validate()?;

    let codec = Arc::new(CborCodec::v1(false));
    let paths = Arc::new(PathSet::v1());
    let dialer = UdpDialer::new(params.clone());
    let client = LbClient::new(params, codec, paths, dialer);

    let state = Arc::new(AppState {
        client,
        homeserver: args.homeserver.clone(),
    });

    let app = Router::new().fallback(forward).with_state(state);

    info!("lbgate-client v{}", lbgate::VERSION);
    info!(
        "listening on {} forwarding to {}",
        args.http_bind_addr, args.homeserver
    );
    let listener = tokio::net::TcpListener::bind(&args.http_bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Forward any request to the homeserver over the low-bandwidth link.
async fn forward(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path());
    let hs_url = format!("coap://{}{}", state.homeserver, path_and_query);
    let body = String::from_utf8_lossy(&body).into_owned();

    match state.client.send_request(method.as_str(), &hs_url, token, &body).await {
        Ok(res) => {
            let status =
                StatusCode::from_u16(res.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                res.body,
            )
                .into_response()
        }
        Err(e) => {
            warn!("failed to forward {} {}: {}", method, uri, e);
            (
                StatusCode::BAD_GATEWAY,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"errcode":"PROXY","error":"failed to forward request to homeserver"}"#
                    .to_string(),
            )
                .into_response()
        }
    }
}
