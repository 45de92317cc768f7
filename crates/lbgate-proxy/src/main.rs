// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side low-bandwidth proxy.
//!
//! Listens for CoAP over UDP and forwards requests to a Matrix homeserver
//! over HTTP, transcoding CBOR to JSON and compressed paths to full paths
//! on the way. /sync OBSERVE registrations are long-polled on the client's
//! behalf.
//!
//! # Usage
//!
//! ```bash
//! # Proxy UDP :5683 to a local Synapse
//! lbgate-proxy --homeserver http://localhost:8008
//!
//! # Advertise a public base URL so clients keep using the proxy
//! lbgate-proxy --homeserver http://localhost:8008 --advertise https://lb.example.com
//!
//! # Tune the link from a TOML file
//! lbgate-proxy --homeserver http://localhost:8008 --params link.toml
//! ```

mod net;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lbgate::observe::sync_observations;
use lbgate::{CborCodec, CoapHttpMapper, ConnectionParams, Gateway, PathSet};

use crate::net::UdpCoapServer;
use crate::upstream::HttpForwarder;

/// Low-bandwidth Matrix proxy (server side)
#[derive(Parser, Debug)]
#[command(name = "lbgate-proxy")]
#[command(about = "Low-bandwidth Matrix proxy: CoAP/UDP in, HTTP out")]
#[command(version)]
struct Args {
    /// UDP listen address for CoAP
    #[arg(short, long, default_value = "0.0.0.0:5683")]
    listen: String,

    /// Where the homeserver is located, e.g. http://localhost:8008
    #[arg(long)]
    homeserver: String,

    /// Public base URL to advertise in login/well-known responses
    #[arg(long)]
    advertise: Option<String>,

    /// Connection parameter file (TOML)
    #[arg(long)]
    params: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let params = match &args.params {
        Some(path) => ConnectionParams::from_file(path)?,
        None => ConnectionParams::default(),
    };
    params.validate()?;

    let codec = Arc::new(CborCodec::v1(false));
    let paths = Arc::new(PathSet::v1());
    let mapper = Arc::new(CoapHttpMapper::new(paths.clone()));
    let forwarder: Arc<HttpForwarder> =
        Arc::new(HttpForwarder::new(&args.homeserver, args.advertise.clone())?);
    let observations = Arc::new(sync_observations(
        forwarder.clone(),
        paths.clone(),
        codec.clone(),
    ));
    let gateway = Gateway::new(mapper, codec, forwarder, observations.clone());

    let server = UdpCoapServer::bind(&args.listen, gateway, params.clone()).await?;
    info!("lbgate-proxy v{}", lbgate::VERSION);
    info!(
        "proxying inbound CoAP->HTTP on {} (ACK piggyback window: {}s)",
        args.listen, params.piggyback_ack_window_secs
    );
    info!("forwarding to {}", args.homeserver);

    let serve = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    observations.shutdown();
    serve.abort();
    Ok(())
}
