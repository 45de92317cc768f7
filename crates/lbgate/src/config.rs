// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection parameters for the whole low-bandwidth stack.
//!
//! One struct covers DTLS handshake pacing, CoAP keepalive/transmission
//! behavior and OBSERVE, loadable from TOML or built programmatically.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for the datagram link and OBSERVE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Skip DTLS certificate checks, for self-signed deployments. Keep
    /// false in production.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Retry rate for initial DTLS handshake flights. Below the path RTT
    /// the handshake can never complete; too high and lossy links take
    /// longer than needed to connect.
    #[serde(default = "default_flight_interval")]
    pub flight_interval_secs: u64,

    /// CoAP empty-message keepalive period. Costs idle bandwidth but keeps
    /// NAT bindings alive.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_keepalive_max_retries")]
    pub keepalive_max_retries: u32,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    /// Max simultaneous outstanding requests per session. RFC 7252
    /// section 4.8 recommends 1.
    #[serde(default = "default_nstart")]
    pub transmission_nstart: u32,

    /// How long to wait for an ACK before retransmitting. Servers must ACK
    /// within this window or clients retransmit needlessly; hence the
    /// server's piggyback window must stay below it.
    #[serde(default = "default_ack_timeout")]
    pub transmission_ack_timeout_secs: u64,

    /// Max retransmissions per message. RFC 7252 section 4.8 recommends 4.
    #[serde(default = "default_max_retransmits")]
    pub transmission_max_retransmits: u32,

    /// Use OBSERVE for /sync instead of long-polling. Subscriptions live
    /// server-side, so a server restart silently drops them; most useful
    /// for quiet accounts where the idle savings dominate.
    #[serde(default)]
    pub observe_enabled: bool,

    /// Buffer size for pushed /sync notifications. When full the client
    /// stops acknowledging, which throttles the server.
    #[serde(default = "default_observe_buffer_size")]
    pub observe_buffer_size: usize,

    /// Synthesize an empty /sync response after this many seconds without
    /// pushed data, so long-poll clients keep believing they are syncing.
    #[serde(default = "default_observe_no_response_timeout")]
    pub observe_no_response_timeout_secs: u64,

    /// Server-side early-ACK timer: how long the upstream handler may run
    /// before the ACK is sent separately instead of piggybacked.
    #[serde(default = "default_piggyback_ack_window")]
    pub piggyback_ack_window_secs: u64,
}

fn default_flight_interval() -> u64 {
    2
}
fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_keepalive_max_retries() -> u32 {
    5
}
fn default_keepalive_timeout() -> u64 {
    30
}
fn default_nstart() -> u32 {
    1
}
fn default_ack_timeout() -> u64 {
    8
}
fn default_max_retransmits() -> u32 {
    4
}
fn default_observe_buffer_size() -> usize {
    50
}
fn default_observe_no_response_timeout() -> u64 {
    5
}
fn default_piggyback_ack_window() -> u64 {
    5
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            flight_interval_secs: default_flight_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            keepalive_max_retries: default_keepalive_max_retries(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            transmission_nstart: default_nstart(),
            transmission_ack_timeout_secs: default_ack_timeout(),
            transmission_max_retransmits: default_max_retransmits(),
            observe_enabled: false,
            observe_buffer_size: default_observe_buffer_size(),
            observe_no_response_timeout_secs: default_observe_no_response_timeout(),
            piggyback_ack_window_secs: default_piggyback_ack_window(),
        }
    }
}

impl ConnectionParams {
    /// Load parameters from a TOML file and validate them.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let params: Self = toml::from_str(&content)?;
        params.validate()?;
        Ok(params)
    }

    /// Validate the parameter set.
    pub fn validate(&self) -> Result<()> {
        if self.flight_interval_secs == 0 {
            return Err(Error::Config("flight_interval_secs must be > 0".into()));
        }
        if self.transmission_nstart == 0 {
            return Err(Error::Config("transmission_nstart must be > 0".into()));
        }
        if self.transmission_ack_timeout_secs == 0 {
            return Err(Error::Config(
                "transmission_ack_timeout_secs must be > 0".into(),
            ));
        }
        if self.observe_buffer_size == 0 {
            return Err(Error::Config("observe_buffer_size must be > 0".into()));
        }
        if self.observe_no_response_timeout_secs == 0 {
            return Err(Error::Config(
                "observe_no_response_timeout_secs must be > 0".into(),
            ));
        }
        if self.piggyback_ack_window_secs >= self.transmission_ack_timeout_secs {
            return Err(Error::Config(
                "piggyback_ack_window_secs must stay below transmission_ack_timeout_secs".into(),
            ));
        }
        Ok(())
    }
}
