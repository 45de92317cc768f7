// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Forwards gateway requests to the homeserver over plain HTTP.

use async_trait::async_trait;
use lbgate::bridge::UpstreamHandler;
use lbgate::http::{proxy_error, HttpRequest, HttpResponse};
use lbgate::Error;
use tracing::{info, warn};
use url::Url;

/// Timeout covering long /sync requests.
const UPSTREAM_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// An [`UpstreamHandler`] backed by a reqwest client pointed at one origin.
pub struct HttpForwarder {
    client: reqwest::Client,
    base: Url,
    advertise: Option<String>,
}

impl HttpForwarder {
    /// `local_addr` is where the homeserver lives, e.g.
    /// `http://localhost:8008`. When `advertise` is set, homeserver
    /// base URLs in login and well-known responses are rewritten to it so
    /// clients keep talking through this proxy.
    pub fn new(local_addr: &str, advertise: Option<String>) -> Result<Self, Error> {
        let base = Url::parse(local_addr)?;
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| Error::Gateway(e.to_string()))?;
        Ok(Self {
            client,
            base,
            advertise,
        })
    }
}

#[async_trait]
impl UpstreamHandler for HttpForwarder {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        let mut url = self.base.clone();
        url.set_path(&req.path);
        let query = req.query_string();
        url.set_query(if query.is_empty() { None } else { Some(&query) });

        let method = match reqwest::Method::from_bytes(req.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return proxy_error(500, &format!("bad method {}", req.method)),
        };

        let mut outbound = self.client.request(method, url.clone());
        for (name, value) in &req.headers {
            outbound = outbound.header(name, value);
        }
        if !req.body.is_empty() {
            outbound = outbound.body(req.body);
        }

        let upstream = match outbound.send().await {
            Ok(res) => res,
            Err(e) => {
                warn!("failed to contact local address: {}", e);
                return proxy_error(502, "failed to contact local address");
            }
        };

        let status = upstream.status().as_u16();
        let mut res = HttpResponse::new(status);
        for (name, value) in upstream.headers() {
            if let Ok(value) = value.to_str() {
                res.set_header(name.as_str(), value);
            }
        }
        match upstream.bytes().await {
            Ok(body) => res.body = body.to_vec(),
            Err(e) => {
                warn!("failed to read local response body: {}", e);
                return proxy_error(502, "failed to read local response body");
            }
        }

        if let Some(advertise) = &self.advertise {
            if let Some(rewritten) = rewrite_advertised_base_url(&res.body, advertise) {
                info!("replaced homeserver base_url with {}", advertise);
                res.body = rewritten;
            }
        }

        if status == 200 {
            info!("{} {} - 200 OK ({} bytes)", req.method, url, res.body.len());
        } else {
            warn!(
                "{} {} returned {} with body: {}",
                req.method,
                url,
                status,
                String::from_utf8_lossy(&res.body)
            );
        }
        res
    }
}

/// Point `base_url` at the proxy in login (`well_known.m.homeserver`) and
/// well-known (`m.homeserver`) response bodies. Returns `None` when the
/// body carries neither.
fn rewrite_advertised_base_url(body: &[u8], advertise: &str) -> Option<Vec<u8>> {
    let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let mut changed = false;
    for pointer in ["/well_known/m.homeserver/base_url", "/m.homeserver/base_url"] {
        if let Some(slot) = value.pointer_mut(pointer) {
            *slot = serde_json::Value::String(advertise.to_string());
            changed = true;
        }
    }
    if changed {
        serde_json::to_vec(&value).ok()
    } else {
        None
    }
}
