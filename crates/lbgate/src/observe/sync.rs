// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Matrix /sync specific observation behavior.
//!
//! A /sync response is only an update when its `next_batch` token moved;
//! the token of the previous response feeds the next poll as `?since=` so
//! the origin long-polls instead of replaying state.

use std::sync::Arc;

use crate::bridge::UpstreamHandler;
use crate::codec::CborCodec;
use crate::http::HttpRequest;
use crate::observe::{HasUpdatedFn, Observations, UpdateRequestFn};
use crate::paths::PathSet;

const SYNC_PATH: &str = "_matrix/client/r0/sync";

/// Build an observation engine wired for Matrix /sync long-polling. Paths
/// other than /sync observe every response and poll unmodified.
pub fn sync_observations(
    upstream: Arc<dyn UpstreamHandler>,
    paths: Arc<PathSet>,
    codec: Arc<CborCodec>,
) -> Observations {
    let has_updated: HasUpdatedFn = {
        let paths = paths.clone();
        Arc::new(move |path, prev, curr| {
            if !is_sync_path(&paths, path) {
                return true;
            }
            if prev.is_none() {
                return true;
            }
            // Different tokens mean there has been an update; a missing
            // token compares as empty.
            next_batch(prev).unwrap_or_default() != next_batch(Some(curr)).unwrap_or_default()
        })
    };

    let update: UpdateRequestFn = Arc::new(move |path, prev, req: &mut HttpRequest| {
        if !is_sync_path(&paths, path) {
            return;
        }
        if let Some(since) = next_batch(prev) {
            req.set_query("since", since);
            req.set_query("timeout", "10000");
        }
    });

    Observations::new(upstream, codec, Some(has_updated), vec![update])
}

fn is_sync_path(paths: &PathSet, path: &str) -> bool {
    let http = paths.coap_to_http(path);
    http.trim_start_matches('/') == SYNC_PATH
}

/// The `next_batch` field of a JSON body, if any.
fn next_batch(body: Option<&[u8]>) -> Option<String> {
    let body = body?;
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("next_batch")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
