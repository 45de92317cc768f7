// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal owned HTTP request/response model.
//!
//! The gateway only ever needs method, path, query, a handful of headers and
//! the body, so the seams use these plain structs instead of pulling a full
//! HTTP stack into the library. Binaries convert to and from axum/reqwest
//! types at the edges.

use std::collections::BTreeMap;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const AUTHORIZATION: &str = "Authorization";

pub const APPLICATION_JSON: &str = "application/json";
pub const APPLICATION_CBOR: &str = "application/cbor";

/// An HTTP request as seen at the gateway boundary.
///
/// `query` is a multi-value map: repeating `?foo=1&foo=2` accumulates into
/// `{"foo": ["1", "2"]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Path with a leading `/`, already percent-decoded.
    pub path: String,
    pub query: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Append one value to a query key, keeping earlier values.
    pub fn add_query(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query.entry(key.into()).or_default().push(value.into());
    }

    /// Replace all values of a query key with a single value.
    pub fn set_query(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query.insert(key.into(), vec![value.into()]);
    }

    /// Encode the query map as a URL query string (keys in sorted order).
    pub fn query_string(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, vs) in &self.query {
            for v in vs {
                ser.append_pair(k, v);
            }
        }
        ser.finish()
    }
}

/// An HTTP response as seen at the gateway boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_body(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut res = Self::new(status);
        res.set_header(CONTENT_TYPE, content_type);
        res.body = body.into();
        res
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }
}

/// Build the `{"errcode":"PROXY","error":…}` body returned on gateway
/// failures.
pub fn proxy_error(status: u16, message: &str) -> HttpResponse {
    let body = serde_json::json!({ "errcode": "PROXY", "error": message });
    HttpResponse::with_body(status, APPLICATION_JSON, body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_accumulates_repeated_keys() {
        let mut req = HttpRequest::new("GET", "/");
        req.add_query("foo", "1");
        req.add_query("foo", "2");
        req.add_query("bar", "x");
        assert_eq!(req.query["foo"], vec!["1", "2"]);
        assert_eq!(req.query_string(), "bar=x&foo=1&foo=2");
    }

    #[test]
    fn set_query_replaces() {
        let mut req = HttpRequest::new("GET", "/");
        req.add_query("since", "a");
        req.set_query("since", "b");
        assert_eq!(req.query["since"], vec!["b"]);
    }

    #[test]
    fn proxy_error_shape() {
        let res = proxy_error(502, "nope");
        assert_eq!(res.status, 502);
        let v: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
        assert_eq!(v["errcode"], "PROXY");
        assert_eq!(v["error"], "nope");
    }
}
