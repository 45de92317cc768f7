// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CoAP message <-> HTTP request/response conversion.
//!
//! The mapping is lossy by design: HTTP headers other than `Content-Type`
//! and `Authorization` are dropped, and the bearer credential travels as a
//! private CoAP option instead of a Uri-Query so it never leaks into cached
//! URIs and is cheap to repeat.
//!
//! Method and status code tables follow RFC 8075 section 7.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::{HttpRequest, HttpResponse, AUTHORIZATION, CONTENT_TYPE};
use crate::paths::PathSet;

/// CoAP option number carrying the Matrix access token.
///
/// Elective (even number) and unsafe to forward, per the option numbering
/// rules of RFC 7252 section 5.4.6.
pub const ACCESS_TOKEN_OPTION: u16 = 256;

/// Media types the gateway understands, with their CoAP Content-Format
/// codes from the RFC 7252 registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    TextPlain,
    AppOctets,
    AppJson,
    AppCbor,
}

impl MediaType {
    pub fn code(self) -> u16 {
        match self {
            Self::TextPlain => 0,
            Self::AppOctets => 42,
            Self::AppJson => 50,
            Self::AppCbor => 60,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::TextPlain),
            42 => Some(Self::AppOctets),
            50 => Some(Self::AppJson),
            60 => Some(Self::AppCbor),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::TextPlain => "text/plain",
            Self::AppOctets => "application/octet-stream",
            Self::AppJson => "application/json",
            Self::AppCbor => "application/cbor",
        }
    }

    pub fn from_content_type(value: &str) -> Option<Self> {
        match value {
            "text/plain" => Some(Self::TextPlain),
            "application/octet-stream" => Some(Self::AppOctets),
            "application/json" => Some(Self::AppJson),
            "application/cbor" => Some(Self::AppCbor),
            _ => None,
        }
    }
}

fn method_from_code(code: MessageClass) -> Option<&'static str> {
    match code {
        MessageClass::Request(RequestType::Get) => Some("GET"),
        MessageClass::Request(RequestType::Post) => Some("POST"),
        MessageClass::Request(RequestType::Put) => Some("PUT"),
        MessageClass::Request(RequestType::Delete) => Some("DELETE"),
        _ => None,
    }
}

fn code_from_method(method: &str) -> Option<MessageClass> {
    match method {
        "GET" => Some(MessageClass::Request(RequestType::Get)),
        "POST" => Some(MessageClass::Request(RequestType::Post)),
        "PUT" => Some(MessageClass::Request(RequestType::Put)),
        "DELETE" => Some(MessageClass::Request(RequestType::Delete)),
        _ => None,
    }
}

/// HTTP status to CoAP response code, RFC 8075 table 2.
pub fn coap_code_from_status(status: u16) -> Option<MessageClass> {
    let code = match status {
        200 => ResponseType::Content,
        400 => ResponseType::BadRequest,
        401 => ResponseType::Unauthorized,
        403 => ResponseType::Forbidden,
        404 => ResponseType::NotFound,
        405 => ResponseType::MethodNotAllowed,
        413 => ResponseType::RequestEntityTooLarge,
        415 => ResponseType::UnsupportedContentFormat,
        500 => ResponseType::InternalServerError,
        502 => ResponseType::BadGateway,
        504 => ResponseType::GatewayTimeout,
        _ => return None,
    };
    Some(MessageClass::Response(code))
}

/// CoAP response code to HTTP status, the reverse of the table above.
pub fn status_from_coap_code(code: MessageClass) -> Option<u16> {
    let status = match code {
        MessageClass::Response(ResponseType::Content) => 200,
        MessageClass::Response(ResponseType::BadRequest) => 400,
        MessageClass::Response(ResponseType::Unauthorized) => 401,
        MessageClass::Response(ResponseType::Forbidden) => 403,
        MessageClass::Response(ResponseType::NotFound) => 404,
        MessageClass::Response(ResponseType::MethodNotAllowed) => 405,
        MessageClass::Response(ResponseType::RequestEntityTooLarge) => 413,
        MessageClass::Response(ResponseType::UnsupportedContentFormat) => 415,
        MessageClass::Response(ResponseType::InternalServerError) => 500,
        MessageClass::Response(ResponseType::BadGateway) => 502,
        MessageClass::Response(ResponseType::GatewayTimeout) => 504,
        _ => return None,
    };
    Some(status)
}

/// Encode a CoAP uint option value: big-endian with leading zeros stripped,
/// zero encodes to the empty string.
pub fn encode_uint_option(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

/// Decode a CoAP uint option value.
pub fn decode_uint_option(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

/// Produces CoAP tokens for outbound requests.
pub type TokenSource = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// The default token source: a monotonically increasing counter encoded as
/// an unsigned varint.
pub fn varint_token_source() -> TokenSource {
    let counter = AtomicU64::new(0);
    Arc::new(move || {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        encode_uvarint(n)
    })
}

fn encode_uvarint(mut n: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    while n >= 0x80 {
        out.push((n as u8) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
    out
}

/// Joined Uri-Path options with a leading slash.
pub fn uri_path(msg: &Packet) -> String {
    let mut path = String::from("/");
    if let Some(segments) = msg.get_option(CoapOption::UriPath) {
        let joined: Vec<String> = segments
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        path.push_str(&joined.join("/"));
    }
    path
}

/// The Observe option value, when present. An empty option value decodes
/// to 0 (register).
pub fn observe_value(msg: &Packet) -> Option<u32> {
    msg.get_option(CoapOption::Observe)
        .and_then(|values| values.front())
        .map(|v| decode_uint_option(v))
}

/// Converts CoAP messages to HTTP requests/responses and back, composing
/// the path table and the access-token option.
pub struct CoapHttpMapper {
    paths: Arc<PathSet>,
    next_token: TokenSource,
}

impl CoapHttpMapper {
    pub fn new(paths: Arc<PathSet>) -> Self {
        Self {
            paths,
            next_token: varint_token_source(),
        }
    }

    /// Replace the token source, e.g. for deterministic tests.
    pub fn with_token_source(paths: Arc<PathSet>, next_token: TokenSource) -> Self {
        Self { paths, next_token }
    }

    pub fn paths(&self) -> &Arc<PathSet> {
        &self.paths
    }

    /// Produce the next outbound CoAP token.
    pub fn next_token(&self) -> Vec<u8> {
        (self.next_token)()
    }

    /// Convert a CoAP request into an HTTP request (lossy). Expects standard
    /// Uri-Path / Uri-Query options; the payload is carried over untouched.
    pub fn coap_to_http_request(&self, msg: &Packet) -> Result<HttpRequest> {
        let method = method_from_code(msg.header.code)
            .ok_or_else(|| Error::UnknownCode(format!("{:?}", msg.header.code)))?;
        let path = self.paths.coap_to_http(&uri_path(msg));
        let mut req = HttpRequest::new(method, path);

        if let Some(queries) = msg.get_option(CoapOption::UriQuery) {
            for q in queries {
                let q = String::from_utf8_lossy(q);
                match q.split_once('=') {
                    // Repeating keys accumulate: ?foo=1&foo=2.
                    Some((k, v)) => req.add_query(k, v),
                    None => {
                        warn!("ignoring malformed query string: {}", q);
                    }
                }
            }
        }

        req.body = msg.payload.clone();

        if let Some(values) = msg.get_option(CoapOption::ContentFormat) {
            if let Some(v) = values.front() {
                let code = decode_uint_option(v) as u16;
                if let Some(media) = MediaType::from_code(code) {
                    req.set_header(CONTENT_TYPE, media.content_type());
                }
            }
        }

        if let Some(values) = msg.get_option(CoapOption::from(ACCESS_TOKEN_OPTION)) {
            if let Some(token) = values.front() {
                if !token.is_empty() {
                    let token = String::from_utf8_lossy(token);
                    req.set_header(AUTHORIZATION, format!("Bearer {}", token));
                }
            }
        }

        Ok(req)
    }

    /// Convert an HTTP request into a confirmable CoAP request. Fails on
    /// methods with no CoAP equivalent.
    pub fn http_request_to_coap(&self, req: &HttpRequest) -> Result<Packet> {
        let code = code_from_method(&req.method)
            .ok_or_else(|| Error::UnknownMethod(req.method.clone()))?;
        let mut msg = Packet::new();
        msg.header.code = code;
        msg.header.set_type(MessageType::Confirmable);
        msg.set_token((self.next_token)());

        let coap_path = self.paths.http_to_coap(&req.path);
        for segment in coap_path.split('/').filter(|s| !s.is_empty()) {
            msg.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        for (k, vs) in &req.query {
            for v in vs {
                msg.add_option(CoapOption::UriQuery, format!("{}={}", k, v).into_bytes());
            }
        }

        msg.payload = req.body.clone();

        let media = req
            .header(CONTENT_TYPE)
            .and_then(MediaType::from_content_type)
            .unwrap_or(MediaType::AppOctets);
        msg.add_option(CoapOption::ContentFormat, encode_uint_option(media.code().into()));

        if let Some(auth) = req.header(AUTHORIZATION) {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                msg.add_option(
                    CoapOption::from(ACCESS_TOKEN_OPTION),
                    token.as_bytes().to_vec(),
                );
            }
        }

        Ok(msg)
    }

    /// Convert a CoAP response into an HTTP response. Fails on codes outside
    /// the RFC 8075 table.
    pub fn coap_to_http_response(&self, msg: &Packet) -> Result<HttpResponse> {
        let status = status_from_coap_code(msg.header.code)
            .ok_or_else(|| Error::UnknownCode(format!("{:?}", msg.header.code)))?;
        let mut res = HttpResponse::new(status);
        if let Some(values) = msg.get_option(CoapOption::ContentFormat) {
            if let Some(v) = values.front() {
                if let Some(media) = MediaType::from_code(decode_uint_option(v) as u16) {
                    res.set_header(CONTENT_TYPE, media.content_type());
                }
            }
        }
        res.body = msg.payload.clone();
        Ok(res)
    }

    /// Convert an HTTP response into the CoAP reply for `reply_to`. Statuses
    /// outside the table map to the Empty code with a warning.
    pub fn http_response_to_coap(&self, res: &HttpResponse, reply_to: &Packet) -> Packet {
        let code = match coap_code_from_status(res.status) {
            Some(c) => c,
            None => {
                warn!("cannot map HTTP status {} to a CoAP code, using Empty", res.status);
                MessageClass::Empty
            }
        };
        let media = res
            .header(CONTENT_TYPE)
            .and_then(MediaType::from_content_type)
            .unwrap_or(MediaType::AppOctets);

        let mut msg = Packet::new();
        msg.header.code = code;
        msg.header.set_type(MessageType::Acknowledgement);
        msg.header.message_id = reply_to.header.message_id;
        msg.set_token(reply_to.get_token().to_vec());
        msg.add_option(CoapOption::ContentFormat, encode_uint_option(media.code().into()));
        msg.payload = res.body.clone();
        debug!(
            "mapped HTTP {} response into CoAP {:?} ({} payload bytes)",
            res.status,
            msg.header.code,
            msg.payload.len()
        );
        msg
    }
}
